//! Element types and tagged byte storage
//!
//! Every buffer that crosses the host/device boundary is a [`ByteBuffer`]:
//! raw bytes plus the [`DType`] tag that says how to read them.

use std::fmt;

use bytemuck::Pod;

use crate::error::{Result, TensorError};

/// Primitive family of an element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DTypeKind {
    Float,
    Int,
    Bool,
    None,
}

/// Element type descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub kind: DTypeKind,
    /// Width in bits
    pub bits: usize,
    /// Width in bytes
    pub bytes: usize,
    /// Short name used in kernel names, e.g. `f32`
    pub repr: &'static str,
}

impl DType {
    pub const F32: DType = DType {
        kind: DTypeKind::Float,
        bits: 32,
        bytes: 4,
        repr: "f32",
    };
    pub const I32: DType = DType {
        kind: DTypeKind::Int,
        bits: 32,
        bytes: 4,
        repr: "i32",
    };
    pub const I64: DType = DType {
        kind: DTypeKind::Int,
        bits: 64,
        bytes: 8,
        repr: "i64",
    };
    pub const BOOL: DType = DType {
        kind: DTypeKind::Bool,
        bits: 1,
        bytes: 1,
        repr: "b",
    };
    pub const NONE: DType = DType {
        kind: DTypeKind::None,
        bits: 0,
        bytes: 0,
        repr: "none",
    };

    /// Look up a dtype by name. Unknown names map to [`DType::NONE`].
    pub fn lookup(name: &str) -> DType {
        match name.to_lowercase().as_str() {
            "float32" | "f32" => DType::F32,
            "int32" | "i32" => DType::I32,
            "int64" | "i64" => DType::I64,
            "bool" => DType::BOOL,
            _ => DType::NONE,
        }
    }

    /// Resolve a kernel-name suffix back to its dtype
    pub fn from_repr(repr: &str) -> Option<DType> {
        [DType::F32, DType::I32, DType::I64, DType::BOOL]
            .into_iter()
            .find(|d| d.repr == repr)
    }

    pub fn is_none(&self) -> bool {
        self.kind == DTypeKind::None
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.repr)
    }
}

/// Host scalar types that can back a tensor
pub trait Element: Pod + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;
}

/// Raw bytes tagged with their element type
#[derive(Clone, PartialEq, Eq)]
pub struct ByteBuffer {
    bytes: Vec<u8>,
    dtype: DType,
    count: usize,
}

impl ByteBuffer {
    /// Wrap raw bytes. The length must be a whole number of elements.
    pub fn new(bytes: Vec<u8>, dtype: DType) -> Result<Self> {
        if dtype.bytes == 0 {
            if !bytes.is_empty() {
                return Err(TensorError::BufferLength {
                    expected: 0,
                    got: bytes.len(),
                });
            }
            return Ok(Self::empty(dtype));
        }
        if bytes.len() % dtype.bytes != 0 {
            return Err(TensorError::BufferLength {
                expected: (bytes.len() / dtype.bytes + 1) * dtype.bytes,
                got: bytes.len(),
            });
        }
        let count = bytes.len() / dtype.bytes;
        Ok(Self {
            bytes,
            dtype,
            count,
        })
    }

    pub fn empty(dtype: DType) -> Self {
        Self {
            bytes: Vec::new(),
            dtype,
            count: 0,
        }
    }

    pub fn zeroed(dtype: DType, count: usize) -> Self {
        Self {
            bytes: vec![0; count * dtype.bytes],
            dtype,
            count,
        }
    }

    pub fn from_slice<T: Element>(data: &[T]) -> Self {
        Self {
            bytes: bytemuck::cast_slice(data).to_vec(),
            dtype: T::DTYPE,
            count: data.len(),
        }
    }

    /// Decode into host scalars. Fails if `T` does not match the tag.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype.repr,
                got: T::DTYPE.repr,
            });
        }
        // The backing Vec<u8> carries no alignment guarantee for T.
        Ok(self
            .bytes
            .chunks_exact(self.dtype.bytes)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("dtype", &self.dtype.repr)
            .field("count", &self.count)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_names() {
        assert_eq!(DType::lookup("float32"), DType::F32);
        assert_eq!(DType::lookup("int32"), DType::I32);
        assert_eq!(DType::lookup("INT64"), DType::I64);
        assert_eq!(DType::lookup("bool"), DType::BOOL);
        assert_eq!(DType::lookup("bool").bits, 1);
        assert_eq!(DType::lookup("int64").bytes, 8);
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        assert!(DType::lookup("b").is_none());
        let d = DType::lookup("complex128");
        assert!(d.is_none());
        assert_eq!(d.bytes, 0);
        assert_eq!(d.repr, "none");
    }

    #[test]
    fn test_from_repr() {
        assert_eq!(DType::from_repr("i64"), Some(DType::I64));
        assert_eq!(DType::from_repr("f16"), None);
    }

    #[test]
    fn test_buffer_length_invariant() {
        let buf = ByteBuffer::new(vec![0u8; 12], DType::F32).unwrap();
        assert_eq!(buf.count(), 3);
        assert_eq!(buf.len(), buf.count() * buf.dtype().bytes);

        let err = ByteBuffer::new(vec![0u8; 10], DType::I64).unwrap_err();
        assert_eq!(
            err,
            TensorError::BufferLength {
                expected: 16,
                got: 10
            }
        );
    }

    #[test]
    fn test_typed_decode() {
        let buf = ByteBuffer::from_slice(&[1i64, -2, 3]);
        assert_eq!(buf.dtype(), DType::I64);
        assert_eq!(buf.to_vec::<i64>().unwrap(), vec![1, -2, 3]);
        assert!(matches!(
            buf.to_vec::<f32>(),
            Err(TensorError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_unaligned_bytes() {
        // Slice one byte in so the payload is not 4-aligned.
        let mut raw = vec![0u8];
        raw.extend_from_slice(bytemuck::cast_slice(&[1.5f32, -2.25]));
        let buf = ByteBuffer::new(raw[1..].to_vec(), DType::F32).unwrap();
        assert_eq!(buf.to_vec::<f32>().unwrap(), vec![1.5, -2.25]);
    }
}
