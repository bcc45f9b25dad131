use tracing::instrument;

use super::{ElementwiseOp, ElementwiseParams, KernelError};
use crate::dtype::{DType, Element};

/// Scalar arithmetic for kernel dtypes.
///
/// Integer add/sub/mul wrap; integer division by zero is an error.
trait Arith: Element {
    fn add(a: Self, b: Self) -> Self;
    fn sub(a: Self, b: Self) -> Self;
    fn mul(a: Self, b: Self) -> Self;
    fn div(a: Self, b: Self) -> Option<Self>;
    fn neg(a: Self) -> Self;
}

impl Arith for f32 {
    fn add(a: Self, b: Self) -> Self {
        a + b
    }
    fn sub(a: Self, b: Self) -> Self {
        a - b
    }
    fn mul(a: Self, b: Self) -> Self {
        a * b
    }
    fn div(a: Self, b: Self) -> Option<Self> {
        Some(a / b)
    }
    fn neg(a: Self) -> Self {
        -a
    }
}

macro_rules! int_arith {
    ($($t:ty),*) => {$(
        impl Arith for $t {
            fn add(a: Self, b: Self) -> Self {
                a.wrapping_add(b)
            }
            fn sub(a: Self, b: Self) -> Self {
                a.wrapping_sub(b)
            }
            fn mul(a: Self, b: Self) -> Self {
                a.wrapping_mul(b)
            }
            fn div(a: Self, b: Self) -> Option<Self> {
                (b != 0).then(|| a.wrapping_div(b))
            }
            fn neg(a: Self) -> Self {
                a.wrapping_neg()
            }
        }
    )*};
}

int_arith!(i32, i64);

fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect()
}

fn run<T: Arith>(
    op: ElementwiseOp,
    inputs: &[&[u8]],
    count: usize,
) -> Result<Vec<u8>, KernelError> {
    let a: Vec<T> = decode(inputs[0]);
    let out: Vec<T> = match op {
        ElementwiseOp::Neg => a.into_iter().map(T::neg).collect(),
        _ => {
            let b: Vec<T> = decode(inputs[1]);
            let mut out = Vec::with_capacity(count);
            for (index, (&x, &y)) in a.iter().zip(&b).enumerate() {
                let value = match op {
                    ElementwiseOp::Add => T::add(x, y),
                    ElementwiseOp::Sub => T::sub(x, y),
                    ElementwiseOp::Mul => T::mul(x, y),
                    ElementwiseOp::Div => {
                        T::div(x, y).ok_or(KernelError::DivisionByZero { index })?
                    }
                    ElementwiseOp::Neg => unreachable!("unary op in binary path"),
                };
                out.push(value);
            }
            out
        }
    };
    Ok(bytemuck::cast_slice(&out).to_vec())
}

/// Run one elementwise kernel on the host and return the output bytes
#[instrument(skip_all, fields(kernel = %params.kernel, count = params.count))]
pub fn execute(params: ElementwiseParams) -> Result<Vec<u8>, KernelError> {
    let ElementwiseParams {
        kernel,
        inputs,
        count,
    } = params;

    if inputs.len() != kernel.op.arity() {
        return Err(KernelError::Arity {
            kernel,
            expected: kernel.op.arity(),
            got: inputs.len(),
        });
    }
    let expected = count * kernel.dtype.bytes;
    if let Some((index, input)) = inputs.iter().enumerate().find(|(_, i)| i.len() != expected) {
        return Err(KernelError::OperandLength {
            index,
            expected,
            got: input.len(),
        });
    }

    match kernel.dtype {
        DType::F32 => run::<f32>(kernel.op, inputs, count),
        DType::I32 => run::<i32>(kernel.op, inputs, count),
        DType::I64 => run::<i64>(kernel.op, inputs, count),
        other => Err(KernelError::UnsupportedDType(other.repr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::kernels::KernelName;

    fn bytes<T: Element>(v: &[T]) -> Vec<u8> {
        bytemuck::cast_slice(v).to_vec()
    }

    fn run_named<T: Element>(name: &str, inputs: &[&[T]]) -> Result<Vec<T>, KernelError> {
        let encoded: Vec<Vec<u8>> = inputs.iter().map(|i| bytes(i)).collect();
        let slices: Vec<&[u8]> = encoded.iter().map(|v| v.as_slice()).collect();
        let out = execute(ElementwiseParams {
            kernel: name.parse::<KernelName>().unwrap(),
            inputs: &slices,
            count: inputs[0].len(),
        })?;
        Ok(decode(&out))
    }

    #[test]
    fn test_add_i32() {
        let out = run_named::<i32>("add_i32", &[&[1, 2, 3], &[10, 20, 30]]).unwrap();
        assert_eq!(out, vec![11, 22, 33]);
    }

    #[test]
    fn test_sub_f32() {
        let out = run_named::<f32>("sub_f32", &[&[1.5, 2.0], &[0.5, 4.0]]).unwrap();
        assert_eq!(out, vec![1.0, -2.0]);
    }

    #[test]
    fn test_mul_i64_wraps() {
        let out = run_named::<i64>("mul_i64", &[&[i64::MAX, 3], &[2, 4]]).unwrap();
        assert_eq!(out, vec![i64::MAX.wrapping_mul(2), 12]);
    }

    #[test]
    fn test_neg_unary() {
        let out = run_named::<f32>("neg_f32", &[&[1.0, -2.0, 0.0]]).unwrap();
        assert_eq!(out, vec![-1.0, 2.0, -0.0]);
    }

    #[test]
    fn test_int_division_by_zero() {
        let err = run_named::<i32>("div_i32", &[&[4, 5], &[2, 0]]).unwrap_err();
        assert_eq!(err, KernelError::DivisionByZero { index: 1 });
    }

    #[test]
    fn test_float_division_by_zero_is_inf() {
        let out = run_named::<f32>("div_f32", &[&[1.0], &[0.0]]).unwrap();
        assert!(out[0].is_infinite());
    }

    #[test]
    fn test_arity_and_length_checks() {
        let a = bytes(&[1i32, 2]);
        let short = bytes(&[1i32]);
        let kernel: KernelName = "add_i32".parse().unwrap();

        let err = execute(ElementwiseParams {
            kernel,
            inputs: &[a.as_slice()],
            count: 2,
        })
        .unwrap_err();
        assert!(matches!(err, KernelError::Arity { expected: 2, got: 1, .. }));

        let err = execute(ElementwiseParams {
            kernel,
            inputs: &[a.as_slice(), short.as_slice()],
            count: 2,
        })
        .unwrap_err();
        assert_eq!(
            err,
            KernelError::OperandLength {
                index: 1,
                expected: 8,
                got: 4
            }
        );
    }
}
