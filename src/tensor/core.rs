use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

use rand::distributions::Uniform;
use rand::prelude::Distribution;
use tracing::{debug, instrument};

use super::kernels::ElementwiseOp;
use super::registry::{row_major_strides, RealizationState, TensorId, TensorRecord};
use crate::device::CPU;
use crate::dtype::{ByteBuffer, DType, Element};
use crate::error::{Result, TensorError};
use crate::runtime::Runtime;

/// Handle to a tensor record owned by a [`Runtime`]
///
/// Operators only record work; bytes are produced when the tensor is
/// realized. Dropping the handle releases the record, which stays alive for
/// as long as pending operations still read it.
pub struct Tensor {
    id: TensorId,
    shape: Vec<usize>,
    dtype: DType,
    runtime: Arc<Runtime>,
}

impl Tensor {
    /// Create a CPU tensor from data and shape
    pub fn from_vec<T: Element>(data: Vec<T>, shape: Vec<usize>) -> Result<Self> {
        Self::from_vec_on(data, shape, CPU)
    }

    pub fn from_vec_on<T: Element>(data: Vec<T>, shape: Vec<usize>, device: &str) -> Result<Self> {
        Self::from_vec_in(&Runtime::global(), data, shape, device)
    }

    pub fn from_vec_in<T: Element>(
        runtime: &Arc<Runtime>,
        data: Vec<T>,
        shape: Vec<usize>,
        device: &str,
    ) -> Result<Self> {
        Self::from_buffer(runtime, ByteBuffer::from_slice(&data), shape, device)
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self> {
        Self::zeros_in(&Runtime::global(), shape, dtype, CPU)
    }

    pub fn zeros_in(
        runtime: &Arc<Runtime>,
        shape: Vec<usize>,
        dtype: DType,
        device: &str,
    ) -> Result<Self> {
        if dtype.is_none() {
            return Err(TensorError::UnsupportedOperation(format!(
                "zeros_{}",
                dtype.repr
            )));
        }
        let numel = shape.iter().product();
        Self::from_buffer(runtime, ByteBuffer::zeroed(dtype, numel), shape, device)
    }

    /// Create a tensor filled with ones
    pub fn ones(shape: Vec<usize>, dtype: DType) -> Result<Self> {
        Self::ones_in(&Runtime::global(), shape, dtype, CPU)
    }

    pub fn ones_in(
        runtime: &Arc<Runtime>,
        shape: Vec<usize>,
        dtype: DType,
        device: &str,
    ) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let data = match dtype.repr {
            "f32" => ByteBuffer::from_slice(&vec![1.0f32; numel]),
            "i32" => ByteBuffer::from_slice(&vec![1i32; numel]),
            "i64" => ByteBuffer::from_slice(&vec![1i64; numel]),
            "b" => ByteBuffer::new(vec![1u8; numel], dtype)?,
            other => return Err(TensorError::UnsupportedOperation(format!("ones_{other}"))),
        };
        Self::from_buffer(runtime, data, shape, device)
    }

    /// Create an f32 tensor with values drawn uniformly from [-1, 1)
    pub fn randn(shape: Vec<usize>) -> Result<Self> {
        Self::randn_in(&Runtime::global(), shape, CPU)
    }

    pub fn randn_in(runtime: &Arc<Runtime>, shape: Vec<usize>, device: &str) -> Result<Self> {
        let numel = shape.iter().product::<usize>();
        let mut rng = rand::thread_rng();
        let uniform = Uniform::new(-1.0f32, 1.0);
        let data: Vec<f32> = (0..numel).map(|_| uniform.sample(&mut rng)).collect();
        Self::from_vec_in(runtime, data, shape, device)
    }

    #[instrument(skip(runtime, data), fields(dtype = %data.dtype(), count = data.count()))]
    fn from_buffer(
        runtime: &Arc<Runtime>,
        data: ByteBuffer,
        shape: Vec<usize>,
        device: &str,
    ) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.count() {
            return Err(TensorError::ShapeMismatch {
                expected: shape,
                got: vec![data.count()],
            });
        }
        let device = runtime.device(device)?;
        let dtype = data.dtype();
        let id = runtime
            .tensors()
            .register(TensorRecord::realized(data, shape.clone(), Arc::clone(&device)));
        // Released by Drop if the upload fails.
        let tensor = Tensor {
            id,
            shape,
            dtype,
            runtime: Arc::clone(runtime),
        };
        let bytes = runtime.tensors().with_record(id, |r| r.data.as_bytes().to_vec())?;
        device.backend().assign(id, &bytes)?;
        Ok(tensor)
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> Vec<usize> {
        row_major_strides(&self.shape)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn device_name(&self) -> Result<String> {
        self.runtime
            .tensors()
            .with_record(self.id, |r| r.device.name().to_string())
    }

    pub fn state(&self) -> Result<RealizationState> {
        self.runtime.tensors().with_record(self.id, |r| r.state)
    }

    pub fn parents(&self) -> Result<Vec<TensorId>> {
        self.runtime
            .tensors()
            .with_record(self.id, |r| r.parents.clone())
    }

    pub fn requires_grad(&self) -> Result<bool> {
        self.runtime.tensors().with_record(self.id, |r| r.requires_grad)
    }

    pub fn set_requires_grad(&self, requires_grad: bool) -> Result<()> {
        self.runtime
            .tensors()
            .with_record_mut(self.id, |r| r.requires_grad = requires_grad)
    }

    /// Always `None`; gradients are not computed.
    pub fn grad(&self) -> Result<Option<ByteBuffer>> {
        self.runtime.tensors().with_record(self.id, |r| r.grad.clone())
    }

    /// Realize and return the host bytes
    pub fn data(&self) -> Result<ByteBuffer> {
        self.realize(true)?;
        self.runtime.tensors().with_record(self.id, |r| r.data.clone())
    }

    /// Realize and decode the host bytes
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype.repr,
                got: T::DTYPE.repr,
            });
        }
        self.data()?.to_vec()
    }

    /// Make the host bytes valid.
    ///
    /// With `force` false the pending invocation is only submitted and the
    /// call returns at once. With `force` true it blocks until the bytes are
    /// copied back. Realizing an already realized tensor does nothing.
    #[instrument(skip(self), fields(tensor = %self.id))]
    pub fn realize(&self, force: bool) -> Result<()> {
        let tensors = self.runtime.tensors();
        let (state, device, nbytes) =
            tensors.with_record(self.id, |r| (r.state, Arc::clone(&r.device), r.nbytes()))?;
        if state == RealizationState::Realized {
            return Ok(());
        }

        let backend = device.backend();
        backend.schedule_realize(self.id)?;
        if !force {
            if state == RealizationState::Unrealized {
                tensors.with_record_mut(self.id, |r| r.state = RealizationState::Scheduled)?;
            }
            return Ok(());
        }

        let mut bytes = vec![0u8; nbytes];
        if let Err(e) = backend.copy_to_host(self.id, &mut bytes) {
            if e.is_execution() {
                tensors.with_record_mut(self.id, |r| r.state = RealizationState::Failed)?;
            }
            return Err(e);
        }

        let data = ByteBuffer::new(bytes, self.dtype)?;
        tensors.with_record_mut(self.id, |r| {
            r.data = data;
            r.state = RealizationState::Realized;
        })?;
        tensors.unpin_parents(self.id);
        debug!(tensor = %self.id, device = device.name(), "realized");
        Ok(())
    }

    /// Move the tensor's storage to `device`, realizing it first.
    #[instrument(skip(self), fields(tensor = %self.id))]
    pub fn to(&self, device: &str) -> Result<()> {
        let target = self.runtime.device(device)?;
        let tensors = self.runtime.tensors();
        let current = tensors.with_record(self.id, |r| Arc::clone(&r.device))?;
        if current.name() == target.name() {
            return Ok(());
        }

        self.realize(true)?;
        let bytes = tensors.with_record(self.id, |r| r.data.as_bytes().to_vec())?;
        target.backend().assign(self.id, &bytes)?;
        tensors.move_to(self.id, target)?;
        debug!(tensor = %self.id, from = current.name(), to = device, "moved");
        Ok(())
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.elementwise(ElementwiseOp::Add, &[self, other])
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.elementwise(ElementwiseOp::Sub, &[self, other])
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.elementwise(ElementwiseOp::Mul, &[self, other])
    }

    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.elementwise(ElementwiseOp::Div, &[self, other])
    }

    pub fn neg(&self) -> Result<Tensor> {
        self.elementwise(ElementwiseOp::Neg, &[self])
    }

    /// Record `op` over `operands` as a new unrealized tensor.
    #[instrument(skip(self, op, operands), fields(op = op.name(), shape = ?self.shape))]
    fn elementwise(&self, op: ElementwiseOp, operands: &[&Tensor]) -> Result<Tensor> {
        let tensors = self.runtime.tensors();
        let meta = operands
            .iter()
            .map(|t| tensors.with_record(t.id, |r| (Arc::clone(&r.device), r.requires_grad)))
            .collect::<Result<Vec<_>>>()?;

        let device = &meta[0].0;
        if let Some((other, _)) = meta.iter().find(|(d, _)| d.name() != device.name()) {
            return Err(TensorError::MixedDevice {
                left: device.name().to_string(),
                right: other.name().to_string(),
            });
        }
        if let Some(other) = operands.iter().find(|t| t.shape != self.shape) {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        if let Some(other) = operands.iter().find(|t| t.dtype != self.dtype) {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype.repr,
                got: other.dtype.repr,
            });
        }

        let parents: Vec<TensorId> = operands.iter().map(|t| t.id).collect();
        let requires_grad = meta.iter().any(|(_, rg)| *rg);
        let id = tensors.register(TensorRecord::pending(
            self.dtype,
            self.shape.clone(),
            parents.clone(),
            Arc::clone(device),
            requires_grad,
        ));
        // Dropping `result` on any error below discards the record.
        let result = Tensor {
            id,
            shape: self.shape.clone(),
            dtype: self.dtype,
            runtime: Arc::clone(&self.runtime),
        };
        tensors.pin_parents(id)?;

        let kernel = format!("{}_{}", op.name(), self.dtype.repr);
        device.backend().enqueue_kernel(&parents, id, &kernel)?;
        Ok(result)
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        self.runtime.tensors().release(self.id);
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state().ok();
        let device = self.device_name().ok();
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype.repr)
            .field("device", &device)
            .field("state", &state)
            .finish()
    }
}

impl Add for &Tensor {
    type Output = Result<Tensor>;

    fn add(self, rhs: Self) -> Self::Output {
        Tensor::add(self, rhs)
    }
}

impl Sub for &Tensor {
    type Output = Result<Tensor>;

    fn sub(self, rhs: Self) -> Self::Output {
        Tensor::sub(self, rhs)
    }
}

impl Mul for &Tensor {
    type Output = Result<Tensor>;

    fn mul(self, rhs: Self) -> Self::Output {
        Tensor::mul(self, rhs)
    }
}

impl Div for &Tensor {
    type Output = Result<Tensor>;

    fn div(self, rhs: Self) -> Self::Output {
        Tensor::div(self, rhs)
    }
}

impl Neg for &Tensor {
    type Output = Result<Tensor>;

    fn neg(self) -> Self::Output {
        Tensor::neg(self)
    }
}
