//! # tg_tensor - Tensors with Reverse-Mode Autodiff
//!
//! This crate provides dtype-polymorphic multi-dimensional arrays with a
//! dynamic autograd graph and pluggable compute devices.
//!
//! ## Overview
//!
//! The core abstractions are:
//! - [`DataType`] and [`Scalar`] - element types and the promotion table
//! - [`Shape`] and [`Strides`] - tensor geometry and broadcast rules
//! - [`Device`] - the kernel contract, with [`CpuDevice`] as the reference
//! - [`TensorValue`] - an eager array on one device
//! - [`Tensor`] - a shared handle to an autograd graph node
//!
//! ## Example
//!
//! ```
//! use tg_tensor::prelude::*;
//!
//! let x = tg_tensor::tensor(&[1.0f32, 2.0, 3.0], [1, 3], true);
//! let y = tg_tensor::tensor(&[4.0f32, 5.0, 6.0, 7.0, 8.0, 9.0], [2, 3], true);
//!
//! // Broadcasting multiply, then reverse-mode differentiation.
//! let z = &x * &y;
//! z.backward().unwrap();
//!
//! assert_eq!(x.grad().unwrap().to_vec::<f32>().unwrap(), vec![11.0, 13.0, 15.0]);
//! ```

pub mod device;
pub mod dtype;
pub mod error;
pub mod finite_diff;
pub mod node;
pub mod rng;
pub mod shape;
pub mod value;

use std::sync::{Arc, OnceLock};

pub use device::{CpuDevice, Device, DeviceType};
pub use dtype::{DataType, Element, Scalar};
pub use error::{Result, TensorError};
pub use node::{GradFn, Tensor};
pub use rng::manual_seed;
pub use shape::{Shape, Strides};
pub use value::TensorValue;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::device::{CpuDevice, Device, DeviceType};
    pub use crate::dtype::{DataType, Element, Scalar};
    pub use crate::error::{Result, TensorError};
    pub use crate::node::Tensor;
    pub use crate::shape::{Shape, Strides};
    pub use crate::value::TensorValue;
}

static DEFAULT_DEVICE: OnceLock<Arc<CpuDevice>> = OnceLock::new();

/// The process-wide CPU device, created on first use and shared by every
/// tensor that does not name a device explicitly.
pub fn default_device() -> Arc<dyn Device> {
    DEFAULT_DEVICE.get_or_init(|| Arc::new(CpuDevice::new())).clone()
}

// Convenience constructors. These default to F32 on the process CPU device;
// the `_with` variants choose a dtype and a device. Allocation failures in
// the convenience forms abort, matching the operator overloads.

/// A tensor from host data with an explicit shape.
pub fn tensor<T: Element>(data: &[T], shape: impl Into<Shape>, require_grad: bool) -> Tensor {
    tensor_with(data, shape, require_grad, DataType::F32, default_device())
        .expect("tensor construction failed")
}

/// A tensor from host data with an explicit shape, dtype, and device.
pub fn tensor_with<T: Element>(
    data: &[T],
    shape: impl Into<Shape>,
    require_grad: bool,
    dtype: DataType,
    device: Arc<dyn Device>,
) -> Result<Tensor> {
    let value = TensorValue::from_elems(data, shape.into(), dtype, device)?;
    Tensor::from_value(value, require_grad)
}

/// A rank-0 tensor holding one value.
pub fn scalar(value: f32, require_grad: bool) -> Tensor {
    full(Shape::scalar(), value, require_grad)
}

/// A tensor filled with one value.
pub fn full(shape: impl Into<Shape>, value: f32, require_grad: bool) -> Tensor {
    let value = TensorValue::full(
        Scalar::F32(value),
        shape.into(),
        DataType::F32,
        default_device(),
    )
    .expect("tensor construction failed");
    Tensor::from_value(value, require_grad).expect("tensor construction failed")
}

/// A zero-filled tensor.
pub fn zeros(shape: impl Into<Shape>, require_grad: bool) -> Tensor {
    full(shape, 0.0, require_grad)
}

/// A one-filled tensor.
pub fn ones(shape: impl Into<Shape>, require_grad: bool) -> Tensor {
    full(shape, 1.0, require_grad)
}

/// A zero-filled tensor with another tensor's shape, dtype, and device.
pub fn zeros_like(other: &Tensor, require_grad: bool) -> Result<Tensor> {
    let value = TensorValue::zeros(other.shape(), other.dtype(), other.device())?;
    Tensor::from_value(value, require_grad)
}

/// A one-filled tensor with another tensor's shape, dtype, and device.
pub fn ones_like(other: &Tensor, require_grad: bool) -> Result<Tensor> {
    let value = TensorValue::full(Scalar::F32(1.0), other.shape(), other.dtype(), other.device())?;
    Tensor::from_value(value, require_grad)
}

/// A tensor of random values drawn uniformly from [-1, 1).
pub fn randn(shape: impl Into<Shape>, require_grad: bool) -> Tensor {
    randn_with(shape, require_grad, DataType::F32, default_device())
        .expect("tensor construction failed")
}

/// Like [`randn`] with an explicit dtype and device.
pub fn randn_with(
    shape: impl Into<Shape>,
    require_grad: bool,
    dtype: DataType,
    device: Arc<dyn Device>,
) -> Result<Tensor> {
    use rand::Rng;
    let shape = shape.into();
    let data: Vec<f32> =
        rng::with_rng(|r| (0..shape.numel()).map(|_| r.gen_range(-1.0..1.0)).collect());
    let value = TensorValue::from_elems(&data, shape, dtype, device)?;
    Tensor::from_value(value, require_grad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let z = zeros([2, 3], false);
        assert_eq!(z.to_vec::<f32>().unwrap(), vec![0.0; 6]);

        let o = ones([2], true);
        assert!(o.is_require_grad());
        assert_eq!(o.to_vec::<f32>().unwrap(), vec![1.0, 1.0]);

        let s = scalar(4.0, false);
        assert_eq!(s.item::<f32>().unwrap(), 4.0);
        assert_eq!(s.shape(), Shape::scalar());
    }

    #[test]
    fn test_like_constructors() {
        let base = tensor(&[1.0f32, 2.0, 3.0], [3], false);
        let z = zeros_like(&base, false).unwrap();
        assert_eq!(z.shape(), base.shape());
        assert_eq!(z.to_vec::<f32>().unwrap(), vec![0.0; 3]);
        let o = ones_like(&base, false).unwrap();
        assert_eq!(o.to_vec::<f32>().unwrap(), vec![1.0; 3]);
    }

    #[test]
    fn test_randn_range_and_seeding() {
        manual_seed(7);
        let a = randn([32], false).to_vec::<f32>().unwrap();
        assert!(a.iter().all(|v| (-1.0..1.0).contains(v)));

        manual_seed(7);
        let b = randn([32], false).to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_default_device_is_shared() {
        let a = default_device();
        let b = default_device();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
