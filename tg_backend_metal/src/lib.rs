//! Metal accelerator backend for tg_tensor (macOS only).
//!
//! Provides [`MetalDevice`], a [`tg_tensor::Device`] that batches kernel
//! dispatches onto a single command queue, reuses released buffers through a
//! size-keyed cache, and falls through to the CPU reference kernels for
//! dtypes the hardware cannot run (F64 everywhere; non-atomic dtypes in the
//! reduce scatters).
//!
//! On other platforms the crate is an empty stub so the workspace still
//! builds; [`is_available`] reports whether an accelerator can be created.

#[cfg(target_os = "macos")]
mod allocator;
#[cfg(target_os = "macos")]
mod cache;
#[cfg(target_os = "macos")]
mod device;
#[cfg(target_os = "macos")]
mod shaders;

#[cfg(target_os = "macos")]
pub use device::MetalDevice;

/// True when a Metal device can be created on this machine.
#[cfg(target_os = "macos")]
pub fn is_available() -> bool {
    metal::Device::system_default().is_some()
}

/// True when a Metal device can be created on this machine.
#[cfg(not(target_os = "macos"))]
pub fn is_available() -> bool {
    false
}

#[cfg(all(test, target_os = "macos"))]
mod tests {
    use std::sync::Arc;

    use tg_tensor::prelude::*;

    use crate::MetalDevice;

    fn metal() -> Option<Arc<dyn Device>> {
        if !crate::is_available() {
            return None;
        }
        Some(Arc::new(MetalDevice::new().expect("metal device creation failed")))
    }

    #[test]
    fn test_elementwise_matches_cpu() {
        let Some(dev) = metal() else { return };
        let a = TensorValue::from_elems(&[1.0f32, 2.0, 3.0, 4.0], Shape::new(vec![4]), DataType::F32, dev.clone()).unwrap();
        let b = TensorValue::from_elems(&[10.0f32, 20.0, 30.0, 40.0], Shape::new(vec![4]), DataType::F32, dev).unwrap();
        let c = a.add(&b).unwrap();
        assert_eq!(c.to_vec::<f32>().unwrap(), vec![11.0, 22.0, 33.0, 44.0]);
        let d = a.mul(&b).unwrap();
        assert_eq!(d.to_vec::<f32>().unwrap(), vec![10.0, 40.0, 90.0, 160.0]);
    }

    #[test]
    fn test_f64_falls_through_to_cpu() {
        let Some(dev) = metal() else { return };
        let a = TensorValue::from_elems(&[1.5f64, 2.5], Shape::new(vec![2]), DataType::F64, dev.clone()).unwrap();
        let b = TensorValue::from_elems(&[0.25f64, 0.75], Shape::new(vec![2]), DataType::F64, dev).unwrap();
        let c = a.add(&b).unwrap();
        // Scalar adds are bit-exact between backends.
        assert_eq!(c.to_vec::<f64>().unwrap(), vec![1.75, 3.25]);
    }

    #[test]
    fn test_reduction_and_matmul() {
        let Some(dev) = metal() else { return };
        let data: Vec<f32> = (1..=4096).map(|v| v as f32).collect();
        let t = TensorValue::from_elems(&data, Shape::new(vec![4096]), DataType::F32, dev.clone()).unwrap();
        let total = t.sum().unwrap().item::<f32>().unwrap();
        assert_eq!(total, (4096.0 * 4097.0) / 2.0);

        let a = TensorValue::from_elems(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new(vec![2, 3]), DataType::F32, dev.clone()).unwrap();
        let b = TensorValue::from_elems(&[7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0], Shape::new(vec![3, 2]), DataType::F32, dev).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.to_vec::<f32>().unwrap(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_broadcast_reduce_round_trip() {
        let Some(dev) = metal() else { return };
        let ones = TensorValue::full(Scalar::F32(1.0), Shape::new(vec![3, 1]), DataType::F32, dev).unwrap();
        let wide = ones.broadcast_to(&Shape::new(vec![3, 4])).unwrap();
        let back = wide.reduce_to(&Shape::new(vec![3, 1])).unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), vec![4.0, 4.0, 4.0]);
    }
}
