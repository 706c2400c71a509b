//! Backend parity: the accelerator must agree with the CPU reference.
//!
//! The CPU baselines always run; the Metal comparisons run only on macOS
//! and skip silently when no device is present.

use tg_nn::{Module, MseLoss, Softmax};
use tg_tensor::prelude::*;
use tg_tensor::tensor;

const TOLERANCE: f32 = 1e-5;

#[test]
fn test_mse_loss_cpu_baseline() {
    let pred = tensor(&[1.0f32, 2.0, 3.0, 4.0], [4], false);
    let target = tensor(&[1.1f32, 1.9, 3.2, 3.8], [4], false);
    let loss = MseLoss.forward(&pred, &target).unwrap();
    assert!((loss.item::<f32>().unwrap() - 0.025).abs() < TOLERANCE);
}

#[test]
fn test_softmax_cpu_baseline() {
    let x = tensor(&[1.0f32, 2.0, 3.0], [1, 3], false);
    let y = Softmax.forward(&x).unwrap();
    let total: f32 = y.to_vec::<f32>().unwrap().iter().sum();
    assert!((total - 1.0).abs() < TOLERANCE);
}

#[cfg(target_os = "macos")]
mod metal {
    use super::*;
    use std::sync::Arc;
    use tg_backend_metal::MetalDevice;
    use tg_tensor::tensor_with;

    fn device() -> Option<Arc<dyn Device>> {
        if !tg_backend_metal::is_available() {
            return None;
        }
        Some(Arc::new(MetalDevice::new().expect("metal device creation failed")))
    }

    fn assert_tensors_close(cpu: &Tensor, other: &Tensor, name: &str) {
        let cpu_data = cpu.to_vec::<f32>().unwrap();
        let other_data = other.to_vec::<f32>().unwrap();
        assert_eq!(cpu_data.len(), other_data.len(), "{name}: length mismatch");
        for (i, (c, o)) in cpu_data.iter().zip(other_data.iter()).enumerate() {
            assert!(
                (c - o).abs() < TOLERANCE,
                "{name}[{i}]: cpu={c}, metal={o}"
            );
        }
    }

    #[test]
    fn test_forward_pass_matches_cpu() {
        let Some(dev) = device() else { return };

        let x_data = [0.5f32, -1.0, 2.0, 0.25, 1.5, -0.75];
        let w_data = [0.1f32, -0.2, 0.3, 0.4, -0.5, 0.6];

        let x_cpu = tensor(&x_data, [2, 3], false);
        let w_cpu = tensor(&w_data, [3, 2], false);
        let y_cpu = x_cpu.matmul(&w_cpu).unwrap().tanh().unwrap();

        let x_gpu = tensor_with(&x_data, [2, 3], false, DataType::F32, dev.clone()).unwrap();
        let w_gpu = tensor_with(&w_data, [3, 2], false, DataType::F32, dev).unwrap();
        let y_gpu = x_gpu.matmul(&w_gpu).unwrap().tanh().unwrap();

        assert_tensors_close(&y_cpu, &y_gpu, "matmul+tanh");
    }

    #[test]
    fn test_f64_add_falls_back_bit_exact() {
        let Some(dev) = device() else { return };

        let a = [1.125f64, -2.5, 3.0625, 7.75];
        let b = [0.875f64, 2.5, -1.0625, 0.25];

        let cpu_sum: Vec<f64> = a.iter().zip(b.iter()).map(|(x, y)| x + y).collect();

        let ga = tensor_with(&a, [4], false, DataType::F64, dev.clone()).unwrap();
        let gb = tensor_with(&b, [4], false, DataType::F64, dev).unwrap();
        let gpu_sum = ga.add(&gb).unwrap().to_vec::<f64>().unwrap();

        // Scalar adds are bit-exact; the F64 path runs on the CPU oracle.
        assert_eq!(cpu_sum, gpu_sum);
    }

    #[test]
    fn test_gradients_match_cpu() {
        let Some(dev) = device() else { return };

        let data = [0.3f32, -0.6, 0.9, 1.2];

        let x_cpu = tensor(&data, [2, 2], true);
        let loss_cpu = (&x_cpu * &x_cpu).sum().unwrap();
        loss_cpu.backward().unwrap();

        let x_gpu = tensor_with(&data, [2, 2], true, DataType::F32, dev).unwrap();
        let loss_gpu = x_gpu.mul(&x_gpu).unwrap().sum().unwrap();
        loss_gpu.backward().unwrap();

        let g_cpu = x_cpu.grad().unwrap().to_vec::<f32>().unwrap();
        let g_gpu = x_gpu.grad().unwrap().to_vec::<f32>().unwrap();
        for (c, g) in g_cpu.iter().zip(g_gpu.iter()) {
            assert!((c - g).abs() < TOLERANCE);
        }
    }
}
