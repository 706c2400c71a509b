//! Activation modules.

use tg_tensor::prelude::*;

use crate::module::Module;

pub struct Tanh;

impl Module for Tanh {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.tanh()
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

pub struct Sigmoid;

impl Module for Sigmoid {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // 1 / (1 + e^-x)
        let e = x.neg()?.exp()?;
        Ok(1.0 / (&e + 1.0))
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

pub struct Softmax;

impl Module for Softmax {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let exp_x = x.exp()?;
        let total = exp_x.sum()?;
        Ok(&exp_x / &total)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

pub struct LogSoftmax;

impl Module for LogSoftmax {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // log(e^x / sum(e^x)) = x - log(sum(e^x))
        let log_total = x.exp()?.sum()?.log()?;
        Ok(x - &log_total)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

pub struct GeLU;

impl Module for GeLU {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let scale = (2.0f32 / std::f32::consts::PI).sqrt();
        let cubic = x + &(&(&(x * x) * x) * 0.044715);
        let gate = (&cubic * scale).tanh()? + 1.0;
        Ok(&(x * 0.5) * &gate)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_tensor::tensor;

    #[test]
    fn test_tanh_and_sigmoid_ranges() {
        let x = tensor(&[-5.0f32, 0.0, 5.0], [3], false);

        let t = Tanh.forward(&x).unwrap().to_vec::<f32>().unwrap();
        assert!((t[1]).abs() < 1e-6);
        assert!(t[0] > -1.0 && t[2] < 1.0);

        let s = Sigmoid.forward(&x).unwrap().to_vec::<f32>().unwrap();
        assert!((s[1] - 0.5).abs() < 1e-6);
        assert!(s[0] > 0.0 && s[2] < 1.0);
        assert!(s[0] < 0.01 && s[2] > 0.99);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let x = tensor(&[1.0f32, 2.0, 3.0], [3], false);
        let y = Softmax.forward(&x).unwrap().to_vec::<f32>().unwrap();
        let total: f32 = y.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(y[2] > y[1] && y[1] > y[0]);
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let x = tensor(&[0.5f32, 1.5, -0.5], [3], false);
        let soft = Softmax.forward(&x).unwrap().to_vec::<f32>().unwrap();
        let log_soft = LogSoftmax.forward(&x).unwrap().to_vec::<f32>().unwrap();
        for i in 0..3 {
            assert!((log_soft[i] - soft[i].ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn test_gelu_reference_values() {
        let x = tensor(&[-1.0f32, 0.0, 1.0, 2.0], [4], false);
        let y = GeLU.forward(&x).unwrap().to_vec::<f32>().unwrap();
        let expected = [-0.15880801, 0.0, 0.841192, 1.9545977];
        for i in 0..4 {
            assert!((y[i] - expected[i]).abs() < 1e-4, "{}: {} vs {}", i, y[i], expected[i]);
        }
    }
}
