//! Stochastic gradient descent.

use tg_tensor::prelude::*;

use super::Optimizer;

pub struct Sgd {
    parameters: Vec<Tensor>,
    lr: f32,
}

impl Sgd {
    pub fn new(parameters: Vec<Tensor>, lr: f32) -> Self {
        Sgd { parameters, lr }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self) -> Result<()> {
        for param in &self.parameters {
            if param.is_require_grad() {
                // w' = w - lr * dw
                let delta = param.grad()?.mul_scalar(Scalar::F32(self.lr))?;
                param.value_mut().sub_in_place(&delta)?;
            }
        }
        Ok(())
    }

    fn zero_grad(&self) {
        for param in &self.parameters {
            param.zero_grad();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_tensor::tensor;

    #[test]
    fn test_step_moves_against_gradient() {
        let w = tensor(&[1.0f32, -1.0], [2], true);
        let loss = (&w * &w).sum().unwrap();
        loss.backward().unwrap();

        let mut opt = Sgd::new(vec![w.clone()], 0.1);
        opt.step().unwrap();

        // dw = 2w, so w' = w - 0.2 w = 0.8 w.
        let updated = w.to_vec::<f32>().unwrap();
        assert!((updated[0] - 0.8).abs() < 1e-6);
        assert!((updated[1] + 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_converges_on_quadratic() {
        let x = tensor(&[10.0f32], [1], true);
        let mut opt = Sgd::new(vec![x.clone()], 0.1);

        for _ in 0..50 {
            opt.zero_grad();
            let loss = (&x * &x).sum().unwrap();
            loss.backward().unwrap();
            opt.step().unwrap();
        }
        assert!(x.to_vec::<f32>().unwrap()[0].abs() < 0.01);
    }
}
