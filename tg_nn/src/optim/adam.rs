//! Adam optimizer (adaptive moment estimation).

use tg_tensor::prelude::*;

use super::Optimizer;

pub struct Adam {
    parameters: Vec<Tensor>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    timestep: u64,
    /// First moment estimate per parameter.
    m: Vec<TensorValue>,
    /// Second raw moment estimate per parameter.
    v: Vec<TensorValue>,
}

impl Adam {
    pub fn new(parameters: Vec<Tensor>, lr: f32) -> Result<Self> {
        Self::with_params(parameters, lr, 0.9, 0.999, 1e-8)
    }

    pub fn with_params(
        parameters: Vec<Tensor>,
        lr: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> Result<Self> {
        let mut m = Vec::with_capacity(parameters.len());
        let mut v = Vec::with_capacity(parameters.len());
        for param in &parameters {
            m.push(TensorValue::zeros(param.shape(), param.dtype(), param.device())?);
            v.push(TensorValue::zeros(param.shape(), param.dtype(), param.device())?);
        }
        Ok(Adam {
            parameters,
            lr,
            beta1,
            beta2,
            epsilon,
            timestep: 0,
            m,
            v,
        })
    }
}

impl Optimizer for Adam {
    fn step(&mut self) -> Result<()> {
        self.timestep += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.timestep as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.timestep as i32);

        for (i, param) in self.parameters.iter().enumerate() {
            if !param.is_require_grad() {
                continue;
            }
            let grad = param.grad()?;

            // Biased moment estimates.
            self.m[i] = self.m[i]
                .mul_scalar(Scalar::F32(self.beta1))?
                .add(&grad.mul_scalar(Scalar::F32(1.0 - self.beta1))?)?;
            let grad_sq = grad.mul(&grad)?;
            self.v[i] = self.v[i]
                .mul_scalar(Scalar::F32(self.beta2))?
                .add(&grad_sq.mul_scalar(Scalar::F32(1.0 - self.beta2))?)?;

            // Bias-corrected estimates and the update itself.
            let m_hat = self.m[i].div_scalar(Scalar::F32(bias_correction1))?;
            let v_hat = self.v[i].div_scalar(Scalar::F32(bias_correction2))?;
            let denom = v_hat.sqrt()?.add_scalar(Scalar::F32(self.epsilon))?;
            let update = m_hat.mul_scalar(Scalar::F32(self.lr))?.div(&denom)?;

            param.value_mut().sub_in_place(&update)?;
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
        let w = tensor(&[1.0f32, 2.0], [2], true);
        let loss = (&w * &w).sum().unwrap();
        loss.backward().unwrap();

        let before = w.to_vec::<f32>().unwrap();
        let mut opt = Adam::new(vec![w.clone()], 0.1).unwrap();
        opt.step().unwrap();
        let after = w.to_vec::<f32>().unwrap();

        for i in 0..2 {
            assert!(after[i] < before[i]);
        }
    }

    #[test]
    fn test_converges_on_quadratic() {
        let x = tensor(&[10.0f32], [1], true);
        let mut opt = Adam::new(vec![x.clone()], 0.5).unwrap();

        for _ in 0..100 {
            opt.zero_grad();
            let loss = (&x * &x).sum().unwrap();
            loss.backward().unwrap();
            opt.step().unwrap();
        }
        assert!(x.to_vec::<f32>().unwrap()[0].abs() < 0.5);
    }
}
