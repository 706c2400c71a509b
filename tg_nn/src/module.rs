//! Module trait and containers.

use std::sync::Arc;

use tg_tensor::prelude::*;

/// A unit of a model: a forward function over tensors plus the learnable
/// parameters it owns. Parameter tensors are shared handles, so optimizer
/// updates through them are visible to the module.
pub trait Module {
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Every learnable parameter, in registration order.
    fn parameters(&self) -> Vec<Tensor>;

    /// Total number of elements across parameters that require gradients.
    fn learnable_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|p| p.is_require_grad())
            .map(|p| p.size())
            .sum()
    }

    /// Reset every parameter gradient to zero.
    fn zero_grad(&self) {
        for param in self.parameters() {
            param.zero_grad();
        }
    }

    /// Move every parameter (value and gradient) to a device.
    fn to_device(&self, device: Arc<dyn Device>) -> Result<()> {
        for param in self.parameters() {
            param.to_device(device.clone())?;
        }
        Ok(())
    }
}

/// Chains modules, feeding each output into the next.
#[derive(Default)]
pub struct Sequential {
    modules: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new() -> Self {
        Sequential { modules: Vec::new() }
    }

    pub fn add(&mut self, module: impl Module + 'static) {
        self.modules.push(Box::new(module));
    }
}

impl Module for Sequential {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut current = x.clone();
        for module in &self.modules {
            current = module.forward(&current)?;
        }
        Ok(current)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.modules.iter().flat_map(|m| m.parameters()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;

    #[test]
    fn test_sequential_collects_parameters() {
        let mut model = Sequential::new();
        model.add(Linear::new(2, 4));
        model.add(crate::activations::Tanh);
        model.add(Linear::new(4, 1));

        // Two weight matrices and two bias rows.
        assert_eq!(model.parameters().len(), 4);
        assert_eq!(model.learnable_parameters(), 2 * 4 + 4 + 4 + 1);
    }

    #[test]
    fn test_sequential_forward() {
        let mut model = Sequential::new();
        model.add(Linear::new(3, 2));
        let x = tg_tensor::tensor(&[1.0f32, 2.0, 3.0], [1, 3], false);
        let y = model.forward(&x).unwrap();
        assert_eq!(y.shape(), Shape::new(vec![1, 2]));
    }

    #[test]
    fn test_zero_grad_clears_all() {
        let model = Linear::new(2, 2);
        let x = tg_tensor::tensor(&[1.0f32, 2.0], [1, 2], false);
        let loss = model.forward(&x).unwrap().sum().unwrap();
        loss.backward().unwrap();
        model.zero_grad();
        for param in model.parameters() {
            let grad = param.grad().unwrap();
            assert!(grad.to_vec::<f32>().unwrap().iter().all(|&g| g == 0.0));
        }
    }
}
