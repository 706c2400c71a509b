//! Linear (fully connected) layer.

use tg_tensor::prelude::*;
use tg_tensor::randn;

use crate::module::Module;

/// A fully connected layer: `y = x @ W + b`.
///
/// The weight has shape `[inputs, outputs]` and the bias `[1, outputs]`,
/// broadcast over the batch dimension.
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
}

impl Linear {
    /// Create a layer with weights and bias drawn uniformly from [-1, 1).
    pub fn new(num_inputs: usize, num_outputs: usize) -> Self {
        Linear {
            weight: randn([num_inputs, num_outputs], true),
            bias: randn([1, num_outputs], true),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().dim(0)
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape().dim(1)
    }
}

impl Module for Linear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.matmul(&self.weight)?.add(&self.bias)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shape() {
        let layer = Linear::new(3, 2);
        let x = tg_tensor::tensor(&[1.0f32, 2.0, 3.0], [1, 3], false);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), Shape::new(vec![1, 2]));
        assert_eq!(layer.in_features(), 3);
        assert_eq!(layer.out_features(), 2);
    }

    #[test]
    fn test_batch_bias_broadcast() {
        let layer = Linear::new(2, 2);
        let x = tg_tensor::tensor(&[1.0f32, 0.0, 0.0, 1.0, 1.0, 1.0], [3, 2], false);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), Shape::new(vec![3, 2]));
    }

    #[test]
    fn test_gradients_reach_parameters() {
        let layer = Linear::new(2, 1);
        let x = tg_tensor::tensor(&[0.5f32, -0.5], [1, 2], true);
        let loss = layer.forward(&x).unwrap().sum().unwrap();
        loss.backward().unwrap();

        let wg = layer.weight.grad().unwrap().to_vec::<f32>().unwrap();
        assert_eq!(wg, vec![0.5, -0.5]);
        let bg = layer.bias.grad().unwrap().to_vec::<f32>().unwrap();
        assert_eq!(bg, vec![1.0]);
    }
}
