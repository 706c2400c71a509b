//! End-to-end training tests.

use tg_nn::{Adam, Linear, Module, MseLoss, Optimizer, Sgd, Tanh};
use tg_tensor::prelude::*;
use tg_tensor::{manual_seed, randn, tensor};

/// A 2-4-1 network with one bias row per sample, tanh in the hidden layer.
struct XorNet {
    w1: Tensor,
    b1: Tensor,
    w2: Tensor,
    b2: Tensor,
}

impl XorNet {
    fn new(num_inputs: usize, num_outputs: usize, num_samples: usize) -> Self {
        let hidden = 4;
        XorNet {
            w1: randn([num_inputs, hidden], true),
            b1: randn([num_samples, hidden], true),
            w2: randn([hidden, num_outputs], true),
            b2: randn([num_samples, num_outputs], true),
        }
    }
}

impl Module for XorNet {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = x.matmul(&self.w1)?.add(&self.b1)?.tanh()?;
        hidden.matmul(&self.w2)?.add(&self.b2)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![
            self.w1.clone(),
            self.b1.clone(),
            self.w2.clone(),
            self.b2.clone(),
        ]
    }
}

#[test]
fn test_xor_training_converges() {
    manual_seed(42);

    let inputs = tensor(
        &[0.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0],
        [4, 2],
        false,
    );
    let targets = tensor(&[0.0f32, 1.0, 1.0, 0.0], [4, 1], false);

    let model = XorNet::new(2, 1, 4);
    let mut optimizer = Adam::new(model.parameters(), 0.05).unwrap();

    let mut last_loss = f32::INFINITY;
    for _epoch in 0..1000 {
        optimizer.zero_grad();
        let predictions = model.forward(&inputs).unwrap();
        let loss = MseLoss.forward(&predictions, &targets).unwrap();
        loss.backward().unwrap();
        optimizer.step().unwrap();

        last_loss = loss.item::<f32>().unwrap();
        if last_loss <= 1e-5 {
            break;
        }
    }

    assert!(
        last_loss < 1e-3,
        "loss failed to converge below 1e-3: {last_loss}"
    );

    // Predictions should land on the right side of 0.5 for every sample.
    let predictions = model.forward(&inputs).unwrap().to_vec::<f32>().unwrap();
    let expected = [0.0f32, 1.0, 1.0, 0.0];
    for (p, e) in predictions.iter().zip(expected.iter()) {
        assert!((p - e).abs() < 0.5, "prediction {p} too far from {e}");
    }
}

#[test]
fn test_deep_network_learns_quadratic() {
    manual_seed(7);

    let xs: Vec<f32> = vec![-2.0, -1.5, -1.0, -0.5, 0.0, 0.5, 1.0, 1.5, 2.0];

    let l1 = Linear::new(1, 16);
    let l2 = Linear::new(16, 1);
    let params: Vec<Tensor> = l1.parameters().into_iter().chain(l2.parameters()).collect();
    let mut optimizer = Adam::new(params, 0.05).unwrap();

    let mut final_loss = f32::INFINITY;
    for _epoch in 0..500 {
        let mut epoch_loss = 0.0;
        for &x_val in &xs {
            optimizer.zero_grad();
            let x = tensor(&[x_val], [1, 1], false);
            let y = tensor(&[x_val * x_val], [1, 1], false);

            let hidden = l1.forward(&x).unwrap().tanh().unwrap();
            let prediction = l2.forward(&hidden).unwrap();
            let loss = MseLoss.forward(&prediction, &y).unwrap();
            loss.backward().unwrap();
            optimizer.step().unwrap();
            epoch_loss += loss.item::<f32>().unwrap();
        }
        final_loss = epoch_loss / xs.len() as f32;
    }

    assert!(final_loss < 0.05, "average loss stayed at {final_loss}");
}

#[test]
fn test_sgd_trains_linear_regression() {
    manual_seed(3);

    // y = 2x + 1 from noiseless samples.
    let layer = Linear::new(1, 1);
    let mut optimizer = Sgd::new(layer.parameters(), 0.05);

    for _epoch in 0..300 {
        for x_val in [-1.0f32, -0.5, 0.0, 0.5, 1.0] {
            optimizer.zero_grad();
            let x = tensor(&[x_val], [1, 1], false);
            let y = tensor(&[2.0 * x_val + 1.0], [1, 1], false);
            let loss = MseLoss.forward(&layer.forward(&x).unwrap(), &y).unwrap();
            loss.backward().unwrap();
            optimizer.step().unwrap();
        }
    }

    let w = layer.weight.to_vec::<f32>().unwrap()[0];
    let b = layer.bias.to_vec::<f32>().unwrap()[0];
    assert!((w - 2.0).abs() < 0.05, "weight {w}");
    assert!((b - 1.0).abs() < 0.05, "bias {b}");
}

#[test]
fn test_tanh_module_in_training_graph() {
    manual_seed(11);
    let x = tensor(&[0.5f32, -0.5], [1, 2], true);
    let y = Tanh.forward(&x).unwrap().sum().unwrap();
    y.backward().unwrap();

    let grads = x.grad().unwrap().to_vec::<f32>().unwrap();
    for (g, v) in grads.iter().zip([0.5f32, -0.5]) {
        let expected = 1.0 - v.tanh().powi(2);
        assert!((g - expected).abs() < 1e-5);
    }
}
