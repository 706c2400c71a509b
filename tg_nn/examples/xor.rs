//! XOR training example.
//!
//! Trains a 2-4-1 MLP with tanh hidden activation and per-sample bias rows
//! to learn the XOR function, the classic non-linearly-separable problem.

use std::time::Instant;

use tg_nn::{Adam, Module, MseLoss, Optimizer};
use tg_tensor::prelude::*;
use tg_tensor::{randn, tensor};

struct NeuralNet {
    w1: Tensor,
    b1: Tensor,
    w2: Tensor,
    b2: Tensor,
}

impl NeuralNet {
    fn new(num_inputs: usize, num_outputs: usize, num_samples: usize) -> Self {
        let hidden = 4;
        NeuralNet {
            w1: randn([num_inputs, hidden], true),
            b1: randn([num_samples, hidden], true),
            w2: randn([hidden, num_outputs], true),
            b2: randn([num_samples, num_outputs], true),
        }
    }
}

impl Module for NeuralNet {
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

fn main() -> Result<()> {
    const NUM_SAMPLES: usize = 4;
    const NUM_INPUTS: usize = 2;
    const NUM_TARGETS: usize = 1;
    const NUM_EPOCHS: usize = 1000;
    const LOG_INTERVAL: usize = 100;
    const LEARNING_RATE: f32 = 0.05;
    const LOSS_THRESHOLD: f32 = 1e-5;

    let inputs = tensor(
        &[0.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0],
        [NUM_SAMPLES, NUM_INPUTS],
        false,
    );
    let targets = tensor(&[0.0f32, 1.0, 1.0, 0.0], [NUM_SAMPLES, NUM_TARGETS], false);

    let model = NeuralNet::new(NUM_INPUTS, NUM_TARGETS, NUM_SAMPLES);
    let mut optimizer = Adam::new(model.parameters(), LEARNING_RATE)?;

    let start = Instant::now();
    let mut epochs_run = 0;
    for epoch in 0..NUM_EPOCHS {
        epochs_run = epoch + 1;
        optimizer.zero_grad();

        let predictions = model.forward(&inputs)?;
        let loss = MseLoss.forward(&predictions, &targets)?;
        loss.backward()?;
        optimizer.step()?;

        let loss_value = loss.item::<f32>()?;
        if epoch % LOG_INTERVAL == 0 || loss_value <= LOSS_THRESHOLD {
            println!("Epoch: {epoch} Loss = {loss_value}");
        }
        if loss_value <= LOSS_THRESHOLD {
            break;
        }
    }

    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
    println!();
    println!(
        "Training: {elapsed:.2} ms - Avg Iteration: {:.3} ms",
        elapsed / epochs_run as f64
    );

    println!("Final Predictions:");
    let predictions = model.forward(&inputs)?;
    for value in predictions.to_vec::<f32>()? {
        println!("{value}");
    }

    Ok(())
}
