//! # tg_nn - Neural Network Building Blocks for tg_tensor
//!
//! Modules, activations, losses, optimizers, and parameter persistence on
//! top of the tg_tensor autograd engine.
//!
//! ## Example: one training step
//!
//! ```
//! use tg_nn::{Linear, Module, MseLoss, Optimizer, Sgd};
//!
//! let layer = Linear::new(2, 1);
//! let mut opt = Sgd::new(layer.parameters(), 0.01);
//!
//! let x = tg_tensor::tensor(&[1.0f32, 2.0], [1, 2], false);
//! let target = tg_tensor::tensor(&[5.0f32], [1, 1], false);
//!
//! opt.zero_grad();
//! let prediction = layer.forward(&x).unwrap();
//! let loss = MseLoss.forward(&prediction, &target).unwrap();
//! loss.backward().unwrap();
//! opt.step().unwrap();
//! ```

pub mod activations;
pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;
pub mod serialize;

pub use activations::{GeLU, LogSoftmax, Sigmoid, Softmax, Tanh};
pub use layers::Linear;
pub use loss::{BinaryCrossEntropyLoss, MseLoss};
pub use module::{Module, Sequential};
pub use optim::{Adam, Optimizer, Sgd};
pub use serialize::{load, save};
