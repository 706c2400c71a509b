//! Optimizers.

mod adam;
mod sgd;

pub use adam::Adam;
pub use sgd::Sgd;

use tg_tensor::prelude::*;

/// Mutates parameter values in place from their accumulated gradients.
/// In-place updates never invalidate the autograd nodes the parameters
/// belong to.
pub trait Optimizer {
    fn step(&mut self) -> Result<()>;

    fn zero_grad(&self);
}
