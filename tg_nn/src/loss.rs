//! Loss functions.

use tg_tensor::prelude::*;

/// Mean squared error.
pub struct MseLoss;

impl MseLoss {
    pub fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let diff = predictions.sub(targets)?;
        diff.mul(&diff)?.mean()
    }
}

/// Binary cross entropy. Prediction values must lie in (0, 1).
pub struct BinaryCrossEntropyLoss;

impl BinaryCrossEntropyLoss {
    pub fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let positive = targets.mul(&predictions.log()?)?;
        let negative = (1.0 - targets).mul(&(1.0 - predictions).log()?)?;
        positive.add(&negative)?.mean()?.neg()
    }
}
