//! Error types surfaced by tensor operations.

use thiserror::Error;

use crate::dtype::DataType;

pub type Result<T> = std::result::Result<T, TensorError>;

/// Failure modes of the tensor engine, raised at the call site of the
/// offending operation. Invalid preconditions abort before any buffer is
/// allocated.
#[derive(Debug, Error)]
pub enum TensorError {
    /// Reshape count mismatch, broadcast incompatibility, matmul inner-dim
    /// mismatch, transpose dim out of range, or a backward seed whose shape
    /// cannot be accumulated into the expected gradient shape.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The device cannot execute the operation for this dtype and no
    /// fallback applies.
    #[error("data type {dtype:?} is not supported for {op}")]
    DTypeUnsupported { op: &'static str, dtype: DataType },

    /// `.grad()` was read on a non-leaf tensor without `retain_grad`.
    #[error(
        "gradients for non-leaf tensors are not populated during backward; \
         call retain_grad() on the non-leaf tensor first, or access the leaf instead"
    )]
    InvalidGradAccess,

    /// Device memory exhausted after cache eviction.
    #[error("device memory allocation failed for {bytes} bytes")]
    AllocationFailure { bytes: usize },

    /// An accelerator command buffer failed after submission.
    #[error("device fault: {0}")]
    DeviceFault(String),

    /// The persistence layer could not open, read, or write a file.
    #[error("i/o failure: {0}")]
    IoFailure(#[from] std::io::Error),
}
