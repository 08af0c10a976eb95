//! Error types for log-space numerics and emission densities.

use dmvflow_diff::DiffError;
use thiserror::Error;

/// Errors that can occur in probability computations.
///
/// Every variant is a precondition violation; callers are expected to abort
/// the run rather than recover.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProbError {
    /// Gaussian variance must be strictly positive in every dimension.
    #[error("Non-positive variance {value} in dimension {dim}")]
    NonPositiveVariance { dim: usize, value: f64 },

    /// Embedding width doesn't match the emission model.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Normalization axis beyond the tensor rank.
    #[error("Axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    /// Underlying tensor error.
    #[error(transparent)]
    Tensor(#[from] DiffError),
}
