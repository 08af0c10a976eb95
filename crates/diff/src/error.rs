//! Error types for tensor, optimizer and transform operations.

use thiserror::Error;

/// Errors that can occur in differentiable computations.
///
/// All of these are precondition violations: they indicate that a caller
/// wired together tensors or parameters with incompatible layouts.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DiffError {
    /// Tensor shape doesn't match what the operation requires.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Data length doesn't match the product of the shape.
    #[error("Data length {len} doesn't match shape {shape:?}")]
    DataLength { len: usize, shape: Vec<usize> },

    /// Number of gradients doesn't match number of parameters.
    #[error("Expected {expected} gradient tensors, got {got}")]
    ParamCount { expected: usize, got: usize },

    /// Transform configuration that cannot be built.
    #[error("Invalid transform configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Analytic and numerical gradients disagree.
    #[error("Gradient mismatch at index {index}: analytic {analytic}, numerical {numerical}")]
    GradientMismatch {
        index: usize,
        analytic: f64,
        numerical: f64,
    },
}
