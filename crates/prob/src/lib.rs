//! # Prob - Log-Space Numerics and Gaussian Emissions
//!
//! The probabilistic layer underneath the DMV flow parser.
//!
//! ## Core Concepts
//!
//! - **Everything is a log-probability**: products become sums, sums become
//!   log-sum-exp, and "impossible" is the finite floor [`NEG_FLOOR`]
//! - **Normalization is a softmax**: raw learnable scores are turned into
//!   conditional distributions with [`logspace::log_softmax_axis`], and
//!   gradients flow back through [`logspace::log_softmax_axis_backward`]
//! - **Emissions are diagonal Gaussians**: one mean per latent state, one
//!   variance vector shared by all states
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_diff::Tensor;
//! use dmvflow_prob::{log_sum_exp, EmissionModel};
//!
//! let means = Tensor::from_rows(&[vec![-1.0], vec![1.0]], 1).unwrap();
//! let emission = EmissionModel::new(means, vec![1.0]).unwrap();
//!
//! let x = Tensor::from_data(vec![1, 1, 1], vec![0.0]).unwrap();
//! let scores = emission.log_density(&x).unwrap();
//!
//! // Both states are equally far from 0
//! assert!((scores.data[0] - scores.data[1]).abs() < 1e-12);
//!
//! // Marginal density under a uniform mixture
//! let marginal = log_sum_exp(&scores.data) - 2.0_f64.ln();
//! assert!(marginal < 0.0);
//! ```

pub mod emission;
mod error;
pub mod logspace;

pub use emission::{EmissionGrad, EmissionModel};
pub use error::ProbError;
pub use logspace::{argmax, log_add_exp, log_softmax, log_sum_exp, stable_ln, NEG_FLOOR};
