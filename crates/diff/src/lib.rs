//! # Diff - Tensors, Gradients and Embedding Flows
//!
//! Numeric groundwork for the DMV flow parser: a runtime-shaped tensor,
//! first-order optimizers, finite-difference gradient checking and the
//! invertible embedding transforms that sit in front of the emission model.
//!
//! Nothing here builds a computation graph. Each model component owns a
//! hand-written reverse sweep that fills gradient tensors shaped like its
//! parameters; [`check`] verifies those sweeps numerically.
//!
//! ## Modules
//!
//! - [`tensor`] — Dense `f64` tensors with dynamic shapes
//! - [`optim`] — SGD, Adam and global gradient-norm clipping
//! - [`check`] — Central-difference gradient checks
//! - [`flow`] — Identity and NICE additive-coupling transforms
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_diff::flow::{EmbeddingTransform, Flow, IdentityTransform};
//! use dmvflow_diff::optim::{Adam, Optimizer};
//! use dmvflow_diff::Tensor;
//!
//! let flow = Flow::Identity(IdentityTransform::new(2));
//! let x = Tensor::from_rows(&[vec![1.0, 2.0]], 2).unwrap();
//! let (y, log_det) = flow.forward(&x).unwrap();
//! assert_eq!(y, x);
//! assert_eq!(log_det, 0.0);
//!
//! let mut w = Tensor::vector(vec![0.5]);
//! let mut adam = Adam::new(0.01);
//! adam.step(&mut [&mut w], &[Tensor::vector(vec![1.0])]).unwrap();
//! assert!(w.data[0] < 0.5);
//! ```

pub mod check;
pub mod error;
pub mod flow;
pub mod optim;
pub mod tensor;

pub use error::DiffError;
pub use flow::{EmbeddingTransform, Flow, IdentityTransform, NiceTransform, TransformGrad};
pub use optim::{clip_grad_norm, Adam, Optimizer, Sgd};
pub use tensor::Tensor;
