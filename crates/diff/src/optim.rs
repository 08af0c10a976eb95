//! # Optimization
//!
//! Optimizers for gradient-based training, plus global gradient-norm clipping.
//!
//! Parameters are handed to an optimizer as a list of mutable tensor
//! references and gradients as a parallel list of tensors. The pairing is
//! positional, so callers must produce both lists in the same order.
//!
//! ## Optimizers
//!
//! - [`Sgd`]: plain gradient descent
//! - [`Adam`]: adaptive moments (Kingma & Ba)
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_diff::optim::{clip_grad_norm, Optimizer, Sgd};
//! use dmvflow_diff::Tensor;
//!
//! let mut w = Tensor::vector(vec![1.0, 2.0]);
//! let mut grads = vec![Tensor::vector(vec![30.0, 40.0])];
//!
//! // Global norm is 50; rescale to 5
//! let norm = clip_grad_norm(&mut grads, 5.0);
//! assert!((norm - 50.0).abs() < 1e-9);
//!
//! let mut sgd = Sgd::new(0.1);
//! sgd.step(&mut [&mut w], &grads).unwrap();
//! ```

use crate::{DiffError, Tensor};

/// A first-order optimizer that minimizes a loss.
pub trait Optimizer {
    /// Apply one update: `params[i]` moves against `grads[i]`.
    fn step(&mut self, params: &mut [&mut Tensor], grads: &[Tensor]) -> Result<(), DiffError>;

    /// Current learning rate.
    fn learning_rate(&self) -> f64;
}

fn check_pairing(params: &[&mut Tensor], grads: &[Tensor]) -> Result<(), DiffError> {
    if params.len() != grads.len() {
        return Err(DiffError::ParamCount {
            expected: params.len(),
            got: grads.len(),
        });
    }
    for (param, grad) in params.iter().zip(grads.iter()) {
        grad.expect_shape(&param.shape)?;
    }
    Ok(())
}

/// Rescale gradients in place so their global L2 norm is at most `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(grads: &mut [Tensor], max_norm: f64) -> f64 {
    let total: f64 = grads.iter().map(Tensor::norm_sq).sum::<f64>().sqrt();
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for grad in grads.iter_mut() {
            for g in grad.data.iter_mut() {
                *g *= coef;
            }
        }
    }
    total
}

/// Stochastic Gradient Descent optimizer.
///
/// Updates parameters using: `θ = θ - lr * ∇L`
#[derive(Debug, Clone)]
pub struct Sgd {
    /// Learning rate (step size)
    pub learning_rate: f64,
}

impl Sgd {
    /// Create a new SGD optimizer with the given learning rate.
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Tensor], grads: &[Tensor]) -> Result<(), DiffError> {
        check_pairing(params, grads)?;
        for (param, grad) in params.iter_mut().zip(grads.iter()) {
            for (p, g) in param.data.iter_mut().zip(grad.data.iter()) {
                *p -= self.learning_rate * g;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

/// Adam optimizer.
///
/// Keeps bias-corrected running estimates of the first and second gradient
/// moments, one buffer pair per parameter tensor.
#[derive(Debug, Clone)]
pub struct Adam {
    /// Learning rate
    pub learning_rate: f64,
    /// Decay of the first-moment estimate
    pub beta1: f64,
    /// Decay of the second-moment estimate
    pub beta2: f64,
    /// Denominator stabilizer
    pub eps: f64,
    steps: u64,
    first: Vec<Tensor>,
    second: Vec<Tensor>,
}

impl Adam {
    /// Create Adam with the usual defaults (0.9, 0.999, 1e-8).
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            steps: 0,
            first: Vec::new(),
            second: Vec::new(),
        }
    }

    /// Number of updates applied so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Tensor], grads: &[Tensor]) -> Result<(), DiffError> {
        check_pairing(params, grads)?;

        // Moment buffers are created lazily on the first step
        if self.first.is_empty() {
            self.first = params.iter().map(|p| p.zeros_like()).collect();
            self.second = params.iter().map(|p| p.zeros_like()).collect();
        }
        if self.first.len() != params.len() {
            return Err(DiffError::ParamCount {
                expected: self.first.len(),
                got: params.len(),
            });
        }

        self.steps += 1;
        let t = self.steps as i32;
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);

        for (i, (param, grad)) in params.iter_mut().zip(grads.iter()).enumerate() {
            let m = &mut self.first[i];
            let v = &mut self.second[i];
            for j in 0..grad.data.len() {
                let g = grad.data[j];
                m.data[j] = self.beta1 * m.data[j] + (1.0 - self.beta1) * g;
                v.data[j] = self.beta2 * v.data[j] + (1.0 - self.beta2) * g * g;
                let m_hat = m.data[j] / correction1;
                let v_hat = v.data[j] / correction2;
                param.data[j] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sgd_step() {
        let mut w = Tensor::vector(vec![1.0, 2.0, 3.0]);
        let grads = vec![Tensor::vector(vec![0.1, 0.2, 0.3])];

        let mut optimizer = Sgd::new(1.0);
        optimizer.step(&mut [&mut w], &grads).unwrap();

        assert!((w.data[0] - 0.9).abs() < 1e-12);
        assert!((w.data[1] - 1.8).abs() < 1e-12);
        assert!((w.data[2] - 2.7).abs() < 1e-12);
    }

    #[test]
    fn test_step_rejects_mismatched_grads() {
        let mut w = Tensor::vector(vec![1.0, 2.0]);
        let mut optimizer = Sgd::new(1.0);

        let wrong_count = optimizer.step(&mut [&mut w], &[]);
        assert!(matches!(wrong_count, Err(DiffError::ParamCount { .. })));

        let wrong_shape = optimizer.step(&mut [&mut w], &[Tensor::vector(vec![1.0])]);
        assert!(matches!(wrong_shape, Err(DiffError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_clip_grad_norm_rescales() {
        let mut grads = vec![
            Tensor::vector(vec![3.0, 0.0]),
            Tensor::vector(vec![0.0, 4.0]),
        ];
        let norm = clip_grad_norm(&mut grads, 1.0);
        assert!((norm - 5.0).abs() < 1e-12);

        let clipped: f64 = grads.iter().map(Tensor::norm_sq).sum::<f64>().sqrt();
        assert!((clipped - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_grad_norm_leaves_small_gradients() {
        let mut grads = vec![Tensor::vector(vec![0.3, 0.4])];
        clip_grad_norm(&mut grads, 5.0);
        assert_eq!(grads[0].data, vec![0.3, 0.4]);
    }

    #[test]
    fn test_adam_first_step_is_lr_sized() {
        // With bias correction, the first Adam step moves each coordinate by ~lr
        let mut w = Tensor::vector(vec![0.0, 0.0]);
        let grads = vec![Tensor::vector(vec![2.0, -0.5])];

        let mut adam = Adam::new(0.01);
        adam.step(&mut [&mut w], &grads).unwrap();

        assert!((w.data[0] + 0.01).abs() < 1e-6);
        assert!((w.data[1] - 0.01).abs() < 1e-6);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        // f(w) = (w - 3)^2
        let mut w = Tensor::vector(vec![0.0]);
        let mut adam = Adam::new(0.1);
        for _ in 0..500 {
            let grad = vec![Tensor::vector(vec![2.0 * (w.data[0] - 3.0)])];
            adam.step(&mut [&mut w], &grad).unwrap();
        }
        assert!((w.data[0] - 3.0).abs() < 5e-2);
    }
}
