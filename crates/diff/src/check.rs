//! # Gradient Checking
//!
//! Finite-difference validation of hand-written backward passes.
//!
//! The chart engines, the emission model and the coupling layers all
//! compute their gradients with explicit reverse sweeps. These helpers
//! compare such analytic gradients against central differences:
//! `(f(x+h) - f(x-h)) / 2h`.
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_diff::check::grad_check;
//!
//! // f(x, y) = x² y, ∇f = (2xy, x²)
//! let f = |v: &[f64]| v[0] * v[0] * v[1];
//! let x = [1.5, -2.0];
//! let analytic = [2.0 * 1.5 * -2.0, 1.5 * 1.5];
//! grad_check(f, &x, &analytic, 1e-5, 1e-6).unwrap();
//! ```

use crate::DiffError;

/// Numerical gradient of a scalar function by central differences.
pub fn numerical_gradient<F>(mut f: F, x: &[f64], h: f64) -> Vec<f64>
where
    F: FnMut(&[f64]) -> f64,
{
    let mut probe = x.to_vec();
    let mut grad = Vec::with_capacity(x.len());
    for i in 0..x.len() {
        probe[i] = x[i] + h;
        let f_plus = f(&probe);
        probe[i] = x[i] - h;
        let f_minus = f(&probe);
        probe[i] = x[i];
        grad.push((f_plus - f_minus) / (2.0 * h));
    }
    grad
}

/// Check analytic gradients against numerical gradients.
///
/// The comparison is relative for large gradients and absolute for small
/// ones: `|a - n| <= tolerance * max(1, |a|, |n|)`.
pub fn grad_check<F>(
    f: F,
    x: &[f64],
    analytic: &[f64],
    h: f64,
    tolerance: f64,
) -> Result<(), DiffError>
where
    F: FnMut(&[f64]) -> f64,
{
    if analytic.len() != x.len() {
        return Err(DiffError::ShapeMismatch {
            expected: vec![x.len()],
            got: vec![analytic.len()],
        });
    }
    let numerical = numerical_gradient(f, x, h);
    for (index, (&a, &n)) in analytic.iter().zip(numerical.iter()).enumerate() {
        let scale = 1.0_f64.max(a.abs()).max(n.abs());
        if (a - n).abs() > tolerance * scale {
            return Err(DiffError::GradientMismatch {
                index,
                analytic: a,
                numerical: n,
            });
        }
    }
    Ok(())
}
