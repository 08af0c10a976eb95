//! # Log-Space Numerics
//!
//! Every probability in the parser lives in log space. This module provides
//! the few primitives the chart engines are built from:
//!
//! - [`NEG_FLOOR`]: a finite stand-in for `log 0`
//! - [`log_sum_exp`] / [`log_add_exp`]: stable `log Σ exp`
//! - [`log_softmax`] / [`log_softmax_axis`]: normalization of raw scores, with
//!   matching backward passes
//! - [`stable_ln`]: `ln` that floors instead of returning `-inf`
//! - [`argmax`]: first maximal entry
//!
//! `NEG_FLOOR` is used instead of `f64::NEG_INFINITY` so that sums of
//! "impossible" terms stay finite and never turn into `NaN` (`-inf - -inf`).
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_prob::logspace::{log_add_exp, log_softmax};
//!
//! // log(0.25 + 0.5) computed from the logs
//! let combined = log_add_exp(0.25_f64.ln(), 0.5_f64.ln());
//! assert!((combined - 0.75_f64.ln()).abs() < 1e-12);
//!
//! let probs: f64 = log_softmax(&[1.0, 2.0, 3.0]).iter().map(|l| l.exp()).sum();
//! assert!((probs - 1.0).abs() < 1e-12);
//! ```

use dmvflow_diff::Tensor;

use crate::ProbError;

/// Log-probability used for "no mass".
pub const NEG_FLOOR: f64 = -1e20;

/// `log Σ exp(values)`, shifted by the maximum for stability.
///
/// Returns [`NEG_FLOOR`] for an empty slice.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() || max <= NEG_FLOOR {
        return if values.is_empty() { NEG_FLOOR } else { max };
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// `log(exp(a) + exp(b))`.
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if hi <= NEG_FLOOR {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Natural log that maps non-positive inputs to [`NEG_FLOOR`].
pub fn stable_ln(p: f64) -> f64 {
    if p > 0.0 {
        p.ln()
    } else {
        NEG_FLOOR
    }
}

/// Index and value of the first maximal entry, or `None` when empty.
pub fn argmax(values: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best
}

/// Normalize raw scores into log-probabilities.
pub fn log_softmax(scores: &[f64]) -> Vec<f64> {
    let total = log_sum_exp(scores);
    scores.iter().map(|&s| s - total).collect()
}

/// Pull a gradient on log-probabilities back onto the raw scores.
///
/// For `y = log_softmax(x)`: `∂L/∂x_i = g_i − p_i Σ_j g_j`.
pub fn log_softmax_backward(log_probs: &[f64], grad: &[f64]) -> Vec<f64> {
    let total: f64 = grad.iter().sum();
    log_probs
        .iter()
        .zip(grad)
        .map(|(&lp, &g)| g - lp.exp() * total)
        .collect()
}

/// Strides for walking the lanes of one axis: (outer, axis length, inner).
fn lanes(shape: &[usize], axis: usize) -> Result<(usize, usize, usize), ProbError> {
    if axis >= shape.len() {
        return Err(ProbError::AxisOutOfRange {
            axis,
            rank: shape.len(),
        });
    }
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    Ok((outer, shape[axis], inner))
}

/// [`log_softmax`] applied independently along one axis of a tensor.
pub fn log_softmax_axis(scores: &Tensor, axis: usize) -> Result<Tensor, ProbError> {
    let (outer, len, inner) = lanes(&scores.shape, axis)?;
    let mut out = scores.zeros_like();
    let mut lane = vec![0.0; len];
    for o in 0..outer {
        for i in 0..inner {
            for (k, v) in lane.iter_mut().enumerate() {
                *v = scores.data[(o * len + k) * inner + i];
            }
            let total = log_sum_exp(&lane);
            for (k, v) in lane.iter().enumerate() {
                out.data[(o * len + k) * inner + i] = v - total;
            }
        }
    }
    Ok(out)
}

/// Backward of [`log_softmax_axis`].
pub fn log_softmax_axis_backward(
    log_probs: &Tensor,
    grad: &Tensor,
    axis: usize,
) -> Result<Tensor, ProbError> {
    grad.expect_shape(&log_probs.shape)?;
    let (outer, len, inner) = lanes(&log_probs.shape, axis)?;
    let mut out = grad.zeros_like();
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * len + k) * inner + i;
            let total: f64 = (0..len).map(|k| grad.data[at(k)]).sum();
            for k in 0..len {
                out.data[at(k)] = grad.data[at(k)] - log_probs.data[at(k)].exp() * total;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmvflow_diff::check::grad_check;
    use proptest::prelude::*;

    #[test]
    fn test_log_sum_exp_matches_direct_sum() {
        // Two disjoint derivations combined in log space vs. probability space
        let a = 0.03_f64;
        let b = 0.0125_f64;
        let combined = log_sum_exp(&[a.ln(), b.ln()]);
        assert!((combined.exp() - (a + b)).abs() < 1e-14);
        assert!((log_add_exp(a.ln(), b.ln()) - combined).abs() < 1e-12);
    }

    #[test]
    fn test_log_sum_exp_large_values() {
        let v = log_sum_exp(&[1000.0, 1000.0]);
        assert!((v - (1000.0 + 2.0_f64.ln())).abs() < 1e-9);
    }

    #[test]
    fn test_floor_absorbs() {
        assert_eq!(log_sum_exp(&[]), NEG_FLOOR);
        assert!((log_sum_exp(&[NEG_FLOOR, 0.0]) - 0.0).abs() < 1e-12);
        assert!(log_sum_exp(&[NEG_FLOOR, NEG_FLOOR]) <= NEG_FLOOR + 1.0);
        assert_eq!(log_add_exp(NEG_FLOOR, NEG_FLOOR), NEG_FLOOR);
        assert!((NEG_FLOOR + NEG_FLOOR).is_finite());
    }

    #[test]
    fn test_stable_ln() {
        assert_eq!(stable_ln(0.0), NEG_FLOOR);
        assert_eq!(stable_ln(-1.0), NEG_FLOOR);
        assert!(stable_ln(1.0).abs() < 1e-15);
    }

    #[test]
    fn test_argmax_first_on_ties() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0, 2.0]), Some((1, 3.0)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_log_softmax_axis_rows_and_columns() {
        let t = Tensor::from_rows(&[vec![1.0, 2.0], vec![0.5, -1.0]], 2).unwrap();

        let rows = log_softmax_axis(&t, 1).unwrap();
        for r in 0..2 {
            let s: f64 = rows.row(r).iter().map(|v| v.exp()).sum();
            assert!((s - 1.0).abs() < 1e-12);
        }

        let cols = log_softmax_axis(&t, 0).unwrap();
        for c in 0..2 {
            let s = cols.get(&[0, c]).exp() + cols.get(&[1, c]).exp();
            assert!((s - 1.0).abs() < 1e-12);
        }

        assert!(matches!(
            log_softmax_axis(&t, 2),
            Err(ProbError::AxisOutOfRange { axis: 2, rank: 2 })
        ));
    }

    #[test]
    fn test_log_softmax_backward_numerically() {
        let x = [0.3, -1.2, 2.0, 0.7];
        let w = [1.0, -2.0, 0.5, 3.0];
        let lp = log_softmax(&x);
        let analytic = log_softmax_backward(&lp, &w);
        let f = |v: &[f64]| log_softmax(v).iter().zip(w.iter()).map(|(a, b)| a * b).sum();
        grad_check(f, &x, &analytic, 1e-6, 1e-6).unwrap();
    }

    #[test]
    fn test_log_softmax_axis_backward_numerically() {
        let shape = vec![2, 3, 2];
        let x = Tensor::from_data(
            shape.clone(),
            vec![0.1, 0.4, -0.3, 1.1, 0.8, -0.6, 0.2, 0.0, -1.0, 0.5, 0.9, 0.3],
        )
        .unwrap();
        let w = Tensor::from_data(
            shape.clone(),
            vec![1.0, 0.5, -0.2, 2.0, 0.3, -1.0, 0.7, 0.1, 1.5, -0.4, 0.2, 0.9],
        )
        .unwrap();

        let lp = log_softmax_axis(&x, 1).unwrap();
        let analytic = log_softmax_axis_backward(&lp, &w, 1).unwrap();
        let f = |v: &[f64]| {
            let probe = Tensor::from_data(shape.clone(), v.to_vec()).unwrap();
            let y = log_softmax_axis(&probe, 1).unwrap();
            y.data.iter().zip(w.data.iter()).map(|(a, b)| a * b).sum()
        };
        grad_check(f, &x.data, &analytic.data, 1e-6, 1e-6).unwrap();
    }

    proptest! {
        #[test]
        fn prop_log_softmax_normalizes(scores in prop::collection::vec(-50.0f64..50.0, 1..40)) {
            let total: f64 = log_softmax(&scores).iter().map(|l| l.exp()).sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
        }
    }
}
