//! # Gaussian Emissions
//!
//! Each latent state emits transformed word embeddings from a diagonal
//! Gaussian. All states share one variance vector; each state has its own
//! mean.
//!
//! ```text
//!   log p(x | s) = c − ½ Σ_d (μ[s,d] − x[d])² / σ²[d]
//!   c            = −(D/2) log 2π − ½ Σ_d log σ²[d]
//! ```
//!
//! # Example
//!
//! ```rust
//! use dmvflow_diff::Tensor;
//! use dmvflow_prob::EmissionModel;
//!
//! let means = Tensor::from_rows(&[vec![0.0, 0.0], vec![1.0, 1.0]], 2).unwrap();
//! let model = EmissionModel::new(means, vec![1.0, 1.0]).unwrap();
//!
//! // One sentence of one token sitting on the first mean
//! let x = Tensor::from_data(vec![1, 1, 2], vec![0.0, 0.0]).unwrap();
//! let scores = model.log_density(&x).unwrap();
//! assert_eq!(scores.shape, vec![1, 1, 2]);
//! assert!(scores.data[0] > scores.data[1]);
//! ```

use std::f64::consts::PI;

use dmvflow_diff::Tensor;

use crate::ProbError;

/// Gradients produced by [`EmissionModel::backward`].
#[derive(Debug, Clone)]
pub struct EmissionGrad {
    /// ∂L/∂means, shaped like the means
    pub means: Tensor,
    /// ∂L/∂x, shaped like the embeddings
    pub input: Tensor,
}

/// Per-state diagonal Gaussians with shared variance.
#[derive(Debug, Clone, PartialEq)]
pub struct EmissionModel {
    /// State means, (num_state × num_dims)
    pub means: Tensor,
    variance: Vec<f64>,
}

fn check_variance(variance: &[f64]) -> Result<(), ProbError> {
    for (dim, &value) in variance.iter().enumerate() {
        if value <= 0.0 || !value.is_finite() {
            return Err(ProbError::NonPositiveVariance { dim, value });
        }
    }
    Ok(())
}

impl EmissionModel {
    /// Build from a (num_state × num_dims) mean matrix and a shared variance.
    ///
    /// # Errors
    /// Fails on a non-matrix mean tensor, a width mismatch or any variance
    /// entry that is not strictly positive.
    pub fn new(means: Tensor, variance: Vec<f64>) -> Result<Self, ProbError> {
        if means.rank() != 2 {
            return Err(ProbError::Tensor(dmvflow_diff::DiffError::ShapeMismatch {
                expected: vec![0, variance.len()],
                got: means.shape.clone(),
            }));
        }
        if means.shape[1] != variance.len() {
            return Err(ProbError::DimensionMismatch {
                expected: means.shape[1],
                got: variance.len(),
            });
        }
        check_variance(&variance)?;
        Ok(Self { means, variance })
    }

    /// Number of latent states.
    pub fn num_states(&self) -> usize {
        self.means.shape[0]
    }

    /// Embedding width.
    pub fn num_dims(&self) -> usize {
        self.variance.len()
    }

    /// The shared variance vector.
    pub fn variance(&self) -> &[f64] {
        &self.variance
    }

    /// Replace the variance, validating positivity.
    pub fn set_variance(&mut self, variance: Vec<f64>) -> Result<(), ProbError> {
        if variance.len() != self.num_dims() {
            return Err(ProbError::DimensionMismatch {
                expected: self.num_dims(),
                got: variance.len(),
            });
        }
        check_variance(&variance)?;
        self.variance = variance;
        Ok(())
    }

    /// The normalizing constant `c` shared by every state.
    pub fn log_density_constant(&self) -> f64 {
        let d = self.num_dims() as f64;
        -0.5 * d * (2.0 * PI).ln() - 0.5 * self.variance.iter().map(|v| v.ln()).sum::<f64>()
    }

    fn check_input(&self, x: &Tensor) -> Result<(), ProbError> {
        self.means
            .expect_shape(&[self.num_states(), self.num_dims()])?;
        if x.rank() == 0 || x.row_len() != self.num_dims() {
            return Err(ProbError::DimensionMismatch {
                expected: self.num_dims(),
                got: x.row_len(),
            });
        }
        Ok(())
    }

    /// Log-density of every embedding under every state.
    ///
    /// `x` has shape `[.., D]` (typically `[batch, position, D]`); the result
    /// replaces the last axis with one entry per state.
    pub fn log_density(&self, x: &Tensor) -> Result<Tensor, ProbError> {
        self.check_input(x)?;
        let states = self.num_states();
        let c = self.log_density_constant();

        let mut shape = x.shape.clone();
        if let Some(last) = shape.last_mut() {
            *last = states;
        }
        let mut out = Tensor::zeros(shape);

        for r in 0..x.num_rows() {
            let row = x.row(r);
            let scores = out.row_mut(r);
            for (s, score) in scores.iter_mut().enumerate() {
                let mean = self.means.row(s);
                let quad: f64 = mean
                    .iter()
                    .zip(row)
                    .zip(&self.variance)
                    .map(|((m, v), var)| (m - v) * (m - v) / var)
                    .sum();
                *score = c - 0.5 * quad;
            }
        }
        Ok(out)
    }

    /// Pull ∂L/∂(log-density) back onto the means and the embeddings.
    pub fn backward(&self, x: &Tensor, grad: &Tensor) -> Result<EmissionGrad, ProbError> {
        self.check_input(x)?;
        let mut expected = x.shape.clone();
        if let Some(last) = expected.last_mut() {
            *last = self.num_states();
        }
        grad.expect_shape(&expected)?;

        let mut means = self.means.zeros_like();
        let mut input = x.zeros_like();

        for r in 0..x.num_rows() {
            let row = x.row(r);
            let g_row = grad.row(r);
            let g_in = input.row_mut(r);
            for (s, &g) in g_row.iter().enumerate() {
                if g == 0.0 {
                    continue;
                }
                let mean = self.means.row(s);
                let g_mean = means.row_mut(s);
                for d in 0..row.len() {
                    let delta = g * (row[d] - mean[d]) / self.variance[d];
                    g_mean[d] += delta;
                    g_in[d] -= delta;
                }
            }
        }
        Ok(EmissionGrad { means, input })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmvflow_diff::check::grad_check;

    fn model() -> EmissionModel {
        let means = Tensor::from_rows(
            &[vec![0.0, 1.0, -1.0], vec![0.5, 0.5, 0.5]],
            3,
        )
        .unwrap();
        EmissionModel::new(means, vec![1.0, 0.5, 2.0]).unwrap()
    }

    #[test]
    fn test_constant() {
        let m = model();
        let expected = -1.5 * (2.0 * PI).ln() - 0.5 * (0.5_f64.ln() + 2.0_f64.ln());
        assert!((m.log_density_constant() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_density_at_mean_is_constant() {
        let m = model();
        let x = Tensor::from_data(vec![1, 1, 3], vec![0.0, 1.0, -1.0]).unwrap();
        let scores = m.log_density(&x).unwrap();
        assert!((scores.get(&[0, 0, 0]) - m.log_density_constant()).abs() < 1e-12);
    }

    #[test]
    fn test_density_matches_univariate_product() {
        let m = model();
        let point = [0.2, -0.3, 0.9];
        let x = Tensor::from_data(vec![1, 1, 3], point.to_vec()).unwrap();
        let scores = m.log_density(&x).unwrap();

        let mut expected = 0.0;
        for d in 0..3 {
            let mean = m.means.get(&[1, d]);
            let var = m.variance()[d];
            expected += -0.5 * (2.0 * PI * var).ln() - (point[d] - mean).powi(2) / (2.0 * var);
        }
        assert!((scores.get(&[0, 0, 1]) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_variance() {
        let means = Tensor::zeros(vec![2, 2]);
        let err = EmissionModel::new(means.clone(), vec![1.0, 0.0]).unwrap_err();
        assert_eq!(err, ProbError::NonPositiveVariance { dim: 1, value: 0.0 });
        assert!(EmissionModel::new(means.clone(), vec![-1.0, 1.0]).is_err());
        assert!(EmissionModel::new(means, vec![1.0, f64::NAN]).is_err());

        let mut m = model();
        assert!(m.set_variance(vec![1.0, 1.0, -0.1]).is_err());
        assert!(m.set_variance(vec![1.0, 1.0]).is_err());
        assert_eq!(m.variance(), &[1.0, 0.5, 2.0]);
    }

    #[test]
    fn test_rejects_width_mismatch() {
        let m = model();
        let x = Tensor::zeros(vec![1, 2, 4]);
        assert!(matches!(
            m.log_density(&x),
            Err(ProbError::DimensionMismatch { expected: 3, got: 4 })
        ));
    }

    #[test]
    fn test_backward_numerically() {
        let m = model();
        let x = Tensor::from_data(
            vec![1, 2, 3],
            vec![0.3, -0.4, 1.2, -0.7, 0.1, 0.05],
        )
        .unwrap();
        let w = Tensor::from_data(vec![1, 2, 2], vec![1.0, -0.5, 0.25, 2.0]).unwrap();
        let grads = m.backward(&x, &w).unwrap();

        let objective_x = |v: &[f64]| {
            let probe = Tensor::from_data(vec![1, 2, 3], v.to_vec()).unwrap();
            let s = m.log_density(&probe).unwrap();
            s.data.iter().zip(w.data.iter()).map(|(a, b)| a * b).sum()
        };
        grad_check(objective_x, &x.data, &grads.input.data, 1e-6, 1e-6).unwrap();

        let objective_means = |v: &[f64]| {
            let mut probe = m.clone();
            probe.means.data.copy_from_slice(v);
            let s = probe.log_density(&x).unwrap();
            s.data.iter().zip(w.data.iter()).map(|(a, b)| a * b).sum()
        };
        grad_check(objective_means, &m.means.data, &grads.means.data, 1e-6, 1e-6).unwrap();
    }
}
