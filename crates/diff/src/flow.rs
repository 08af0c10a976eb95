//! # Invertible Embedding Transforms
//!
//! An embedding transform maps raw word vectors into the space where the
//! emission model's diagonal Gaussians live, and reports the log-determinant
//! of its Jacobian so the change of variables can be accounted for in the
//! training objective.
//!
//! ## Implementations
//!
//! - [`IdentityTransform`]: leaves embeddings untouched (log-det = 0)
//! - [`NiceTransform`]: a stack of additive coupling layers (Dinh et al.,
//!   "NICE"). Each layer keeps one half of the dimensions and shifts the other
//!   half by a ReLU network of the kept half:
//!
//! ```text
//!   y_keep  = x_keep
//!   y_shift = x_shift + m(x_keep)
//! ```
//!
//!   Consecutive layers swap the halves. Additive coupling is volume
//!   preserving, so every layer contributes exactly 0 to the log-determinant.
//!
//! Inputs are tensors whose innermost axis is the embedding width; every
//! innermost row is transformed independently.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{DiffError, Tensor};

/// Gradients produced by [`EmbeddingTransform::backward`].
#[derive(Debug, Clone)]
pub struct TransformGrad {
    /// Gradient with respect to the transform input (same shape as the input)
    pub input: Tensor,
    /// Gradients with respect to the parameters, in [`EmbeddingTransform::params`] order
    pub params: Vec<Tensor>,
}

/// The contract every embedding transform satisfies.
pub trait EmbeddingTransform {
    /// Embedding width this transform was built for.
    fn dims(&self) -> usize;

    /// Transform every row; returns the output and the summed log |det J|.
    fn forward(&self, x: &Tensor) -> Result<(Tensor, f64), DiffError>;

    /// Invert [`forward`](Self::forward).
    fn inverse(&self, y: &Tensor) -> Result<Tensor, DiffError>;

    /// Vector-Jacobian product.
    ///
    /// `grad_y` is ∂L/∂y for the output of `forward(x)` and `grad_log_det` is
    /// the coefficient of the log-determinant term in L.
    fn backward(
        &self,
        x: &Tensor,
        grad_y: &Tensor,
        grad_log_det: f64,
    ) -> Result<TransformGrad, DiffError>;

    /// Learnable parameters.
    fn params(&self) -> Vec<&Tensor>;

    /// Learnable parameters, mutably, in the same order as [`params`](Self::params).
    fn params_mut(&mut self) -> Vec<&mut Tensor>;
}

fn check_width(x: &Tensor, dims: usize) -> Result<(), DiffError> {
    if x.rank() == 0 || x.row_len() != dims {
        return Err(DiffError::ShapeMismatch {
            expected: vec![dims],
            got: x.shape.clone(),
        });
    }
    Ok(())
}

// ============================================================================
// Identity
// ============================================================================

/// The identity transform, used by the plain Gaussian model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityTransform {
    dims: usize,
}

impl IdentityTransform {
    /// Identity over `dims`-wide embeddings.
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl EmbeddingTransform for IdentityTransform {
    fn dims(&self) -> usize {
        self.dims
    }

    fn forward(&self, x: &Tensor) -> Result<(Tensor, f64), DiffError> {
        check_width(x, self.dims)?;
        Ok((x.clone(), 0.0))
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor, DiffError> {
        check_width(y, self.dims)?;
        Ok(y.clone())
    }

    fn backward(
        &self,
        x: &Tensor,
        grad_y: &Tensor,
        _grad_log_det: f64,
    ) -> Result<TransformGrad, DiffError> {
        check_width(x, self.dims)?;
        grad_y.expect_shape(&x.shape)?;
        Ok(TransformGrad {
            input: grad_y.clone(),
            params: Vec::new(),
        })
    }

    fn params(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }
}

// ============================================================================
// Coupling networks
// ============================================================================

/// Fully connected layer: `out = W in + b`, with `W` stored as (out × in).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Dense {
    weight: Tensor,
    bias: Tensor,
}

impl Dense {
    fn new(inputs: usize, outputs: usize, rng: &mut impl Rng) -> Self {
        let bound = 1.0 / (inputs as f64).sqrt();
        Self {
            weight: Tensor::uniform(vec![outputs, inputs], -bound, bound, rng),
            bias: Tensor::uniform(vec![outputs], -bound, bound, rng),
        }
    }

    fn outputs(&self) -> usize {
        self.weight.shape[0]
    }

    fn apply(&self, x: &[f64]) -> Vec<f64> {
        (0..self.outputs())
            .map(|o| {
                let w = self.weight.row(o);
                self.bias.data[o] + w.iter().zip(x).map(|(a, b)| a * b).sum::<f64>()
            })
            .collect()
    }

    /// Accumulate parameter gradients and return ∂L/∂x.
    fn backward(
        &self,
        x: &[f64],
        grad_out: &[f64],
        grad_weight: &mut Tensor,
        grad_bias: &mut Tensor,
    ) -> Vec<f64> {
        let mut grad_in = vec![0.0; x.len()];
        for (o, &g) in grad_out.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            grad_bias.data[o] += g;
            let w = self.weight.row(o);
            let gw = grad_weight.row_mut(o);
            for i in 0..x.len() {
                gw[i] += g * x[i];
                grad_in[i] += g * w[i];
            }
        }
        grad_in
    }
}

/// ReLU network used as a coupling function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ReluNet {
    layers: Vec<Dense>,
}

impl ReluNet {
    fn new(
        inputs: usize,
        outputs: usize,
        hidden_layers: usize,
        hidden_units: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let mut layers = Vec::with_capacity(hidden_layers + 1);
        let mut width = inputs;
        for _ in 0..hidden_layers {
            layers.push(Dense::new(width, hidden_units, rng));
            width = hidden_units;
        }
        layers.push(Dense::new(width, outputs, rng));
        Self { layers }
    }

    /// Input to every layer, followed by the network output.
    fn trace(&self, x: &[f64]) -> Vec<Vec<f64>> {
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(x.to_vec());
        for (l, layer) in self.layers.iter().enumerate() {
            let mut out = layer.apply(&acts[l]);
            if l + 1 < self.layers.len() {
                for v in out.iter_mut() {
                    *v = v.max(0.0);
                }
            }
            acts.push(out);
        }
        acts
    }

    fn output(&self, x: &[f64]) -> Vec<f64> {
        let mut acts = self.trace(x);
        acts.pop().unwrap_or_default()
    }

    /// `grads` holds (weight, bias) pairs for each layer, in order.
    fn backward(&self, acts: &[Vec<f64>], grad_out: &[f64], grads: &mut [Tensor]) -> Vec<f64> {
        let mut g = grad_out.to_vec();
        let last = self.layers.len() - 1;
        for l in (0..self.layers.len()).rev() {
            if l < last {
                for (gi, &a) in g.iter_mut().zip(acts[l + 1].iter()) {
                    if a <= 0.0 {
                        *gi = 0.0;
                    }
                }
            }
            let (head, tail) = grads.split_at_mut(2 * l + 1);
            g = self.layers[l].backward(&acts[l], &g, &mut head[2 * l], &mut tail[0]);
        }
        g
    }

    fn params(&self) -> Vec<&Tensor> {
        self.layers
            .iter()
            .flat_map(|d| [&d.weight, &d.bias])
            .collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers
            .iter_mut()
            .flat_map(|d| [&mut d.weight, &mut d.bias])
            .collect()
    }
}

/// One additive coupling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CouplingLayer {
    split: usize,
    /// When set, the upper half conditions and the lower half is shifted
    flip: bool,
    net: ReluNet,
}

impl CouplingLayer {
    fn halves(&self, dims: usize) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        if self.flip {
            (self.split..dims, 0..self.split)
        } else {
            (0..self.split, self.split..dims)
        }
    }

    fn forward_row(&self, row: &mut [f64]) {
        let (keep, shift) = self.halves(row.len());
        let m = self.net.output(&row[keep]);
        for (v, d) in row[shift].iter_mut().zip(m) {
            *v += d;
        }
    }

    fn inverse_row(&self, row: &mut [f64]) {
        let (keep, shift) = self.halves(row.len());
        let m = self.net.output(&row[keep]);
        for (v, d) in row[shift].iter_mut().zip(m) {
            *v -= d;
        }
    }

    /// Turn ∂L/∂y (in `grad`) into ∂L/∂x for input row `x`.
    fn backward_row(&self, x: &[f64], grad: &mut [f64], param_grads: &mut [Tensor]) {
        let (keep, shift) = self.halves(x.len());
        let acts = self.net.trace(&x[keep.clone()]);
        let through = self.net.backward(&acts, &grad[shift], param_grads);
        for (g, t) in grad[keep].iter_mut().zip(through) {
            *g += t;
        }
    }

    fn num_params(&self) -> usize {
        2 * self.net.layers.len()
    }
}

// ============================================================================
// NICE
// ============================================================================

/// Volume-preserving flow built from additive coupling layers.
///
/// # Example
///
/// ```rust
/// use dmvflow_diff::flow::{EmbeddingTransform, NiceTransform};
/// use dmvflow_diff::Tensor;
/// use rand::SeedableRng;
///
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let flow = NiceTransform::new(4, 4, 1, 8, &mut rng).unwrap();
///
/// let x = Tensor::from_rows(&[vec![0.1, -0.2, 0.3, 0.4]], 4).unwrap();
/// let (y, log_det) = flow.forward(&x).unwrap();
/// assert_eq!(log_det, 0.0);
///
/// let back = flow.inverse(&y).unwrap();
/// assert!((back.data[2] - 0.3).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NiceTransform {
    dims: usize,
    layers: Vec<CouplingLayer>,
}

impl NiceTransform {
    /// Build `couple_layers` coupling layers, each with a ReLU network of
    /// `cell_layers` hidden layers of `hidden_units` units.
    pub fn new(
        dims: usize,
        couple_layers: usize,
        cell_layers: usize,
        hidden_units: usize,
        rng: &mut impl Rng,
    ) -> Result<Self, DiffError> {
        if dims < 2 {
            return Err(DiffError::InvalidConfig {
                reason: format!("coupling needs at least 2 dimensions, got {}", dims),
            });
        }
        if couple_layers == 0 || hidden_units == 0 {
            return Err(DiffError::InvalidConfig {
                reason: "couple_layers and hidden_units must be positive".to_string(),
            });
        }

        let split = dims / 2;
        let layers = (0..couple_layers)
            .map(|i| {
                let flip = i % 2 == 1;
                let (keep, shift) = if flip {
                    (dims - split, split)
                } else {
                    (split, dims - split)
                };
                CouplingLayer {
                    split,
                    flip,
                    net: ReluNet::new(keep, shift, cell_layers, hidden_units, rng),
                }
            })
            .collect();

        Ok(Self { dims, layers })
    }

    /// Number of coupling layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl EmbeddingTransform for NiceTransform {
    fn dims(&self) -> usize {
        self.dims
    }

    fn forward(&self, x: &Tensor) -> Result<(Tensor, f64), DiffError> {
        check_width(x, self.dims)?;
        let mut y = x.clone();
        for r in 0..y.num_rows() {
            let row = y.row_mut(r);
            for layer in &self.layers {
                layer.forward_row(row);
            }
        }
        Ok((y, 0.0))
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor, DiffError> {
        check_width(y, self.dims)?;
        let mut x = y.clone();
        for r in 0..x.num_rows() {
            let row = x.row_mut(r);
            for layer in self.layers.iter().rev() {
                layer.inverse_row(row);
            }
        }
        Ok(x)
    }

    fn backward(
        &self,
        x: &Tensor,
        grad_y: &Tensor,
        _grad_log_det: f64,
    ) -> Result<TransformGrad, DiffError> {
        check_width(x, self.dims)?;
        grad_y.expect_shape(&x.shape)?;

        let mut params: Vec<Tensor> = self.params().into_iter().map(Tensor::zeros_like).collect();
        let mut input = grad_y.clone();

        for r in 0..x.num_rows() {
            // Inputs to each coupling layer for this row
            let mut states = Vec::with_capacity(self.layers.len());
            let mut current = x.row(r).to_vec();
            for layer in &self.layers {
                states.push(current.clone());
                layer.forward_row(&mut current);
            }

            let grad = input.row_mut(r);
            let mut end = params.len();
            for (layer, state) in self.layers.iter().zip(states.iter()).rev() {
                let start = end - layer.num_params();
                layer.backward_row(state, grad, &mut params[start..end]);
                end = start;
            }
        }

        Ok(TransformGrad { input, params })
    }

    fn params(&self) -> Vec<&Tensor> {
        self.layers.iter().flat_map(|l| l.net.params()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.net.params_mut())
            .collect()
    }
}

// ============================================================================
// Serializable choice of transform
// ============================================================================

/// The transform a model was configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Flow {
    /// No projection: the Gaussian model over raw embeddings
    Identity(IdentityTransform),
    /// NICE additive coupling projection
    Nice(NiceTransform),
}

impl EmbeddingTransform for Flow {
    fn dims(&self) -> usize {
        match self {
            Flow::Identity(t) => t.dims(),
            Flow::Nice(t) => t.dims(),
        }
    }

    fn forward(&self, x: &Tensor) -> Result<(Tensor, f64), DiffError> {
        match self {
            Flow::Identity(t) => t.forward(x),
            Flow::Nice(t) => t.forward(x),
        }
    }

    fn inverse(&self, y: &Tensor) -> Result<Tensor, DiffError> {
        match self {
            Flow::Identity(t) => t.inverse(y),
            Flow::Nice(t) => t.inverse(y),
        }
    }

    fn backward(
        &self,
        x: &Tensor,
        grad_y: &Tensor,
        grad_log_det: f64,
    ) -> Result<TransformGrad, DiffError> {
        match self {
            Flow::Identity(t) => t.backward(x, grad_y, grad_log_det),
            Flow::Nice(t) => t.backward(x, grad_y, grad_log_det),
        }
    }

    fn params(&self) -> Vec<&Tensor> {
        match self {
            Flow::Identity(t) => t.params(),
            Flow::Nice(t) => t.params(),
        }
    }

    fn params_mut(&mut self) -> Vec<&mut Tensor> {
        match self {
            Flow::Identity(t) => t.params_mut(),
            Flow::Nice(t) => t.params_mut(),
        }
    }
}
