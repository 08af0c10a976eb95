//! # DMV Grammar Parameters
//!
//! The grammar is stored as raw learnable scores and turned into
//! log-probabilities by a softmax along each distribution's axis:
//!
//! | Tensor         | Shape         | Indexed by                    | Normalized over |
//! |----------------|---------------|-------------------------------|-----------------|
//! | `attach_left`  | `[S, S]`      | (head, argument)              | argument        |
//! | `attach_right` | `[S, S]`      | (head, argument)              | argument        |
//! | `stop_left`    | `[2, S, 2]`   | (decision, state, adjacency)  | decision        |
//! | `stop_right`   | `[2, S, 2]`   | (decision, state, adjacency)  | decision        |
//! | `root`         | `[S]`         | state                         | state           |
//!
//! Decision index 0 is [`CONTINUE`], 1 is [`STOP`]; adjacency index 0 means a
//! dependent has already been generated on that side, 1 means none has.
//!
//! Parameters may change between calls, so every engine call normalizes afresh
//! with [`GrammarParameters::normalize`].
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_nlp::grammar::{GrammarParameters, STOP};
//! use rand::SeedableRng;
//!
//! let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
//! let grammar = GrammarParameters::random(3, &mut rng);
//! let log = grammar.normalize().unwrap();
//!
//! let p_stop = log.stop_left(STOP, 0, true).exp();
//! let p_cont = log.stop_left(1 - STOP, 0, true).exp();
//! assert!((p_stop + p_cont - 1.0).abs() < 1e-12);
//! ```

use dmvflow_diff::Tensor;
use dmvflow_prob::logspace::{log_softmax_axis, log_softmax_axis_backward};
use rand::Rng;

use crate::NlpError;

/// Decision index for generating another dependent.
pub const CONTINUE: usize = 0;
/// Decision index for stopping.
pub const STOP: usize = 1;

const NON_ADJACENT: usize = 0;
const ADJACENT: usize = 1;

const ATTACH_AXIS: usize = 1;
const STOP_AXIS: usize = 0;
const ROOT_AXIS: usize = 0;

fn adjacency(adjacent: bool) -> usize {
    if adjacent {
        ADJACENT
    } else {
        NON_ADJACENT
    }
}

// ============================================================================
// Raw parameters
// ============================================================================

/// Raw (unnormalized) attach, stop and root scores.
#[derive(Debug, Clone, PartialEq)]
pub struct GrammarParameters {
    /// Left attachment scores, (head × argument)
    pub attach_left: Tensor,
    /// Right attachment scores, (head × argument)
    pub attach_right: Tensor,
    /// Left stop scores, (decision × state × adjacency)
    pub stop_left: Tensor,
    /// Right stop scores, (decision × state × adjacency)
    pub stop_right: Tensor,
    /// Root scores, one per state
    pub root: Tensor,
}

impl GrammarParameters {
    /// All-zero scores (uniform distributions once normalized).
    pub fn zeros(num_state: usize) -> Self {
        Self {
            attach_left: Tensor::zeros(vec![num_state, num_state]),
            attach_right: Tensor::zeros(vec![num_state, num_state]),
            stop_left: Tensor::zeros(vec![2, num_state, 2]),
            stop_right: Tensor::zeros(vec![2, num_state, 2]),
            root: Tensor::zeros(vec![num_state]),
        }
    }

    /// Random initialization.
    ///
    /// Scores are uniform on [0, 1) plus an offset: attachments +0.01, root
    /// +1. Stop scores favor stopping once a dependent exists and continuing
    /// while none does.
    pub fn random(num_state: usize, rng: &mut impl Rng) -> Self {
        let mut grammar = Self {
            attach_left: Tensor::uniform(vec![num_state, num_state], 0.01, 1.01, rng),
            attach_right: Tensor::uniform(vec![num_state, num_state], 0.01, 1.01, rng),
            stop_left: Tensor::zeros(vec![2, num_state, 2]),
            stop_right: Tensor::zeros(vec![2, num_state, 2]),
            root: Tensor::uniform(vec![num_state], 1.0, 2.0, rng),
        };

        let offsets = [
            (CONTINUE, NON_ADJACENT, 1.0),
            (STOP, NON_ADJACENT, 2.0),
            (CONTINUE, ADJACENT, 2.0),
            (STOP, ADJACENT, 1.0),
        ];
        for stop in [&mut grammar.stop_right, &mut grammar.stop_left] {
            for &(decision, adj, offset) in &offsets {
                for s in 0..num_state {
                    *stop.get_mut(&[decision, s, adj]) = rng.gen::<f64>() + offset;
                }
            }
        }
        grammar
    }

    /// Number of latent states.
    pub fn num_states(&self) -> usize {
        self.root.size()
    }

    /// Check that all five tensors agree on the state count.
    pub fn validate(&self) -> Result<(), NlpError> {
        let s = self.num_states();
        self.attach_left.expect_shape(&[s, s])?;
        self.attach_right.expect_shape(&[s, s])?;
        self.stop_left.expect_shape(&[2, s, 2])?;
        self.stop_right.expect_shape(&[2, s, 2])?;
        self.root.expect_shape(&[s])?;
        Ok(())
    }

    /// Normalize every distribution into log-probabilities.
    pub fn normalize(&self) -> Result<LogGrammar, NlpError> {
        self.validate()?;
        Ok(LogGrammar {
            num_state: self.num_states(),
            attach_left: log_softmax_axis(&self.attach_left, ATTACH_AXIS)?,
            attach_right: log_softmax_axis(&self.attach_right, ATTACH_AXIS)?,
            stop_left: log_softmax_axis(&self.stop_left, STOP_AXIS)?,
            stop_right: log_softmax_axis(&self.stop_right, STOP_AXIS)?,
            root: log_softmax_axis(&self.root, ROOT_AXIS)?,
        })
    }

    /// The five tensors in a fixed order.
    pub fn params(&self) -> Vec<&Tensor> {
        vec![
            &self.attach_left,
            &self.attach_right,
            &self.stop_left,
            &self.stop_right,
            &self.root,
        ]
    }

    /// The five tensors, mutably, in the order of [`params`](Self::params).
    pub fn params_mut(&mut self) -> Vec<&mut Tensor> {
        vec![
            &mut self.attach_left,
            &mut self.attach_right,
            &mut self.stop_left,
            &mut self.stop_right,
            &mut self.root,
        ]
    }
}

// ============================================================================
// Normalized grammar
// ============================================================================

/// Log-probabilities derived from [`GrammarParameters`] for one engine call.
#[derive(Debug, Clone, PartialEq)]
pub struct LogGrammar {
    num_state: usize,
    attach_left: Tensor,
    attach_right: Tensor,
    stop_left: Tensor,
    stop_right: Tensor,
    root: Tensor,
}

impl LogGrammar {
    /// Number of latent states.
    pub fn num_states(&self) -> usize {
        self.num_state
    }

    /// log P(argument attaches to the left of head).
    #[inline]
    pub fn attach_left(&self, head: usize, arg: usize) -> f64 {
        self.attach_left.data[head * self.num_state + arg]
    }

    /// log P(argument attaches to the right of head).
    #[inline]
    pub fn attach_right(&self, head: usize, arg: usize) -> f64 {
        self.attach_right.data[head * self.num_state + arg]
    }

    /// log P(decision | state, left adjacency).
    #[inline]
    pub fn stop_left(&self, decision: usize, state: usize, adjacent: bool) -> f64 {
        self.stop_left.data[(decision * self.num_state + state) * 2 + adjacency(adjacent)]
    }

    /// log P(decision | state, right adjacency).
    #[inline]
    pub fn stop_right(&self, decision: usize, state: usize, adjacent: bool) -> f64 {
        self.stop_right.data[(decision * self.num_state + state) * 2 + adjacency(adjacent)]
    }

    /// log P(state is the sentence root).
    #[inline]
    pub fn root(&self, state: usize) -> f64 {
        self.root.data[state]
    }

    /// Map gradients on these log-probabilities onto the raw scores.
    pub fn backward(&self, grad: &GrammarGrad) -> Result<GrammarGrad, NlpError> {
        Ok(GrammarGrad {
            attach_left: log_softmax_axis_backward(&self.attach_left, &grad.attach_left, ATTACH_AXIS)?,
            attach_right: log_softmax_axis_backward(
                &self.attach_right,
                &grad.attach_right,
                ATTACH_AXIS,
            )?,
            stop_left: log_softmax_axis_backward(&self.stop_left, &grad.stop_left, STOP_AXIS)?,
            stop_right: log_softmax_axis_backward(&self.stop_right, &grad.stop_right, STOP_AXIS)?,
            root: log_softmax_axis_backward(&self.root, &grad.root, ROOT_AXIS)?,
        })
    }
}

/// Gradients laid out like [`GrammarParameters`].
#[derive(Debug, Clone, PartialEq)]
pub struct GrammarGrad {
    pub attach_left: Tensor,
    pub attach_right: Tensor,
    pub stop_left: Tensor,
    pub stop_right: Tensor,
    pub root: Tensor,
}

impl GrammarGrad {
    /// Zero gradients for `num_state` states.
    pub fn zeros(num_state: usize) -> Self {
        let g = GrammarParameters::zeros(num_state);
        Self {
            attach_left: g.attach_left,
            attach_right: g.attach_right,
            stop_left: g.stop_left,
            stop_right: g.stop_right,
            root: g.root,
        }
    }

    fn num_states(&self) -> usize {
        self.root.size()
    }

    #[inline]
    pub(crate) fn add_attach_left(&mut self, head: usize, arg: usize, value: f64) {
        let s = self.num_states();
        self.attach_left.data[head * s + arg] += value;
    }

    #[inline]
    pub(crate) fn add_attach_right(&mut self, head: usize, arg: usize, value: f64) {
        let s = self.num_states();
        self.attach_right.data[head * s + arg] += value;
    }

    #[inline]
    pub(crate) fn add_stop_left(&mut self, decision: usize, state: usize, adjacent: bool, value: f64) {
        let s = self.num_states();
        self.stop_left.data[(decision * s + state) * 2 + adjacency(adjacent)] += value;
    }

    #[inline]
    pub(crate) fn add_stop_right(&mut self, decision: usize, state: usize, adjacent: bool, value: f64) {
        let s = self.num_states();
        self.stop_right.data[(decision * s + state) * 2 + adjacency(adjacent)] += value;
    }

    #[inline]
    pub(crate) fn add_root(&mut self, state: usize, value: f64) {
        self.root.data[state] += value;
    }

    /// The five tensors in [`GrammarParameters::params`] order.
    pub fn into_tensors(self) -> Vec<Tensor> {
        vec![
            self.attach_left,
            self.attach_right,
            self.stop_left,
            self.stop_right,
            self.root,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmvflow_diff::check::grad_check;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn assert_normalized(log: &LogGrammar) {
        let s = log.num_states();
        for h in 0..s {
            let left: f64 = (0..s).map(|a| log.attach_left(h, a).exp()).sum();
            let right: f64 = (0..s).map(|a| log.attach_right(h, a).exp()).sum();
            assert!((left - 1.0).abs() < 1e-9);
            assert!((right - 1.0).abs() < 1e-9);
            for adj in [false, true] {
                let sl = log.stop_left(CONTINUE, h, adj).exp() + log.stop_left(STOP, h, adj).exp();
                let sr =
                    log.stop_right(CONTINUE, h, adj).exp() + log.stop_right(STOP, h, adj).exp();
                assert!((sl - 1.0).abs() < 1e-9);
                assert!((sr - 1.0).abs() < 1e-9);
            }
        }
        let root: f64 = (0..s).map(|h| log.root(h).exp()).sum();
        assert!((root - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zeros_normalize_uniform() {
        let log = GrammarParameters::zeros(4).normalize().unwrap();
        assert!((log.attach_left(1, 2) - (0.25_f64).ln()).abs() < 1e-12);
        assert!((log.stop_right(STOP, 3, false) - (0.5_f64).ln()).abs() < 1e-12);
        assert_normalized(&log);
    }

    #[test]
    fn test_random_offsets() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let g = GrammarParameters::random(5, &mut rng);
        assert!(g.root.min() >= 1.0);
        assert!(g.attach_left.min() >= 0.01);
        for s in 0..5 {
            assert!(g.stop_left.get(&[STOP, s, NON_ADJACENT]) >= 2.0);
            assert!(g.stop_left.get(&[CONTINUE, s, ADJACENT]) >= 2.0);
            assert!(g.stop_right.get(&[CONTINUE, s, NON_ADJACENT]) < 2.0);
            assert!(g.stop_right.get(&[STOP, s, ADJACENT]) < 2.0);
        }
    }

    #[test]
    fn test_validate_rejects_inconsistent_shapes() {
        let mut g = GrammarParameters::zeros(3);
        g.attach_right = Tensor::zeros(vec![3, 2]);
        assert!(matches!(g.normalize(), Err(NlpError::Diff(_))));
    }

    #[test]
    fn test_backward_matches_numerical_gradient() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let g = GrammarParameters::random(3, &mut rng);
        let log = g.normalize().unwrap();

        // L = Σ w ⊙ log P for a fixed weighting of the stop-left table
        let weights: Vec<f64> = (0..12).map(|i| (i as f64 * 0.37).sin()).collect();
        let mut grad = GrammarGrad::zeros(3);
        grad.stop_left.data.copy_from_slice(&weights);
        grad.add_root(1, 2.0);
        let raw = log.backward(&grad).unwrap();

        let objective = |v: &[f64]| {
            let mut probe = g.clone();
            probe.stop_left.data.copy_from_slice(v);
            let l = probe.normalize().unwrap();
            l.stop_left.data.iter().zip(&weights).map(|(a, b)| a * b).sum::<f64>()
        };
        grad_check(objective, &g.stop_left.data, &raw.stop_left.data, 1e-6, 1e-6).unwrap();

        let root_objective = |v: &[f64]| {
            let mut probe = g.clone();
            probe.root.data.copy_from_slice(v);
            2.0 * probe.normalize().unwrap().root(1)
        };
        grad_check(root_objective, &g.root.data, &raw.root.data, 1e-6, 1e-6).unwrap();
    }

    proptest! {
        #[test]
        fn prop_normalization_for_all_state_counts(states in 1usize..12, seed in 0u64..500) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let log = GrammarParameters::random(states, &mut rng).normalize().unwrap();
            assert_normalized(&log);
        }
    }
}
