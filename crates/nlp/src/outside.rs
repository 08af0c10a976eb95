//! # Outside (Adjoint) Pass
//!
//! Gradients of the batch log-likelihood `Σ_b LL_b` with respect to the
//! normalized grammar and the emission scores, by a reverse sweep over the
//! inside chart.
//!
//! Every chart entry is a log-sum-exp of terms; the adjoint of a term is the
//! entry's adjoint times the term's soft-max weight `exp(term − entry)`.
//! Spans are visited longest first, so by the time a span is reached every
//! span that uses it has already pushed its adjoint down. Within a span the
//! order mirrors the forward pass in reverse: stop transitions, then left
//! attachment, then right attachment.
//!
//! The adjoint of a chart entry is the posterior expected count of the
//! derivation step it stands for, so the gradient with respect to a
//! log-probability is its expected usage count.

use dmvflow_diff::Tensor;

use crate::chart::{Chart, Mark};
use crate::grammar::{GrammarGrad, LogGrammar, CONTINUE, STOP};
use crate::inside::{
    check_inputs, left_attach_scores, left_splits, right_splits, InsideChart, SplitTable,
};
use crate::NlpError;

/// Gradients of the summed log-likelihood.
#[derive(Debug, Clone)]
pub struct InsideGrad {
    /// With respect to the normalized log-probabilities
    pub grammar: GrammarGrad,
    /// With respect to the emission scores, `[batch, max_len, states]`
    pub emissions: Tensor,
}

/// Run the outside pass for an inside chart computed from the same inputs.
pub fn outside(
    grammar: &LogGrammar,
    emissions: &Tensor,
    inside: &InsideChart,
    chart_budget_bytes: usize,
) -> Result<InsideGrad, NlpError> {
    let lengths = inside.lengths();
    check_inputs(grammar, emissions, lengths)?;
    let states = grammar.num_states();
    let scores = &inside.chart;

    let mut adjoint = Chart::try_new(*scores.layout(), 0.0, chart_budget_bytes)?;
    let mut grad = GrammarGrad::zeros(states);
    let mut grad_emissions = emissions.zeros_like();

    for (b, &len) in lengths.iter().enumerate() {
        let ll = inside.sentence_log_likelihoods()[b];
        for h in 0..states {
            for p in 0..len {
                let w = (scores.get(0, len, Mark::BothStopped, b, h, p) + grammar.root(h) - ll).exp();
                *adjoint.get_mut(0, len, Mark::BothStopped, b, h, p) += w;
                grad.add_root(h, w);
            }
        }

        let mut sweep = Sweep {
            grammar,
            scores,
            adjoint: &mut adjoint,
            grad: &mut grad,
            b,
        };
        for l in (1..=len).rev() {
            for i in 0..=len - l {
                let j = i + l;
                if l == 1 {
                    sweep.unary(i, j);
                    for h in 0..states {
                        *grad_emissions.get_mut(&[b, i, h]) +=
                            *sweep.adjoint.get(i, j, Mark::NonStop, b, h, i);
                    }
                    continue;
                }
                let left = left_splits(scores, grammar, b, i, j);
                let att = left_attach_scores(scores, grammar, &left, b, i, j);
                let grad_att = sweep.unary(i, j);
                sweep.left_attach(i, j, &left, &att, &grad_att);
                sweep.right_attach(i, j);
            }
        }
    }

    Ok(InsideGrad {
        grammar: grad,
        emissions: grad_emissions,
    })
}

struct Sweep<'a> {
    grammar: &'a LogGrammar,
    scores: &'a Chart<f64>,
    adjoint: &'a mut Chart<f64>,
    grad: &'a mut GrammarGrad,
    b: usize,
}

impl Sweep<'_> {
    /// Backward through the stop transitions of one span.
    ///
    /// Returns the adjoint of the left-attachment mass, indexed like it;
    /// position `i` carries none.
    fn unary(&mut self, i: usize, j: usize) -> Vec<f64> {
        let b = self.b;
        let width = j - i;
        let mut grad_att = vec![0.0; self.grammar.num_states() * width];

        for h in 0..self.grammar.num_states() {
            for p in i..j {
                let g2 = *self.adjoint.get(i, j, Mark::BothStopped, b, h, p);
                if g2 != 0.0 {
                    *self.adjoint.get_mut(i, j, Mark::RightStopped, b, h, p) += g2;
                    self.grad.add_stop_left(STOP, h, p == i, g2);
                }
            }

            let g1 = *self.adjoint.get(i, j, Mark::RightStopped, b, h, i);
            if g1 != 0.0 {
                *self.adjoint.get_mut(i, j, Mark::NonStop, b, h, i) += g1;
                self.grad.add_stop_right(STOP, h, j == i + 1, g1);
            }
            for p in i + 1..j {
                grad_att[h * width + (p - i)] = *self.adjoint.get(i, j, Mark::RightStopped, b, h, p);
            }
        }
        grad_att
    }

    fn left_attach(&mut self, i: usize, j: usize, left: &SplitTable, att: &[f64], grad_att: &[f64]) {
        let b = self.b;
        let states = self.grammar.num_states();
        let width = j - i;
        let splits = width - 1;
        let mut grad_attached = vec![0.0; splits * states];

        for h in 0..states {
            for n in i + 1..j {
                let g = grad_att[h * width + (n - i)];
                if g == 0.0 {
                    continue;
                }
                let total = att[h * width + (n - i)];
                for k in i + 1..=n {
                    let term = left.attached(k, h)
                        + self.scores.get(k, j, Mark::RightStopped, b, h, n)
                        + self.grammar.stop_left(CONTINUE, h, n == k);
                    let w = g * (term - total).exp();
                    *self.adjoint.get_mut(k, j, Mark::RightStopped, b, h, n) += w;
                    self.grad.add_stop_left(CONTINUE, h, n == k, w);
                    grad_attached[(k - i - 1) * states + h] += w;
                }
            }
        }

        let mut grad_completed = vec![0.0; splits * states];
        for k in i + 1..j {
            let row = (k - i - 1) * states;
            for h in 0..states {
                let g = grad_attached[row + h];
                if g == 0.0 {
                    continue;
                }
                for a in 0..states {
                    let w = g
                        * (left.completed(k, a) + self.grammar.attach_left(h, a)
                            - left.attached(k, h))
                        .exp();
                    self.grad.add_attach_left(h, a, w);
                    grad_completed[row + a] += w;
                }
            }
            for a in 0..states {
                let g = grad_completed[row + a];
                if g == 0.0 {
                    continue;
                }
                let total = left.completed(k, a);
                for m in i..k {
                    let w = g * (self.scores.get(i, k, Mark::BothStopped, b, a, m) - total).exp();
                    *self.adjoint.get_mut(i, k, Mark::BothStopped, b, a, m) += w;
                }
            }
        }
    }

    fn right_attach(&mut self, i: usize, j: usize) {
        let b = self.b;
        let states = self.grammar.num_states();
        let right = right_splits(self.scores, self.grammar, b, i, j);
        let splits = j - i - 1;
        let mut grad_attached = vec![0.0; splits * states];

        for h in 0..states {
            let g = *self.adjoint.get(i, j, Mark::NonStop, b, h, i);
            if g == 0.0 {
                continue;
            }
            let total = *self.scores.get(i, j, Mark::NonStop, b, h, i);
            for k in i + 1..j {
                let term = self.scores.get(i, k, Mark::NonStop, b, h, i)
                    + right.attached(k, h)
                    + self.grammar.stop_right(CONTINUE, h, k == i + 1);
                let w = g * (term - total).exp();
                *self.adjoint.get_mut(i, k, Mark::NonStop, b, h, i) += w;
                self.grad.add_stop_right(CONTINUE, h, k == i + 1, w);
                grad_attached[(k - i - 1) * states + h] += w;
            }
        }

        let mut grad_completed = vec![0.0; splits * states];
        for k in i + 1..j {
            let row = (k - i - 1) * states;
            for h in 0..states {
                let g = grad_attached[row + h];
                if g == 0.0 {
                    continue;
                }
                for a in 0..states {
                    let w = g
                        * (right.completed(k, a) + self.grammar.attach_right(h, a)
                            - right.attached(k, h))
                        .exp();
                    self.grad.add_attach_right(h, a, w);
                    grad_completed[row + a] += w;
                }
            }
            for a in 0..states {
                let g = grad_completed[row + a];
                if g == 0.0 {
                    continue;
                }
                let total = right.completed(k, a);
                for n in k..j {
                    let w = g * (self.scores.get(k, j, Mark::BothStopped, b, a, n) - total).exp();
                    *self.adjoint.get_mut(k, j, Mark::BothStopped, b, a, n) += w;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::GrammarParameters;
    use crate::inside::InsideEngine;
    use dmvflow_diff::check::grad_check;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const BUDGET: usize = 1 << 28;

    fn setup(seed: u64, states: usize, lengths: &[usize]) -> (GrammarParameters, Tensor) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let grammar = GrammarParameters::random(states, &mut rng);
        let max_len = lengths.iter().copied().max().unwrap();
        let emissions = Tensor::uniform(vec![lengths.len(), max_len, states], -2.0, 0.0, &mut rng);
        (grammar, emissions)
    }

    fn log_likelihood(grammar: &GrammarParameters, emissions: &Tensor, lengths: &[usize]) -> f64 {
        let log = grammar.normalize().unwrap();
        InsideEngine::new(BUDGET)
            .run(&log, emissions, lengths)
            .unwrap()
            .log_likelihood()
    }

    fn gradients(grammar: &GrammarParameters, emissions: &Tensor, lengths: &[usize]) -> InsideGrad {
        let log = grammar.normalize().unwrap();
        let inside = InsideEngine::new(BUDGET).run(&log, emissions, lengths).unwrap();
        outside(&log, emissions, &inside, BUDGET).unwrap()
    }

    #[test]
    fn test_emission_gradient_matches_numerical() {
        let lengths = [4, 2, 1];
        let (grammar, emissions) = setup(1, 3, &lengths);
        let grads = gradients(&grammar, &emissions, &lengths);

        let f = |v: &[f64]| {
            let probe = Tensor::from_data(emissions.shape.clone(), v.to_vec()).unwrap();
            log_likelihood(&grammar, &probe, &lengths)
        };
        grad_check(f, &emissions.data, &grads.emissions.data, 1e-5, 1e-6).unwrap();
    }

    #[test]
    fn test_grammar_gradient_matches_numerical() {
        let lengths = [5, 3];
        let (grammar, emissions) = setup(2, 3, &lengths);
        let log = grammar.normalize().unwrap();
        let grads = gradients(&grammar, &emissions, &lengths);
        let raw = log.backward(&grads.grammar).unwrap();

        let analytic = raw.clone().into_tensors();
        for (index, expected) in analytic.iter().enumerate() {
            let f = |v: &[f64]| {
                let mut probe = grammar.clone();
                probe.params_mut()[index].data.copy_from_slice(v);
                log_likelihood(&probe, &emissions, &lengths)
            };
            let x = grammar.params()[index].data.clone();
            grad_check(f, &x, &expected.data, 1e-5, 1e-6).unwrap();
        }
    }

    #[test]
    fn test_emission_gradients_are_posteriors() {
        // Each token is emitted by exactly one state in every derivation, so
        // the emission adjoints of a token sum to one.
        let lengths = [4];
        let (grammar, emissions) = setup(3, 4, &lengths);
        let grads = gradients(&grammar, &emissions, &lengths);
        for i in 0..4 {
            let total: f64 = (0..4).map(|h| grads.emissions.get(&[0, i, h])).sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
        let root_total: f64 = grads.grammar.root.data.iter().sum();
        assert!((root_total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_padding_positions_get_no_gradient() {
        let lengths = [2, 4];
        let (grammar, emissions) = setup(4, 2, &lengths);
        let grads = gradients(&grammar, &emissions, &lengths);
        for i in 2..4 {
            for h in 0..2 {
                assert_eq!(grads.emissions.get(&[0, i, h]), 0.0);
            }
        }
    }
}
