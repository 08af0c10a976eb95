//! # Inside Algorithm
//!
//! Sum-product dynamic program over DMV derivations. For every span
//! `(i, j)`, mark and head `(state h, position p)` the chart holds the log
//! of the total probability of all partial derivations of words `i..j`
//! headed by `h` at `p`:
//!
//! ```text
//!   I(i,i+1,NonStop)[h][i]  = emit[i][h]
//!
//!   I(i,j,NonStop)[h][i]    = lse_k  I(i,k,NonStop)[h][i]
//!                                  + lse_a( lse_n I(k,j,BothStopped)[a][n] + attachR(h,a) )
//!                                  + stopR(continue | h, adj = k == i+1)
//!
//!   Iatt(i,j)[h][n]         = lse_k  lse_a( lse_m I(i,k,BothStopped)[a][m] + attachL(h,a) )
//!                                  + I(k,j,RightStopped)[h][n]
//!                                  + stopL(continue | h, adj = n == k)
//!
//!   I(i,j,RightStopped)[h][i] = I(i,j,NonStop)[h][i] + stopR(stop | h, adj = j == i+1)
//!   I(i,j,RightStopped)[h][n] = Iatt(i,j)[h][n]                    (n > i)
//!   I(i,j,BothStopped)[h][p]  = I(i,j,RightStopped)[h][p] + stopL(stop | h, adj = p == i)
//! ```
//!
//! Right dependents are taken first, so a head still in `NonStop` always
//! sits at the left edge of its span; `NonStop` entries with `p > i` are
//! never derived and never read. A sentence of length `L` scores
//! `lse_{h,p} I(0,L,BothStopped)[h][p] + root(h)`.
//!
//! Argument marginals over positions and states are taken before combining
//! with the head side, so a span costs `O(l · S²)` for the argument tables
//! plus `O(l² · S)` for the split sums.

use dmvflow_diff::Tensor;
use dmvflow_prob::{log_sum_exp, NEG_FLOOR};

use crate::chart::{Chart, ChartLayout, Mark};
use crate::grammar::{LogGrammar, CONTINUE, STOP};
use crate::NlpError;

/// Check engine inputs and return `(batch, max_len)`.
pub(crate) fn check_inputs(
    grammar: &LogGrammar,
    emissions: &Tensor,
    lengths: &[usize],
) -> Result<(usize, usize), NlpError> {
    let s = grammar.num_states();
    if emissions.rank() != 3 || emissions.shape[2] != s {
        return Err(dmvflow_diff::DiffError::ShapeMismatch {
            expected: vec![lengths.len(), lengths.iter().copied().max().unwrap_or(0), s],
            got: emissions.shape.clone(),
        }
        .into());
    }
    let (batch, max_len) = (emissions.shape[0], emissions.shape[1]);
    if batch == 0 {
        return Err(NlpError::EmptyBatch);
    }
    if lengths.len() != batch {
        return Err(NlpError::InvalidConfig {
            reason: format!("{} lengths for a batch of {}", lengths.len(), batch),
        });
    }
    for &length in lengths {
        if length == 0 {
            return Err(NlpError::EmptySentence);
        }
        if length > max_len {
            return Err(NlpError::SentenceTooLong {
                length,
                capacity: max_len,
            });
        }
    }
    Ok((batch, max_len))
}

/// Argument tables for the splits `k ∈ (i, j)` of one span.
///
/// `completed[k][a]` is the position-marginal of the completed argument
/// span; `attached[k][h]` additionally marginalizes the argument state
/// under the attach distribution of head `h`.
pub(crate) struct SplitTable {
    first: usize,
    states: usize,
    completed: Vec<f64>,
    attached: Vec<f64>,
}

impl SplitTable {
    #[inline]
    pub(crate) fn completed(&self, k: usize, a: usize) -> f64 {
        self.completed[(k - self.first) * self.states + a]
    }

    #[inline]
    pub(crate) fn attached(&self, k: usize, h: usize) -> f64 {
        self.attached[(k - self.first) * self.states + h]
    }
}

fn split_table(
    chart: &Chart<f64>,
    i: usize,
    j: usize,
    states: usize,
    argument: impl Fn(&Chart<f64>, usize, usize) -> f64,
    attach: impl Fn(usize, usize) -> f64,
) -> SplitTable {
    let splits = j - i - 1;
    let mut completed = vec![NEG_FLOOR; splits * states];
    let mut attached = vec![NEG_FLOOR; splits * states];
    let mut terms = vec![0.0; states];
    for k in i + 1..j {
        let row = (k - i - 1) * states;
        for a in 0..states {
            completed[row + a] = argument(chart, k, a);
        }
        for h in 0..states {
            for (a, t) in terms.iter_mut().enumerate() {
                *t = completed[row + a] + attach(h, a);
            }
            attached[row + h] = log_sum_exp(&terms);
        }
    }
    SplitTable {
        first: i + 1,
        states,
        completed,
        attached,
    }
}

/// Tables for right attachment: the argument is `(k, j, BothStopped)`.
pub(crate) fn right_splits(
    chart: &Chart<f64>,
    grammar: &LogGrammar,
    b: usize,
    i: usize,
    j: usize,
) -> SplitTable {
    split_table(
        chart,
        i,
        j,
        grammar.num_states(),
        |c, k, a| log_sum_exp(&c.positions(k, j, Mark::BothStopped, b, a)[k..j]),
        |h, a| grammar.attach_right(h, a),
    )
}

/// Tables for left attachment: the argument is `(i, k, BothStopped)`.
pub(crate) fn left_splits(
    chart: &Chart<f64>,
    grammar: &LogGrammar,
    b: usize,
    i: usize,
    j: usize,
) -> SplitTable {
    split_table(
        chart,
        i,
        j,
        grammar.num_states(),
        |c, k, a| log_sum_exp(&c.positions(i, k, Mark::BothStopped, b, a)[i..k]),
        |h, a| grammar.attach_left(h, a),
    )
}

/// Left-attachment mass `Iatt(i,j)[h][n]`, indexed `[h · (j − i) + (n − i)]`.
///
/// Position `n = i` has no left split and stays at the floor.
pub(crate) fn left_attach_scores(
    chart: &Chart<f64>,
    grammar: &LogGrammar,
    left: &SplitTable,
    b: usize,
    i: usize,
    j: usize,
) -> Vec<f64> {
    let width = j - i;
    let states = grammar.num_states();
    let mut out = vec![NEG_FLOOR; states * width];
    let mut terms = Vec::with_capacity(width);
    for h in 0..states {
        for n in i + 1..j {
            terms.clear();
            for k in i + 1..=n {
                terms.push(
                    left.attached(k, h)
                        + chart.get(k, j, Mark::RightStopped, b, h, n)
                        + grammar.stop_left(CONTINUE, h, n == k),
                );
            }
            out[h * width + (n - i)] = log_sum_exp(&terms);
        }
    }
    out
}

/// Result of an inside pass over one batch.
#[derive(Debug, Clone)]
pub struct InsideChart {
    pub(crate) chart: Chart<f64>,
    lengths: Vec<usize>,
    sentence_ll: Vec<f64>,
}

impl InsideChart {
    /// Log-likelihood of each sentence.
    pub fn sentence_log_likelihoods(&self) -> &[f64] {
        &self.sentence_ll
    }

    /// Summed log-likelihood of the batch.
    pub fn log_likelihood(&self) -> f64 {
        self.sentence_ll.iter().sum()
    }

    /// Sentence lengths of the batch.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Inside score of one chart entry.
    pub fn score(
        &self,
        start: usize,
        end: usize,
        mark: Mark,
        b: usize,
        state: usize,
        pos: usize,
    ) -> f64 {
        *self.chart.get(start, end, mark, b, state, pos)
    }
}

/// Sum-product chart engine.
#[derive(Debug, Clone, Copy)]
pub struct InsideEngine {
    chart_budget_bytes: usize,
}

impl InsideEngine {
    /// Engine whose charts may use at most `chart_budget_bytes`.
    pub fn new(chart_budget_bytes: usize) -> Self {
        Self { chart_budget_bytes }
    }

    /// Run the inside pass.
    ///
    /// `emissions` is `[batch, max_len, states]`; positions past a
    /// sentence's length are ignored.
    pub fn run(
        &self,
        grammar: &LogGrammar,
        emissions: &Tensor,
        lengths: &[usize],
    ) -> Result<InsideChart, NlpError> {
        let (batch, max_len) = check_inputs(grammar, emissions, lengths)?;
        let states = grammar.num_states();
        let layout = ChartLayout::new(max_len, batch, states);
        let mut chart = Chart::try_new(layout, NEG_FLOOR, self.chart_budget_bytes)?;

        let mut sentence_ll = Vec::with_capacity(batch);
        for (b, &len) in lengths.iter().enumerate() {
            for i in 0..len {
                for h in 0..states {
                    *chart.get_mut(i, i + 1, Mark::NonStop, b, h, i) =
                        emissions.get(&[b, i, h]);
                }
                unary(&mut chart, grammar, b, i, i + 1);
            }

            for l in 2..=len {
                for i in 0..=len - l {
                    let j = i + l;
                    right_attach(&mut chart, grammar, b, i, j);
                    let left = left_splits(&chart, grammar, b, i, j);
                    let att = left_attach_scores(&chart, grammar, &left, b, i, j);
                    for h in 0..states {
                        chart
                            .positions_mut(i, j, Mark::RightStopped, b, h)[i..j]
                            .copy_from_slice(&att[h * l..(h + 1) * l]);
                    }
                    unary(&mut chart, grammar, b, i, j);
                }
            }

            let mut roots = Vec::with_capacity(states * len);
            for h in 0..states {
                let full = chart.positions(0, len, Mark::BothStopped, b, h);
                roots.extend(full[..len].iter().map(|v| v + grammar.root(h)));
            }
            sentence_ll.push(log_sum_exp(&roots));
        }

        Ok(InsideChart {
            chart,
            lengths: lengths.to_vec(),
            sentence_ll,
        })
    }
}

fn right_attach(chart: &mut Chart<f64>, grammar: &LogGrammar, b: usize, i: usize, j: usize) {
    let right = right_splits(chart, grammar, b, i, j);
    let mut terms = Vec::with_capacity(j - i);
    for h in 0..grammar.num_states() {
        terms.clear();
        for k in i + 1..j {
            terms.push(
                chart.get(i, k, Mark::NonStop, b, h, i)
                    + right.attached(k, h)
                    + grammar.stop_right(CONTINUE, h, k == i + 1),
            );
        }
        *chart.get_mut(i, j, Mark::NonStop, b, h, i) = log_sum_exp(&terms);
    }
}

/// Stop transitions: NonStop → RightStopped → BothStopped.
///
/// Positions right of `i` already hold their left-attachment mass.
fn unary(chart: &mut Chart<f64>, grammar: &LogGrammar, b: usize, i: usize, j: usize) {
    for h in 0..grammar.num_states() {
        let stopped = chart.get(i, j, Mark::NonStop, b, h, i) + grammar.stop_right(STOP, h, j == i + 1);
        *chart.get_mut(i, j, Mark::RightStopped, b, h, i) = stopped;
        for p in i..j {
            let right_stopped = *chart.get(i, j, Mark::RightStopped, b, h, p);
            *chart.get_mut(i, j, Mark::BothStopped, b, h, p) =
                right_stopped + grammar.stop_left(STOP, h, p == i);
        }
    }
}
