//! # Viterbi Parsing
//!
//! Max-product version of the inside recursion. Every log-sum-exp becomes a
//! maximum, and each chart entry remembers how its best score was built:
//!
//! - [`Backpointer::Terminal`]: a single word, `(i, i+1, NonStop)`
//! - [`Backpointer::Unary`]: a stop transition from the previous mark of the
//!   same span and head
//! - [`Backpointer::Binary`]: an attachment, combining a head-side child
//!   and a completed argument child
//!
//! Trees are read back with an explicit stack. Every binary step adds the
//! edge `(argument position, head position)`; the root adds
//! `(root position, None)`. A sentence of length `n` yields exactly `n`
//! edges, anything else is reported as a corrupt chart.
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_diff::Tensor;
//! use dmvflow_nlp::grammar::GrammarParameters;
//! use dmvflow_nlp::viterbi::ViterbiEngine;
//!
//! let grammar = GrammarParameters::zeros(2).normalize().unwrap();
//! let emissions = Tensor::zeros(vec![1, 3, 2]);
//! let trees = ViterbiEngine::new(1 << 20).run(&grammar, &emissions, &[3]).unwrap();
//! assert_eq!(trees[0].len(), 3);
//! ```

use dmvflow_diff::Tensor;
use dmvflow_prob::NEG_FLOOR;
use serde::{Deserialize, Serialize};

use crate::chart::{Chart, ChartLayout, Mark};
use crate::grammar::{LogGrammar, CONTINUE, STOP};
use crate::inside::check_inputs;
use crate::NlpError;

// ============================================================================
// Trees
// ============================================================================

/// A dependency tree as `(dependent, head)` pairs, sorted by dependent.
///
/// Positions are 0-indexed; the root word has head `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyTree {
    edges: Vec<(usize, Option<usize>)>,
}

impl DependencyTree {
    /// Build a tree from one head per word.
    pub fn from_heads(heads: &[Option<usize>]) -> Self {
        Self {
            edges: heads.iter().copied().enumerate().collect(),
        }
    }

    /// Number of words (and edges).
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// All edges.
    pub fn edges(&self) -> &[(usize, Option<usize>)] {
        &self.edges
    }

    /// Position of the root word.
    pub fn root(&self) -> Option<usize> {
        self.edges
            .iter()
            .find(|(_, head)| head.is_none())
            .map(|&(dep, _)| dep)
    }

    /// Head of every word.
    pub fn heads(&self) -> Vec<Option<usize>> {
        self.edges.iter().map(|&(_, head)| head).collect()
    }

    /// Whether the tree has the edge `dependent → head`.
    pub fn contains(&self, dependent: usize, head: Option<usize>) -> bool {
        self.edges
            .get(dependent)
            .is_some_and(|&(dep, h)| dep == dependent && h == head)
    }
}

// ============================================================================
// Backpointers
// ============================================================================

/// A chart entry that a backpointer leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    pub start: u32,
    pub end: u32,
    pub mark: Mark,
    pub state: u32,
    pub position: u32,
}

impl ChildRef {
    fn new(start: usize, end: usize, mark: Mark, state: usize, position: usize) -> Self {
        Self {
            start: start as u32,
            end: end as u32,
            mark,
            state: state as u32,
            position: position as u32,
        }
    }

    fn span(&self) -> (usize, usize) {
        (self.start as usize, self.end as usize)
    }
}

/// How the best score of a chart entry was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpointer {
    /// A single emitted word
    Terminal,
    /// A stop transition from the same span and head
    Unary(ChildRef),
    /// An attachment of two adjacent spans
    Binary { left: ChildRef, right: ChildRef },
}

// ============================================================================
// Engine
// ============================================================================

/// Max-product chart engine.
#[derive(Debug, Clone, Copy)]
pub struct ViterbiEngine {
    chart_budget_bytes: usize,
}

impl ViterbiEngine {
    /// Engine whose score and backpointer charts together may use at most
    /// `chart_budget_bytes`.
    pub fn new(chart_budget_bytes: usize) -> Self {
        Self { chart_budget_bytes }
    }

    /// Most probable tree for every sentence of the batch.
    pub fn run(
        &self,
        grammar: &LogGrammar,
        emissions: &Tensor,
        lengths: &[usize],
    ) -> Result<Vec<DependencyTree>, NlpError> {
        let (batch, max_len) = check_inputs(grammar, emissions, lengths)?;
        let states = grammar.num_states();
        let layout = ChartLayout::new(max_len, batch, states);

        let score_bytes = layout.bytes_for::<f64>().unwrap_or(usize::MAX);
        let mut charts = Charts {
            score: Chart::try_new(layout, NEG_FLOOR, self.chart_budget_bytes)?,
            back: Chart::try_new(
                layout,
                None,
                self.chart_budget_bytes.saturating_sub(score_bytes),
            )
            .map_err(|err| match err {
                NlpError::ResourceExhausted { requested, .. } => NlpError::ResourceExhausted {
                    requested: requested.saturating_add(score_bytes),
                    budget: self.chart_budget_bytes,
                },
                other => other,
            })?,
        };

        let mut trees = Vec::with_capacity(batch);
        for (b, &len) in lengths.iter().enumerate() {
            for i in 0..len {
                for h in 0..states {
                    let emit = emissions.get(&[b, i, h]);
                    charts.set(i, i + 1, Mark::NonStop, b, h, i, emit, Backpointer::Terminal);
                }
                charts.unary(grammar, b, i, i + 1, &[]);
            }
            for l in 2..=len {
                for i in 0..=len - l {
                    let j = i + l;
                    charts.right_attach(grammar, b, i, j);
                    let attached = charts.left_attach(grammar, b, i, j);
                    charts.unary(grammar, b, i, j, &attached);
                }
            }

            let mut best: Option<(f64, usize, usize)> = None;
            for h in 0..states {
                for p in 0..len {
                    let v = charts.score.get(0, len, Mark::BothStopped, b, h, p) + grammar.root(h);
                    if best.map_or(true, |(top, _, _)| v > top) {
                        best = Some((v, h, p));
                    }
                }
            }
            let (_, h, p) = best.ok_or(NlpError::EmptySentence)?;
            let root = ChildRef::new(0, len, Mark::BothStopped, h, p);
            trees.push(reconstruct(&charts.back, b, len, root)?);
        }
        Ok(trees)
    }
}

struct Charts {
    score: Chart<f64>,
    back: Chart<Option<Backpointer>>,
}

/// Best `(score, left child, right child)` for one head.
type Candidate = Option<(f64, ChildRef, ChildRef)>;

fn consider(best: &mut Candidate, score: f64, left: ChildRef, right: ChildRef) {
    if best.map_or(true, |(top, _, _)| score > top) {
        *best = Some((score, left, right));
    }
}

impl Charts {
    #[allow(clippy::too_many_arguments)]
    fn set(
        &mut self,
        start: usize,
        end: usize,
        mark: Mark,
        b: usize,
        state: usize,
        pos: usize,
        score: f64,
        back: Backpointer,
    ) {
        *self.score.get_mut(start, end, mark, b, state, pos) = score;
        *self.back.get_mut(start, end, mark, b, state, pos) = Some(back);
    }

    /// Best completed argument of `(start, end)` for every state:
    /// `(score, position)`.
    fn best_completed(&self, b: usize, start: usize, end: usize, states: usize) -> Vec<(f64, usize)> {
        (0..states)
            .map(|a| {
                let row = self.score.positions(start, end, Mark::BothStopped, b, a);
                let mut best = (row[start], start);
                for (n, &v) in row.iter().enumerate().take(end).skip(start + 1) {
                    if v > best.0 {
                        best = (v, n);
                    }
                }
                best
            })
            .collect()
    }

    /// Best `(score, argument state, argument position)` per head.
    fn best_arguments(
        completed: &[(f64, usize)],
        attach: impl Fn(usize, usize) -> f64,
    ) -> Vec<(f64, usize, usize)> {
        let states = completed.len();
        (0..states)
            .map(|h| {
                let mut best = (completed[0].0 + attach(h, 0), 0, completed[0].1);
                for (a, &(score, pos)) in completed.iter().enumerate().skip(1) {
                    let v = score + attach(h, a);
                    if v > best.0 {
                        best = (v, a, pos);
                    }
                }
                best
            })
            .collect()
    }

    fn right_attach(&mut self, grammar: &LogGrammar, b: usize, i: usize, j: usize) {
        let states = grammar.num_states();
        let args: Vec<Vec<(f64, usize, usize)>> = (i + 1..j)
            .map(|k| {
                let completed = self.best_completed(b, k, j, states);
                Self::best_arguments(&completed, |h, a| grammar.attach_right(h, a))
            })
            .collect();

        for h in 0..states {
            let mut best: Candidate = None;
            for k in i + 1..j {
                let (arg, a, n) = args[k - i - 1][h];
                let score = self.score.get(i, k, Mark::NonStop, b, h, i)
                    + arg
                    + grammar.stop_right(CONTINUE, h, k == i + 1);
                consider(
                    &mut best,
                    score,
                    ChildRef::new(i, k, Mark::NonStop, h, i),
                    ChildRef::new(k, j, Mark::BothStopped, a, n),
                );
            }
            if let Some((score, left, right)) = best {
                self.set(i, j, Mark::NonStop, b, h, i, score, Backpointer::Binary { left, right });
            }
        }
    }

    /// Best left attachment per head, indexed `[h · (j − i) + (n − i)]`.
    fn left_attach(&self, grammar: &LogGrammar, b: usize, i: usize, j: usize) -> Vec<Candidate> {
        let states = grammar.num_states();
        let width = j - i;
        let args: Vec<Vec<(f64, usize, usize)>> = (i + 1..j)
            .map(|k| {
                let completed = self.best_completed(b, i, k, states);
                Self::best_arguments(&completed, |h, a| grammar.attach_left(h, a))
            })
            .collect();

        let mut out = vec![None; states * width];
        for h in 0..states {
            for n in i + 1..j {
                let mut best: Candidate = None;
                for k in i + 1..=n {
                    let (arg, a, m) = args[k - i - 1][h];
                    let score = arg
                        + self.score.get(k, j, Mark::RightStopped, b, h, n)
                        + grammar.stop_left(CONTINUE, h, n == k);
                    consider(
                        &mut best,
                        score,
                        ChildRef::new(i, k, Mark::BothStopped, a, m),
                        ChildRef::new(k, j, Mark::RightStopped, h, n),
                    );
                }
                out[h * width + (n - i)] = best;
            }
        }
        out
    }

    /// Stop transitions. A head still in `NonStop` sits at `i`; every other
    /// position of the span is right-stopped by its best left attachment.
    fn unary(&mut self, grammar: &LogGrammar, b: usize, i: usize, j: usize, attached: &[Candidate]) {
        let width = j - i;
        for h in 0..grammar.num_states() {
            let inter = self.score.get(i, j, Mark::NonStop, b, h, i) + grammar.stop_right(STOP, h, j == i + 1);
            let non_stop = ChildRef::new(i, j, Mark::NonStop, h, i);
            self.set(i, j, Mark::RightStopped, b, h, i, inter, Backpointer::Unary(non_stop));
            for p in i + 1..j {
                if let Some((att, left, right)) = attached[h * width + (p - i)] {
                    self.set(i, j, Mark::RightStopped, b, h, p, att, Backpointer::Binary { left, right });
                }
            }

            for p in i..j {
                if self.back.get(i, j, Mark::RightStopped, b, h, p).is_none() {
                    continue;
                }
                let both = self.score.get(i, j, Mark::RightStopped, b, h, p) + grammar.stop_left(STOP, h, p == i);
                let right_stopped = ChildRef::new(i, j, Mark::RightStopped, h, p);
                self.set(i, j, Mark::BothStopped, b, h, p, both, Backpointer::Unary(right_stopped));
            }
        }
    }
}

// ============================================================================
// Reconstruction
// ============================================================================

fn corrupt(node: &ChildRef, reason: &str) -> NlpError {
    NlpError::CorruptChart {
        start: node.start as usize,
        end: node.end as usize,
        mark: node.mark.index(),
        reason: reason.to_string(),
    }
}

/// Walk the backpointers below `root` and collect one edge per word.
fn reconstruct(
    back: &Chart<Option<Backpointer>>,
    b: usize,
    len: usize,
    root: ChildRef,
) -> Result<DependencyTree, NlpError> {
    let mut edges = vec![(root.position as usize, None)];
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        let (start, end) = node.span();
        let entry = back.get(
            start,
            end,
            node.mark,
            b,
            node.state as usize,
            node.position as usize,
        );
        match *entry {
            None => return Err(corrupt(&node, "missing backpointer")),
            Some(Backpointer::Terminal) => {
                if end - start != 1 || node.mark != Mark::NonStop || node.position as usize != start {
                    return Err(corrupt(&node, "terminal outside a single-word span"));
                }
            }
            Some(Backpointer::Unary(child)) => {
                let expected = match node.mark {
                    Mark::RightStopped => Mark::NonStop,
                    Mark::BothStopped => Mark::RightStopped,
                    Mark::NonStop => return Err(corrupt(&node, "stop transition into NonStop")),
                };
                if child.span() != (start, end)
                    || child.mark != expected
                    || child.state != node.state
                    || child.position != node.position
                {
                    return Err(corrupt(&node, "stop transition changes span or head"));
                }
                stack.push(child);
            }
            Some(Backpointer::Binary { left, right }) => {
                let (left_start, split) = left.span();
                let (right_start, right_end) = right.span();
                if left_start != start || right_end != end || split != right_start || split <= start || split >= end {
                    return Err(corrupt(&node, "children do not partition the span"));
                }
                let (head_side, argument) = match node.mark {
                    Mark::NonStop => (left, right),
                    Mark::RightStopped => (right, left),
                    Mark::BothStopped => return Err(corrupt(&node, "attachment into BothStopped")),
                };
                if head_side.mark != node.mark
                    || head_side.state != node.state
                    || head_side.position != node.position
                    || argument.mark != Mark::BothStopped
                {
                    return Err(corrupt(&node, "attachment children have wrong marks or head"));
                }
                edges.push((argument.position as usize, Some(node.position as usize)));
                stack.push(left);
                stack.push(right);
            }
        }
    }

    if edges.len() != len {
        return Err(NlpError::EdgeCountMismatch {
            edges: edges.len(),
            length: len,
        });
    }
    edges.sort_unstable();
    if edges.iter().enumerate().any(|(i, &(dep, _))| dep != i) {
        return Err(corrupt(&root, "a word has no head or several heads"));
    }
    Ok(DependencyTree { edges })
}
