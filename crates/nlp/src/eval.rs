//! # Attachment Accuracy
//!
//! Scores predicted trees against gold heads.
//!
//! Gold edges are 1-indexed `(dependent, head)` pairs with head `0` for the
//! root; predicted trees are 0-indexed with head `None` for the root. An edge
//! counts as directed-correct when the tree has it, and as
//! undirected-correct when the tree has it in either direction. The root
//! edge is scored like any other, so a sentence contributes its full length
//! to the denominator. Sentences of a single word are skipped.
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_nlp::eval::measures;
//! use dmvflow_nlp::viterbi::DependencyTree;
//!
//! let gold = [(1, 2), (2, 0)];
//! let predicted = DependencyTree::from_heads(&[Some(1), None]);
//! assert_eq!(measures(&gold, &predicted), (2, 2));
//! ```

use tracing::{debug, warn};

use crate::corpus::{Batch, Sentence};
use crate::viterbi::DependencyTree;
use crate::NlpError;

/// Anything that can parse a batch.
pub trait TreeParser {
    /// One tree per sentence of `batch`.
    fn parse_batch(&self, batch: &Batch) -> Result<Vec<DependencyTree>, NlpError>;
}

/// `(directed, undirected)` matches of one sentence.
pub fn measures(gold: &[(usize, usize)], predicted: &DependencyTree) -> (usize, usize) {
    let mut directed = 0;
    let mut undirected = 0;
    for &(dependent, head) in gold {
        let Some(dependent) = dependent.checked_sub(1) else {
            continue;
        };
        let head = head.checked_sub(1);
        if predicted.contains(dependent, head) {
            directed += 1;
            undirected += 1;
        } else if head.is_some_and(|h| predicted.contains(h, Some(dependent))) {
            undirected += 1;
        }
    }
    (directed, undirected)
}

/// Running totals over a corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccuracyAccumulator {
    pub directed: usize,
    pub undirected: usize,
    pub tokens: usize,
    pub sentences: usize,
}

impl AccuracyAccumulator {
    /// Score one sentence.
    pub fn add(&mut self, gold: &[(usize, usize)], predicted: &DependencyTree) -> Result<(), NlpError> {
        if gold.len() != predicted.len() {
            return Err(NlpError::TreeLengthMismatch {
                gold: gold.len(),
                predicted: predicted.len(),
            });
        }
        if gold.len() <= 1 {
            return Ok(());
        }
        let (directed, undirected) = measures(gold, predicted);
        self.directed += directed;
        self.undirected += undirected;
        self.tokens += gold.len();
        self.sentences += 1;
        Ok(())
    }

    /// Directed attachment accuracy, 0 before any token is scored.
    pub fn directed_accuracy(&self) -> f64 {
        ratio(self.directed, self.tokens)
    }

    /// Undirected attachment accuracy, 0 before any token is scored.
    pub fn undirected_accuracy(&self) -> f64 {
        ratio(self.undirected, self.tokens)
    }
}

fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

/// Outcome of [`evaluate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub directed: f64,
    pub undirected: f64,
    /// Words scored
    pub tokens: usize,
    /// Sentences scored
    pub sentences: usize,
    /// Batches skipped because their charts did not fit
    pub skipped_batches: usize,
}

/// Parse `sentences` in order, `batch_size` at a time, and score them.
///
/// A batch whose parse fails recoverably (chart too large) is skipped and
/// counted; any other error aborts the evaluation.
pub fn evaluate(
    parser: &impl TreeParser,
    sentences: &[Sentence],
    batch_size: usize,
) -> Result<EvalReport, NlpError> {
    let mut totals = AccuracyAccumulator::default();
    let mut skipped_batches = 0;

    for (index, chunk) in sentences.chunks(batch_size.max(1)).enumerate() {
        let batch = Batch::from_sentences(chunk)?;
        let trees = match parser.parse_batch(&batch) {
            Ok(trees) => trees,
            Err(err) if err.is_recoverable() => {
                warn!(batch = index, error = %err, "skipping batch");
                skipped_batches += 1;
                continue;
            }
            Err(err) => return Err(err),
        };

        if trees.len() != chunk.len() {
            return Err(NlpError::TreeCountMismatch {
                expected: chunk.len(),
                got: trees.len(),
            });
        }
        for (offset, (sentence, tree)) in chunk.iter().zip(&trees).enumerate() {
            let gold = sentence.gold.as_deref().ok_or(NlpError::MissingGold {
                index: index * batch_size.max(1) + offset,
            })?;
            totals.add(gold, tree)?;
        }
        debug!(batch = index, tokens = totals.tokens, "scored batch");
    }

    Ok(EvalReport {
        directed: totals.directed_accuracy(),
        undirected: totals.undirected_accuracy(),
        tokens: totals.tokens,
        sentences: totals.sentences,
        skipped_batches,
    })
}
