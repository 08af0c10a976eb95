//! Error types for grammar induction, parsing and evaluation.

use dmvflow_diff::DiffError;
use dmvflow_prob::ProbError;
use thiserror::Error;

/// Errors that can occur in the DMV flow parser.
///
/// Only [`NlpError::ResourceExhausted`] is recoverable; see
/// [`NlpError::is_recoverable`].
#[derive(Debug, Error)]
pub enum NlpError {
    /// Word not found in the word-vector table.
    #[error("Unknown word: '{word}'")]
    UnknownWord { word: String },

    /// Tag not found in the tag vocabulary.
    #[error("Unknown tag: '{tag}'")]
    UnknownTag { tag: String },

    /// Sentence without tokens.
    #[error("Cannot parse empty sentence")]
    EmptySentence,

    /// Batch without sentences.
    #[error("Batch contains no sentences")]
    EmptyBatch,

    /// Gold and predicted trees disagree on sentence length.
    #[error("Tree length mismatch: gold has {gold} edges, predicted has {predicted}")]
    TreeLengthMismatch { gold: usize, predicted: usize },

    /// A parser returned a different number of trees than sentences given.
    #[error("Parser returned {got} trees for a batch of {expected} sentences")]
    TreeCountMismatch { expected: usize, got: usize },

    /// Sentence is longer than the chart was sized for.
    #[error("Sentence of length {length} exceeds chart capacity {capacity}")]
    SentenceTooLong { length: usize, capacity: usize },

    /// Chart allocation would exceed the memory budget or was refused.
    #[error("Chart needs {requested} bytes, budget is {budget} bytes")]
    ResourceExhausted { requested: usize, budget: usize },

    /// A backpointer does not describe a valid derivation step.
    #[error("Corrupt chart at span ({start}, {end}) mark {mark}: {reason}")]
    CorruptChart {
        start: usize,
        end: usize,
        mark: usize,
        reason: String,
    },

    /// Reconstructed tree does not assign exactly one head per token.
    #[error("Reconstructed {edges} edges for a sentence of length {length}")]
    EdgeCountMismatch { edges: usize, length: usize },

    /// Evaluation requested on a sentence without gold heads.
    #[error("Sentence {index} has no gold heads")]
    MissingGold { index: usize },

    /// Malformed input file.
    #[error("Parse error at line {line}: {message}")]
    Format { line: usize, message: String },

    /// Configuration that cannot be used.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Checkpoint does not fit the model it is loaded into.
    #[error("Checkpoint mismatch: {reason}")]
    CheckpointMismatch { reason: String },

    /// Tensor-level error.
    #[error(transparent)]
    Diff(#[from] DiffError),

    /// Probability-level error.
    #[error(transparent)]
    Prob(#[from] ProbError),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NlpError {
    /// Whether a caller may skip the failing unit of work and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, NlpError::ResourceExhausted { .. })
    }
}
