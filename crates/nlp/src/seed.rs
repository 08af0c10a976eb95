//! # Pretrained Grammar Seeding
//!
//! Training can start from a grammar estimated by a previous (discrete) DMV
//! run instead of from random scores. The converged model is consulted
//! through [`ConvergedGrammar`], which answers log-probability point
//! estimates keyed by tag labels.
//!
//! Raw scores are set so that normalization reproduces the estimates: the
//! target log-probability is written at the selected index and, for the
//! binary stop decision, `log(1 − p)` at the complementary index. A stop
//! probability of exactly 1 has no finite complement; it is floored to
//! [`NEG_FLOOR`](dmvflow_prob::NEG_FLOOR) and reported with a warning.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use dmvflow_prob::stable_ln;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::grammar::{GrammarParameters, CONTINUE, STOP};
use crate::NlpError;

/// One queried parameter of a converged grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedParam<'a> {
    /// `arg` attaches to the left of `head`
    AttachLeft { head: &'a str, arg: &'a str },
    /// `arg` attaches to the right of `head`
    AttachRight { head: &'a str, arg: &'a str },
    /// `state` stops generating left dependents
    StopLeft { state: &'a str, adjacent: bool },
    /// `state` stops generating right dependents
    StopRight { state: &'a str, adjacent: bool },
    /// `state` is the sentence root
    Root { state: &'a str },
}

/// A converged grammar that can answer point estimates.
pub trait ConvergedGrammar {
    /// Log-probability of a parameter, or `None` if the model has no estimate.
    fn log_prob(&self, param: SeedParam<'_>) -> Option<f64>;
}

/// JSON-loadable table of converged log-probabilities.
///
/// ```json
/// {
///   "attach_left":  { "VB": { "NN": -0.5 } },
///   "attach_right": { "VB": { "NN": -1.2 } },
///   "stop_left":    { "NN": [-0.1, -0.7] },
///   "stop_right":   { "NN": [-0.2, -0.9] },
///   "root":         { "VB": -0.3 }
/// }
/// ```
///
/// Attachment tables are keyed by head, then argument. Stop entries hold the
/// log-probability of stopping, non-adjacent first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedTable {
    pub attach_left: HashMap<String, HashMap<String, f64>>,
    pub attach_right: HashMap<String, HashMap<String, f64>>,
    pub stop_left: HashMap<String, [f64; 2]>,
    pub stop_right: HashMap<String, [f64; 2]>,
    pub root: HashMap<String, f64>,
}

impl SeedTable {
    /// Parse a table from JSON text.
    pub fn from_json(json: &str) -> Result<Self, NlpError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a table from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NlpError> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

impl ConvergedGrammar for SeedTable {
    fn log_prob(&self, param: SeedParam<'_>) -> Option<f64> {
        match param {
            SeedParam::AttachLeft { head, arg } => self.attach_left.get(head)?.get(arg).copied(),
            SeedParam::AttachRight { head, arg } => self.attach_right.get(head)?.get(arg).copied(),
            SeedParam::StopLeft { state, adjacent } => {
                self.stop_left.get(state).map(|v| v[usize::from(adjacent)])
            }
            SeedParam::StopRight { state, adjacent } => {
                self.stop_right.get(state).map(|v| v[usize::from(adjacent)])
            }
            SeedParam::Root { state } => self.root.get(state).copied(),
        }
    }
}

/// Overwrite raw grammar scores with a converged model's estimates.
///
/// `tags[s]` is the label of state `s`. Parameters the source has no
/// estimate for keep their current value. Returns the number of entries
/// written.
pub fn seed_grammar(
    grammar: &mut GrammarParameters,
    tags: &[String],
    source: &impl ConvergedGrammar,
) -> Result<usize, NlpError> {
    grammar.validate()?;
    if tags.len() != grammar.num_states() {
        return Err(NlpError::InvalidConfig {
            reason: format!(
                "{} tag labels for a grammar with {} states",
                tags.len(),
                grammar.num_states()
            ),
        });
    }

    let mut written = 0;
    let mut missing = 0;

    for (h, head) in tags.iter().enumerate() {
        for (a, arg) in tags.iter().enumerate() {
            let (head, arg) = (head.as_str(), arg.as_str());
            match source.log_prob(SeedParam::AttachLeft { head, arg }) {
                Some(lp) => {
                    *grammar.attach_left.get_mut(&[h, a]) = lp;
                    written += 1;
                }
                None => missing += 1,
            }
            match source.log_prob(SeedParam::AttachRight { head, arg }) {
                Some(lp) => {
                    *grammar.attach_right.get_mut(&[h, a]) = lp;
                    written += 1;
                }
                None => missing += 1,
            }
        }
    }

    for (s, state) in tags.iter().enumerate() {
        let state = state.as_str();
        for adjacent in [false, true] {
            let adj = usize::from(adjacent);
            let left = source.log_prob(SeedParam::StopLeft { state, adjacent });
            let right = source.log_prob(SeedParam::StopRight { state, adjacent });
            for (lp, table, side) in [
                (left, &mut grammar.stop_left, "left"),
                (right, &mut grammar.stop_right, "right"),
            ] {
                let Some(lp) = lp else {
                    missing += 1;
                    continue;
                };
                *table.get_mut(&[STOP, s, adj]) = lp;
                *table.get_mut(&[CONTINUE, s, adj]) = complement(lp, state, side, adjacent);
                written += 2;
            }
        }

        match source.log_prob(SeedParam::Root { state }) {
            Some(lp) => {
                *grammar.root.get_mut(&[s]) = lp;
                written += 1;
            }
            None => missing += 1,
        }
    }

    debug!(written, missing, "seeded grammar from converged model");
    Ok(written)
}

/// `log(1 − exp(lp))`, floored when the stop probability is 1.
fn complement(lp: f64, state: &str, side: &str, adjacent: bool) -> f64 {
    let rest = 1.0 - lp.exp();
    if rest <= 0.0 {
        warn!(state, side, adjacent, "stop probability is 1, continue score floored");
    }
    stable_ln(rest)
}
