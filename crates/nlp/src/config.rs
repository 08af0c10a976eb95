//! Training configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::NlpError;

/// Which embedding transform the model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Gaussian emissions on the raw embeddings
    #[default]
    Gaussian,
    /// Gaussian emissions behind a NICE coupling flow
    Nice,
}

/// Configuration for training and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Passes over the training data
    pub epochs: usize,
    /// Sentences per training batch
    pub batch_size: usize,
    /// Sentences per evaluation batch
    pub eval_batch_size: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Global gradient-norm bound
    pub clip_grad: f64,
    /// Embedding transform
    pub model: ModelKind,
    /// Coupling layers of the NICE transform
    pub couple_layers: usize,
    /// Hidden layers per coupling function
    pub cell_layers: usize,
    /// Units per hidden layer
    pub hidden_units: usize,
    /// Seed for initialization and shuffling
    pub seed: u64,
    /// Evaluate every this many epochs
    pub valid_nepoch: usize,
    /// Longest sentence used for training and evaluation
    pub max_len: usize,
    /// Memory allowed for the charts of one batch
    pub chart_budget_bytes: usize,
    /// Where to write the final checkpoint
    pub save_path: Option<PathBuf>,
    /// Stop when the per-word likelihood improves by less than this ratio
    pub min_improvement_rate: f64,
    /// Epochs to run before early stopping may trigger
    pub min_epochs: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 15,
            batch_size: 32,
            eval_batch_size: 32,
            learning_rate: 0.01,
            clip_grad: 5.0,
            model: ModelKind::Gaussian,
            couple_layers: 8,
            cell_layers: 1,
            hidden_units: 50,
            seed: 5783287,
            valid_nepoch: 1,
            max_len: 10,
            chart_budget_bytes: 1 << 30,
            save_path: None,
            min_improvement_rate: 0.001,
            min_epochs: 5,
        }
    }
}

impl TrainConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, NlpError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NlpError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Reject settings training cannot run with.
    pub fn validate(&self) -> Result<(), NlpError> {
        let invalid = |reason: &str| {
            Err(NlpError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.batch_size == 0 || self.eval_batch_size == 0 {
            return invalid("batch sizes must be positive");
        }
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return invalid("learning rate must be positive");
        }
        if self.clip_grad <= 0.0 || self.clip_grad.is_nan() {
            return invalid("gradient clip must be positive");
        }
        if self.valid_nepoch == 0 {
            return invalid("valid_nepoch must be positive");
        }
        if self.max_len == 0 {
            return invalid("max_len must be positive");
        }
        if self.model == ModelKind::Nice
            && (self.couple_layers == 0 || self.cell_layers == 0 || self.hidden_units == 0)
        {
            return invalid("NICE needs coupling layers, cell layers and hidden units");
        }
        Ok(())
    }

    /// Set the number of epochs.
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set the training batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the evaluation batch size.
    pub fn with_eval_batch_size(mut self, size: usize) -> Self {
        self.eval_batch_size = size;
        self
    }

    /// Set the learning rate.
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set the gradient clip.
    pub fn with_clip_grad(mut self, clip: f64) -> Self {
        self.clip_grad = clip;
        self
    }

    /// Use a NICE transform with the given shape.
    pub fn with_nice(mut self, couple_layers: usize, cell_layers: usize, hidden_units: usize) -> Self {
        self.model = ModelKind::Nice;
        self.couple_layers = couple_layers;
        self.cell_layers = cell_layers;
        self.hidden_units = hidden_units;
        self
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the evaluation interval.
    pub fn with_valid_nepoch(mut self, n: usize) -> Self {
        self.valid_nepoch = n;
        self
    }

    /// Set the sentence length cap.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Set the chart memory budget.
    pub fn with_chart_budget_bytes(mut self, bytes: usize) -> Self {
        self.chart_budget_bytes = bytes;
        self
    }

    /// Save a checkpoint to `path` after training.
    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    /// Set the early-stopping rule.
    pub fn with_early_stopping(mut self, min_improvement_rate: f64, min_epochs: usize) -> Self {
        self.min_improvement_rate = min_improvement_rate;
        self.min_epochs = min_epochs;
        self
    }
}
