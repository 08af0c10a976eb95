//! # DMV Flow Model
//!
//! The full generative model: raw embeddings pass through an invertible
//! transform, each transformed token is scored by every latent state's
//! Gaussian, and the DMV grammar ties states together into trees.
//!
//! ```text
//!   tokens ──transform──▶ y ──emission──▶ scores[b, i, s] ──inside──▶ Σ LL
//!                                                          ──viterbi──▶ trees
//! ```
//!
//! The training objective is `Σ_b LL_b + log |det J|`. Its gradient is
//! assembled by running the pipeline backwards: outside pass, log-softmax
//! backward onto the raw grammar scores, emission backward onto the means
//! and the transformed tokens, transform backward onto its parameters.
//!
//! Learnable parameters, in [`DmvFlow::params_mut`] order: the five grammar
//! tensors, the emission means, then the transform parameters. The variance
//! is fixed at initialization.

use std::fs;
use std::path::Path;

use dmvflow_diff::{EmbeddingTransform, Flow, IdentityTransform, NiceTransform, Tensor};
use dmvflow_prob::EmissionModel;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ModelKind, TrainConfig};
use crate::corpus::{seed_sample, Batch, Sentence};
use crate::eval::TreeParser;
use crate::grammar::GrammarParameters;
use crate::inside::InsideEngine;
use crate::outside::outside;
use crate::seed::{seed_grammar, ConvergedGrammar};
use crate::viterbi::{DependencyTree, ViterbiEngine};
use crate::NlpError;

/// Value and gradient of the training objective on one batch.
#[derive(Debug, Clone)]
pub struct Objective {
    /// `Σ LL + log |det J|`
    pub value: f64,
    /// The transform's log-determinant
    pub log_det: f64,
    /// Log-likelihood of each sentence
    pub sentence_log_likelihoods: Vec<f64>,
    /// ∂value/∂θ in [`DmvFlow::params_mut`] order
    pub grads: Vec<Tensor>,
}

/// Grammar, emissions and embedding transform.
#[derive(Debug, Clone)]
pub struct DmvFlow {
    tags: Vec<String>,
    grammar: GrammarParameters,
    emission: EmissionModel,
    transform: Flow,
    chart_budget_bytes: usize,
}

impl DmvFlow {
    /// Randomly initialized model with one latent state per tag.
    ///
    /// Means start at zero and the variance at one; see
    /// [`init_emissions`](Self::init_emissions).
    pub fn new(
        config: &TrainConfig,
        tags: Vec<String>,
        num_dims: usize,
        rng: &mut impl Rng,
    ) -> Result<Self, NlpError> {
        if tags.is_empty() || num_dims == 0 {
            return Err(NlpError::InvalidConfig {
                reason: format!("{} states over {} dimensions", tags.len(), num_dims),
            });
        }
        let states = tags.len();
        let grammar = GrammarParameters::random(states, rng);
        let emission = EmissionModel::new(Tensor::zeros(vec![states, num_dims]), vec![1.0; num_dims])?;
        let transform = match config.model {
            ModelKind::Gaussian => Flow::Identity(IdentityTransform::new(num_dims)),
            ModelKind::Nice => Flow::Nice(NiceTransform::new(
                num_dims,
                config.couple_layers,
                config.cell_layers,
                config.hidden_units,
                rng,
            )?),
        };
        Ok(Self {
            tags,
            grammar,
            emission,
            transform,
            chart_budget_bytes: config.chart_budget_bytes,
        })
    }

    /// Build a model and fit its emissions to a tagged training corpus.
    ///
    /// The variance comes from a random sample of `config.batch_size`
    /// sentences.
    pub fn initialize(
        config: &TrainConfig,
        tags: Vec<String>,
        train: &[Sentence],
        rng: &mut impl Rng,
    ) -> Result<Self, NlpError> {
        let first = train.first().ok_or(NlpError::EmptyBatch)?;
        let mut model = Self::new(config, tags, first.embeddings.row_len(), rng)?;
        let seed = seed_sample(train, config.batch_size, rng);
        model.init_emissions(&seed, train)?;
        Ok(model)
    }

    /// Tag label of every state.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn num_states(&self) -> usize {
        self.tags.len()
    }

    /// Embedding width.
    pub fn num_dims(&self) -> usize {
        self.emission.num_dims()
    }

    pub fn grammar(&self) -> &GrammarParameters {
        &self.grammar
    }

    pub fn grammar_mut(&mut self) -> &mut GrammarParameters {
        &mut self.grammar
    }

    pub fn emission(&self) -> &EmissionModel {
        &self.emission
    }

    pub fn transform(&self) -> &Flow {
        &self.transform
    }

    /// Chart memory allowed per engine call.
    pub fn chart_budget_bytes(&self) -> usize {
        self.chart_budget_bytes
    }

    pub fn set_chart_budget_bytes(&mut self, bytes: usize) {
        self.chart_budget_bytes = bytes;
    }

    /// All learnable tensors.
    pub fn params_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.grammar.params_mut();
        params.push(&mut self.emission.means);
        params.extend(self.transform.params_mut());
        params
    }

    // ========================================================================
    // Forward computations
    // ========================================================================

    /// Transformed tokens, padded to `[batch, max_len, dims]`, and the
    /// log-determinant.
    pub fn transform_batch(&self, batch: &Batch) -> Result<(Tensor, f64), NlpError> {
        let (y, log_det) = self.transform.forward(&batch.tokens)?;
        Ok((batch.pad(&y)?, log_det))
    }

    /// Emission log-densities, `[batch, max_len, states]`.
    pub fn emission_scores(&self, batch: &Batch) -> Result<Tensor, NlpError> {
        let (padded, _) = self.transform_batch(batch)?;
        Ok(self.emission.log_density(&padded)?)
    }

    /// Log-likelihood of each sentence.
    pub fn sentence_log_likelihoods(&self, batch: &Batch) -> Result<Vec<f64>, NlpError> {
        let scores = self.emission_scores(batch)?;
        let grammar = self.grammar.normalize()?;
        let inside = InsideEngine::new(self.chart_budget_bytes).run(&grammar, &scores, &batch.lengths)?;
        Ok(inside.sentence_log_likelihoods().to_vec())
    }

    /// The training objective `Σ LL + log |det J|`.
    pub fn log_likelihood(&self, batch: &Batch) -> Result<f64, NlpError> {
        let (padded, log_det) = self.transform_batch(batch)?;
        let scores = self.emission.log_density(&padded)?;
        let grammar = self.grammar.normalize()?;
        let inside = InsideEngine::new(self.chart_budget_bytes).run(&grammar, &scores, &batch.lengths)?;
        Ok(inside.log_likelihood() + log_det)
    }

    /// The training objective and its gradient.
    pub fn objective(&self, batch: &Batch) -> Result<Objective, NlpError> {
        let (y, log_det) = self.transform.forward(&batch.tokens)?;
        let padded = batch.pad(&y)?;
        let scores = self.emission.log_density(&padded)?;
        let grammar = self.grammar.normalize()?;

        let inside = InsideEngine::new(self.chart_budget_bytes).run(&grammar, &scores, &batch.lengths)?;
        let adjoint = outside(&grammar, &scores, &inside, self.chart_budget_bytes)?;

        let grammar_grad = grammar.backward(&adjoint.grammar)?;
        let emission_grad = self.emission.backward(&padded, &adjoint.emissions)?;
        let grad_y = batch.unpad(&emission_grad.input)?;
        let transform_grad = self.transform.backward(&batch.tokens, &grad_y, 1.0)?;

        let mut grads = grammar_grad.into_tensors();
        grads.push(emission_grad.means);
        grads.extend(transform_grad.params);

        Ok(Objective {
            value: inside.log_likelihood() + log_det,
            log_det,
            sentence_log_likelihoods: inside.sentence_log_likelihoods().to_vec(),
            grads,
        })
    }

    /// Most probable tree of every sentence.
    pub fn parse(&self, batch: &Batch) -> Result<Vec<DependencyTree>, NlpError> {
        let scores = self.emission_scores(batch)?;
        let grammar = self.grammar.normalize()?;
        ViterbiEngine::new(self.chart_budget_bytes).run(&grammar, &scores, &batch.lengths)
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Fit the emission model to data.
    ///
    /// The variance is the empirical per-dimension variance of the
    /// transformed `seed` tokens. Each state's mean is the average
    /// transformed embedding of the tokens tagged with it in `tagged`; a
    /// state with no tokens gets the mean of all tagged tokens.
    pub fn init_emissions(&mut self, seed: &[&Sentence], tagged: &[Sentence]) -> Result<(), NlpError> {
        let dims = self.num_dims();
        let batch = Batch::from_sentences(seed.iter().copied())?;
        let (y, _) = self.transform.forward(&batch.tokens)?;
        let rows = y.num_rows() as f64;

        let mut mean = vec![0.0; dims];
        for r in 0..y.num_rows() {
            for (m, v) in mean.iter_mut().zip(y.row(r)) {
                *m += v / rows;
            }
        }
        let mut variance = vec![0.0; dims];
        for r in 0..y.num_rows() {
            for ((var, m), v) in variance.iter_mut().zip(&mean).zip(y.row(r)) {
                *var += (v - m) * (v - m) / rows;
            }
        }
        self.emission.set_variance(variance)?;

        let states = self.num_states();
        let mut sums = Tensor::zeros(vec![states, dims]);
        let mut counts = vec![0usize; states];
        for (index, sentence) in tagged.iter().enumerate() {
            let tags = sentence.tags.as_ref().ok_or_else(|| NlpError::InvalidConfig {
                reason: format!("sentence {index} has no tags"),
            })?;
            let (y, _) = self.transform.forward(&sentence.embeddings)?;
            for (i, &tag) in tags.iter().enumerate() {
                if tag >= states {
                    return Err(NlpError::UnknownTag {
                        tag: tag.to_string(),
                    });
                }
                for (s, v) in sums.row_mut(tag).iter_mut().zip(y.row(i)) {
                    *s += v;
                }
                counts[tag] += 1;
            }
        }

        let total: usize = counts.iter().sum();
        let global: Vec<f64> = if total == 0 {
            mean
        } else {
            (0..dims)
                .map(|d| (0..states).map(|s| sums.get(&[s, d])).sum::<f64>() / total as f64)
                .collect()
        };
        let mut empty = 0;
        for (s, &count) in counts.iter().enumerate() {
            let row = self.emission.means.row_mut(s);
            if count == 0 {
                row.copy_from_slice(&global);
                empty += 1;
            } else {
                for (m, v) in row.iter_mut().zip(sums.row(s)) {
                    *m = v / count as f64;
                }
            }
        }
        debug!(
            seed_tokens = batch.num_words(),
            tagged_tokens = total,
            empty_states = empty,
            "initialized emissions"
        );
        Ok(())
    }

    /// Overwrite grammar scores with a converged model's estimates.
    pub fn seed_grammar(&mut self, source: &impl ConvergedGrammar) -> Result<usize, NlpError> {
        seed_grammar(&mut self.grammar, &self.tags, source)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Snapshot of every parameter.
    pub fn export_parameters(&self) -> Checkpoint {
        Checkpoint {
            tags: self.tags.clone(),
            num_dims: self.num_dims(),
            means: self.emission.means.clone(),
            variance: self.emission.variance().to_vec(),
            grammar: CheckpointGrammar::from(&self.grammar),
            transform: self.transform.clone(),
        }
    }

    /// Replace every parameter with a snapshot of an identically shaped model.
    pub fn load_parameters(&mut self, checkpoint: Checkpoint) -> Result<(), NlpError> {
        let mismatch = |reason: String| Err(NlpError::CheckpointMismatch { reason });
        if checkpoint.tags != self.tags {
            return mismatch(format!(
                "checkpoint has states {:?}, model has {:?}",
                checkpoint.tags, self.tags
            ));
        }
        if checkpoint.num_dims != self.num_dims() {
            return mismatch(format!(
                "checkpoint has {} dimensions, model has {}",
                checkpoint.num_dims,
                self.num_dims()
            ));
        }
        let same_kind = std::mem::discriminant(&checkpoint.transform) == std::mem::discriminant(&self.transform);
        let ours: Vec<&Vec<usize>> = self.transform.params().into_iter().map(|t| &t.shape).collect();
        let theirs: Vec<&Vec<usize>> = checkpoint.transform.params().into_iter().map(|t| &t.shape).collect();
        if !same_kind || ours != theirs {
            return mismatch("transform architecture differs".to_string());
        }

        let (tags, emission, grammar, transform) = checkpoint.into_parts()?;
        self.tags = tags;
        self.emission = emission;
        self.grammar = grammar;
        self.transform = transform;
        Ok(())
    }

    /// Rebuild a model from a snapshot.
    pub fn from_checkpoint(checkpoint: Checkpoint, chart_budget_bytes: usize) -> Result<Self, NlpError> {
        let (tags, emission, grammar, transform) = checkpoint.into_parts()?;
        Ok(Self {
            tags,
            grammar,
            emission,
            transform,
            chart_budget_bytes,
        })
    }
}

impl TreeParser for DmvFlow {
    fn parse_batch(&self, batch: &Batch) -> Result<Vec<DependencyTree>, NlpError> {
        self.parse(batch)
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

/// Raw grammar scores as stored in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointGrammar {
    pub attach_left: Tensor,
    pub attach_right: Tensor,
    pub stop_left: Tensor,
    pub stop_right: Tensor,
    pub root: Tensor,
}

impl From<&GrammarParameters> for CheckpointGrammar {
    fn from(g: &GrammarParameters) -> Self {
        Self {
            attach_left: g.attach_left.clone(),
            attach_right: g.attach_right.clone(),
            stop_left: g.stop_left.clone(),
            stop_right: g.stop_right.clone(),
            root: g.root.clone(),
        }
    }
}

/// Every parameter of a [`DmvFlow`], serialized as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub tags: Vec<String>,
    pub num_dims: usize,
    pub means: Tensor,
    pub variance: Vec<f64>,
    pub grammar: CheckpointGrammar,
    pub transform: Flow,
}

impl Checkpoint {
    pub fn to_json(&self) -> Result<String, NlpError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, NlpError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the checkpoint to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), NlpError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read a checkpoint from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NlpError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    fn into_parts(self) -> Result<(Vec<String>, EmissionModel, GrammarParameters, Flow), NlpError> {
        let grammar = GrammarParameters {
            attach_left: self.grammar.attach_left,
            attach_right: self.grammar.attach_right,
            stop_left: self.grammar.stop_left,
            stop_right: self.grammar.stop_right,
            root: self.grammar.root,
        };
        grammar.validate()?;
        if grammar.num_states() != self.tags.len() {
            return Err(NlpError::CheckpointMismatch {
                reason: format!("{} tags for {} grammar states", self.tags.len(), grammar.num_states()),
            });
        }
        self.means.expect_shape(&[self.tags.len(), self.num_dims])?;
        if self.transform.dims() != self.num_dims {
            return Err(NlpError::CheckpointMismatch {
                reason: format!(
                    "transform width {} for {} dimensions",
                    self.transform.dims(),
                    self.num_dims
                ),
            });
        }
        let emission = EmissionModel::new(self.means, self.variance)?;
        Ok((self.tags, emission, grammar, self.transform))
    }
}
