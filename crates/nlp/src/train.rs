//! # Training Loop
//!
//! Maximum-likelihood training of a [`DmvFlow`] with Adam.
//!
//! Each step minimizes `−(Σ LL + log |det J|) / batch_size`, with the global
//! gradient norm clipped to `clip_grad`. Progress is reported through
//! `tracing` five times per epoch; attachment accuracy is measured every
//! `valid_nepoch` epochs when a test corpus is given.
//!
//! Training stops early once the per-word log-likelihood of an epoch
//! improves on the previous one by a relative amount smaller than
//! `min_improvement_rate`, provided at least `min_epochs` epochs have
//! passed.

use std::path::PathBuf;

use dmvflow_diff::{clip_grad_norm, Adam, Optimizer};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::config::TrainConfig;
use crate::corpus::{batch_indices, Batch, Sentence};
use crate::eval::{evaluate, EvalReport};
use crate::model::DmvFlow;
use crate::NlpError;

/// Outcome of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    /// Objective before the update
    pub log_likelihood: f64,
    /// Gradient norm before clipping
    pub grad_norm: f64,
}

/// Outcome of [`Trainer::train`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub epochs_run: usize,
    pub stopped_early: bool,
    /// Per-word log-likelihood of every epoch
    pub ll_per_word: Vec<f64>,
    /// Accuracy before training and after each evaluated epoch, keyed by
    /// epoch (`None` = before training)
    pub evaluations: Vec<(Option<usize>, EvalReport)>,
    pub checkpoint: Option<PathBuf>,
}

/// Adam-driven trainer.
#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainConfig,
    optimizer: Adam,
    rng: ChaCha8Rng,
}

impl Trainer {
    /// Trainer seeded from `config.seed`.
    pub fn new(config: TrainConfig) -> Result<Self, NlpError> {
        config.validate()?;
        Ok(Self {
            optimizer: Adam::new(config.learning_rate),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// One update on one batch.
    pub fn step(&mut self, model: &mut DmvFlow, batch: &Batch) -> Result<StepStats, NlpError> {
        let objective = model.objective(batch)?;
        let scale = -1.0 / batch.num_sentences() as f64;
        let mut grads: Vec<_> = objective.grads.iter().map(|g| g.scale(scale)).collect();
        let grad_norm = clip_grad_norm(&mut grads, self.config.clip_grad);
        self.optimizer.step(&mut model.params_mut(), &grads)?;
        Ok(StepStats {
            log_likelihood: objective.value,
            grad_norm,
        })
    }

    /// Train on `train`, optionally scoring `test` along the way.
    pub fn train(
        &mut self,
        model: &mut DmvFlow,
        train: &[Sentence],
        test: Option<&[Sentence]>,
    ) -> Result<TrainReport, NlpError> {
        if train.is_empty() {
            return Err(NlpError::EmptyBatch);
        }
        let config = self.config.clone();
        let log_every = (train.len() / config.batch_size / 5).max(1);
        let mut report = TrainReport {
            epochs_run: 0,
            stopped_early: false,
            ll_per_word: Vec::new(),
            evaluations: Vec::new(),
            checkpoint: None,
        };

        if let Some(test) = test {
            let eval = evaluate(&*model, test, config.eval_batch_size)?;
            log_accuracy(None, &eval);
            report.evaluations.push((None, eval));
        }

        let mut last = 1.0;
        let mut iteration = 0;
        for epoch in 0..config.epochs {
            let (mut ll, mut words, mut sents) = (0.0, 0usize, 0usize);
            for indices in batch_indices(train.len(), config.batch_size, Some(&mut self.rng)) {
                let batch = Batch::from_sentences(indices.iter().map(|&i| &train[i]))?;
                let stats = self.step(model, &batch)?;
                ll += stats.log_likelihood;
                words += batch.num_words();
                sents += batch.num_sentences();

                if iteration % log_every == 0 {
                    let variance = model.emission().variance();
                    info!(
                        epoch,
                        iteration,
                        ll_per_sent = ll / sents as f64,
                        ll_per_word = ll / words as f64,
                        max_var = variance.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                        min_var = variance.iter().copied().fold(f64::INFINITY, f64::min),
                        grad_norm = stats.grad_norm,
                        "training"
                    );
                }
                iteration += 1;
            }
            report.epochs_run = epoch + 1;

            if let Some(test) = test {
                if epoch % config.valid_nepoch == 0 {
                    let eval = evaluate(&*model, test, config.eval_batch_size)?;
                    log_accuracy(Some(epoch), &eval);
                    report.evaluations.push((Some(epoch), eval));
                }
            }

            let per_word = ll / words as f64;
            report.ll_per_word.push(per_word);
            let rate = (per_word - last) / f64::abs(last);
            info!(epoch, likelihood = per_word, last, rate, "epoch finished");
            if rate < config.min_improvement_rate && epoch >= config.min_epochs {
                info!(epoch, rate, "likelihood converged, stopping");
                report.stopped_early = true;
                break;
            }
            last = per_word;
        }

        if let Some(path) = &config.save_path {
            model.export_parameters().save(path)?;
            info!(path = %path.display(), "saved checkpoint");
            report.checkpoint = Some(path.clone());
        }
        Ok(report)
    }
}

fn log_accuracy(epoch: Option<usize>, eval: &EvalReport) {
    info!(
        epoch = ?epoch,
        trees = eval.sentences,
        directed = 100.0 * eval.directed,
        undirected = 100.0 * eval.undirected,
        skipped_batches = eval.skipped_batches,
        "attachment accuracy"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmvflow_diff::Tensor;
    use rand::Rng;

    fn corpus(seed: u64, n: usize) -> Vec<Sentence> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let len = rng.gen_range(1..5);
                let tags: Vec<usize> = (0..len).map(|_| rng.gen_range(0..2)).collect();
                let mut data = Vec::with_capacity(len * 2);
                for &t in &tags {
                    let centre = if t == 0 { -1.0 } else { 1.0 };
                    data.push(centre + rng.gen_range(-0.3..0.3));
                    data.push(-centre + rng.gen_range(-0.3..0.3));
                }
                let gold = (1..=len).map(|i| (i, if i == len { 0 } else { i + 1 })).collect();
                Sentence {
                    embeddings: Tensor::from_data(vec![len, 2], data).unwrap(),
                    tags: Some(tags),
                    gold: Some(gold),
                }
            })
            .collect()
    }

    fn setup(config: &TrainConfig) -> (DmvFlow, Vec<Sentence>) {
        let sentences = corpus(4, 24);
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let tags = vec!["A".to_string(), "B".to_string()];
        let model = DmvFlow::initialize(config, tags, &sentences, &mut rng).unwrap();
        (model, sentences)
    }

    #[test]
    fn test_steps_increase_likelihood() {
        let config = TrainConfig::default().with_batch_size(24).with_learning_rate(0.02);
        let (mut model, sentences) = setup(&config);
        let batch = Batch::from_sentences(&sentences).unwrap();
        let mut trainer = Trainer::new(config).unwrap();

        let before = model.log_likelihood(&batch).unwrap();
        for _ in 0..10 {
            trainer.step(&mut model, &batch).unwrap();
        }
        assert!(model.log_likelihood(&batch).unwrap() > before);
    }

    #[test]
    fn test_train_runs_and_evaluates() {
        let config = TrainConfig::default()
            .with_epochs(3)
            .with_batch_size(8)
            .with_valid_nepoch(2);
        let (mut model, sentences) = setup(&config);
        let mut trainer = Trainer::new(config).unwrap();
        let report = trainer.train(&mut model, &sentences, Some(sentences.as_slice())).unwrap();

        assert_eq!(report.epochs_run, 3);
        assert!(!report.stopped_early);
        assert_eq!(report.ll_per_word.len(), 3);
        let epochs: Vec<_> = report.evaluations.iter().map(|(e, _)| *e).collect();
        assert_eq!(epochs, vec![None, Some(0), Some(2)]);
        assert!(report.ll_per_word.iter().all(|ll| ll.is_finite()));
    }

    #[test]
    fn test_early_stopping() {
        // Any epoch after the first counts as converged
        let config = TrainConfig::default()
            .with_epochs(10)
            .with_batch_size(8)
            .with_early_stopping(f64::INFINITY, 1);
        let (mut model, sentences) = setup(&config);
        let mut trainer = Trainer::new(config).unwrap();
        let report = trainer.train(&mut model, &sentences, None).unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.epochs_run, 2);
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(Trainer::new(TrainConfig::default().with_clip_grad(0.0)).is_err());
    }
}
