//! # NLP - Unsupervised Dependency Parsing with Flow Emissions
//!
//! A Dependency Model with Valence (DMV) over latent states whose words are
//! continuous embeddings. Each state emits (optionally flow-transformed)
//! embeddings from a diagonal Gaussian; the grammar decides, outward from
//! each head and conditioned on adjacency, whether to take another
//! dependent or stop.
//!
//! ## Core Concepts
//!
//! - **Charts**: one log-space entry per span, mark, sentence, state and head
//!   position, in a flat triangular arena ([`chart`])
//! - **Marks**: how much of a head's valence is resolved in a span
//!   (`NonStop` → `RightStopped` → `BothStopped`)
//! - **Inside / outside**: sum-product likelihood and its exact gradient
//!   ([`inside`], [`outside`])
//! - **Viterbi**: max-product parsing with tagged backpointers ([`viterbi`])
//! - **Evaluation**: directed and undirected attachment accuracy ([`eval`])
//!
//! ## Example: Training on a Toy Corpus
//!
//! ```rust
//! use dmvflow_diff::Tensor;
//! use dmvflow_nlp::{evaluate, DmvFlow, Sentence, TrainConfig, Trainer};
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//!
//! let sentence = Sentence {
//!     embeddings: Tensor::from_data(vec![2, 2], vec![-1.0, 0.5, 1.0, -0.5]).unwrap(),
//!     tags: Some(vec![0, 1]),
//!     gold: Some(vec![(1, 2), (2, 0)]),
//! };
//! let corpus = vec![sentence; 4];
//!
//! let config = TrainConfig::default().with_epochs(2).with_batch_size(2);
//! let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
//! let tags = vec!["DT".to_string(), "NN".to_string()];
//! let mut model = DmvFlow::initialize(&config, tags, &corpus, &mut rng).unwrap();
//!
//! Trainer::new(config).unwrap().train(&mut model, &corpus, None).unwrap();
//! let report = evaluate(&model, &corpus, 2).unwrap();
//! assert_eq!(report.tokens, 8);
//! ```

pub mod chart;
pub mod config;
pub mod corpus;
mod error;
pub mod eval;
pub mod grammar;
pub mod inside;
pub mod model;
pub mod outside;
pub mod seed;
pub mod train;
pub mod viterbi;

pub use chart::{Chart, ChartLayout, Mark};
pub use config::{ModelKind, TrainConfig};
pub use corpus::{
    batch_indices, embed, embed_all, read_conll, read_conll_file, read_conll_file_with, read_conll_with, Batch,
    ConllOptions, ConllSentence, Sentence, TagVocab, WordVectors, NULL_TAG,
};
pub use error::NlpError;
pub use eval::{evaluate, measures, AccuracyAccumulator, EvalReport, TreeParser};
pub use grammar::{GrammarGrad, GrammarParameters, LogGrammar};
pub use inside::{InsideChart, InsideEngine};
pub use model::{Checkpoint, DmvFlow, Objective};
pub use outside::{outside, InsideGrad};
pub use seed::{seed_grammar, ConvergedGrammar, SeedParam, SeedTable};
pub use train::{StepStats, TrainReport, Trainer};
pub use viterbi::{Backpointer, ChildRef, DependencyTree, ViterbiEngine};
