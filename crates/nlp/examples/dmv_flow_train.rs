//! Training a DMV flow parser
//!
//! Run with:
//!
//! ```text
//! cargo run -p dmvflow-nlp --example dmv_flow_train
//! cargo run -p dmvflow-nlp --example dmv_flow_train -- \
//!     --train train.conll --test test.conll --vectors vectors.txt \
//!     [--config config.json] [--seed-grammar dmv.json] \
//!     [--train-from model.json] [--eval-all] [--remove-null]
//! ```
//!
//! Without a treebank a synthetic three-tag one is generated. Set
//! `RUST_LOG=dmvflow_nlp=debug` for batch-level logging.

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use dmvflow_diff::Tensor;
use dmvflow_nlp::{
    embed_all, evaluate, read_conll_file_with, Checkpoint, ConllOptions, DmvFlow, SeedTable, Sentence,
    TagVocab, TrainConfig, Trainer, WordVectors,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;

const TAGS: [&str; 3] = ["DET", "NOUN", "VERB"];

/// `DET NOUN VERB` or `DET NOUN VERB DET NOUN`, headed by the verb.
fn synthetic_corpus(n: usize, rng: &mut impl Rng) -> Vec<Sentence> {
    let centres = [[-1.5, 0.5], [0.0, -1.0], [1.5, 0.8]];
    (0..n)
        .map(|_| {
            let (tags, heads): (Vec<usize>, Vec<usize>) = if rng.gen_bool(0.5) {
                (vec![0, 1, 2], vec![2, 3, 0])
            } else {
                (vec![0, 1, 2, 0, 1], vec![2, 3, 0, 5, 3])
            };
            let mut data = Vec::with_capacity(tags.len() * 2);
            for &t in &tags {
                data.push(centres[t][0] + rng.gen_range(-0.4..0.4));
                data.push(centres[t][1] + rng.gen_range(-0.4..0.4));
            }
            Sentence {
                embeddings: Tensor {
                    shape: vec![tags.len(), 2],
                    data,
                },
                gold: Some(heads.iter().enumerate().map(|(i, &h)| (i + 1, h)).collect()),
                tags: Some(tags),
            }
        })
        .collect()
}

/// Train a DMV flow parser and report attachment accuracy.
#[derive(Parser, Debug)]
#[command(name = "dmv_flow_train", about, long_about = None)]
struct Args {
    /// Training treebank (CoNLL)
    #[arg(long, requires_all = ["test", "vectors"])]
    train: Option<PathBuf>,

    /// Test treebank (CoNLL)
    #[arg(long, requires_all = ["train", "vectors"])]
    test: Option<PathBuf>,

    /// Word vectors, one word and its components per line
    #[arg(long, requires_all = ["train", "test"])]
    vectors: Option<PathBuf>,

    /// Training configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Converged DMV log-probabilities to start the grammar from
    #[arg(long)]
    seed_grammar: Option<PathBuf>,

    /// Checkpoint to load before training
    #[arg(long)]
    train_from: Option<PathBuf>,

    /// After training, evaluate on the whole test set with no length cap
    #[arg(long)]
    eval_all: bool,

    /// Drop `-NONE-` empty elements from the treebanks
    #[arg(long)]
    remove_null: bool,
}

/// Test sentences of every length, for `--eval-all`.
fn full_test_set(args: &Args, vectors: Option<&WordVectors>, synthetic: &[Sentence]) -> Result<Vec<Sentence>, Box<dyn Error>> {
    match (&args.test, vectors) {
        (Some(path), Some(vectors)) => {
            let options = ConllOptions::new(usize::MAX).with_remove_null(args.remove_null);
            Ok(embed_all(&read_conll_file_with(path, options)?, vectors, None)?)
        }
        _ => Ok(synthetic.to_vec()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("dmvflow_nlp=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => TrainConfig::load(path)?,
        None => TrainConfig::default().with_epochs(6).with_batch_size(16),
    };
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let options = ConllOptions::new(config.max_len).with_remove_null(args.remove_null);

    let (tags, train, test, vectors) = match (&args.train, &args.test, &args.vectors) {
        (Some(train), Some(test), Some(vectors)) => {
            let vectors = WordVectors::load(vectors)?;
            let train = read_conll_file_with(train, options)?;
            let test = read_conll_file_with(test, options)?;
            let vocab = TagVocab::from_sentences(&train);
            info!(
                train = train.len(),
                test = test.len(),
                tags = vocab.len(),
                dims = vectors.dims(),
                "loaded treebank"
            );
            (
                vocab.tags().to_vec(),
                embed_all(&train, &vectors, Some(&vocab))?,
                embed_all(&test, &vectors, None)?,
                Some(vectors),
            )
        }
        _ => {
            info!("no treebank given, generating a synthetic one");
            (
                TAGS.iter().map(|t| t.to_string()).collect(),
                synthetic_corpus(160, &mut rng),
                synthetic_corpus(40, &mut rng),
                None,
            )
        }
    };

    let mut model = DmvFlow::initialize(&config, tags, &train, &mut rng)?;
    if let Some(path) = &args.seed_grammar {
        let written = model.seed_grammar(&SeedTable::load(path)?)?;
        info!(written, "seeded grammar");
    }
    if let Some(path) = &args.train_from {
        model.load_parameters(Checkpoint::load(path)?)?;
        let start = evaluate(&model, &test, config.eval_batch_size)?;
        info!(path = %path.display(), directed = start.directed, undirected = start.undirected, "loaded checkpoint");
        println!(
            "starting accuracy: directed {:.1}%, undirected {:.1}%",
            100.0 * start.directed,
            100.0 * start.undirected
        );
    }

    let report = Trainer::new(config.clone())?.train(&mut model, &train, Some(test.as_slice()))?;
    let last = evaluate(&model, &test, config.eval_batch_size)?;

    println!("\n=== DMV flow ===\n");
    println!("  epochs run:          {}", report.epochs_run);
    println!("  stopped early:       {}", report.stopped_early);
    if let Some(ll) = report.ll_per_word.last() {
        println!("  final LL per word:   {:.4}", ll);
    }
    println!("  directed accuracy:   {:.1}%", 100.0 * last.directed);
    println!("  undirected accuracy: {:.1}%", 100.0 * last.undirected);

    if args.eval_all {
        let all = full_test_set(&args, vectors.as_ref(), &test)?;
        let full = evaluate(&model, &all, 10)?;
        println!("\n=== all test sentences ({}) ===\n", all.len());
        println!("  directed accuracy:   {:.1}%", 100.0 * full.directed);
        println!("  undirected accuracy: {:.1}%", 100.0 * full.undirected);
        println!("  skipped batches:     {}", full.skipped_batches);
    }
    Ok(())
}
