//! End-to-end properties of the DMV flow parser.
//!
//! Each section exercises one guarantee of the public API: normalized
//! grammars, likelihood arithmetic, single-token sentences, tree shape,
//! evaluation, batch skipping and checkpoint persistence.

use dmvflow_diff::Tensor;
use dmvflow_nlp::grammar::{CONTINUE, STOP};
use dmvflow_nlp::{
    evaluate, AccuracyAccumulator, Backpointer, Batch, ChartLayout, Checkpoint, DependencyTree, DmvFlow, GrammarParameters,
    InsideEngine, NlpError, SeedTable, Sentence, TrainConfig, TreeParser, ViterbiEngine,
};
use dmvflow_prob::{log_add_exp, log_sum_exp};
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cell::Cell;

const BUDGET: usize = 1 << 26;

fn random_grammar(seed: u64, states: usize) -> GrammarParameters {
    GrammarParameters::random(states, &mut ChaCha8Rng::seed_from_u64(seed))
}

fn tagged_corpus(seed: u64, lengths: &[usize], dims: usize, states: usize) -> Vec<Sentence> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    lengths
        .iter()
        .map(|&len| Sentence {
            embeddings: Tensor::uniform(vec![len, dims], -1.0, 1.0, &mut rng),
            tags: Some((0..len).map(|_| rng.gen_range(0..states)).collect()),
            gold: Some((1..=len).map(|i| (i, i - 1)).collect()),
        })
        .collect()
}

fn tags(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("S{i}")).collect()
}

// ============================================================================
// Normalization
// ============================================================================

proptest! {
    #[test]
    fn normalized_grammar_is_a_distribution(seed in 0u64..500, states in 1usize..12) {
        let log = random_grammar(seed, states).normalize().unwrap();
        for h in 0..states {
            let left: f64 = (0..states).map(|a| log.attach_left(h, a).exp()).sum();
            let right: f64 = (0..states).map(|a| log.attach_right(h, a).exp()).sum();
            prop_assert!((left - 1.0).abs() < 1e-9);
            prop_assert!((right - 1.0).abs() < 1e-9);
            for adjacent in [false, true] {
                let sl = log.stop_left(STOP, h, adjacent).exp() + log.stop_left(CONTINUE, h, adjacent).exp();
                let sr = log.stop_right(STOP, h, adjacent).exp() + log.stop_right(CONTINUE, h, adjacent).exp();
                prop_assert!((sl - 1.0).abs() < 1e-9);
                prop_assert!((sr - 1.0).abs() < 1e-9);
            }
        }
        let root: f64 = (0..states).map(|s| log.root(s).exp()).sum();
        prop_assert!((root - 1.0).abs() < 1e-9);
    }
}

// ============================================================================
// Likelihood arithmetic
// ============================================================================

#[test]
fn log_sum_exp_agrees_with_direct_sums() {
    let derivations = [-3.2, -7.9, -0.4, -12.5];
    let direct: f64 = derivations.iter().map(|d: &f64| d.exp()).sum();
    assert!((log_sum_exp(&derivations) - direct.ln()).abs() < 1e-12);

    let pairwise = derivations.iter().copied().fold(f64::NEG_INFINITY, log_add_exp);
    assert!((pairwise - direct.ln()).abs() < 1e-12);
}

#[test]
fn two_word_likelihood_sums_both_trees() {
    // One state: the two trees of a two-word sentence are the only derivations
    let log = random_grammar(3, 1).normalize().unwrap();
    let emissions = Tensor::from_data(vec![1, 2, 1], vec![-1.5, -0.5]).unwrap();
    let ll = InsideEngine::new(BUDGET).run(&log, &emissions, &[2]).unwrap().log_likelihood();

    let done = |adj_left: bool, adj_right: bool| {
        log.stop_left(STOP, 0, adj_left) + log.stop_right(STOP, 0, adj_right)
    };
    // Word 0 heads word 1
    let right_tree = -1.5 - 0.5 + done(true, true)
        + log.attach_right(0, 0)
        + log.stop_right(CONTINUE, 0, true)
        + log.stop_right(STOP, 0, false)
        + log.stop_left(STOP, 0, true)
        + log.root(0);
    // Word 1 heads word 0
    let left_tree = -1.5 - 0.5 + done(true, true)
        + log.attach_left(0, 0)
        + log.stop_right(STOP, 0, true)
        + log.stop_left(CONTINUE, 0, true)
        + log.stop_left(STOP, 0, false)
        + log.root(0);

    let direct = (right_tree.exp() + left_tree.exp()).ln();
    assert!((ll - direct).abs() < 1e-10);
    assert!((ll - log_add_exp(right_tree, left_tree)).abs() < 1e-10);
}

// ============================================================================
// Single-token sentences
// ============================================================================

#[test]
fn single_token_likelihood_with_certain_stops() {
    let mut params = random_grammar(8, 3);
    for stop in [&mut params.stop_left, &mut params.stop_right] {
        for s in 0..3 {
            for adj in 0..2 {
                *stop.get_mut(&[STOP, s, adj]) = 0.0;
                *stop.get_mut(&[CONTINUE, s, adj]) = -1e6;
            }
        }
    }
    let log = params.normalize().unwrap();
    let emissions = Tensor::from_data(vec![1, 1, 3], vec![-2.0, -0.3, -4.0]).unwrap();
    let ll = InsideEngine::new(BUDGET).run(&log, &emissions, &[1]).unwrap().log_likelihood();

    let expected = log_sum_exp(&[-2.0 + log.root(0), -0.3 + log.root(1), -4.0 + log.root(2)]);
    assert!((ll - expected).abs() < 1e-9);
}

// ============================================================================
// Tree shape
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn viterbi_tree_has_one_edge_per_word(seed in 0u64..10_000, len in 1usize..10, states in 1usize..5) {
        let log = random_grammar(seed, states).normalize().unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x5eed);
        let emissions = Tensor::uniform(vec![1, len, states], -4.0, 0.0, &mut rng);
        let trees = ViterbiEngine::new(BUDGET).run(&log, &emissions, &[len]).unwrap();

        prop_assert_eq!(trees[0].len(), len);
        let roots = trees[0].heads().iter().filter(|h| h.is_none()).count();
        prop_assert_eq!(roots, 1);
        for (dep, head) in trees[0].edges() {
            if let Some(head) = head {
                prop_assert!(*head < len && head != dep);
            }
        }
    }
}

#[test]
fn grammar_seeded_with_certain_stops_still_parses() {
    let config = TrainConfig::default();
    let corpus = tagged_corpus(17, &[4, 3], 3, 2);
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    let mut model = DmvFlow::initialize(&config, tags(2), &corpus, &mut rng).unwrap();

    let table = SeedTable::from_json(
        r#"{
            "stop_left":  { "S0": [0.0, 0.0], "S1": [0.0, 0.0] },
            "stop_right": { "S0": [0.0, 0.0], "S1": [0.0, 0.0] }
        }"#,
    )
    .unwrap();
    assert_eq!(model.seed_grammar(&table).unwrap(), 16);

    let report = evaluate(&model, &corpus[..1], 1).unwrap();
    assert_eq!(report.skipped_batches, 0);
    assert_eq!(report.tokens, 4);
}

// ============================================================================
// Evaluation
// ============================================================================

#[test]
fn evaluator_scores_the_two_word_example() {
    let gold = [(1, 2), (2, 0)];
    let predicted = DependencyTree::from_heads(&[Some(1), None]);
    let mut acc = AccuracyAccumulator::default();
    acc.add(&gold, &predicted).unwrap();
    assert_eq!(acc.directed_accuracy(), 1.0);
    assert_eq!(acc.undirected_accuracy(), 1.0);
}

/// Delegates to a model but reports exhaustion on one chosen call.
struct FlakyParser<'a> {
    model: &'a DmvFlow,
    fail_on: usize,
    calls: Cell<usize>,
}

impl TreeParser for FlakyParser<'_> {
    fn parse_batch(&self, batch: &Batch) -> Result<Vec<DependencyTree>, NlpError> {
        let call = self.calls.replace(self.calls.get() + 1);
        if call == self.fail_on {
            return Err(NlpError::ResourceExhausted {
                requested: usize::MAX,
                budget: 0,
            });
        }
        self.model.parse_batch(batch)
    }
}

#[test]
fn exhausted_batch_is_skipped_without_touching_other_batches() {
    let config = TrainConfig::default();
    let corpus = tagged_corpus(21, &[3, 4, 2, 5, 3, 2], 3, 2);
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let model = DmvFlow::initialize(&config, tags(2), &corpus, &mut rng).unwrap();

    let flaky = FlakyParser {
        model: &model,
        fail_on: 1,
        calls: Cell::new(0),
    };
    let report = evaluate(&flaky, &corpus, 2).unwrap();
    assert_eq!(report.skipped_batches, 1);

    let kept: Vec<Sentence> = [&corpus[..2], &corpus[4..]].concat();
    let reference = evaluate(&model, &kept, 2).unwrap();
    assert_eq!(reference.skipped_batches, 0);
    assert_eq!(report.tokens, reference.tokens);
    assert_eq!(report.directed, reference.directed);
    assert_eq!(report.undirected, reference.undirected);
}

#[test]
fn oversized_batch_is_skipped_by_chart_budget() {
    let config = TrainConfig::default();
    let corpus = tagged_corpus(5, &[2, 3, 9], 3, 2);
    let mut rng = ChaCha8Rng::seed_from_u64(2);
    let mut model = DmvFlow::initialize(&config, tags(2), &corpus, &mut rng).unwrap();

    // Budget fits one 3-word sentence but not a 9-word one
    let layout = ChartLayout::new(3, 1, 2);
    let needed = layout.bytes_for::<f64>().unwrap()
        + layout.bytes_for::<Option<Backpointer>>().unwrap();
    model.set_chart_budget_bytes(needed);

    let report = evaluate(&model, &corpus, 1).unwrap();
    assert_eq!(report.skipped_batches, 1);
    assert_eq!(report.tokens, 5);
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn checkpoint_file_roundtrip_is_bit_exact() {
    for config in [TrainConfig::default(), TrainConfig::default().with_nice(4, 1, 6)] {
        let corpus = tagged_corpus(13, &[4, 3, 5], 4, 3);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let model = DmvFlow::initialize(&config, tags(3), &corpus, &mut rng).unwrap();
        let batch = Batch::from_sentences(&corpus).unwrap();
        let original = model.log_likelihood(&batch).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        model.export_parameters().save(&path).unwrap();

        // A fresh model of the same shape, with different random parameters
        let mut other_rng = ChaCha8Rng::seed_from_u64(99);
        let mut fresh = DmvFlow::new(&config, tags(3), 4, &mut other_rng).unwrap();
        assert_ne!(fresh.log_likelihood(&batch).unwrap(), original);

        fresh.load_parameters(Checkpoint::load(&path).unwrap()).unwrap();
        assert_eq!(fresh.log_likelihood(&batch).unwrap().to_bits(), original.to_bits());
        assert_eq!(fresh.parse(&batch).unwrap(), model.parse(&batch).unwrap());
    }
}
