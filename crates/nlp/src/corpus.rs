//! # Corpus
//!
//! Reading treebanks and word vectors, and turning sentences into padded
//! batches for the chart engines.
//!
//! Treebanks use a tab-separated CoNLL-style layout, one token per line and a
//! blank line between sentences:
//!
//! ```text
//! 1	The	DT	2
//! 2	dog	NN	3
//! 3	barks	VBZ	0
//! ```
//!
//! Columns are index, word, tag and head (`0` = root). Numeric words are
//! normalized to `"0"` so that every number shares one vector. Empty
//! elements tagged `-NONE-` can be dropped on request, see [`ConllOptions`].
//!
//! Word vectors are read from a whitespace-separated text file with one word
//! followed by its components per line.
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_nlp::corpus::read_conll;
//!
//! let text = "1\tThe\tDT\t2\n2\tdog\tNN\t0\n\n";
//! let sentences = read_conll(text.as_bytes(), 10).unwrap();
//! assert_eq!(sentences[0].words, vec!["The", "dog"]);
//! assert_eq!(sentences[0].heads, vec![(1, 2), (2, 0)]);
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use dmvflow_diff::Tensor;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::NlpError;

// ============================================================================
// Treebank
// ============================================================================

/// One sentence of a treebank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConllSentence {
    pub words: Vec<String>,
    pub tags: Vec<String>,
    /// `(index, head)` pairs, 1-indexed, head `0` is the root
    pub heads: Vec<(usize, usize)>,
}

impl ConllSentence {
    fn new() -> Self {
        Self {
            words: Vec::new(),
            tags: Vec::new(),
            heads: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

fn is_number(word: &str) -> bool {
    word.parse::<f64>().is_ok()
}

fn parse_field(value: &str, line: usize, column: &str) -> Result<usize, NlpError> {
    value.parse().map_err(|_| NlpError::Format {
        line,
        message: format!("{column} '{value}' is not a non-negative integer"),
    })
}

/// Tag of the empty elements some treebanks keep as tokens.
pub const NULL_TAG: &str = "-NONE-";

/// How [`read_conll_with`] filters sentences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConllOptions {
    /// Longest sentence kept, counted after null removal
    pub max_len: usize,
    /// Drop tokens tagged [`NULL_TAG`]
    pub remove_null: bool,
}

impl ConllOptions {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            remove_null: false,
        }
    }

    pub fn with_remove_null(mut self, remove_null: bool) -> Self {
        self.remove_null = remove_null;
        self
    }
}

/// Remove [`NULL_TAG`] tokens and renumber the rest.
///
/// A word headed by a removed token is reattached to the nearest kept
/// ancestor, or to the root.
fn remove_null_tokens(sentence: ConllSentence, line: usize) -> Result<ConllSentence, NlpError> {
    let malformed = |message: String| NlpError::Format { line, message };
    let heads: HashMap<usize, usize> = sentence.heads.iter().copied().collect();
    let mut renumbered = HashMap::new();
    for (&(position, _), tag) in sentence.heads.iter().zip(&sentence.tags) {
        if tag != NULL_TAG {
            renumbered.insert(position, renumbered.len() + 1);
        }
    }

    let mut kept = ConllSentence::new();
    for ((word, tag), &(position, mut head)) in sentence.words.into_iter().zip(sentence.tags).zip(&sentence.heads) {
        if tag == NULL_TAG {
            continue;
        }
        let mut steps = 0;
        while head != 0 && !renumbered.contains_key(&head) {
            head = *heads
                .get(&head)
                .ok_or_else(|| malformed(format!("head {head} of token {position} is not in the sentence")))?;
            steps += 1;
            if steps > heads.len() {
                return Err(malformed(format!("cycle through empty elements above token {position}")));
            }
        }
        let head = if head == 0 { 0 } else { renumbered[&head] };
        kept.words.push(word);
        kept.tags.push(tag);
        kept.heads.push((renumbered[&position], head));
    }
    Ok(kept)
}

/// Read sentences of at most `max_len` tokens.
pub fn read_conll(reader: impl BufRead, max_len: usize) -> Result<Vec<ConllSentence>, NlpError> {
    read_conll_with(reader, ConllOptions::new(max_len))
}

/// Read sentences, filtered as `options` asks.
pub fn read_conll_with(reader: impl BufRead, options: ConllOptions) -> Result<Vec<ConllSentence>, NlpError> {
    let mut sentences = Vec::new();
    let mut current = ConllSentence::new();

    let finish = |sentence: ConllSentence, line: usize, sentences: &mut Vec<ConllSentence>| {
        let sentence = if options.remove_null {
            remove_null_tokens(sentence, line)?
        } else {
            sentence
        };
        if !sentence.is_empty() && sentence.len() <= options.max_len {
            sentences.push(sentence);
        }
        Ok::<_, NlpError>(())
    };

    let mut number = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        number = index + 1;
        if line.trim().is_empty() {
            finish(std::mem::replace(&mut current, ConllSentence::new()), number, &mut sentences)?;
            continue;
        }

        let fields: Vec<&str> = line.trim().split('\t').collect();
        if fields.len() < 4 {
            return Err(NlpError::Format {
                line: number,
                message: format!("expected 4 tab-separated columns, found {}", fields.len()),
            });
        }
        let position = parse_field(fields[0], number, "index")?;
        let head = parse_field(fields[3], number, "head")?;
        if position == 0 {
            return Err(NlpError::Format {
                line: number,
                message: "token indices start at 1".to_string(),
            });
        }

        let word = if is_number(fields[1]) { "0" } else { fields[1] };
        current.words.push(word.to_string());
        current.tags.push(fields[2].to_string());
        current.heads.push((position, head));
    }
    finish(current, number, &mut sentences)?;
    Ok(sentences)
}

/// Read a treebank file.
pub fn read_conll_file(path: impl AsRef<Path>, max_len: usize) -> Result<Vec<ConllSentence>, NlpError> {
    read_conll_file_with(path, ConllOptions::new(max_len))
}

/// Read a treebank file, filtered as `options` asks.
pub fn read_conll_file_with(path: impl AsRef<Path>, options: ConllOptions) -> Result<Vec<ConllSentence>, NlpError> {
    read_conll_with(BufReader::new(File::open(path)?), options)
}

// ============================================================================
// Word vectors and tags
// ============================================================================

/// Fixed-width embedding for every known word.
#[derive(Debug, Clone, Default)]
pub struct WordVectors {
    dims: usize,
    vectors: HashMap<String, Vec<f64>>,
}

impl WordVectors {
    /// Empty table of `dims`-wide vectors.
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            vectors: HashMap::new(),
        }
    }

    /// Add or replace a vector.
    pub fn insert(&mut self, word: impl Into<String>, vector: Vec<f64>) -> Result<(), NlpError> {
        if vector.len() != self.dims {
            return Err(dmvflow_diff::DiffError::ShapeMismatch {
                expected: vec![self.dims],
                got: vec![vector.len()],
            }
            .into());
        }
        self.vectors.insert(word.into(), vector);
        Ok(())
    }

    /// Parse `word v1 v2 ...` lines. The first line fixes the width.
    pub fn read(reader: impl BufRead) -> Result<Self, NlpError> {
        let mut table: Option<Self> = None;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let Some(word) = parts.next() else {
                continue;
            };
            let vector = parts
                .map(|v| {
                    v.parse::<f64>().map_err(|_| NlpError::Format {
                        line: index + 1,
                        message: format!("'{v}' is not a number"),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let table = table.get_or_insert_with(|| Self::new(vector.len()));
            table.insert(word, vector).map_err(|_| NlpError::Format {
                line: index + 1,
                message: format!("vector for '{word}' does not have {} components", table.dims),
            })?;
        }
        table.ok_or_else(|| NlpError::Format {
            line: 0,
            message: "no word vectors".to_string(),
        })
    }

    /// Load vectors from a text file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NlpError> {
        Self::read(BufReader::new(File::open(path)?))
    }

    /// Vector width.
    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Look up a word.
    pub fn get(&self, word: &str) -> Result<&[f64], NlpError> {
        self.vectors
            .get(word)
            .map(Vec::as_slice)
            .ok_or_else(|| NlpError::UnknownWord {
                word: word.to_string(),
            })
    }
}

/// Tag inventory; ids follow first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagVocab {
    tags: Vec<String>,
    ids: HashMap<String, usize>,
}

impl TagVocab {
    /// Collect every tag of a treebank.
    pub fn from_sentences(sentences: &[ConllSentence]) -> Self {
        let mut vocab = Self::default();
        for tag in sentences.iter().flat_map(|s| &s.tags) {
            vocab.add(tag);
        }
        vocab
    }

    /// Vocabulary from an ordered tag list, such as a checkpoint's.
    pub fn from_tags(tags: &[String]) -> Self {
        let mut vocab = Self::default();
        for tag in tags {
            vocab.add(tag);
        }
        vocab
    }

    /// Id of `tag`, adding it if new.
    pub fn add(&mut self, tag: &str) -> usize {
        if let Some(&id) = self.ids.get(tag) {
            return id;
        }
        let id = self.tags.len();
        self.tags.push(tag.to_string());
        self.ids.insert(tag.to_string(), id);
        id
    }

    /// Id of a known tag.
    pub fn id(&self, tag: &str) -> Result<usize, NlpError> {
        self.ids.get(tag).copied().ok_or_else(|| NlpError::UnknownTag {
            tag: tag.to_string(),
        })
    }

    /// Tag labels in id order.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

// ============================================================================
// Model input
// ============================================================================

/// A sentence as the model sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    /// Raw embeddings, `[len, dims]`
    pub embeddings: Tensor,
    /// Gold tag ids
    pub tags: Option<Vec<usize>>,
    /// Gold `(index, head)` pairs, 1-indexed
    pub gold: Option<Vec<(usize, usize)>>,
}

impl Sentence {
    /// Sentence without annotations.
    pub fn new(embeddings: Tensor) -> Self {
        Self {
            embeddings,
            tags: None,
            gold: None,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Look up every word of a treebank sentence.
///
/// Tags are attached when `vocab` is given; heads are always kept.
pub fn embed(
    sentence: &ConllSentence,
    vectors: &WordVectors,
    vocab: Option<&TagVocab>,
) -> Result<Sentence, NlpError> {
    let mut data = Vec::with_capacity(sentence.len() * vectors.dims());
    for word in &sentence.words {
        data.extend_from_slice(vectors.get(word)?);
    }
    let embeddings = Tensor::from_data(vec![sentence.len(), vectors.dims()], data)?;
    let tags = vocab
        .map(|v| sentence.tags.iter().map(|t| v.id(t)).collect::<Result<Vec<_>, _>>())
        .transpose()?;
    Ok(Sentence {
        embeddings,
        tags,
        gold: Some(sentence.heads.clone()),
    })
}

/// Embed a whole treebank.
pub fn embed_all(
    sentences: &[ConllSentence],
    vectors: &WordVectors,
    vocab: Option<&TagVocab>,
) -> Result<Vec<Sentence>, NlpError> {
    sentences.iter().map(|s| embed(s, vectors, vocab)).collect()
}

// ============================================================================
// Batches
// ============================================================================

/// Sentences packed for one engine call.
///
/// Tokens are stored packed, `[total words, dims]`, in sentence order; the
/// engines work on the zero-padded `[batch, max_len, dims]` layout produced
/// by [`Batch::pad`].
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub tokens: Tensor,
    pub lengths: Vec<usize>,
    pub max_len: usize,
}

impl Batch {
    /// Pack sentences that share one embedding width.
    pub fn from_sentences<'a>(sentences: impl IntoIterator<Item = &'a Sentence>) -> Result<Self, NlpError> {
        let mut data = Vec::new();
        let mut lengths = Vec::new();
        let mut dims = None;
        for sentence in sentences {
            if sentence.is_empty() {
                return Err(NlpError::EmptySentence);
            }
            let width = sentence.embeddings.row_len();
            if *dims.get_or_insert(width) != width {
                return Err(dmvflow_diff::DiffError::ShapeMismatch {
                    expected: vec![sentence.len(), dims.unwrap_or(width)],
                    got: sentence.embeddings.shape.clone(),
                }
                .into());
            }
            data.extend_from_slice(&sentence.embeddings.data);
            lengths.push(sentence.len());
        }
        let dims = dims.ok_or(NlpError::EmptyBatch)?;
        let total = lengths.iter().sum();
        Ok(Self {
            tokens: Tensor::from_data(vec![total, dims], data)?,
            max_len: lengths.iter().copied().max().unwrap_or(0),
            lengths,
        })
    }

    pub fn num_sentences(&self) -> usize {
        self.lengths.len()
    }

    pub fn num_words(&self) -> usize {
        self.lengths.iter().sum()
    }

    /// Spread packed rows `[total words, width]` into `[batch, max_len, width]`.
    pub fn pad(&self, packed: &Tensor) -> Result<Tensor, NlpError> {
        let width = packed.row_len();
        packed.expect_shape(&[self.num_words(), width])?;
        let mut padded = Tensor::zeros(vec![self.num_sentences(), self.max_len, width]);
        let mut row = 0;
        for (b, &len) in self.lengths.iter().enumerate() {
            let at = b * self.max_len * width;
            let from = row * width;
            padded.data[at..at + len * width].copy_from_slice(&packed.data[from..from + len * width]);
            row += len;
        }
        Ok(padded)
    }

    /// Inverse of [`pad`](Self::pad); padding positions are dropped.
    pub fn unpad(&self, padded: &Tensor) -> Result<Tensor, NlpError> {
        if padded.rank() != 3 {
            return Err(dmvflow_diff::DiffError::ShapeMismatch {
                expected: vec![self.num_sentences(), self.max_len, 0],
                got: padded.shape.clone(),
            }
            .into());
        }
        let width = padded.shape[2];
        padded.expect_shape(&[self.num_sentences(), self.max_len, width])?;
        let mut data = Vec::with_capacity(self.num_words() * width);
        for (b, &len) in self.lengths.iter().enumerate() {
            let at = b * self.max_len * width;
            data.extend_from_slice(&padded.data[at..at + len * width]);
        }
        Ok(Tensor::from_data(vec![self.num_words(), width], data)?)
    }
}

/// Split `0..n` into batches of at most `size`, shuffled when `rng` is given.
pub fn batch_indices<R: Rng>(n: usize, size: usize, rng: Option<&mut R>) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    if let Some(rng) = rng {
        order.shuffle(rng);
    }
    order.chunks(size.max(1)).map(<[usize]>::to_vec).collect()
}

/// A random sample of `size` sentences used to initialize the emission model.
pub fn seed_sample<'a, R: Rng>(sentences: &'a [Sentence], size: usize, rng: &mut R) -> Vec<&'a Sentence> {
    sentences.choose_multiple(rng, size.min(sentences.len())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const TREEBANK: &str = "\
1\tThe\tDT\t2
2\tdog\tNN\t3
3\tbarks\tVBZ\t0

1\tIt\tPRP\t2
2\tcost\tVBD\t0
3\t3.5\tCD\t2
4\tdollars\tNNS\t2
5\ttoday\tNN\t2
";

    fn sentence(rows: &[[f64; 2]]) -> Sentence {
        let data = rows.iter().flatten().copied().collect();
        Sentence::new(Tensor::from_data(vec![rows.len(), 2], data).unwrap())
    }

    #[test]
    fn test_read_conll() {
        let sentences = read_conll(TREEBANK.as_bytes(), 10).unwrap();
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].tags, vec!["DT", "NN", "VBZ"]);
        assert_eq!(sentences[0].heads, vec![(1, 2), (2, 3), (3, 0)]);
        // Numbers share one word form, and a missing trailing blank line is fine
        assert_eq!(sentences[1].words[2], "0");
        assert_eq!(sentences[1].len(), 5);
    }

    const WITH_NULLS: &str = "\
1\tWho\tWP\t3
2\t*T*-1\t-NONE-\t4
3\tsaid\tVBD\t0
4\t*?*\t-NONE-\t3
5\tit\tPRP\t2
";

    #[test]
    fn test_null_tokens_kept_by_default() {
        let sentences = read_conll(WITH_NULLS.as_bytes(), 10).unwrap();
        assert_eq!(sentences[0].len(), 5);
        assert_eq!(sentences[0].tags[1], NULL_TAG);
    }

    #[test]
    fn test_null_tokens_removed_and_heads_renumbered() {
        let options = ConllOptions::new(10).with_remove_null(true);
        let sentences = read_conll_with(WITH_NULLS.as_bytes(), options).unwrap();
        assert_eq!(sentences[0].words, vec!["Who", "said", "it"]);
        // "it" hung below two empty elements and climbs to "said"
        assert_eq!(sentences[0].heads, vec![(1, 2), (2, 0), (3, 2)]);
    }

    #[test]
    fn test_length_filter_counts_after_null_removal() {
        let options = ConllOptions::new(3);
        assert!(read_conll_with(WITH_NULLS.as_bytes(), options).unwrap().is_empty());
        let kept = read_conll_with(WITH_NULLS.as_bytes(), options.with_remove_null(true)).unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_null_removal_rejects_dangling_head() {
        let text = "1\ta\tDT\t0\n2\t*\t-NONE-\t7\n3\tb\tNN\t2\n\n";
        let err = read_conll_with(text.as_bytes(), ConllOptions::new(10).with_remove_null(true)).unwrap_err();
        assert!(matches!(err, NlpError::Format { line: 4, .. }));
    }

    #[test]
    fn test_read_conll_length_filter() {
        let sentences = read_conll(TREEBANK.as_bytes(), 3).unwrap();
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].words[1], "dog");
    }

    #[test]
    fn test_read_conll_rejects_bad_lines() {
        let err = read_conll("1\tdog\tNN\n".as_bytes(), 10).unwrap_err();
        assert!(matches!(err, NlpError::Format { line: 1, .. }));
        let err = read_conll("1\tdog\tNN\t0\n2\tbark\tVB\tx\n".as_bytes(), 10).unwrap_err();
        assert!(matches!(err, NlpError::Format { line: 2, .. }));
    }

    #[test]
    fn test_word_vectors() {
        let vectors = WordVectors::read("dog 1.0 2.0\nbarks -1 0.5\n".as_bytes()).unwrap();
        assert_eq!(vectors.dims(), 2);
        assert_eq!(vectors.get("barks").unwrap(), &[-1.0, 0.5]);
        assert!(matches!(vectors.get("cat"), Err(NlpError::UnknownWord { .. })));

        let err = WordVectors::read("dog 1.0 2.0\ncat 1.0\n".as_bytes()).unwrap_err();
        assert!(matches!(err, NlpError::Format { line: 2, .. }));
    }

    #[test]
    fn test_tag_vocab_first_seen_order() {
        let sentences = read_conll(TREEBANK.as_bytes(), 10).unwrap();
        let vocab = TagVocab::from_sentences(&sentences);
        assert_eq!(vocab.tags()[..3], ["DT", "NN", "VBZ"]);
        assert_eq!(vocab.id("NN").unwrap(), 1);
        assert_eq!(vocab.len(), 7);
        assert!(vocab.id("JJ").is_err());
    }

    #[test]
    fn test_embed() {
        let sentences = read_conll(TREEBANK.as_bytes(), 3).unwrap();
        let mut vectors = WordVectors::new(2);
        vectors.insert("The", vec![0.0, 1.0]).unwrap();
        vectors.insert("dog", vec![2.0, 3.0]).unwrap();
        let vocab = TagVocab::from_sentences(&sentences);

        let err = embed(&sentences[0], &vectors, Some(&vocab)).unwrap_err();
        assert!(matches!(err, NlpError::UnknownWord { ref word } if word == "barks"));

        vectors.insert("barks", vec![4.0, 5.0]).unwrap();
        let sentence = embed(&sentences[0], &vectors, Some(&vocab)).unwrap();
        assert_eq!(sentence.embeddings.row(1), &[2.0, 3.0]);
        assert_eq!(sentence.tags, Some(vec![0, 1, 2]));
        assert_eq!(sentence.gold.as_ref().unwrap()[2], (3, 0));
    }

    #[test]
    fn test_pad_and_unpad() {
        let sentences = [sentence(&[[1.0, 2.0]]), sentence(&[[3.0, 4.0], [5.0, 6.0], [7.0, 8.0]])];
        let batch = Batch::from_sentences(&sentences).unwrap();
        assert_eq!(batch.lengths, vec![1, 3]);
        assert_eq!(batch.max_len, 3);

        let padded = batch.pad(&batch.tokens).unwrap();
        assert_eq!(padded.shape, vec![2, 3, 2]);
        assert_eq!(padded.get(&[0, 0, 1]), 2.0);
        assert_eq!(padded.get(&[0, 2, 0]), 0.0);
        assert_eq!(padded.get(&[1, 2, 1]), 8.0);

        assert_eq!(batch.unpad(&padded).unwrap(), batch.tokens);
    }

    #[test]
    fn test_batch_rejects_mixed_widths_and_empty() {
        let wide = Sentence::new(Tensor::zeros(vec![1, 3]));
        let result = Batch::from_sentences([&sentence(&[[0.0, 0.0]]), &wide]);
        assert!(matches!(result, Err(NlpError::Diff(_))));
        assert!(matches!(Batch::from_sentences(&[] as &[Sentence]), Err(NlpError::EmptyBatch)));
    }

    #[test]
    fn test_batch_indices() {
        let plain = batch_indices::<ChaCha8Rng>(7, 3, None);
        assert_eq!(plain, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let shuffled = batch_indices(7, 3, Some(&mut rng));
        let mut all: Vec<usize> = shuffled.concat();
        all.sort_unstable();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_seed_sample_is_capped() {
        let sentences = vec![sentence(&[[0.0, 0.0]]); 4];
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        assert_eq!(seed_sample(&sentences, 10, &mut rng).len(), 4);
        assert_eq!(seed_sample(&sentences, 2, &mut rng).len(), 2);
    }
}
