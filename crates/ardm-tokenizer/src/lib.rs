//! BPE tokenizer wrapper for dialogue training
//!
//! This crate wraps `aprender::text::tokenize::BpeTokenizer` behind the
//! small surface the training pipeline needs:
//! - encoding/decoding with a fixed maximum sequence length
//! - loading a pretrained vocabulary from disk (fatal if missing)
//! - dialogue turn encoding with the turn-ending marker
//!
//! # Example
//!
//! ```no_run
//! use ardm_tokenizer::Tokenizer;
//!
//! let corpus = ["hi there", "hello there"];
//! let tokenizer = Tokenizer::train_from_iterator(corpus.iter(), 500)
//!     .expect("Failed to train tokenizer");
//!
//! let ids = tokenizer.encode("hi there").expect("Encoding failed");
//! let text = tokenizer.decode(&ids).expect("Decoding failed");
//! ```

pub mod dialog;

pub use dialog::TurnEncoder;

use anyhow::{Context, Result};
use aprender::text::tokenize::BpeTokenizer;
use std::path::Path;

/// Default maximum sequence length for encoded text.
pub const DEFAULT_MAX_LEN: usize = 4096;

/// Serialized tokenizer data
///
/// Only the vocabulary and merge rules are persisted; everything else is
/// derivable from them.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct TokenizerData {
    /// Token to ID mapping
    pub vocabulary: std::collections::HashMap<String, u32>,
    /// BPE merge rules
    pub merges: Vec<(String, String)>,
}

/// Tokenizer with a fixed maximum sequence length
///
/// Uses `aprender::text::tokenize::BpeTokenizer` internally. Sequences
/// longer than `max_len` are truncated on encode.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    bpe: BpeTokenizer,
    max_len: usize,
}

impl Tokenizer {
    /// Train a new tokenizer from an iterator of text
    ///
    /// Used by tests and tooling; training runs load a pretrained
    /// vocabulary via [`Tokenizer::from_file`] instead.
    pub fn train_from_iterator<I, S>(text_iterator: I, vocab_size: usize) -> Result<Self>
    where
        I: Iterator<Item = S>,
        S: AsRef<str>,
    {
        // aprender's API wants slices of &str, so the corpus has to be
        // collected into owned strings first.
        let corpus_owned: Vec<String> = text_iterator.map(|s| s.as_ref().to_string()).collect();
        let corpus: Vec<&str> = corpus_owned.iter().map(|s| s.as_str()).collect();

        let bpe = BpeTokenizer::train(&corpus, vocab_size)
            .map_err(|e| anyhow::anyhow!("Failed to train BPE tokenizer: {}", e))?;

        Ok(Self {
            bpe,
            max_len: DEFAULT_MAX_LEN,
        })
    }

    /// Set the maximum sequence length
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Maximum sequence length
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Encode text to token IDs, truncated to `max_len`
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = self
            .bpe
            .encode(text)
            .map_err(|e| anyhow::anyhow!("Encoding failed: {}", e))?;
        ids.truncate(self.max_len);
        Ok(ids)
    }

    /// Decode token IDs to text
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.bpe
            .decode(ids)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.bpe.vocab_size()
    }

    /// Load a pretrained tokenizer from a vocabulary file
    ///
    /// # Errors
    /// Returns an error if the file is missing or cannot be parsed. A
    /// missing pretrained vocabulary is a fatal startup condition for
    /// training.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        use std::fs;

        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Tokenizer vocabulary not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tokenizer file: {}", path.display()))?;

        let data: TokenizerData =
            serde_json::from_str(&content).context("Failed to parse tokenizer JSON")?;

        let bpe = BpeTokenizer::from_vocab(data.vocabulary, data.merges);

        Ok(Self {
            bpe,
            max_len: DEFAULT_MAX_LEN,
        })
    }

    /// Load a pretrained tokenizer from `tokenizer.json` in a directory
    pub fn from_directory<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file(path.as_ref().join("tokenizer.json"))
    }

    /// Save the tokenizer vocabulary to `tokenizer.json` in a directory
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::fs;

        let path = path.as_ref();
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;

        let tokenizer_file = path.join("tokenizer.json");

        let data = TokenizerData {
            vocabulary: self.bpe.vocab().clone(),
            merges: self.bpe.merges().to_vec(),
        };

        // Compact JSON keeps the vocabulary file small.
        let content = serde_json::to_string(&data).context("Failed to serialize tokenizer")?;

        fs::write(&tokenizer_file, content)
            .with_context(|| format!("Failed to write tokenizer file: {}", tokenizer_file.display()))?;

        Ok(())
    }
}
