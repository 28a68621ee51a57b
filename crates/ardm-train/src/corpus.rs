//! Dialogue corpus loading
//!
//! The training corpus is a single JSON object mapping dialogue ids to
//! ordered arrays of turn strings. Ids are never needed downstream, so
//! the loader emits an ordered list of dialogues directly.

use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading the corpus file
#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("Failed to read corpus file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed corpus JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Corpus contains no dialogues")]
    Empty,
}

/// One multi-turn dialogue
#[derive(Debug, Clone)]
pub struct Dialog {
    /// Ordered turn texts
    pub turns: Vec<String>,
}

/// Load a dialogue corpus from a JSON file
///
/// Dialogue ids are discarded; dialogues come back in the ids' sorted
/// order, so loading the same file twice yields the same list. Any
/// malformed JSON is fatal here, at load time.
pub fn load_corpus<P: AsRef<Path>>(path: P) -> Result<Vec<Dialog>, CorpusError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| CorpusError::Io {
        path: path.display().to_string(),
        source,
    })?;

    parse_corpus(&content)
}

/// Parse corpus JSON into an ordered dialogue list
pub fn parse_corpus(content: &str) -> Result<Vec<Dialog>, CorpusError> {
    let raw: BTreeMap<String, Vec<String>> = serde_json::from_str(content)?;

    if raw.is_empty() {
        return Err(CorpusError::Empty);
    }

    Ok(raw
        .into_values()
        .map(|turns| Dialog { turns })
        .collect())
}
