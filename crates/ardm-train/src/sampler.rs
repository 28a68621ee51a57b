//! Dialogue fragment sampling
//!
//! A fragment is a contiguous window of turns whose total token count
//! stays inside a budget, so one training example never outgrows the
//! memory the step is allowed to use.

use rand::rngs::StdRng;
use rand::Rng;

/// Default token budget for one fragment
pub const DEFAULT_MAX_TOKENS: usize = 800;

/// A contiguous window of turns selected for one training example
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Per-turn token-id sequences, in original dialogue order
    pub turns: Vec<Vec<u32>>,
    /// Turn indices `[start, end)` the window was drawn from
    pub turn_span: (usize, usize),
    /// Token offset of the window start within the flattened dialogue
    pub token_offset: usize,
}

impl Fragment {
    /// Total token count across the window
    pub fn total_tokens(&self) -> usize {
        self.turns.iter().map(|t| t.len()).sum()
    }
}

/// Samples budget-bounded fragments from full dialogues
///
/// Pure function of input + RNG state: the start turn is drawn
/// uniformly, then the window extends while the running total fits the
/// budget. A single turn longer than the whole budget is truncated to
/// it, so the invariant `total_tokens <= max_tokens` always holds.
#[derive(Debug, Clone)]
pub struct DialogFragmentSampler {
    max_tokens: usize,
}

impl DialogFragmentSampler {
    /// Create a sampler with the given token budget
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    /// The token budget
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Sample one fragment from a dialogue's tokenized turns
    ///
    /// Returns `None` only for an empty dialogue.
    pub fn sample(&self, dialog: &[Vec<u32>], rng: &mut StdRng) -> Option<Fragment> {
        if dialog.is_empty() {
            return None;
        }

        let start = rng.gen_range(0..dialog.len());
        let token_offset: usize = dialog[..start].iter().map(|t| t.len()).sum();

        let mut turns: Vec<Vec<u32>> = Vec::new();
        let mut total = 0;
        let mut end = start;

        for turn in &dialog[start..] {
            if total + turn.len() > self.max_tokens {
                break;
            }
            total += turn.len();
            turns.push(turn.clone());
            end += 1;
        }

        // Oversized opening turn: truncate it to the budget rather than
        // returning an empty window.
        if turns.is_empty() {
            let mut truncated = dialog[start].clone();
            truncated.truncate(self.max_tokens);
            turns.push(truncated);
            end = start + 1;
        }

        Some(Fragment {
            turns,
            turn_span: (start, end),
            token_offset,
        })
    }
}

impl Default for DialogFragmentSampler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOKENS)
    }
}
