//! Dialogue turn encoding
//!
//! Turns are separated in the training stream by a plain-text turn-ending
//! marker rather than dedicated special tokens: every encoded turn is
//! terminated by the token ids of `"\n\n\n"`.

use crate::Tokenizer;
use anyhow::{Context, Result};

/// Text appended to every turn before encoding the next one.
pub const TURN_ENDING: &str = "\n\n\n";

/// Encodes dialogue turns with the turn-ending marker
///
/// The marker's token ids are computed once at construction so per-turn
/// encoding only pays for the turn text itself.
#[derive(Debug, Clone)]
pub struct TurnEncoder {
    tokenizer: Tokenizer,
    turn_ending: Vec<u32>,
}

impl TurnEncoder {
    /// Create a turn encoder over a tokenizer
    pub fn new(tokenizer: Tokenizer) -> Result<Self> {
        let turn_ending = tokenizer
            .encode(TURN_ENDING)
            .context("Failed to encode the turn-ending marker")?;
        Ok(Self {
            tokenizer,
            turn_ending,
        })
    }

    /// The encoded turn-ending marker
    pub fn turn_ending(&self) -> &[u32] {
        &self.turn_ending
    }

    /// The wrapped tokenizer
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Encode one turn, terminated by the turn-ending marker
    pub fn encode_turn(&self, turn: &str) -> Result<Vec<u32>> {
        let mut ids = self.tokenizer.encode(turn)?;
        ids.extend_from_slice(&self.turn_ending);
        Ok(ids)
    }

    /// Encode an ordered sequence of turns
    ///
    /// Returns one token-id sequence per turn, preserving turn order.
    pub fn encode_turns(&self, turns: &[String]) -> Result<Vec<Vec<u32>>> {
        turns.iter().map(|turn| self.encode_turn(turn)).collect()
    }
}
