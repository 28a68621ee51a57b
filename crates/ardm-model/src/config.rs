//! Backbone configuration

use serde::{Deserialize, Serialize};

/// Transformer backbone configuration
///
/// `n_positions` bounds the absolute position ids the collator may
/// assign; a training fragment's token total must fit inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Vocabulary size (must match the tokenizer)
    pub vocab_size: usize,
    /// Number of transformer layers
    pub n_layer: usize,
    /// Number of attention heads
    pub n_head: usize,
    /// Embedding dimension
    pub n_embd: usize,
    /// Size of the learned position-embedding table
    pub n_positions: usize,
    /// Dropout probability (None = no dropout)
    pub dropout: Option<f32>,
    /// Random seed for weight initialization (None = non-deterministic)
    pub seed: Option<u64>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50304,
            n_layer: 12,
            n_head: 12,
            n_embd: 768,
            n_positions: 1024,
            dropout: None,
            seed: None,
        }
    }
}

impl BackboneConfig {
    /// A tiny configuration for tests
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            n_layer: 1,
            n_head: 2,
            n_embd: 16,
            n_positions: 64,
            dropout: None,
            seed: Some(42),
        }
    }

    /// Validate the tokenizer vocabulary against the model
    pub fn validate_vocab_size(&self, tokenizer_vocab: usize) -> anyhow::Result<()> {
        if tokenizer_vocab > self.vocab_size {
            anyhow::bail!(
                "Tokenizer vocabulary ({}) exceeds model vocabulary ({})",
                tokenizer_vocab,
                self.vocab_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_position_table() {
        let config = BackboneConfig::default();
        assert_eq!(config.n_positions, 1024);
    }

    #[test]
    fn test_vocab_validation() {
        let config = BackboneConfig::tiny(100);
        assert!(config.validate_vocab_size(100).is_ok());
        assert!(config.validate_vocab_size(101).is_err());
    }
}
