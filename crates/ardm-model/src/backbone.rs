//! Decoder-only transformer backbone
//!
//! A GPT-style language model with learned absolute position embeddings.
//! The collator hands every turn an explicit block of position ids, and
//! the position table is what anchors a fragment at its randomized
//! offset within the context window.

use crate::attention::{CausalSelfAttention, DialogCache};
use crate::config::BackboneConfig;
use crate::embedding::Embedding;
use crate::mlp::FeedForward;
use crate::norm::rms_norm;
use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Linear, Module};

/// Embedding initialization scale
const EMBEDDING_INIT_STD: f32 = 0.02;

/// Transformer decoder block with pre-norm residuals
pub struct Block {
    attn: CausalSelfAttention,
    mlp: FeedForward,
    layer_idx: usize,
}

impl Block {
    /// Create a block at `layer_idx` (its slot in the dialogue cache)
    pub fn new(config: &BackboneConfig, layer_idx: usize) -> Self {
        let attn = CausalSelfAttention::new(
            config.n_embd,
            config.n_head,
            config.dropout,
            config.seed.map(|s| s.wrapping_add(layer_idx as u64)),
        );
        let mlp = FeedForward::new(config.n_embd);

        Self {
            attn,
            mlp,
            layer_idx,
        }
    }

    /// Forward pass: x = x + attn(norm(x)); x = x + mlp(norm(x))
    pub fn forward(&self, x: &Tensor, cache: &mut DialogCache) -> Result<Tensor> {
        let x_norm = rms_norm(x)?;
        let attn_out = self.attn.forward(&x_norm, cache, self.layer_idx)?;

        if attn_out.shape() != x.shape() {
            anyhow::bail!(
                "Attention output shape {:?} doesn't match input shape {:?}",
                attn_out.shape(),
                x.shape()
            );
        }
        let x = attn_out.add(x);

        let x_norm = rms_norm(&x)?;
        let mlp_out = self.mlp.forward(&x_norm)?;
        Ok(mlp_out.add(&x))
    }
}

impl Module for Block {
    fn forward(&self, input: &Tensor) -> Tensor {
        let mut cache = DialogCache::new(self.layer_idx + 1);
        self.forward(input, &mut cache).expect("Block forward failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.attn.parameters());
        params.extend(self.mlp.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.attn.parameters_mut());
        params.extend(self.mlp.parameters_mut());
        params
    }
}

/// Pretrained transformer language model
///
/// Token embeddings + position embeddings feed a stack of decoder
/// blocks; an untied head projects to vocabulary logits.
pub struct TransformerLM {
    config: BackboneConfig,
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    lm_head: Linear,
}

impl TransformerLM {
    /// Create a freshly initialized backbone
    pub fn new(config: BackboneConfig) -> Self {
        let wte = Embedding::new(config.vocab_size, config.n_embd, EMBEDDING_INIT_STD, config.seed);
        let wpe = Embedding::new(
            config.n_positions,
            config.n_embd,
            EMBEDDING_INIT_STD,
            config.seed.map(|s| s.wrapping_add(1)),
        );

        let blocks = (0..config.n_layer)
            .map(|i| Block::new(&config, i))
            .collect();

        let lm_head = Linear::new(config.n_embd, config.vocab_size);

        Self {
            config,
            wte,
            wpe,
            blocks,
            lm_head,
        }
    }

    /// Backbone configuration
    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// Create an empty dialogue cache sized for this backbone
    pub fn new_cache(&self) -> DialogCache {
        DialogCache::new(self.config.n_layer)
    }

    /// Forward one turn through the backbone
    ///
    /// # Arguments
    /// * `tokens` - Token ids [1, seq_len]
    /// * `positions` - Absolute position ids [1, seq_len], continuing
    ///   across the turns of a fragment
    /// * `cache` - Dialogue cache shared by all turns of the fragment
    ///
    /// # Returns
    /// Vocabulary logits [1, seq_len, vocab_size]
    pub fn forward(
        &self,
        tokens: &Tensor,
        positions: &Tensor,
        cache: &mut DialogCache,
    ) -> Result<Tensor> {
        if tokens.shape() != positions.shape() {
            anyhow::bail!(
                "Token shape {:?} doesn't match position shape {:?}",
                tokens.shape(),
                positions.shape()
            );
        }

        let tok_emb = self.wte.lookup(tokens)?;
        let pos_emb = self.wpe.lookup(positions)?;
        let mut x = tok_emb.add(&pos_emb);

        for block in &self.blocks {
            x = block.forward(&x, cache)?;
        }

        let x = rms_norm(&x)?;
        Ok(self.lm_head.forward(&x))
    }
}

impl Module for TransformerLM {
    fn forward(&self, input: &Tensor) -> Tensor {
        // Positions default to 0..seq_len when the backbone is driven
        // through the plain Module interface.
        let seq_len = input.shape()[1];
        let positions: Vec<f32> = (0..seq_len).map(|p| p as f32).collect();
        let positions = Tensor::new(&positions, &[1, seq_len]);

        let mut cache = self.new_cache();
        self.forward(input, &positions, &mut cache)
            .expect("Backbone forward failed")
    }

    fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.wte.parameters());
        params.extend(self.wpe.parameters());
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params.extend(self.lm_head.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.wte.parameters_mut());
        params.extend(self.wpe.parameters_mut());
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        params.extend(self.lm_head.parameters_mut());
        params
    }
}
