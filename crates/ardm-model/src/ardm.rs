//! ARDM training step
//!
//! Wraps the pretrained backbone and defines the per-fragment training
//! procedure: turns run through the backbone one after another over a
//! shared dialogue cache, accumulating the language-model loss and the
//! auxiliary KL scalar. Backpropagation is not triggered here; the
//! distributed manager owns that.

use crate::backbone::TransformerLM;
use crate::config::BackboneConfig;
use crate::regularizer::{AuxRegularizer, UniformPriorKl};
use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::Module;

/// One turn of a collated fragment
pub struct TurnInput {
    /// Token ids [1, seq_len]
    pub tokens: Tensor,
    /// Absolute position ids [1, seq_len]
    pub positions: Tensor,
}

/// One collated dialogue fragment (the whole batch: batch size is one
/// dialogue, turns are the finer-grained unit)
pub struct DialogBatch {
    /// Turns in dialogue order
    pub turns: Vec<TurnInput>,
}

impl DialogBatch {
    /// Total token count across all turns
    pub fn total_tokens(&self) -> usize {
        self.turns.iter().map(|t| t.tokens.shape()[1]).sum()
    }
}

/// Scalars produced by one training step
pub struct StepOutput {
    /// Language-model loss, ready for `backward()`
    pub loss: Tensor,
    /// Auxiliary KL scalar (display/metrics only)
    pub kl: f32,
}

/// Mean next-token negative log-likelihood over one turn
///
/// Position `i` predicts token `i + 1` of the same turn, so a turn of
/// `t` tokens contributes `t - 1` prediction targets.
fn turn_nll(logits: &Tensor, tokens: &Tensor) -> (f32, usize) {
    let shape = logits.shape();
    let (seq_len, vocab) = (shape[1], shape[2]);
    if seq_len < 2 {
        return (0.0, 0);
    }

    let logits_data = logits.data();
    let tokens_data = tokens.data();

    let mut total = 0.0;
    for i in 0..seq_len - 1 {
        let row = &logits_data[i * vocab..(i + 1) * vocab];
        let target = tokens_data[i + 1] as usize;

        // log-softmax evaluated at the target id
        let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum: f32 = row.iter().map(|&v| (v - max_val).exp()).sum::<f32>().ln() + max_val;
        total += log_sum - row[target];
    }

    (total, seq_len - 1)
}

/// Autoregressive dialogue-response model
pub struct Ardm {
    backbone: TransformerLM,
    regularizer: Box<dyn AuxRegularizer>,
}

impl Ardm {
    /// Wrap a backbone with the default KL regularizer
    pub fn new(backbone: TransformerLM) -> Self {
        Self {
            backbone,
            regularizer: Box::new(UniformPriorKl),
        }
    }

    /// Wrap a backbone with a specific regularizer
    pub fn with_regularizer(backbone: TransformerLM, regularizer: Box<dyn AuxRegularizer>) -> Self {
        Self {
            backbone,
            regularizer,
        }
    }

    /// Backbone configuration
    pub fn config(&self) -> &BackboneConfig {
        self.backbone.config()
    }

    /// The wrapped backbone
    pub fn backbone(&self) -> &TransformerLM {
        &self.backbone
    }

    /// The wrapped backbone, mutably
    pub fn backbone_mut(&mut self) -> &mut TransformerLM {
        &mut self.backbone
    }

    /// Run one training step over a collated fragment
    ///
    /// Feeds the turns through the backbone in dialogue order with a
    /// fresh cache, so every turn conditions on all earlier turns.
    /// Returns the loss tensor and the KL scalar; gradients are not yet
    /// computed.
    pub fn train_one_step(&mut self, batch: &DialogBatch) -> Result<StepOutput> {
        let mut cache = self.backbone.new_cache();

        let mut turn_logits = Vec::with_capacity(batch.turns.len());
        let mut total_nll = 0.0;
        let mut total_targets = 0usize;

        for turn in &batch.turns {
            let logits = self
                .backbone
                .forward(&turn.tokens, &turn.positions, &mut cache)?;

            let (nll, targets) = turn_nll(&logits, &turn.tokens);
            total_nll += nll;
            total_targets += targets;

            turn_logits.push(logits);
        }

        let mean_nll = if total_targets > 0 {
            total_nll / total_targets as f32
        } else {
            0.0
        };

        let kl = self.regularizer.penalty(&turn_logits);

        Ok(StepOutput {
            loss: Tensor::new(&[mean_nll], &[1]),
            kl,
        })
    }
}

impl Module for Ardm {
    fn forward(&self, input: &Tensor) -> Tensor {
        Module::forward(&self.backbone, input)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        self.backbone.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        self.backbone.parameters_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regularizer::NoRegularizer;

    fn tiny_batch() -> DialogBatch {
        let turn = |ids: &[f32], start: usize| {
            let positions: Vec<f32> = (start..start + ids.len()).map(|p| p as f32).collect();
            TurnInput {
                tokens: Tensor::new(ids, &[1, ids.len()]),
                positions: Tensor::new(&positions, &[1, ids.len()]),
            }
        };
        DialogBatch {
            turns: vec![turn(&[1.0, 2.0, 3.0], 4), turn(&[4.0, 5.0], 7)],
        }
    }

    #[test]
    fn test_train_one_step_returns_finite_scalars() {
        let backbone = TransformerLM::new(BackboneConfig::tiny(32));
        let mut model = Ardm::new(backbone);

        let out = model.train_one_step(&tiny_batch()).unwrap();
        assert!(out.loss.item().is_finite());
        assert!(out.kl.is_finite());
    }

    #[test]
    fn test_no_regularizer_reports_zero_kl() {
        let backbone = TransformerLM::new(BackboneConfig::tiny(32));
        let mut model = Ardm::with_regularizer(backbone, Box::new(NoRegularizer));

        let out = model.train_one_step(&tiny_batch()).unwrap();
        assert_eq!(out.kl, 0.0);
    }

    #[test]
    fn test_loss_is_positive_for_random_weights() {
        let backbone = TransformerLM::new(BackboneConfig::tiny(32));
        let mut model = Ardm::new(backbone);

        let out = model.train_one_step(&tiny_batch()).unwrap();
        // Mean NLL over a 32-token vocabulary should sit near ln(32).
        assert!(out.loss.item() > 0.0);
    }

    #[test]
    fn test_single_token_turns_yield_zero_loss() {
        let backbone = TransformerLM::new(BackboneConfig::tiny(32));
        let mut model = Ardm::new(backbone);

        let batch = DialogBatch {
            turns: vec![TurnInput {
                tokens: Tensor::new(&[3.0], &[1, 1]),
                positions: Tensor::new(&[0.0], &[1, 1]),
            }],
        };

        let out = model.train_one_step(&batch).unwrap();
        assert_eq!(out.loss.item(), 0.0);
    }

    #[test]
    fn test_total_tokens() {
        assert_eq!(tiny_batch().total_tokens(), 5);
    }
}
