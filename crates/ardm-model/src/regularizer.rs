//! Auxiliary KL regularization
//!
//! The training step reports an auxiliary KL scalar next to the language
//! model loss. Its formulation is pluggable: the trainer logs whatever
//! the configured regularizer computes and never feeds it back into the
//! backward pass.

use aprender::autograd::Tensor;
use aprender::loss::kl_divergence;
use aprender::primitives::Vector;

/// Pluggable auxiliary KL term over a fragment's per-turn logits
pub trait AuxRegularizer: Send + Sync {
    /// Compute the KL scalar for one fragment
    ///
    /// `turn_logits` holds one logits tensor [1, seq_len, vocab] per
    /// turn, in dialogue order.
    fn penalty(&self, turn_logits: &[Tensor]) -> f32;
}

/// No auxiliary term; always reports 0
pub struct NoRegularizer;

impl AuxRegularizer for NoRegularizer {
    fn penalty(&self, _turn_logits: &[Tensor]) -> f32 {
        0.0
    }
}

/// KL divergence of each turn's mean predictive distribution from uniform
///
/// A peaked average distribution over the vocabulary yields a large
/// value, a flat one approaches zero, so the reported scalar tracks how
/// concentrated the model's per-turn predictions are.
pub struct UniformPriorKl;

impl UniformPriorKl {
    /// Mean softmax distribution over the positions of one turn
    fn mean_distribution(logits: &Tensor) -> Vec<f32> {
        let shape = logits.shape();
        let (seq_len, vocab) = (shape[1], shape[2]);
        let data = logits.data();

        let mut mean = vec![0.0; vocab];
        for s in 0..seq_len {
            let row = &data[s * vocab..(s + 1) * vocab];
            let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let exp_vals: Vec<f32> = row.iter().map(|&v| (v - max_val).exp()).collect();
            let sum: f32 = exp_vals.iter().sum();
            for (m, e) in mean.iter_mut().zip(exp_vals.iter()) {
                *m += e / sum;
            }
        }

        for m in mean.iter_mut() {
            *m /= seq_len as f32;
        }
        mean
    }
}

impl AuxRegularizer for UniformPriorKl {
    fn penalty(&self, turn_logits: &[Tensor]) -> f32 {
        if turn_logits.is_empty() {
            return 0.0;
        }

        let mut total = 0.0;
        let mut counted = 0;
        for logits in turn_logits {
            let shape = logits.shape();
            if shape[1] == 0 {
                continue;
            }
            let vocab = shape[2];
            let mean = Self::mean_distribution(logits);
            let uniform = vec![1.0 / vocab as f32; vocab];

            total += kl_divergence(
                &Vector::from_slice(&mean),
                &Vector::from_slice(&uniform),
            );
            counted += 1;
        }

        if counted == 0 {
            0.0
        } else {
            total / counted as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_regularizer_is_zero() {
        let logits = Tensor::ones(&[1, 3, 8]);
        assert_eq!(NoRegularizer.penalty(&[logits]), 0.0);
    }

    #[test]
    fn test_uniform_logits_give_near_zero_kl() {
        // All-equal logits softmax to the uniform distribution.
        let logits = Tensor::ones(&[1, 2, 8]);
        let kl = UniformPriorKl.penalty(&[logits]);
        assert!(kl.abs() < 1e-4, "kl = {}", kl);
    }

    #[test]
    fn test_peaked_logits_give_positive_kl() {
        let mut data = vec![0.0; 8];
        data[3] = 12.0;
        let logits = Tensor::new(&data, &[1, 1, 8]);

        let kl = UniformPriorKl.penalty(&[logits]);
        assert!(kl > 0.1, "kl = {}", kl);
    }

    #[test]
    fn test_empty_fragment_is_zero() {
        assert_eq!(UniformPriorKl.penalty(&[]), 0.0);
    }
}
