//! Fragment collation
//!
//! Turns one sampled fragment into the per-turn tensors the model step
//! consumes. The whole fragment is anchored at a random absolute
//! position inside the backbone's context window, and every turn gets a
//! contiguous block of position ids continuing from the previous one:
//! the training-time stand-in for a long-running conversation offset.

use crate::sampler::Fragment;
use anyhow::Result;
use aprender::autograd::Tensor;
use ardm_model::{DialogBatch, TurnInput};
use rand::rngs::StdRng;
use rand::Rng;

/// Collate one fragment into a model batch
///
/// Draws the start position uniformly from `[0, n_positions - total]`.
///
/// # Errors
/// Fails when the fragment's token total exceeds `n_positions`: there
/// is no valid anchor for it inside the position table.
pub fn collate(fragment: &Fragment, n_positions: usize, rng: &mut StdRng) -> Result<DialogBatch> {
    let total_len = fragment.total_tokens();
    if total_len == 0 {
        anyhow::bail!("Cannot collate an empty fragment");
    }
    if total_len > n_positions {
        anyhow::bail!(
            "Fragment of {} tokens does not fit the {}-slot position table",
            total_len,
            n_positions
        );
    }

    let mut position = rng.gen_range(0..=n_positions - total_len);

    let mut turns = Vec::with_capacity(fragment.turns.len());
    for turn in &fragment.turns {
        let tokens: Vec<f32> = turn.iter().map(|&id| id as f32).collect();
        let positions: Vec<f32> = (position..position + turn.len()).map(|p| p as f32).collect();
        position += turn.len();

        turns.push(TurnInput {
            tokens: Tensor::new(&tokens, &[1, turn.len()]),
            positions: Tensor::new(&positions, &[1, turn.len()]),
        });
    }

    Ok(DialogBatch { turns })
}
