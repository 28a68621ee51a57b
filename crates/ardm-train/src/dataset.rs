//! Dialogue dataset and epoch ordering

use crate::corpus::Dialog;
use crate::sampler::{DialogFragmentSampler, Fragment};
use anyhow::{Context, Result};
use ardm_tokenizer::TurnEncoder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Tokenized dialogue corpus with fragment sampling
///
/// Dialogues are tokenized once at construction; each access samples a
/// fresh fragment, so repeated access to the same index may yield
/// different windows.
pub struct DialogDataset {
    dialogs: Vec<Vec<Vec<u32>>>,
    sampler: DialogFragmentSampler,
}

impl DialogDataset {
    /// Tokenize a corpus into a dataset
    pub fn new(
        corpus: &[Dialog],
        encoder: &TurnEncoder,
        sampler: DialogFragmentSampler,
    ) -> Result<Self> {
        let mut dialogs = Vec::with_capacity(corpus.len());
        for dialog in corpus {
            let encoded = encoder
                .encode_turns(&dialog.turns)
                .context("Failed to tokenize dialogue")?;
            // A turnless dialogue has nothing to sample; dropping it
            // here keeps distributed shards step-aligned.
            if !encoded.is_empty() {
                dialogs.push(encoded);
            }
        }

        Ok(Self { dialogs, sampler })
    }

    /// Number of dialogues
    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    /// Whether the dataset holds no dialogues
    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    /// The fragment sampler's token budget
    pub fn fragment_budget(&self) -> usize {
        self.sampler.max_tokens()
    }

    /// Sample a fragment from the dialogue at `index`
    pub fn fragment(&self, index: usize, rng: &mut StdRng) -> Option<Fragment> {
        self.sampler.sample(&self.dialogs[index], rng)
    }
}

/// Per-epoch iteration order over dataset indices
///
/// Single-process runs shuffle; distributed runs shard a deterministic
/// per-epoch shuffle across ranks so every rank walks a disjoint slice
/// of the same permutation, re-partitioned every epoch.
pub enum EpochOrder {
    /// Shuffle the whole dataset each epoch
    Shuffled { seed: u64 },
    /// Deterministic shard of a per-epoch permutation
    Sharded {
        rank: usize,
        world_size: usize,
        seed: u64,
    },
}

impl EpochOrder {
    /// Indices for one epoch
    ///
    /// In sharded mode the permutation is padded by wrapping so every
    /// rank receives exactly `ceil(len / world_size)` indices; equal
    /// shard lengths keep the gradient-synchronization barrier aligned
    /// across ranks.
    pub fn indices(&self, len: usize, epoch: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }

        match self {
            EpochOrder::Shuffled { seed } => {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
                let mut indices: Vec<usize> = (0..len).collect();
                indices.shuffle(&mut rng);
                indices
            }
            EpochOrder::Sharded {
                rank,
                world_size,
                seed,
            } => {
                // Same seed on every rank: all ranks agree on the
                // permutation, then take disjoint strides of it.
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
                let mut indices: Vec<usize> = (0..len).collect();
                indices.shuffle(&mut rng);

                let shard_len = len.div_ceil(*world_size);
                let padded = shard_len * world_size;

                (0..padded)
                    .skip(*rank)
                    .step_by(*world_size)
                    .map(|i| indices[i % len])
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shuffled_covers_all_indices() {
        let order = EpochOrder::Shuffled { seed: 7 };
        let mut indices = order.indices(10, 0);
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffled_varies_by_epoch() {
        let order = EpochOrder::Shuffled { seed: 7 };
        assert_ne!(order.indices(50, 0), order.indices(50, 1));
    }

    #[test]
    fn test_shards_are_equal_length() {
        let world_size = 3;
        let shards: Vec<Vec<usize>> = (0..world_size)
            .map(|rank| {
                EpochOrder::Sharded {
                    rank,
                    world_size,
                    seed: 11,
                }
                .indices(10, 0)
            })
            .collect();

        for shard in &shards {
            assert_eq!(shard.len(), 4); // ceil(10 / 3)
        }
    }

    #[test]
    fn test_shards_cover_dataset() {
        let world_size = 4;
        let mut seen: Vec<usize> = (0..world_size)
            .flat_map(|rank| {
                EpochOrder::Sharded {
                    rank,
                    world_size,
                    seed: 3,
                }
                .indices(16, 2)
            })
            .collect();

        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_shards_repartition_per_epoch() {
        let order = EpochOrder::Sharded {
            rank: 0,
            world_size: 2,
            seed: 5,
        };
        assert_ne!(order.indices(40, 0), order.indices(40, 1));
    }

    #[test]
    fn test_empty_dataset_has_no_indices() {
        let order = EpochOrder::Shuffled { seed: 0 };
        assert!(order.indices(0, 0).is_empty());
    }
}
