//! Distributed training manager
//!
//! Hides single-replica vs. data-parallel training behind one
//! interface. Data parallelism runs as worker threads over a shared
//! [`ReplicaGroup`]: gradient averaging is a blocking, barrier-aligned
//! collective, so every replica must reach each accumulation boundary
//! or the run stalls there. Failure to establish the group (or a
//! malformed launcher environment) is fatal at startup.

use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use aprender::nn::Module;
use ardm_model::Ardm;
use std::sync::{Arc, Barrier, Mutex};

/// Launcher environment variables
const ENV_RANK: &str = "RANK";
const ENV_WORLD_SIZE: &str = "WORLD_SIZE";

/// Rank/world-size pair read from the launcher environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedConfig {
    pub rank: usize,
    pub world_size: usize,
}

impl DistributedConfig {
    /// Read the launcher environment
    ///
    /// Returns `Ok(None)` when neither `RANK` nor `WORLD_SIZE` is set
    /// (single-process run). Partial or malformed configuration is an
    /// error the caller treats as fatal.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_vars(
            std::env::var(ENV_RANK).ok().as_deref(),
            std::env::var(ENV_WORLD_SIZE).ok().as_deref(),
        )
    }

    fn from_vars(rank: Option<&str>, world_size: Option<&str>) -> Result<Option<Self>> {
        match (rank, world_size) {
            (None, None) => Ok(None),
            (Some(rank), Some(world_size)) => {
                let rank: usize = rank
                    .parse()
                    .with_context(|| format!("Invalid {}: {:?}", ENV_RANK, rank))?;
                let world_size: usize = world_size
                    .parse()
                    .with_context(|| format!("Invalid {}: {:?}", ENV_WORLD_SIZE, world_size))?;
                if world_size == 0 {
                    anyhow::bail!("{} must be at least 1", ENV_WORLD_SIZE);
                }
                if rank >= world_size {
                    anyhow::bail!(
                        "{}={} out of range for {}={}",
                        ENV_RANK,
                        rank,
                        ENV_WORLD_SIZE,
                        world_size
                    );
                }
                Ok(Some(Self { rank, world_size }))
            }
            _ => anyhow::bail!(
                "Partial distributed environment: {} and {} must both be set",
                ENV_RANK,
                ENV_WORLD_SIZE
            ),
        }
    }
}

/// Shared state of a data-parallel replica group
///
/// Replicas accumulate their gradients into a shared buffer, wait on
/// the barrier, read the average back, and wait again so the buffer can
/// be reset exactly once. Every collective call is a synchronization
/// point for all replicas.
pub struct ReplicaGroup {
    world_size: usize,
    barrier: Barrier,
    reduce: Mutex<Vec<Vec<f32>>>,
    layout: Mutex<Option<Vec<usize>>>,
}

impl ReplicaGroup {
    /// Create a group for `world_size` replicas
    pub fn new(world_size: usize) -> Result<Arc<Self>> {
        if world_size == 0 {
            anyhow::bail!("Replica group needs at least one member");
        }
        Ok(Arc::new(Self {
            world_size,
            barrier: Barrier::new(world_size),
            reduce: Mutex::new(Vec::new()),
            layout: Mutex::new(None),
        }))
    }

    /// Number of replicas in the group
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Record or check the replica parameter layout
    ///
    /// The first replica to arrive stores its per-parameter lengths;
    /// everyone else must match them.
    fn validate_layout(&self, lens: &[usize]) -> Result<()> {
        let mut layout = self
            .layout
            .lock()
            .map_err(|_| anyhow::anyhow!("Replica group layout lock poisoned"))?;
        match layout.as_ref() {
            None => {
                *layout = Some(lens.to_vec());
                Ok(())
            }
            Some(expected) if expected == lens => Ok(()),
            Some(expected) => anyhow::bail!(
                "Replica parameter layout mismatch: {} tensors expected, {} found",
                expected.len(),
                lens.len()
            ),
        }
    }

    /// Average gradient buffers across all replicas, in place
    fn all_reduce_mean(&self, grads: &mut [Vec<f32>]) -> Result<()> {
        {
            let mut sums = self
                .reduce
                .lock()
                .map_err(|_| anyhow::anyhow!("Replica group reduce lock poisoned"))?;
            if sums.is_empty() {
                *sums = grads.to_vec();
            } else {
                if sums.len() != grads.len() {
                    anyhow::bail!(
                        "Gradient count mismatch in all-reduce: {} vs {}",
                        sums.len(),
                        grads.len()
                    );
                }
                for (sum, grad) in sums.iter_mut().zip(grads.iter()) {
                    for (s, g) in sum.iter_mut().zip(grad.iter()) {
                        *s += g;
                    }
                }
            }
        }

        // All contributions are in; read the average back.
        self.barrier.wait();
        {
            let sums = self
                .reduce
                .lock()
                .map_err(|_| anyhow::anyhow!("Replica group reduce lock poisoned"))?;
            let scale = 1.0 / self.world_size as f32;
            for (grad, sum) in grads.iter_mut().zip(sums.iter()) {
                for (g, s) in grad.iter_mut().zip(sum.iter()) {
                    *g = s * scale;
                }
            }
        }

        // Reset once after every replica has read, then release the
        // group into the next round together.
        if self.barrier.wait().is_leader() {
            if let Ok(mut sums) = self.reduce.lock() {
                sums.clear();
            }
        }
        self.barrier.wait();

        Ok(())
    }
}

/// Uniform interface over single-replica and data-parallel training
pub struct DistributedManager {
    rank: usize,
    group: Option<Arc<ReplicaGroup>>,
}

impl DistributedManager {
    /// Single-process manager: rank 0 of world 1, all collectives no-ops
    pub fn single() -> Self {
        Self {
            rank: 0,
            group: None,
        }
    }

    /// Manager for one replica of a data-parallel group
    pub fn replicated(group: Arc<ReplicaGroup>, rank: usize) -> Result<Self> {
        if rank >= group.world_size() {
            anyhow::bail!(
                "Rank {} out of range for replica group of {}",
                rank,
                group.world_size()
            );
        }
        Ok(Self {
            rank,
            group: Some(group),
        })
    }

    /// This process's rank
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of cooperating replicas
    pub fn world_size(&self) -> usize {
        self.group.as_ref().map(|g| g.world_size()).unwrap_or(1)
    }

    /// True only for the coordinating replica
    ///
    /// Gates every logging/checkpointing side effect.
    pub fn is_main_rank(&self) -> bool {
        self.rank == 0
    }

    /// Prepare a model for synchronized training
    ///
    /// Replicated mode checks that every replica reports the same
    /// parameter layout; a mismatch is fatal before the first step.
    pub fn init_training(&self, model: &mut Ardm) -> Result<()> {
        if let Some(group) = &self.group {
            let lens: Vec<usize> = model
                .parameters()
                .iter()
                .map(|p| p.data().len())
                .collect();
            group.validate_layout(&lens)?;
            group.barrier.wait();
        }
        Ok(())
    }

    /// Trigger gradient computation for one update's loss
    pub fn backward_loss(&self, loss: &Tensor) {
        loss.backward();
    }

    /// Synchronize and clip gradients at an accumulation boundary
    ///
    /// Replicated mode first averages gradients across the group (the
    /// blocking collective), then clips by global norm; single mode
    /// clips only. Returns the pre-clip global norm.
    pub fn clip_grad_norm(&self, model: &mut Ardm, max_norm: f32) -> Result<f32> {
        let mut params = model.parameters_mut();

        let mut grads: Vec<Vec<f32>> = Vec::with_capacity(params.len());
        for param in params.iter() {
            match param.grad() {
                Some(grad) => grads.push(grad.data().iter().copied().collect()),
                None => grads.push(vec![0.0; param.data().len()]),
            }
        }

        if let Some(group) = &self.group {
            group.all_reduce_mean(&mut grads)?;
        }

        let total_norm_sq: f32 = grads
            .iter()
            .flat_map(|g| g.iter())
            .map(|&g| g * g)
            .sum();
        let global_norm = total_norm_sq.sqrt();

        let clip_coef = if max_norm > 0.0 && global_norm > max_norm {
            max_norm / global_norm
        } else {
            1.0
        };

        // Averaged or rescaled gradients go back onto the parameters;
        // untouched single-replica gradients are left alone.
        if self.group.is_some() || clip_coef < 1.0 {
            for (param, grad) in params.iter_mut().zip(grads.into_iter()) {
                let scaled: Vec<f32> = grad.iter().map(|&g| g * clip_coef).collect();
                param.set_grad(scaled);
            }
        }

        Ok(global_norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_manager_is_main_rank() {
        let manager = DistributedManager::single();
        assert!(manager.is_main_rank());
        assert_eq!(manager.world_size(), 1);
    }

    #[test]
    fn test_from_vars_absent_is_single() {
        assert_eq!(DistributedConfig::from_vars(None, None).unwrap(), None);
    }

    #[test]
    fn test_from_vars_partial_is_fatal() {
        assert!(DistributedConfig::from_vars(Some("0"), None).is_err());
        assert!(DistributedConfig::from_vars(None, Some("2")).is_err());
    }

    #[test]
    fn test_from_vars_malformed_is_fatal() {
        assert!(DistributedConfig::from_vars(Some("zero"), Some("2")).is_err());
        assert!(DistributedConfig::from_vars(Some("0"), Some("0")).is_err());
        assert!(DistributedConfig::from_vars(Some("2"), Some("2")).is_err());
    }

    #[test]
    fn test_from_vars_valid() {
        let config = DistributedConfig::from_vars(Some("1"), Some("4"))
            .unwrap()
            .unwrap();
        assert_eq!(config.rank, 1);
        assert_eq!(config.world_size, 4);
    }

    #[test]
    fn test_rank_out_of_group_range() {
        let group = ReplicaGroup::new(2).unwrap();
        assert!(DistributedManager::replicated(group, 2).is_err());
    }

    #[test]
    fn test_all_reduce_averages_across_replicas() {
        let group = ReplicaGroup::new(2).unwrap();

        let g0 = group.clone();
        let handle = thread::spawn(move || {
            let mut grads = vec![vec![1.0, 2.0], vec![4.0]];
            g0.all_reduce_mean(&mut grads).unwrap();
            grads
        });

        let mut grads = vec![vec![3.0, 6.0], vec![0.0]];
        group.all_reduce_mean(&mut grads).unwrap();

        let other = handle.join().unwrap();
        assert_eq!(grads, vec![vec![2.0, 4.0], vec![2.0]]);
        assert_eq!(other, grads);
    }

    #[test]
    fn test_all_reduce_reusable_across_rounds() {
        let group = ReplicaGroup::new(2).unwrap();

        let g0 = group.clone();
        let handle = thread::spawn(move || {
            for round in 0..3 {
                let mut grads = vec![vec![round as f32]];
                g0.all_reduce_mean(&mut grads).unwrap();
                assert_eq!(grads[0][0], round as f32 + 1.0);
            }
        });

        for round in 0..3 {
            let mut grads = vec![vec![round as f32 + 2.0]];
            group.all_reduce_mean(&mut grads).unwrap();
            assert_eq!(grads[0][0], round as f32 + 1.0);
        }

        handle.join().unwrap();
    }
}
