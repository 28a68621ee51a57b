//! Training driver
//!
//! The epoch/update loop wiring dataset, model, distributed manager,
//! optimizer, schedule, and reporter together. The accumulation,
//! logging, and checkpoint cadences tick on the same update counter as
//! independent modular conditions; any combination may fire on one
//! update. Errors inside the loop propagate out and end the run; the
//! newest checkpoint is the manual-restart recovery point.

use crate::checkpointer::SaveState;
use crate::collator::collate;
use crate::dataset::{DialogDataset, EpochOrder};
use crate::distributed::DistributedManager;
use crate::optimizer::{resolve_warmup_steps, setup_optimizer, OptimizerConfig, WarmupLinearSchedule};
use crate::reporter::Reporter;
use anyhow::{Context, Result};
use aprender::nn::optim::Optimizer;
use ardm_model::Ardm;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

/// Training loop configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Dialogues per update (the loop processes one at a time)
    pub batch_size: usize,
    /// Number of passes over the dataset
    pub num_train_epochs: usize,
    /// Updates per optimizer step
    pub gradient_accumulation_steps: usize,
    /// Updates between scalar logging (main rank)
    pub logging_steps: usize,
    /// Updates between checkpoint saves (main rank)
    pub save_steps: usize,
    /// Gradient clipping threshold
    pub max_grad_norm: f32,
    /// Seed for fragment sampling and collation
    pub seed: u64,
}

/// Modular triggers over the shared update counter
#[derive(Debug, Clone, Copy)]
pub struct StepCadence {
    pub accumulation: usize,
    pub logging: usize,
    pub save: usize,
}

impl StepCadence {
    /// Build from the training configuration
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            accumulation: config.gradient_accumulation_steps.max(1),
            logging: config.logging_steps.max(1),
            save: config.save_steps.max(1),
        }
    }

    /// Whether this update closes an accumulation window
    pub fn optimizer_step_due(&self, update_count: usize) -> bool {
        update_count.is_multiple_of(self.accumulation)
    }

    /// Whether this update is a logging tick
    pub fn logging_due(&self, update_count: usize) -> bool {
        update_count.is_multiple_of(self.logging)
    }

    /// Whether this update is a checkpoint tick
    pub fn save_due(&self, update_count: usize) -> bool {
        update_count.is_multiple_of(self.save)
    }
}

/// Counters reported back after a run
#[derive(Debug, Clone, Copy)]
pub struct TrainSummary {
    pub updates: usize,
    pub optimizer_steps: usize,
    pub checkpoints: usize,
}

/// Run the full epoch/update loop for one rank
///
/// Every participating rank calls this with its own model replica and
/// manager; the gradient collective inside `clip_grad_norm` keeps them
/// in lockstep at each accumulation boundary.
pub fn train(
    model: &mut Ardm,
    dataset: &DialogDataset,
    order: &EpochOrder,
    manager: &DistributedManager,
    reporter: &mut dyn Reporter,
    config: &TrainingConfig,
    optimizer_config: &OptimizerConfig,
) -> Result<TrainSummary> {
    if dataset.is_empty() {
        anyhow::bail!("Cannot train on an empty dataset");
    }

    manager
        .init_training(model)
        .context("Failed to initialize distributed training")?;

    let mut optimizer =
        setup_optimizer(model, optimizer_config).context("Failed to set up optimizer")?;

    let shard_len = order.indices(dataset.len(), 0).len();
    let total_steps = (shard_len * config.num_train_epochs
        / (config.batch_size * config.gradient_accumulation_steps))
        .max(1);
    let warmup_steps = resolve_warmup_steps(optimizer_config, dataset.len());

    let mut schedule =
        WarmupLinearSchedule::new(optimizer_config.learning_rate, warmup_steps, total_steps);

    let cadence = StepCadence::from_config(config);
    let n_positions = model.config().n_positions;

    // Per-rank stream: fragment starts and collator anchors draw from
    // it, so replicas sample independently.
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(manager.rank() as u64));

    let mut update_count = 0usize;
    let mut optimizer_steps = 0usize;
    let mut checkpoints = 0usize;

    if manager.is_main_rank() {
        info!(
            dialogues = dataset.len(),
            shard_len,
            epochs = config.num_train_epochs,
            total_steps,
            warmup_steps,
            world_size = manager.world_size(),
            "starting training"
        );
    }

    for epoch in 0..config.num_train_epochs {
        for index in order.indices(dataset.len(), epoch) {
            let fragment = match dataset.fragment(index, &mut rng) {
                Some(fragment) => fragment,
                // Empty dialogue: nothing to learn from, skip it.
                None => continue,
            };

            let batch = collate(&fragment, n_positions, &mut rng)
                .context("Failed to collate fragment")?;

            let step = model
                .train_one_step(&batch)
                .context("Training step failed")?;
            manager.backward_loss(&step.loss);
            update_count += 1;

            if cadence.optimizer_step_due(update_count) {
                manager
                    .clip_grad_norm(model, config.max_grad_norm)
                    .context("Gradient synchronization failed")?;
                optimizer.step();
                schedule.step(&mut optimizer);
                optimizer.zero_grad();
                optimizer_steps += 1;
            }

            if cadence.logging_due(update_count) {
                reporter.record_scalars(update_count, step.loss.item(), step.kl)?;
            }

            if cadence.save_due(update_count) {
                reporter.save_checkpoint(
                    model,
                    update_count,
                    SaveState {
                        loss: step.loss.item(),
                        kl: step.kl,
                        learning_rate: schedule.current_lr(),
                    },
                )?;
                checkpoints += 1;
            }
        }
    }

    if manager.is_main_rank() {
        info!(update_count, optimizer_steps, "training finished");
    }

    Ok(TrainSummary {
        updates: update_count,
        optimizer_steps,
        checkpoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cadence(accumulation: usize, logging: usize, save: usize) -> StepCadence {
        StepCadence {
            accumulation,
            logging,
            save,
        }
    }

    #[test]
    fn test_four_updates_one_optimizer_step() {
        let cadence = cadence(4, 100, 100);
        let steps: usize = (1..=4)
            .filter(|&u| cadence.optimizer_step_due(u))
            .count();
        assert_eq!(steps, 1);
    }

    #[test]
    fn test_250_updates_two_checkpoints() {
        let cadence = cadence(1, 50, 100);
        let saves: Vec<usize> = (1..=250).filter(|&u| cadence.save_due(u)).collect();
        assert_eq!(saves, vec![100, 200]);
    }

    #[test]
    fn test_triggers_can_coincide() {
        let cadence = cadence(2, 4, 8);
        assert!(cadence.optimizer_step_due(8));
        assert!(cadence.logging_due(8));
        assert!(cadence.save_due(8));
    }

    #[test]
    fn test_zero_cadence_is_clamped() {
        let config = TrainingConfig {
            batch_size: 1,
            num_train_epochs: 1,
            gradient_accumulation_steps: 0,
            logging_steps: 0,
            save_steps: 0,
            max_grad_norm: 1.0,
            seed: 0,
        };
        let cadence = StepCadence::from_config(&config);
        assert_eq!(cadence.accumulation, 1);
    }
}
