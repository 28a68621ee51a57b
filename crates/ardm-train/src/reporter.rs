//! Rank-gated reporting
//!
//! Logging and checkpointing are capabilities of the coordinating rank
//! only. Instead of scattering rank checks through the loop, the driver
//! talks to a [`Reporter`] selected once at startup: the main rank gets
//! the real implementation, every other rank a no-op.

use crate::checkpointer::{Checkpointer, SaveState};
use crate::metrics::{ScalarWriter, SmoothedMetrics};
use anyhow::Result;
use ardm_model::Ardm;
use std::time::Instant;
use tracing::info;

/// Side-effect sink for the training loop
pub trait Reporter {
    /// Record one logging-cadence tick: raw scalars for the event
    /// stream, smoothed scalars for display
    fn record_scalars(&mut self, step: usize, loss: f32, kl: f32) -> Result<()>;

    /// Persist a checkpoint at a save-cadence tick
    fn save_checkpoint(&mut self, model: &Ardm, step: usize, state: SaveState) -> Result<()>;
}

/// Reporter for non-coordinating ranks: every call is a no-op
pub struct NullReporter;

impl Reporter for NullReporter {
    fn record_scalars(&mut self, _step: usize, _loss: f32, _kl: f32) -> Result<()> {
        Ok(())
    }

    fn save_checkpoint(&mut self, _model: &Ardm, _step: usize, _state: SaveState) -> Result<()> {
        Ok(())
    }
}

/// Reporter for the main rank: metrics stream + checkpoints + progress
pub struct MainReporter {
    writer: ScalarWriter,
    checkpointer: Checkpointer,
    smoothed: SmoothedMetrics,
    last_log: Instant,
    last_logged_step: usize,
}

impl MainReporter {
    /// Build the main-rank reporter
    pub fn new(writer: ScalarWriter, checkpointer: Checkpointer) -> Self {
        Self {
            writer,
            checkpointer,
            smoothed: SmoothedMetrics::default(),
            last_log: Instant::now(),
            last_logged_step: 0,
        }
    }

    /// Current smoothed display metrics
    pub fn smoothed(&self) -> SmoothedMetrics {
        self.smoothed
    }
}

impl Reporter for MainReporter {
    fn record_scalars(&mut self, step: usize, loss: f32, kl: f32) -> Result<()> {
        self.writer.add_scalar("loss", loss, step)?;
        self.writer.add_scalar("kl", kl, step)?;

        self.smoothed = self.smoothed.update(loss, kl);

        let elapsed = self.last_log.elapsed().as_secs_f32();
        let updates = step.saturating_sub(self.last_logged_step);
        let speed = if elapsed > 0.0 {
            updates as f32 / elapsed
        } else {
            0.0
        };
        self.last_log = Instant::now();
        self.last_logged_step = step;

        info!(
            step,
            loss = self.smoothed.loss,
            kl = self.smoothed.kl,
            updates_per_sec = speed,
            "training progress"
        );

        Ok(())
    }

    fn save_checkpoint(&mut self, model: &Ardm, step: usize, state: SaveState) -> Result<()> {
        let path = self.checkpointer.save(model, step, state)?;
        info!(step, path = %path.display(), "saved checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ardm_model::{BackboneConfig, TransformerLM};
    use tempfile::TempDir;

    #[test]
    fn test_null_reporter_has_no_side_effects() {
        let mut reporter = NullReporter;
        let model = Ardm::new(TransformerLM::new(BackboneConfig::tiny(16)));

        reporter.record_scalars(10, 1.0, 0.1).unwrap();
        reporter
            .save_checkpoint(
                &model,
                10,
                SaveState {
                    loss: 1.0,
                    kl: 0.1,
                    learning_rate: 1e-5,
                },
            )
            .unwrap();
    }

    #[test]
    fn test_main_reporter_writes_scalars_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let writer = ScalarWriter::create(dir.path().join("scalars.jsonl")).unwrap();
        let checkpointer = Checkpointer::new(dir.path().join("checkpoints")).unwrap();
        let mut reporter = MainReporter::new(writer, checkpointer);

        let model = Ardm::new(TransformerLM::new(BackboneConfig::tiny(16)));

        reporter.record_scalars(100, 2.0, 0.3).unwrap();
        reporter
            .save_checkpoint(
                &model,
                100,
                SaveState {
                    loss: 2.0,
                    kl: 0.3,
                    learning_rate: 1e-5,
                },
            )
            .unwrap();

        assert!((reporter.smoothed().loss - 0.2).abs() < 1e-6);
        assert!(dir.path().join("scalars.jsonl").exists());
        assert!(dir
            .path()
            .join("checkpoints")
            .join("checkpoint_step_100.json")
            .exists());
    }
}
