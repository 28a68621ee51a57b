//! Periodic checkpointing with bounded retention
//!
//! Every save is marked best-so-far (there is no validation metric to
//! compare against). Disk usage is bounded two ways: at most
//! `num_to_keep` managed snapshots, and when the oldest one is about to
//! be evicted it is instead retained permanently if enough wall-clock
//! time has passed since the last permanently retained snapshot.

use anyhow::{Context, Result};
use ardm_model::{save_checkpoint, Ardm, CheckpointMetadata};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Default number of managed snapshots kept on disk
pub const DEFAULT_NUM_TO_KEEP: usize = 10;

/// Default minimum spacing between permanently retained snapshots
pub const DEFAULT_KEEP_EVERY: Duration = Duration::from_secs(4 * 3600);

/// Scalars recorded into checkpoint metadata at save time
#[derive(Debug, Clone, Copy)]
pub struct SaveState {
    pub loss: f32,
    pub kl: f32,
    pub learning_rate: f32,
}

struct ManagedSnapshot {
    path: PathBuf,
    saved_at: SystemTime,
}

/// Writes step-keyed checkpoints and enforces the retention policy
pub struct Checkpointer {
    output_dir: PathBuf,
    num_to_keep: usize,
    keep_every: Duration,
    managed: Vec<ManagedSnapshot>,
    last_kept: Option<SystemTime>,
}

impl Checkpointer {
    /// Create a checkpointer with the default retention policy
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        Self::with_retention(output_dir, DEFAULT_NUM_TO_KEEP, DEFAULT_KEEP_EVERY)
    }

    /// Create a checkpointer with an explicit retention policy
    pub fn with_retention<P: AsRef<Path>>(
        output_dir: P,
        num_to_keep: usize,
        keep_every: Duration,
    ) -> Result<Self> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", output_dir))?;

        Ok(Self {
            output_dir,
            num_to_keep,
            keep_every,
            managed: Vec::new(),
            last_kept: None,
        })
    }

    /// Path stem for a step's checkpoint files
    pub fn checkpoint_path(&self, step: usize) -> PathBuf {
        self.output_dir.join(format!("checkpoint_step_{}", step))
    }

    /// Save a checkpoint for `step`, marked best-so-far
    pub fn save(&mut self, model: &Ardm, step: usize, state: SaveState) -> Result<PathBuf> {
        self.save_at(model, step, state, SystemTime::now())
    }

    /// Save with an explicit timestamp (time-injectable for tests)
    fn save_at(
        &mut self,
        model: &Ardm,
        step: usize,
        state: SaveState,
        now: SystemTime,
    ) -> Result<PathBuf> {
        let path = self.checkpoint_path(step);

        let mut extra = HashMap::new();
        extra.insert(
            "optimizer_state".to_string(),
            serde_json::json!({ "step": step, "lr": state.learning_rate }),
        );

        let metadata = CheckpointMetadata {
            step,
            loss: Some(state.loss),
            kl: Some(state.kl),
            learning_rate: Some(state.learning_rate),
            is_best_so_far: true,
            extra,
        };

        save_checkpoint(model.backbone(), &path, Some(metadata))
            .with_context(|| format!("Failed to save checkpoint to {:?}", path))?;

        self.managed.push(ManagedSnapshot {
            path: path.clone(),
            saved_at: now,
        });
        self.enforce_retention()?;

        Ok(path)
    }

    /// Number of snapshots currently under management
    pub fn managed_count(&self) -> usize {
        self.managed.len()
    }

    fn enforce_retention(&mut self) -> Result<()> {
        while self.managed.len() > self.num_to_keep {
            let oldest = self.managed.remove(0);

            let spaced_out = match self.last_kept {
                None => true,
                Some(last) => oldest
                    .saved_at
                    .duration_since(last)
                    .map(|elapsed| elapsed >= self.keep_every)
                    .unwrap_or(false),
            };

            if spaced_out {
                // Old enough to matter: keep it on disk permanently and
                // stop tracking it.
                self.last_kept = Some(oldest.saved_at);
            } else {
                remove_checkpoint_files(&oldest.path)?;
            }
        }
        Ok(())
    }
}

fn remove_checkpoint_files(path: &Path) -> Result<()> {
    for ext in ["safetensors", "json"] {
        let file = path.with_extension(ext);
        if file.exists() {
            fs::remove_file(&file)
                .with_context(|| format!("Failed to remove old checkpoint file {:?}", file))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ardm_model::{BackboneConfig, TransformerLM};
    use tempfile::TempDir;

    fn tiny_model() -> Ardm {
        Ardm::new(TransformerLM::new(BackboneConfig::tiny(16)))
    }

    fn state() -> SaveState {
        SaveState {
            loss: 1.0,
            kl: 0.1,
            learning_rate: 1e-5,
        }
    }

    #[test]
    fn test_save_marks_best_so_far() {
        let dir = TempDir::new().unwrap();
        let mut checkpointer = Checkpointer::new(dir.path()).unwrap();
        let model = tiny_model();

        let path = checkpointer.save(&model, 100, state()).unwrap();
        let (_, metadata) = ardm_model::load_checkpoint(&path).unwrap();
        assert!(metadata.is_best_so_far);
        assert_eq!(metadata.step, 100);
    }

    #[test]
    fn test_eviction_inside_window_deletes_files() {
        let dir = TempDir::new().unwrap();
        let mut checkpointer =
            Checkpointer::with_retention(dir.path(), 2, Duration::from_secs(3600)).unwrap();
        let model = tiny_model();

        let t0 = SystemTime::UNIX_EPOCH;
        // First eviction always retains (nothing was kept yet), so the
        // window applies from the second eviction on.
        for (i, step) in [100usize, 200, 300, 400].iter().enumerate() {
            checkpointer
                .save_at(&model, *step, state(), t0 + Duration::from_secs(60 * i as u64))
                .unwrap();
        }

        assert_eq!(checkpointer.managed_count(), 2);
        // step 100 was retained permanently, step 200 fell inside the
        // hour window and was deleted.
        assert!(checkpointer.checkpoint_path(100).with_extension("json").exists());
        assert!(!checkpointer.checkpoint_path(200).with_extension("json").exists());
        assert!(checkpointer.checkpoint_path(300).with_extension("json").exists());
        assert!(checkpointer.checkpoint_path(400).with_extension("json").exists());
    }

    #[test]
    fn test_eviction_past_window_retains_permanently() {
        let dir = TempDir::new().unwrap();
        let mut checkpointer =
            Checkpointer::with_retention(dir.path(), 1, Duration::from_secs(3600)).unwrap();
        let model = tiny_model();

        let t0 = SystemTime::UNIX_EPOCH;
        checkpointer.save_at(&model, 100, state(), t0).unwrap();
        checkpointer
            .save_at(&model, 200, state(), t0 + Duration::from_secs(2 * 3600))
            .unwrap();
        checkpointer
            .save_at(&model, 300, state(), t0 + Duration::from_secs(4 * 3600))
            .unwrap();

        // Both evicted snapshots cleared the spacing window, so all
        // three survive on disk even though only one is managed.
        assert_eq!(checkpointer.managed_count(), 1);
        for step in [100, 200, 300] {
            assert!(checkpointer.checkpoint_path(step).with_extension("json").exists());
        }
    }

    #[test]
    fn test_managed_count_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mut checkpointer =
            Checkpointer::with_retention(dir.path(), 3, Duration::from_secs(3600)).unwrap();
        let model = tiny_model();

        let t0 = SystemTime::UNIX_EPOCH;
        for i in 0..8usize {
            checkpointer
                .save_at(&model, i * 100, state(), t0 + Duration::from_secs(i as u64))
                .unwrap();
        }

        assert_eq!(checkpointer.managed_count(), 3);
    }
}
