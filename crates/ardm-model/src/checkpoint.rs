//! Checkpoint save/load
//!
//! Checkpoints are two files sharing a stem: the backbone weights in
//! SafeTensors format and a JSON metadata file carrying the backbone
//! config, the update step, and training scalars.

use crate::backbone::TransformerLM;
use crate::config::BackboneConfig;
use anyhow::{Context, Result};
use aprender::nn::serialize::{load_model, save_model};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Checkpoint format version for compatibility checking
const CHECKPOINT_VERSION: &str = "1.0.0";

/// Training metadata stored next to the weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Update step at save time
    pub step: usize,
    /// Loss value at this checkpoint
    pub loss: Option<f32>,
    /// Auxiliary KL value at this checkpoint
    pub kl: Option<f32>,
    /// Learning rate at this checkpoint
    pub learning_rate: Option<f32>,
    /// Whether the save was marked best-so-far
    pub is_best_so_far: bool,
    /// Additional metadata as key-value pairs
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for CheckpointMetadata {
    fn default() -> Self {
        Self {
            step: 0,
            loss: None,
            kl: None,
            learning_rate: None,
            is_best_so_far: false,
            extra: HashMap::new(),
        }
    }
}

/// Save a backbone checkpoint
///
/// Writes `<path>.safetensors` (weights) and `<path>.json` (metadata).
///
/// # Errors
/// Returns an error if the directory cannot be created or either file
/// cannot be written.
pub fn save_checkpoint<P: AsRef<Path>>(
    model: &TransformerLM,
    path: P,
    metadata: Option<CheckpointMetadata>,
) -> Result<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create checkpoint directory: {}", parent.display())
        })?;
    }

    let weights_path = path.with_extension("safetensors");
    save_model(model, &weights_path)
        .map_err(|e| anyhow::anyhow!("Failed to save weights to SafeTensors: {}", e))?;

    let metadata_path = path.with_extension("json");
    let metadata_data = CheckpointMetadata {
        step: metadata.as_ref().map(|m| m.step).unwrap_or(0),
        loss: metadata.as_ref().and_then(|m| m.loss),
        kl: metadata.as_ref().and_then(|m| m.kl),
        learning_rate: metadata.as_ref().and_then(|m| m.learning_rate),
        is_best_so_far: metadata.as_ref().map(|m| m.is_best_so_far).unwrap_or(false),
        extra: {
            let mut extra = HashMap::new();
            extra.insert(
                "version".to_string(),
                serde_json::Value::String(CHECKPOINT_VERSION.to_string()),
            );
            extra.insert("config".to_string(), serde_json::to_value(model.config())?);
            if let Some(m) = metadata {
                extra.extend(m.extra);
            }
            extra
        },
    };

    let json_data = serde_json::to_string_pretty(&metadata_data)
        .context("Failed to serialize metadata to JSON")?;
    fs::write(&metadata_path, json_data)
        .with_context(|| format!("Failed to write metadata file: {}", metadata_path.display()))?;

    Ok(())
}

/// Load a backbone checkpoint saved by [`save_checkpoint`]
///
/// # Errors
/// Returns an error if either file is missing, unparseable, or the
/// format version does not match. A missing pretrained checkpoint is a
/// fatal startup condition for training.
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<(TransformerLM, CheckpointMetadata)> {
    let path = path.as_ref();

    let metadata_path = path.with_extension("json");
    let json_data = fs::read_to_string(&metadata_path)
        .with_context(|| format!("Failed to read metadata file: {}", metadata_path.display()))?;

    let metadata: CheckpointMetadata =
        serde_json::from_str(&json_data).context("Failed to parse metadata JSON")?;

    let config_value = metadata
        .extra
        .get("config")
        .ok_or_else(|| anyhow::anyhow!("Missing config in metadata"))?;
    let config: BackboneConfig = serde_json::from_value(config_value.clone())
        .context("Failed to parse config from metadata")?;

    let version = metadata
        .extra
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing version in metadata"))?;
    if version != CHECKPOINT_VERSION {
        anyhow::bail!(
            "Checkpoint version mismatch: expected {}, got {}",
            CHECKPOINT_VERSION,
            version
        );
    }

    let mut model = TransformerLM::new(config);

    let weights_path = path.with_extension("safetensors");
    load_model(&mut model, &weights_path)
        .map_err(|e| anyhow::anyhow!("Failed to load weights from SafeTensors: {}", e))?;

    Ok((model, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_creates_both_files() {
        let model = TransformerLM::new(BackboneConfig::tiny(32));
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("model");

        save_checkpoint(&model, &checkpoint_path, None).unwrap();

        assert!(checkpoint_path.with_extension("json").exists());
        assert!(checkpoint_path.with_extension("safetensors").exists());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let model = TransformerLM::new(BackboneConfig::tiny(32));
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("model");

        let metadata = CheckpointMetadata {
            step: 200,
            loss: Some(2.5),
            kl: Some(0.12),
            learning_rate: Some(1e-4),
            is_best_so_far: true,
            extra: HashMap::new(),
        };

        save_checkpoint(&model, &checkpoint_path, Some(metadata.clone())).unwrap();
        let (_, loaded) = load_checkpoint(&checkpoint_path).unwrap();

        assert_eq!(loaded.step, metadata.step);
        assert_eq!(loaded.loss, metadata.loss);
        assert_eq!(loaded.kl, metadata.kl);
        assert_eq!(loaded.learning_rate, metadata.learning_rate);
        assert!(loaded.is_best_so_far);
    }

    #[test]
    fn test_load_restores_config() {
        let config = BackboneConfig::tiny(32);
        let model = TransformerLM::new(config.clone());
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("model");

        save_checkpoint(&model, &checkpoint_path, None).unwrap();
        let (loaded, _) = load_checkpoint(&checkpoint_path).unwrap();

        assert_eq!(loaded.config(), &config);
    }

    #[test]
    fn test_corrupted_weights_fail_to_load() {
        let model = TransformerLM::new(BackboneConfig::tiny(32));
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("model");

        save_checkpoint(&model, &checkpoint_path, None).unwrap();

        let safetensors_path = checkpoint_path.with_extension("safetensors");
        fs::write(&safetensors_path, b"corrupted").unwrap();

        assert!(load_checkpoint(&checkpoint_path).is_err());
    }
}
