//! Run configuration: CLI flags, optional config file, resolution

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Train an autoregressive dialogue-response model
#[derive(Parser, Debug)]
#[command(name = "ardm-train")]
#[command(about = "Train an autoregressive dialogue-response model", long_about = None)]
pub struct Args {
    /// Path to an optional JSON config file; flags override its values
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Dialogue corpus (JSON object: dialogue id -> turn array)
    #[arg(long, value_name = "PATH", default_value = "dialog_corpus.json")]
    pub train_corpus: PathBuf,

    /// Pretrained backbone checkpoint stem (required)
    #[arg(long, value_name = "PATH", required = true)]
    pub backbone: PathBuf,

    /// Pretrained tokenizer vocabulary file (required)
    #[arg(long, value_name = "PATH", required = true)]
    pub tokenizer: PathBuf,

    /// Directory for checkpoints and the metrics stream
    #[arg(long, value_name = "PATH", default_value = "runs")]
    pub output_dir: PathBuf,

    /// Dialogues per update
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Number of passes over the corpus
    #[arg(long)]
    pub num_train_epochs: Option<usize>,

    /// Updates per optimizer step
    #[arg(long)]
    pub gradient_accumulation_steps: Option<usize>,

    /// Peak learning rate
    #[arg(long)]
    pub learning_rate: Option<f32>,

    /// Warmup steps; negative derives the count from --warmup-ratio
    #[arg(long, allow_hyphen_values = true)]
    pub warmup_steps: Option<i64>,

    /// Warmup ratio of the dataset length
    #[arg(long)]
    pub warmup_ratio: Option<f32>,

    /// Updates between scalar logging
    #[arg(long)]
    pub logging_steps: Option<usize>,

    /// Updates between checkpoint saves
    #[arg(long)]
    pub save_steps: Option<usize>,

    /// Gradient clipping threshold
    #[arg(long)]
    pub max_grad_norm: Option<f32>,

    /// Token budget for one sampled fragment
    #[arg(long)]
    pub fragment_budget: Option<usize>,

    /// Number of data-parallel replicas
    #[arg(long)]
    pub world_size: Option<usize>,

    /// Seed for data order, sampling, and collation
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Optional overrides loaded from a JSON config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub batch_size: Option<usize>,
    pub num_train_epochs: Option<usize>,
    pub gradient_accumulation_steps: Option<usize>,
    pub learning_rate: Option<f32>,
    pub warmup_steps: Option<i64>,
    pub warmup_ratio: Option<f32>,
    pub logging_steps: Option<usize>,
    pub save_steps: Option<usize>,
    pub max_grad_norm: Option<f32>,
    pub fragment_budget: Option<usize>,
    pub world_size: Option<usize>,
    pub seed: Option<u64>,
}

impl ConfigFile {
    /// Load overrides from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

/// Fully resolved run configuration
///
/// Resolution order per field: CLI flag, then config file, then the
/// built-in default.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub train_corpus: PathBuf,
    pub backbone: PathBuf,
    pub tokenizer: PathBuf,
    pub output_dir: PathBuf,
    pub batch_size: usize,
    pub num_train_epochs: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f32,
    pub warmup_steps: i64,
    pub warmup_ratio: f32,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub max_grad_norm: f32,
    pub fragment_budget: usize,
    pub world_size: usize,
    pub seed: Option<u64>,
}

impl RunConfig {
    /// Resolve the effective configuration
    pub fn resolve(args: &Args, file: Option<ConfigFile>) -> Self {
        let file = file.unwrap_or_default();

        Self {
            train_corpus: args.train_corpus.clone(),
            backbone: args.backbone.clone(),
            tokenizer: args.tokenizer.clone(),
            output_dir: args.output_dir.clone(),
            batch_size: args.batch_size.or(file.batch_size).unwrap_or(1),
            num_train_epochs: args.num_train_epochs.or(file.num_train_epochs).unwrap_or(2),
            gradient_accumulation_steps: args
                .gradient_accumulation_steps
                .or(file.gradient_accumulation_steps)
                .unwrap_or(8),
            learning_rate: args.learning_rate.or(file.learning_rate).unwrap_or(1e-5),
            warmup_steps: args.warmup_steps.or(file.warmup_steps).unwrap_or(-1),
            warmup_ratio: args.warmup_ratio.or(file.warmup_ratio).unwrap_or(0.1),
            logging_steps: args.logging_steps.or(file.logging_steps).unwrap_or(50),
            save_steps: args.save_steps.or(file.save_steps).unwrap_or(200),
            max_grad_norm: args.max_grad_norm.or(file.max_grad_norm).unwrap_or(1.0),
            fragment_budget: args.fragment_budget.or(file.fragment_budget).unwrap_or(800),
            world_size: args.world_size.or(file.world_size).unwrap_or(1),
            seed: args.seed.or(file.seed),
        }
    }
}
