//! Training metrics: display smoothing and the scalar event stream

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// EMA factor applied to the previous value
const SMOOTHING: f32 = 0.9;

/// Exponentially smoothed loss/KL for display
///
/// Explicit accumulator state, folded functionally each logging step;
/// never persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothedMetrics {
    pub loss: f32,
    pub kl: f32,
}

impl SmoothedMetrics {
    /// Fold one step's raw scalars into the running averages
    pub fn update(self, loss: f32, kl: f32) -> Self {
        Self {
            loss: self.loss * SMOOTHING + (1.0 - SMOOTHING) * loss,
            kl: self.kl * SMOOTHING + (1.0 - SMOOTHING) * kl,
        }
    }
}

/// One scalar event in the metrics stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub value: f32,
    pub step: usize,
}

/// Append-only JSONL scalar event stream
///
/// One JSON object per line, keyed by tag and update step; consumed by
/// external visualization tooling.
pub struct ScalarWriter {
    writer: BufWriter<File>,
}

impl ScalarWriter {
    /// Create (or append to) an event file
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create metrics directory: {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics file: {:?}", path))?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Append one scalar event
    pub fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            value,
            step,
        };
        serde_json::to_writer(&mut self.writer, &event).context("Failed to serialize event")?;
        self.writer.write_all(b"\n").context("Failed to write event")?;
        self.writer.flush().context("Failed to flush event stream")?;
        Ok(())
    }
}
