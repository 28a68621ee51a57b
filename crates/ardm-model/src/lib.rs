//! Autoregressive dialogue-response model
//!
//! This crate provides:
//! - a decoder-only transformer backbone with learned absolute position
//!   embeddings (`n_positions = 1024`)
//! - the ARDM training step: turn-by-turn forward over a dialogue
//!   fragment with a shared cache, returning the LM loss and an
//!   auxiliary KL scalar
//! - checkpoint save/load (SafeTensors weights + JSON metadata)
//!
//! # Example
//!
//! ```no_run
//! use ardm_model::{Ardm, BackboneConfig, DialogBatch, TransformerLM, TurnInput};
//! use aprender::autograd::Tensor;
//!
//! let backbone = TransformerLM::new(BackboneConfig::default());
//! let mut model = Ardm::new(backbone);
//!
//! let batch = DialogBatch {
//!     turns: vec![TurnInput {
//!         tokens: Tensor::new(&[1.0, 2.0, 3.0], &[1, 3]),
//!         positions: Tensor::new(&[10.0, 11.0, 12.0], &[1, 3]),
//!     }],
//! };
//!
//! let out = model.train_one_step(&batch)?;
//! out.loss.backward();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod ardm;
pub mod attention;
pub mod backbone;
pub mod checkpoint;
pub mod config;
pub mod embedding;
pub mod mlp;
pub mod norm;
pub mod regularizer;

/// ARDM training step and its batch types
pub use ardm::{Ardm, DialogBatch, StepOutput, TurnInput};

/// Dialogue cache threading turn context through the backbone
pub use attention::DialogCache;

/// Transformer backbone
pub use backbone::TransformerLM;

/// Checkpoint management
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointMetadata};

/// Backbone configuration
pub use config::BackboneConfig;

/// Auxiliary KL regularizers
pub use regularizer::{AuxRegularizer, NoRegularizer, UniformPriorKl};

// Re-export common types for convenience
/// Result type alias for error handling
pub use anyhow::Result;
