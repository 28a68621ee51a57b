//! Training pipeline for the autoregressive dialogue model
//!
//! This crate wires the corpus, fragment sampler, collator, distributed
//! manager, optimizer/schedule, checkpointer, and metrics into the
//! epoch/update training loop.

pub mod checkpointer;
pub mod collator;
pub mod config;
pub mod corpus;
pub mod dataset;
pub mod distributed;
pub mod metrics;
pub mod optimizer;
pub mod reporter;
pub mod sampler;
pub mod train;
