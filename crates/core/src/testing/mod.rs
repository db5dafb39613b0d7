//! Shared test utilities for vit-core.
//!
//! Tiny configurations and synthetic checkpoints for exercising the loader
//! without downloading real weights.

mod checkpoint;
mod tiny_config;

pub use checkpoint::{synthetic_checkpoint, write_checkpoint};
pub use tiny_config::tiny_vit_config;
