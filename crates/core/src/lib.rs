//! Vision Transformer models and pretrained weight loading.
//!
//! ```ignore
//! use candle_core::{DType, Device};
//! use vit_core::{config::ViTConfig, loader::LoadOptions, model::ViT};
//!
//! // B/16 fine-tuned at 384px, adapted to 10 classes.
//! let cfg = ViTConfig { num_classes: 10, image_size: 384, ..ViTConfig::b16() };
//! let model = ViT::from_pretrained("B_16", &cfg, LoadOptions::default(), DType::F32, &Device::Cpu)?;
//! ```

pub mod config;
pub mod fetch;
pub mod loader;
pub mod model;
pub mod pos_embed;
pub mod state_dict;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{ClassifierMode, PretrainedModel, ViTConfig, WeightsSource};
pub use loader::{load_pretrained_weights, LoadOptions, WeightLoadError};
pub use model::ViT;
pub use pos_embed::resize_positional_embedding;
pub use state_dict::{LoadReport, ModelTarget, ParameterSet};
