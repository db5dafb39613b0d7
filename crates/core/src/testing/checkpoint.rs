use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Result};

use crate::config::ViTConfig;
use crate::model::ViT;
use crate::state_dict::{ModelTarget, ParameterSet};

/// A complete checkpoint for `cfg`, taken from a freshly initialised model.
///
/// Tensors are copied, so they do not alias any model's storage.
pub fn synthetic_checkpoint(cfg: &ViTConfig) -> Result<ParameterSet> {
    let model = ViT::new(cfg, DType::F32, &Device::Cpu)?;
    model
        .state_dict()
        .into_iter()
        .map(|(name, t)| Ok((name, t.copy()?)))
        .collect()
}

/// Write `params` as `<dir>/<name>.safetensors` and return the path.
pub fn write_checkpoint(dir: &Path, name: &str, params: &ParameterSet) -> Result<PathBuf> {
    let path = dir.join(format!("{name}.safetensors"));
    candle_core::safetensors::save(params, &path)?;
    Ok(path)
}
