//! Loading pretrained checkpoints into a ViT.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::{pretrained_model, ClassifierMode, WeightsSource};
use crate::fetch::{self, FetchError};
use crate::pos_embed::{resize_positional_embedding, ResizeError};
use crate::state_dict::{LoadReport, ModelTarget, ParameterSet, StateDictError};

pub const PATCH_EMBEDDING_KEYS: [&str; 2] = ["patch_embedding.weight", "patch_embedding.bias"];
pub const FC_KEYS: [&str; 2] = ["fc.weight", "fc.bias"];
pub const POSITIONAL_EMBEDDING_KEY: &str = "positional_embedding.pos_embedding";

/// Errors from loading pretrained weights.
///
/// If the key check fails, the parameters that did match have already been
/// written to the model; the load is not rolled back.
#[derive(Debug, Error)]
pub enum WeightLoadError {
    #[error("unknown pretrained model: {0}")]
    UnknownModel(String),
    #[error("no pretrained weights are published for {0}")]
    NoWeights(String),
    #[error("parameter {0} not found")]
    MissingParameter(String),
    #[error("missing keys when loading pretrained weights: {0:?}")]
    MissingKeys(Vec<String>),
    #[error("unexpected keys when loading pretrained weights: {0:?}")]
    UnexpectedKeys(Vec<String>),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("positional embedding resize failed: {0}")]
    Resize(#[from] ResizeError),
    #[error(transparent)]
    StateDict(#[from] StateDictError),
}

/// Options for [`load_pretrained_weights`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Local checkpoint; takes precedence over any download source.
    pub weights_path: Option<PathBuf>,
    /// Download source overriding the registry entry.
    pub source: Option<WeightsSource>,
    /// Keep `patch_embedding.*` from the checkpoint.
    pub load_first_conv: bool,
    /// Keep `fc.*` from the checkpoint.
    pub load_fc: bool,
    /// Resample the checkpoint's positional embedding to the model's grid.
    pub resize_positional_embedding: bool,
    /// Target image size, reported when resizing.
    pub image_size: Option<usize>,
    /// Log completion at info level.
    pub verbose: bool,
    /// Directory for URL downloads; defaults to [`fetch::default_cache_dir`].
    pub cache_dir: Option<PathBuf>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            weights_path: None,
            source: None,
            load_first_conv: true,
            load_fc: true,
            resize_positional_embedding: false,
            image_size: None,
            verbose: true,
            cache_dir: None,
        }
    }
}

impl LoadOptions {
    pub fn with_weights_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.weights_path = Some(path.into());
        self
    }

    /// Parameter names deliberately dropped from the checkpoint.
    pub fn excluded_keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if !self.load_first_conv {
            keys.extend(PATCH_EMBEDDING_KEYS);
        }
        if !self.load_fc {
            keys.extend(FC_KEYS);
        }
        keys
    }
}

/// Load the pretrained checkpoint for `model_name` into `model`.
///
/// The checkpoint comes from `options.weights_path` when set, otherwise from
/// `options.source`, otherwise from the registry entry for `model_name`.
/// `classifier` tells the positional embedding resize whether the first
/// token is a class token.
pub fn load_pretrained_weights(
    model: &impl ModelTarget,
    model_name: &str,
    classifier: ClassifierMode,
    options: &LoadOptions,
) -> Result<LoadReport, WeightLoadError> {
    let mut state_dict = read_checkpoint(model_name, options)?;

    let excluded = options.excluded_keys();
    for key in &excluded {
        state_dict
            .remove(*key)
            .ok_or_else(|| WeightLoadError::MissingParameter(key.to_string()))?;
    }

    if options.resize_positional_embedding {
        let posemb = state_dict
            .get(POSITIONAL_EMBEDDING_KEY)
            .ok_or_else(|| WeightLoadError::MissingParameter(POSITIONAL_EMBEDDING_KEY.into()))?;
        let posemb_new = model
            .state_dict()
            .remove(POSITIONAL_EMBEDDING_KEY)
            .ok_or_else(|| WeightLoadError::MissingParameter(POSITIONAL_EMBEDDING_KEY.into()))?;
        tracing::debug!(
            model = model_name,
            image_size = ?options.image_size,
            from = ?posemb.dims(),
            to = ?posemb_new.dims(),
            "resizing positional embedding"
        );
        let resized = resize_positional_embedding(posemb, &posemb_new, classifier)?;
        state_dict.insert(POSITIONAL_EMBEDDING_KEY.to_string(), resized);
    }

    let report = model.load_state_dict(&state_dict, false)?;
    check_report(&report, options.load_fc)?;

    if options.verbose {
        tracing::info!("Loaded pretrained weights for {model_name}");
    } else {
        tracing::debug!(model = model_name, "loaded pretrained weights");
    }
    Ok(report)
}

fn read_checkpoint(model_name: &str, options: &LoadOptions) -> Result<ParameterSet, WeightLoadError> {
    if let Some(path) = &options.weights_path {
        return Ok(fetch::load_file(path)?);
    }

    let source = match &options.source {
        Some(source) => source.clone(),
        None => pretrained_model(model_name)
            .ok_or_else(|| WeightLoadError::UnknownModel(model_name.to_string()))?
            .source
            .clone()
            .ok_or_else(|| WeightLoadError::NoWeights(model_name.to_string()))?,
    };
    Ok(fetch::load_source(&source, options.cache_dir.as_deref())?)
}

/// The only acceptable missing keys are the classifier's, and only when it
/// was skipped on purpose. Unexpected keys are never acceptable.
fn check_report(report: &LoadReport, load_fc: bool) -> Result<(), WeightLoadError> {
    if load_fc {
        if !report.missing.is_empty() {
            return Err(WeightLoadError::MissingKeys(
                report.missing.iter().cloned().collect(),
            ));
        }
    } else {
        let expected: BTreeSet<String> = FC_KEYS.iter().map(|k| k.to_string()).collect();
        if report.missing != expected {
            return Err(WeightLoadError::MissingKeys(
                report.missing.iter().cloned().collect(),
            ));
        }
    }

    if !report.unexpected.is_empty() {
        return Err(WeightLoadError::UnexpectedKeys(
            report.unexpected.iter().cloned().collect(),
        ));
    }
    Ok(())
}
