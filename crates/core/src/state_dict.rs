//! Named parameter sets and the models that receive them.

use std::collections::{BTreeSet, HashMap};

use candle_core::Tensor;
use candle_nn::VarMap;
use thiserror::Error;

/// Parameter name → tensor, as found in a checkpoint.
pub type ParameterSet = HashMap<String, Tensor>;

#[derive(Debug, Error)]
pub enum StateDictError {
    #[error("size mismatch for {name}: checkpoint has shape {actual:?}, model has {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("strict load failed: missing keys {missing:?}, unexpected keys {unexpected:?}")]
    Strict {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Outcome of applying a [`ParameterSet`] to a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Model parameters the set did not provide.
    pub missing: BTreeSet<String>,
    /// Set entries the model has no parameter for.
    pub unexpected: BTreeSet<String>,
}

impl LoadReport {
    fn compare<'a>(
        model: impl IntoIterator<Item = &'a String>,
        params: &ParameterSet,
    ) -> Self {
        let model: BTreeSet<String> = model.into_iter().cloned().collect();
        let missing = model
            .iter()
            .filter(|name| !params.contains_key(*name))
            .cloned()
            .collect();
        let unexpected = params
            .keys()
            .filter(|name| !model.contains(*name))
            .cloned()
            .collect();
        Self {
            missing,
            unexpected,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// A model whose parameters can be read and overwritten by name.
pub trait ModelTarget {
    /// Current parameters, keyed by name. Tensors may share storage with the model.
    fn state_dict(&self) -> ParameterSet;

    /// Copy matching entries of `params` into the model.
    ///
    /// With `strict`, any missing or unexpected name is an error and nothing is
    /// written. Otherwise mismatched names are only reported. Shape mismatches are
    /// errors in both modes and are checked before anything is written.
    fn load_state_dict(
        &self,
        params: &ParameterSet,
        strict: bool,
    ) -> Result<LoadReport, StateDictError>;
}

impl ModelTarget for VarMap {
    fn state_dict(&self) -> ParameterSet {
        let data = self.data().lock().unwrap_or_else(|e| e.into_inner());
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    }

    fn load_state_dict(
        &self,
        params: &ParameterSet,
        strict: bool,
    ) -> Result<LoadReport, StateDictError> {
        let data = self.data().lock().unwrap_or_else(|e| e.into_inner());
        let report = LoadReport::compare(data.keys(), params);

        if strict && !report.is_exact() {
            return Err(StateDictError::Strict {
                missing: report.missing.into_iter().collect(),
                unexpected: report.unexpected.into_iter().collect(),
            });
        }

        let mut names: Vec<&String> = data.keys().filter(|n| params.contains_key(*n)).collect();
        names.sort();

        for name in &names {
            let var = &data[*name];
            let value = &params[*name];
            if value.dims() != var.dims() {
                return Err(StateDictError::ShapeMismatch {
                    name: (*name).clone(),
                    expected: var.dims().to_vec(),
                    actual: value.dims().to_vec(),
                });
            }
        }

        for name in names {
            let var = &data[name];
            let mut value = params[name]
                .to_dtype(var.dtype())?
                .to_device(var.device())?;
            // Tensors from `state_dict()` alias the var; `Var::set` refuses those.
            if value.same_storage(var.as_tensor()) {
                value = value.copy()?;
            }
            var.set(&value)?;
        }

        tracing::debug!(
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            "applied parameter set"
        );
        Ok(report)
    }
}
