use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;
use crate::model::{Extension, LossScaler, Optimizer, StateDict, Trainable};
use crate::rng::{RandomSources, RngState};

/// Everything persisted for one checkpoint step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub rng_state: RngState,
    pub model: StateDict,
    pub optimizer: StateDict,
    #[serde(default)]
    pub extensions: BTreeMap<String, StateDict>,
    pub step: usize,
    #[serde(with = "lossy_f64")]
    pub loss: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaler: Option<StateDict>,
}

impl CheckpointRecord {
    pub fn capture<M: Trainable, O: Optimizer>(
        model: &M,
        optimizer: &O,
        random: &RandomSources,
        step: usize,
        loss: f64,
    ) -> Self {
        CheckpointRecord {
            rng_state: random.snapshot(),
            model: model.state_dict(),
            optimizer: optimizer.state_dict(),
            extensions: BTreeMap::new(),
            step,
            loss,
            scaler: None,
        }
    }

    pub fn with_extensions(mut self, extensions: &[Extension]) -> Self {
        self.extensions = extensions
            .iter()
            .map(|ext| (ext.name.clone(), ext.module.state_dict()))
            .collect();
        self
    }

    pub fn with_scaler(mut self, scaler: Option<StateDict>) -> Self {
        self.scaler = scaler;
        self
    }

    /// Start restoring this record into live collaborators.
    ///
    /// Only the parts that are explicitly requested on the returned
    /// [`Restore`] are touched.
    pub fn restore(&self) -> Restore<'_> {
        Restore {
            record: self,
            strict: true,
        }
    }
}

/// Selective restore of a [`CheckpointRecord`].
pub struct Restore<'a> {
    record: &'a CheckpointRecord,
    strict: bool,
}

impl<'a> Restore<'a> {
    /// Strict mode fails with `MissingState` when an extension has no saved
    /// state, and loads the model with strict key matching.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn model<M: Trainable>(self, model: &mut M) -> Result<Self, CheckpointError> {
        model
            .load_state_dict(&self.record.model, self.strict)
            .map_err(|source| CheckpointError::Restore {
                what: "model".to_string(),
                source,
            })?;
        Ok(self)
    }

    pub fn optimizer<O: Optimizer>(self, optimizer: &mut O) -> Result<Self, CheckpointError> {
        optimizer
            .load_state_dict(&self.record.optimizer)
            .map_err(|source| CheckpointError::Restore {
                what: "optimizer".to_string(),
                source,
            })?;
        Ok(self)
    }

    /// Non-strict restores hand `None` to extensions without saved state.
    pub fn extensions(self, extensions: &mut [Extension]) -> Result<Self, CheckpointError> {
        if self.strict {
            if let Some(missing) = extensions
                .iter()
                .find(|ext| !self.record.extensions.contains_key(&ext.name))
            {
                return Err(CheckpointError::MissingState {
                    key: missing.name.clone(),
                });
            }
        }
        for ext in extensions.iter_mut() {
            let state = self.record.extensions.get(&ext.name);
            ext.module
                .load_state_dict(state)
                .map_err(|source| CheckpointError::Restore {
                    what: format!("extension `{}`", ext.name),
                    source,
                })?;
        }
        Ok(self)
    }

    /// Scaler state is restored only when the record carries it.
    pub fn scaler<M: Trainable>(
        self,
        scaler: &mut dyn LossScaler<M>,
    ) -> Result<Self, CheckpointError> {
        if let Some(state) = &self.record.scaler {
            scaler
                .load_state_dict(state)
                .map_err(|source| CheckpointError::Restore {
                    what: "scaler".to_string(),
                    source,
                })?;
        }
        Ok(self)
    }

    pub fn random_state(self, random: &mut RandomSources) -> Self {
        random.restore(&self.record.rng_state);
        self
    }

    /// `(step, loss)` recorded in the checkpoint.
    pub fn finish(self) -> (usize, f64) {
        (self.record.step, self.record.loss)
    }
}

// Losses can diverge to NaN or infinity, which JSON numbers cannot hold.
mod lossy_f64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
        Null(Option<()>),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            Repr::Number(*value).serialize(serializer)
        } else {
            Repr::Text(value.to_string()).serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Null(_) => Ok(f64::NAN),
        }
    }
}
