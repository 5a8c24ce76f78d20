use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::metrics::{AverageKind, Ema};
use crate::training::trainer::TrainerConfig;

/// Reducer used for epoch-level metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub average: AverageKind,
    /// Only used by the `ema` reducer.
    pub ema_decay: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            average: AverageKind::Ema,
            ema_decay: Ema::DEFAULT_DECAY,
        }
    }
}

/// Synthetic regression data for the reference job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub samples: usize,
    pub val_samples: usize,
    pub features: usize,
    pub batch_size: usize,
    pub noise_std: f32,
    /// Seed for generating the samples, independent of the run's seed.
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            samples: 1024,
            val_samples: 256,
            features: 8,
            batch_size: 32,
            noise_std: 0.1,
            seed: 42,
        }
    }
}

/// Optimizer settings for the reference job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub lr: f64,
    pub weight_decay: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_grad_norm: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            lr: 0.01,
            weight_decay: 0.0,
            clip_grad_norm: None,
        }
    }
}

/// Top-level application configuration, loadable from TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub training: TrainerConfig,
    pub metrics: MetricsConfig,
    pub data: DataConfig,
    pub model: ModelConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.training.validate()?;

        if !(self.metrics.ema_decay > 0.0 && self.metrics.ema_decay < 1.0) {
            return Err(ConfigError::Validation(
                "metrics.ema_decay must be in (0, 1)".into(),
            ));
        }

        if self.data.samples == 0 {
            return Err(ConfigError::Validation(
                "data.samples must be > 0".into(),
            ));
        }
        if self.data.features == 0 {
            return Err(ConfigError::Validation(
                "data.features must be > 0".into(),
            ));
        }
        if self.data.batch_size == 0 {
            return Err(ConfigError::Validation(
                "data.batch_size must be > 0".into(),
            ));
        }
        if !(self.data.noise_std >= 0.0 && self.data.noise_std.is_finite()) {
            return Err(ConfigError::Validation(
                "data.noise_std must be a finite value >= 0".into(),
            ));
        }

        if self.model.lr <= 0.0 {
            return Err(ConfigError::Validation("model.lr must be > 0".into()));
        }
        if self.model.weight_decay < 0.0 {
            return Err(ConfigError::Validation(
                "model.weight_decay must be >= 0".into(),
            ));
        }
        if let Some(max_norm) = self.model.clip_grad_norm {
            if max_norm <= 0.0 {
                return Err(ConfigError::Validation(
                    "model.clip_grad_norm must be > 0".into(),
                ));
            }
        }

        Ok(())
    }

    /// Generate a TOML string with all default values (useful for creating
    /// example config files).
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&AppConfig::default())?)
    }
}
