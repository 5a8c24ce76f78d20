use std::path::PathBuf;

use crate::model::BoxError;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse checkpoint {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("cannot find `{key}` in the checkpoint")]
    MissingState { key: String },

    #[error("failed to restore {what}: {source}")]
    Restore {
        what: String,
        #[source]
        source: BoxError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("failed to render TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}

/// Failures of a summary sink. Never abort a run.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("summary I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("summary serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("summary sink rejected `{name}`: {reason}")]
    Rejected { name: String, reason: String },
}

/// Errors that abort a training run.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("{0}")]
    Collaborator(#[from] BoxError),

    #[error("failed to open summary sink: {0}")]
    Sink(#[from] SinkError),

    #[error("dataset produced no batches")]
    EmptyDataset,

    #[error("step function returned no loss for a training batch")]
    MissingLoss,

    #[error("metric `{0}` is missing or not a scalar")]
    MissingMetric(String),

    #[error("failed to prepare {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
}
