use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building a run from its configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unknown noise type \"{0}\"")]
    UnknownNoiseType(String),

    #[error("noise token \"{0}\" has no stddev (expected <kind>_<stddev>)")]
    MissingNoiseStddev(String),

    #[error("noise token \"{token}\" has an invalid stddev: {reason}")]
    InvalidNoiseStddev { token: String, reason: String },

    #[error("nb_epochs and total_timesteps cannot both be set")]
    ConflictingEpochSettings,

    #[error("invalid value for {field}: {reason}")]
    InvalidHyperparameter { field: &'static str, reason: String },

    #[error("unknown activation function \"{0}\"")]
    UnknownActivation(String),

    #[error("unknown curiosity type \"{0}\" (expected state-action or state)")]
    UnknownCuriosityType(String),
}

/// Errors that abort a training run.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("shape mismatch in {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("cannot sample {requested} transitions from an empty replay buffer")]
    EmptyBuffer { requested: usize },

    #[error("checkpoint not found at {0}")]
    CheckpointNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "rl-nn")]
    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
}
