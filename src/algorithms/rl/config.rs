//! Hyperparameters and run layout for multi-agent DDPG training.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TrainError};

/// Number of epochs used when neither `nb_epochs` nor `total_timesteps` is set.
pub const DEFAULT_NB_EPOCHS: usize = 500;

/// Training configuration.
///
/// Every field has a default, so a JSON config file only needs to list the
/// values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // --- Schedule ---
    /// Explicit epoch count. Mutually exclusive with `total_timesteps`.
    pub nb_epochs: Option<usize>,
    /// Total rollout steps; converted to epochs when `nb_epochs` is unset.
    pub total_timesteps: Option<usize>,
    /// Cycles per epoch.
    pub nb_epoch_cycles: usize,
    /// Environment steps per cycle.
    pub nb_rollout_steps: usize,
    /// Gradient steps per cycle, per trainer.
    pub nb_train_steps: usize,
    /// Evaluation steps per cycle (only used with an evaluation env).
    pub nb_eval_steps: usize,

    // --- Learning ---
    /// Discount factor γ.
    pub gamma: f64,
    /// Target network smoothing factor τ.
    pub tau: f64,
    /// Actor learning rate.
    pub actor_lr: f64,
    /// Critic learning rate.
    pub critic_lr: f64,
    /// L2 penalty on critic hidden weights.
    pub critic_l2_reg: f64,
    /// Gradient norm clip, if any.
    pub clip_norm: Option<f64>,
    /// Multiplier applied to rewards in the critic target.
    pub reward_scale: f64,
    /// Minibatch size.
    pub batch_size: usize,
    /// Replay buffer capacity per trainer.
    pub memory_limit: usize,
    /// Normalize observations with running statistics.
    pub normalize_observations: bool,
    /// Train the critic on returns standardized with running statistics.
    pub normalize_returns: bool,

    // --- Exploration ---
    /// Noise specification, e.g. `"adaptive-param_0.2"` or `"normal_0.1,ou_0.05"`.
    pub noise_type: String,
    /// Adapt parameter noise every this many train steps.
    pub param_noise_adaption_interval: usize,

    // --- Networks ---
    /// Hidden layer sizes of actor and critic heads.
    pub hidden_sizes: Vec<usize>,
    /// Activation of the hidden layers (`relu`, `tanh`, `elu`).
    pub activation: String,
    /// Apply layer normalization after each hidden layer.
    pub layer_norm: bool,
    /// Intrinsic curiosity bonus scale; `None` disables the module.
    pub curiosity_beta: Option<f64>,
    /// Curiosity model: `state-action` (inverse + forward) or `state`.
    pub curiosity_type: String,

    // --- Bookkeeping ---
    /// Save a checkpoint every this many epochs (0 disables periodic saves).
    pub save_interval: usize,
    /// Run name to restore from (`<results_dir>/<load_path>/checkpoints/checkpoints-final`).
    pub load_path: Option<String>,
    /// Random seed.
    pub seed: Option<u64>,
    /// Where runs are written.
    pub results_dir: PathBuf,
    /// Name of this run (subdirectory of `results_dir`).
    pub run_name: String,
    /// Prefix prepended to every logged metric key.
    pub metrics_root: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            nb_epochs: None,
            total_timesteps: None,
            nb_epoch_cycles: 20,
            nb_rollout_steps: 100,
            nb_train_steps: 50,
            nb_eval_steps: 100,
            gamma: 0.99,
            tau: 0.01,
            actor_lr: 1e-4,
            critic_lr: 1e-3,
            critic_l2_reg: 1e-2,
            clip_norm: None,
            reward_scale: 1.0,
            batch_size: 64,
            memory_limit: 1_000_000,
            normalize_observations: true,
            normalize_returns: false,
            noise_type: "adaptive-param_0.2".to_string(),
            param_noise_adaption_interval: 50,
            hidden_sizes: vec![64, 64],
            activation: "relu".to_string(),
            layer_norm: false,
            curiosity_beta: None,
            curiosity_type: "state-action".to_string(),
            save_interval: 100,
            load_path: None,
            seed: None,
            results_dir: PathBuf::from("results"),
            run_name: "maddpg".to_string(),
            metrics_root: String::new(),
        }
    }
}

impl TrainingConfig {
    /// Loads a configuration from a JSON file; missing fields keep defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Resolves the number of epochs to run.
    ///
    /// An explicit `nb_epochs` wins; otherwise `total_timesteps` is divided by
    /// the steps per epoch; otherwise [`DEFAULT_NB_EPOCHS`].
    pub fn resolved_epochs(&self) -> Result<usize, ConfigError> {
        match (self.nb_epochs, self.total_timesteps) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingEpochSettings),
            (Some(n), None) => Ok(n),
            (None, Some(total)) => {
                let per_epoch = self.nb_epoch_cycles * self.nb_rollout_steps;
                if per_epoch == 0 {
                    return Err(invalid(
                        "total_timesteps",
                        "nb_epoch_cycles * nb_rollout_steps must be positive",
                    ));
                }
                Ok(total / per_epoch)
            }
            (None, None) => Ok(DEFAULT_NB_EPOCHS),
        }
    }

    /// Checks ranges of the numeric hyperparameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolved_epochs()?;
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be positive"));
        }
        if self.memory_limit == 0 {
            return Err(invalid("memory_limit", "must be positive"));
        }
        if self.nb_epoch_cycles == 0 {
            return Err(invalid("nb_epoch_cycles", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.tau) {
            return Err(invalid("tau", format!("{} is outside [0, 1]", self.tau)));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(invalid("gamma", format!("{} is outside [0, 1]", self.gamma)));
        }
        if self.actor_lr <= 0.0 {
            return Err(invalid("actor_lr", "must be positive"));
        }
        if self.critic_lr <= 0.0 {
            return Err(invalid("critic_lr", "must be positive"));
        }
        if let Some(clip) = self.clip_norm {
            if clip <= 0.0 {
                return Err(invalid("clip_norm", "must be positive"));
            }
        }
        if self.param_noise_adaption_interval == 0 {
            return Err(invalid("param_noise_adaption_interval", "must be positive"));
        }
        Activation::from_str(&self.activation)?;
        CuriosityKind::from_str(&self.curiosity_type)?;
        Ok(())
    }

    /// Filesystem layout of this run.
    pub fn run_paths(&self) -> RunPaths {
        RunPaths::new(&self.results_dir, &self.run_name)
    }

    /// Checkpoint to restore from, if `load_path` is set.
    pub fn load_checkpoint_dir(&self) -> Option<PathBuf> {
        self.load_path
            .as_ref()
            .map(|run| RunPaths::new(&self.results_dir, run).final_checkpoint_dir())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidHyperparameter {
        field,
        reason: reason.into(),
    }
}

/// Directory layout of a run: `<results_dir>/<run_name>/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    log_dir: PathBuf,
}

impl RunPaths {
    pub fn new(results_dir: impl AsRef<Path>, run_name: &str) -> Self {
        Self {
            log_dir: results_dir.as_ref().join(run_name),
        }
    }

    /// Directory receiving tabular logs.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.log_dir.join("checkpoints")
    }

    /// `checkpoints/checkpoints-<epoch>` with the epoch zero-padded to five digits.
    pub fn epoch_checkpoint_dir(&self, epoch: usize) -> PathBuf {
        self.checkpoints_dir()
            .join(format!("checkpoints-{:05}", epoch))
    }

    pub fn final_checkpoint_dir(&self) -> PathBuf {
        self.checkpoints_dir().join("checkpoints-final")
    }
}

/// Hidden-layer activation of the fully-connected heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Tanh,
    Elu,
}

impl FromStr for Activation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "tanh" => Ok(Activation::Tanh),
            "elu" => Ok(Activation::Elu),
            other => Err(ConfigError::UnknownActivation(other.to_string())),
        }
    }
}

/// Which dynamics model produces the curiosity bonus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CuriosityKind {
    /// Inverse and forward models in feature space.
    #[default]
    StateAction,
    /// Forward model predicting the next raw observation.
    State,
}

impl FromStr for CuriosityKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "state-action" | "icm" => Ok(CuriosityKind::StateAction),
            "state" => Ok(CuriosityKind::State),
            other => Err(ConfigError::UnknownCuriosityType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = TrainingConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.batch_size, 64);
        assert_eq!(cfg.noise_type, "adaptive-param_0.2");
    }

    #[test]
    fn epochs_default_when_unset() {
        let cfg = TrainingConfig::default();
        assert_eq!(cfg.resolved_epochs().unwrap(), DEFAULT_NB_EPOCHS);
    }

    #[test]
    fn epochs_from_total_timesteps() {
        let cfg = TrainingConfig {
            total_timesteps: Some(10_000),
            nb_epoch_cycles: 10,
            nb_rollout_steps: 100,
            ..TrainingConfig::default()
        };
        assert_eq!(cfg.resolved_epochs().unwrap(), 10);
    }

    #[test]
    fn epochs_conflict_is_rejected() {
        let cfg = TrainingConfig {
            nb_epochs: Some(3),
            total_timesteps: Some(10_000),
            ..TrainingConfig::default()
        };
        assert_eq!(
            cfg.resolved_epochs(),
            Err(ConfigError::ConflictingEpochSettings)
        );
    }

    #[test]
    fn tau_out_of_range_is_rejected() {
        let cfg = TrainingConfig {
            tau: 1.5,
            ..TrainingConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidHyperparameter { field: "tau", .. })
        ));
    }

    #[test]
    fn unknown_activation_is_rejected() {
        let cfg = TrainingConfig {
            activation: "swish".to_string(),
            ..TrainingConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::UnknownActivation("swish".to_string()))
        );
    }

    #[test]
    fn curiosity_type_is_parsed_and_validated() {
        assert_eq!("state".parse::<CuriosityKind>(), Ok(CuriosityKind::State));
        assert_eq!("ICM".parse::<CuriosityKind>(), Ok(CuriosityKind::StateAction));
        let cfg = TrainingConfig {
            curiosity_type: "pixel".to_string(),
            ..TrainingConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::UnknownCuriosityType("pixel".to_string()))
        );
    }

    #[test]
    fn checkpoint_paths_follow_run_layout() {
        let cfg = TrainingConfig {
            results_dir: PathBuf::from("/tmp/results"),
            run_name: "run1".to_string(),
            load_path: Some("old".to_string()),
            ..TrainingConfig::default()
        };
        let paths = cfg.run_paths();
        assert_eq!(
            paths.epoch_checkpoint_dir(7),
            PathBuf::from("/tmp/results/run1/checkpoints/checkpoints-00007")
        );
        assert_eq!(
            paths.final_checkpoint_dir(),
            PathBuf::from("/tmp/results/run1/checkpoints/checkpoints-final")
        );
        assert_eq!(
            cfg.load_checkpoint_dir(),
            Some(PathBuf::from(
                "/tmp/results/old/checkpoints/checkpoints-final"
            ))
        );
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: TrainingConfig =
            serde_json::from_str(r#"{"batch_size": 32, "noise_type": "ou_0.3"}"#).unwrap();
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.noise_type, "ou_0.3");
        assert_eq!(cfg.nb_rollout_steps, 100);
    }
}
