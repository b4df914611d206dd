//! Multi-agent reinforcement learning on vectorized environments.
//!
//! The training loop, replay, exploration noise, metrics and checkpointing are
//! plain Rust and always available. Neural networks, the recurrent policy, the
//! curiosity models and the DDPG trainer additionally require the `rl-nn`
//! feature flag (which brings in `tch`).

pub mod checkpoint;
pub mod config;
pub mod environment;
pub mod logger;
pub mod metrics;
pub mod noise;
pub mod normalize;
pub mod training;
pub mod types;

#[cfg(feature = "rl-nn")]
pub mod curiosity;
#[cfg(feature = "rl-nn")]
pub mod network;
#[cfg(feature = "rl-nn")]
pub mod recurrent;

pub use checkpoint::Checkpointer;
pub use config::{Activation, CuriosityKind, RunPaths, TrainingConfig};
pub use environment::{LaneKeepingConfig, LaneKeepingEnv, MultiAgentEnv};
pub use logger::{CsvSink, HumanSink, JsonLinesSink, TabularLogger, TabularSink};
pub use metrics::{LocalReducer, Metrics, StatsReducer};
pub use noise::{parse_noise, ActionNoise, AdaptiveParamNoiseSpec, NoiseConfig};
pub use normalize::RunningMeanStd;
pub use training::{learn, AgentTrainer, ReplayBuffer, RunSummary};
pub use types::{ActionBatch, ObsBatch, StepResult, Transition};

#[cfg(feature = "rl-nn")]
pub use curiosity::{
    build_curiosity, CuriosityConfig, CuriosityModel, StateActionPredictor, StatePredictor,
};
#[cfg(feature = "rl-nn")]
pub use network::{ActorNetwork, CriticNetwork, HeadConfig};
#[cfg(feature = "rl-nn")]
pub use recurrent::{LstmPolicy, LstmStep};
#[cfg(feature = "rl-nn")]
pub use training::{DdpgConfig, DdpgTrainer};
