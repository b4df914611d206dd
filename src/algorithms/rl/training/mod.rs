//! Training infrastructure for multi-agent DDPG.
//!
//! Provides the replay buffer, episode bookkeeping, target updates, the
//! per-agent trainer contract and the training loop. The tch-backed
//! [`DdpgTrainer`](ddpg::DdpgTrainer) and the target updates require the
//! `rl-nn` feature.

pub mod buffer;
pub mod episode;
pub mod maddpg;
pub mod trainer;

#[cfg(feature = "rl-nn")]
pub mod ddpg;
#[cfg(feature = "rl-nn")]
pub mod target;

pub use buffer::{ReplayBuffer, TransitionBatch};
pub use episode::{CompletedEpisode, EpisodeAccumulator};
pub use maddpg::{learn, RunSummary};
pub use trainer::{ActionOutput, AgentTrainer, TrainLosses};

#[cfg(feature = "rl-nn")]
pub use ddpg::{DdpgConfig, DdpgTrainer};
