//! highway-maddpg - multi-agent DDPG training harness
//!
//! Trains one independent DDPG learner per agent on a vectorized multi-agent
//! environment: rollout, experience replay, actor-critic updates, exploration
//! noise, tabular metrics and checkpoints.

pub mod algorithms;
pub mod error;

pub use algorithms::rl::{learn, AgentTrainer, MultiAgentEnv, TrainingConfig};
pub use error::{ConfigError, TrainError};
