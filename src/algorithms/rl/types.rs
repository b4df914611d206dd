//! Shared data types for the multi-agent training loop.
//!
//! Batched quantities are indexed `[env_instance][agent]`, matching the
//! layout a vectorized multi-agent environment produces.

use std::collections::HashMap;

use crate::error::TrainError;

/// Observations for every agent in every environment instance:
/// `[n_envs][n_agents][obs_dim]`.
pub type ObsBatch = Vec<Vec<Vec<f32>>>;

/// A single experience tuple for one agent in one environment instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Observation before the step.
    pub obs0: Vec<f32>,
    /// Action taken.
    pub action: Vec<f32>,
    /// Reward received for this agent.
    pub reward: f32,
    /// Observation after the step.
    pub obs1: Vec<f32>,
    /// Whether the episode terminated for this agent.
    pub terminal: bool,
}

/// Actions for every agent in every environment instance.
///
/// Construction checks the `[n_envs][n_agents][action_dim]` shape so the
/// environment never sees a ragged batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionBatch {
    actions: Vec<Vec<Vec<f32>>>,
}

impl ActionBatch {
    /// Wraps per-env, per-agent actions after validating their shape.
    pub fn new(
        actions: Vec<Vec<Vec<f32>>>,
        n_envs: usize,
        n_agents: usize,
        action_dim: usize,
    ) -> Result<Self, TrainError> {
        let expected = vec![n_envs, n_agents, action_dim];
        if actions.len() != n_envs {
            return Err(TrainError::ShapeMismatch {
                what: "action batch",
                expected,
                actual: vec![actions.len()],
            });
        }
        for per_env in &actions {
            if per_env.len() != n_agents {
                return Err(TrainError::ShapeMismatch {
                    what: "action batch",
                    expected,
                    actual: vec![n_envs, per_env.len()],
                });
            }
            if let Some(bad) = per_env.iter().find(|a| a.len() != action_dim) {
                return Err(TrainError::ShapeMismatch {
                    what: "action batch",
                    expected,
                    actual: vec![n_envs, n_agents, bad.len()],
                });
            }
        }
        Ok(Self { actions })
    }

    /// Number of environment instances.
    pub fn n_envs(&self) -> usize {
        self.actions.len()
    }

    /// Action of `agent` in environment instance `env`.
    pub fn get(&self, env: usize, agent: usize) -> &[f32] {
        &self.actions[env][agent]
    }

    /// Iterates over the per-agent actions of each environment instance.
    pub fn iter(&self) -> impl Iterator<Item = &Vec<Vec<f32>>> {
        self.actions.iter()
    }
}

/// Result of stepping a vectorized multi-agent environment.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Next observations, `[n_envs][n_agents][obs_dim]`.
    pub observations: ObsBatch,
    /// Per-agent rewards, `[n_envs][n_agents]`.
    pub rewards: Vec<Vec<f32>>,
    /// Per-agent done flags, `[n_envs][n_agents]`.
    pub dones: Vec<Vec<bool>>,
    /// Auxiliary scalar info per environment instance.
    pub infos: Vec<HashMap<String, f64>>,
}

impl StepResult {
    /// Checks that every batched field has the expected leading dimensions.
    pub fn check_shape(&self, n_envs: usize, n_agents: usize) -> Result<(), TrainError> {
        let shape_ok = self.observations.len() == n_envs
            && self.rewards.len() == n_envs
            && self.dones.len() == n_envs
            && self.observations.iter().all(|o| o.len() == n_agents)
            && self.rewards.iter().all(|r| r.len() == n_agents)
            && self.dones.iter().all(|d| d.len() == n_agents);
        if shape_ok {
            Ok(())
        } else {
            Err(TrainError::ShapeMismatch {
                what: "environment step result",
                expected: vec![n_envs, n_agents],
                actual: vec![
                    self.observations.len(),
                    self.rewards.first().map_or(0, Vec::len),
                ],
            })
        }
    }
}
