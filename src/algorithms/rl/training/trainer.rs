//! The per-agent trainer contract used by the training loop.

use std::collections::BTreeMap;
use std::path::Path;

use crate::algorithms::rl::types::Transition;
use crate::error::TrainError;

/// Output of [`AgentTrainer::step`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutput {
    /// Action in `[-1, 1]^action_dim`.
    pub action: Vec<f32>,
    /// Critic estimate for `(obs, action)`, when requested.
    pub q: Option<f32>,
}

/// Losses of one gradient step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainLosses {
    pub critic_loss: f64,
    pub actor_loss: f64,
}

/// One learning agent: its networks, exploration noise and replay buffer.
///
/// Each trainer exclusively owns its state. The training loop calls it from a
/// single thread.
pub trait AgentTrainer {
    /// Proposes an action for a single observation.
    fn step(
        &mut self,
        obs: &[f32],
        apply_noise: bool,
        compute_q: bool,
    ) -> Result<ActionOutput, TrainError>;

    /// Records one transition in the trainer's replay buffer.
    fn store_transition(&mut self, transition: Transition);

    /// Number of transitions currently held by the replay buffer.
    fn memory_len(&self) -> usize;

    /// Performs one critic and one actor gradient step on a sampled minibatch.
    fn train(&mut self) -> Result<TrainLosses, TrainError>;

    /// Moves target networks toward the online networks.
    fn update_target_net(&mut self);

    /// Adapts parameter-noise magnitude; `None` when the trainer has no
    /// parameter noise.
    fn adapt_param_noise(&mut self) -> Result<Option<f64>, TrainError>;

    /// Resets exploration state at episode boundaries.
    fn reset(&mut self);

    /// Scalar diagnostics for the epoch log.
    fn stats(&mut self) -> Result<BTreeMap<String, f64>, TrainError>;

    /// Persists the full trainer state under `dir`.
    fn save(&self, dir: &Path) -> Result<(), TrainError>;

    /// Restores state written by [`save`](AgentTrainer::save).
    fn load(&mut self, dir: &Path) -> Result<(), TrainError>;
}
