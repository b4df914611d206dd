//! Fixed-capacity replay buffer for off-policy training.

use rand::Rng;

use crate::algorithms::rl::types::Transition;
use crate::error::TrainError;

/// A sampled minibatch, stored column-wise and flattened row-major so it can
/// be turned into tensors without further copies.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionBatch {
    pub obs0: Vec<f32>,
    pub actions: Vec<f32>,
    pub rewards: Vec<f32>,
    pub obs1: Vec<f32>,
    /// `1.0` for terminal transitions, `0.0` otherwise.
    pub terminals: Vec<f32>,
    pub batch_size: usize,
    pub obs_dim: usize,
    pub action_dim: usize,
}

/// Circular buffer of transitions.
///
/// Holds at most `capacity` transitions; once full, every push overwrites the
/// oldest entry.
#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    storage: Vec<Transition>,
    /// Slot the next push writes to once the buffer is full.
    next: usize,
}

impl ReplayBuffer {
    /// Creates an empty buffer. `capacity` must be positive.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "replay buffer capacity must be positive");
        Self {
            capacity,
            storage: Vec::with_capacity(capacity.min(1 << 16)),
            next: 0,
        }
    }

    /// Appends a transition, evicting the oldest one when full.
    pub fn push(&mut self, transition: Transition) {
        if self.storage.len() < self.capacity {
            self.storage.push(transition);
        } else {
            self.storage[self.next] = transition;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Number of stored transitions.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates from the oldest to the newest stored transition.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        let split = if self.storage.len() < self.capacity {
            0
        } else {
            self.next
        };
        self.storage[split..].iter().chain(self.storage[..split].iter())
    }

    /// Draws `batch_size` transitions uniformly, with replacement.
    pub fn sample<R: Rng>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<TransitionBatch, TrainError> {
        let Some(first) = self.storage.first() else {
            return Err(TrainError::EmptyBuffer {
                requested: batch_size,
            });
        };
        let obs_dim = first.obs0.len();
        let action_dim = first.action.len();

        let mut batch = TransitionBatch {
            obs0: Vec::with_capacity(batch_size * obs_dim),
            actions: Vec::with_capacity(batch_size * action_dim),
            rewards: Vec::with_capacity(batch_size),
            obs1: Vec::with_capacity(batch_size * obs_dim),
            terminals: Vec::with_capacity(batch_size),
            batch_size,
            obs_dim,
            action_dim,
        };
        for _ in 0..batch_size {
            let t = &self.storage[rng.gen_range(0..self.storage.len())];
            batch.obs0.extend_from_slice(&t.obs0);
            batch.actions.extend_from_slice(&t.action);
            batch.rewards.push(t.reward);
            batch.obs1.extend_from_slice(&t.obs1);
            batch.terminals.push(if t.terminal { 1.0 } else { 0.0 });
        }
        Ok(batch)
    }
}
