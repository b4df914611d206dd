//! Epoch statistics and their reduction across workers.
//!
//! Every epoch the training loop rebuilds a flat `key → scalar` map. Keys are
//! path-like (`ro/return`, `tr/loss_actor`, `st/ag0_param_noise_stddev`) and
//! carry a configurable root prefix. Means over empty samples are NaN.

use std::collections::{BTreeMap, VecDeque};

use super::training::episode::CompletedEpisode;
use super::training::trainer::TrainLosses;
use crate::error::TrainError;

/// Episodes kept in the rolling return histories.
pub const HISTORY_LEN: usize = 100;

/// Flat epoch metrics, sorted by key.
pub type Metrics = BTreeMap<String, f64>;

fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// Samples collected during one epoch; cleared at every epoch boundary.
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    episode_returns: Vec<f64>,
    episode_steps: Vec<f64>,
    action_sum: f64,
    action_count: usize,
    q_values: Vec<f64>,
    actor_losses: Vec<f64>,
    critic_losses: Vec<f64>,
    param_noise_distances: Vec<f64>,
    eval_returns: Vec<f64>,
    eval_q_values: Vec<f64>,
}

impl EpochStats {
    pub fn record_episode(&mut self, episode: &CompletedEpisode) {
        self.episode_returns.push(episode.total_return() as f64);
        self.episode_steps.push(episode.steps as f64);
    }

    pub fn record_action(&mut self, action: &[f32], q: Option<f32>) {
        self.action_sum += action.iter().map(|&a| a as f64).sum::<f64>();
        self.action_count += action.len();
        if let Some(q) = q {
            self.q_values.push(q as f64);
        }
    }

    pub fn record_losses(&mut self, losses: TrainLosses) {
        self.critic_losses.push(losses.critic_loss);
        self.actor_losses.push(losses.actor_loss);
    }

    pub fn record_param_noise_distance(&mut self, distance: f64) {
        self.param_noise_distances.push(distance);
    }

    pub fn record_eval_episode(&mut self, total_return: f32) {
        self.eval_returns.push(total_return as f64);
    }

    pub fn record_eval_q(&mut self, q: f32) {
        self.eval_q_values.push(q as f64);
    }

    /// Episodes completed this epoch.
    pub fn episodes(&self) -> usize {
        self.episode_returns.len()
    }

    /// Gradient steps recorded this epoch.
    pub fn train_steps(&self) -> usize {
        self.critic_losses.len()
    }

    pub fn eval_episodes(&self) -> usize {
        self.eval_returns.len()
    }
}

/// Counters and histories that persist across epochs.
#[derive(Debug, Clone, Default)]
pub struct RunTotals {
    /// Episodes completed since the start of the run.
    pub episodes: usize,
    /// Rollout steps since the start of the run.
    pub steps: usize,
    return_history: VecDeque<f64>,
    eval_return_history: VecDeque<f64>,
}

impl RunTotals {
    /// Folds an epoch's episodes into the rolling histories.
    pub fn absorb(&mut self, epoch: &EpochStats) {
        self.episodes += epoch.episodes();
        push_bounded(&mut self.return_history, &epoch.episode_returns);
        push_bounded(&mut self.eval_return_history, &epoch.eval_returns);
    }

    pub fn return_history(&self) -> &VecDeque<f64> {
        &self.return_history
    }
}

fn push_bounded(history: &mut VecDeque<f64>, values: &[f64]) {
    for &v in values {
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(v);
    }
}

/// Builds the flat metrics map of an epoch (before cross-worker reduction).
///
/// `totals` must already include this epoch (see [`RunTotals::absorb`]).
pub fn epoch_metrics(
    root: &str,
    epoch: &EpochStats,
    totals: &RunTotals,
    trainer_stats: &[BTreeMap<String, f64>],
    duration_secs: f64,
    evaluated: bool,
) -> Metrics {
    let key = |k: &str| format!("{}{}", root, k);
    let mut m = Metrics::new();

    for (i, stats) in trainer_stats.iter().enumerate() {
        for (k, v) in stats {
            m.insert(key(&format!("st/ag{}_{}", i, k)), *v);
        }
    }

    m.insert(key("ro/return"), mean(epoch.episode_returns.iter().copied()));
    m.insert(
        key("ro/return_history"),
        mean(totals.return_history.iter().copied()),
    );
    m.insert(
        key("ro/episode_steps"),
        mean(epoch.episode_steps.iter().copied()),
    );
    m.insert(
        key("ro/actions_mean"),
        if epoch.action_count == 0 {
            f64::NAN
        } else {
            epoch.action_sum / epoch.action_count as f64
        },
    );
    m.insert(key("ro/Q_mean"), mean(epoch.q_values.iter().copied()));
    m.insert(key("ro/episodes"), epoch.episodes() as f64);
    m.insert(key("tr/loss_actor"), mean(epoch.actor_losses.iter().copied()));
    m.insert(
        key("tr/loss_critic"),
        mean(epoch.critic_losses.iter().copied()),
    );
    m.insert(
        key("tr/param_noise_distance"),
        mean(epoch.param_noise_distances.iter().copied()),
    );
    m.insert(key("to/duration"), duration_secs);
    m.insert(
        key("to/steps_per_second"),
        if duration_secs > 0.0 {
            totals.steps as f64 / duration_secs
        } else {
            0.0
        },
    );
    m.insert(key("to/episodes"), totals.episodes as f64);

    if evaluated {
        m.insert(key("eval/return"), mean(epoch.eval_returns.iter().copied()));
        m.insert(
            key("eval/return_history"),
            mean(totals.eval_return_history.iter().copied()),
        );
        m.insert(key("eval/Q"), mean(epoch.eval_q_values.iter().copied()));
        m.insert(key("eval/episodes"), epoch.eval_episodes() as f64);
    }

    m
}

/// Cross-worker reduction of epoch metrics.
///
/// Implementations sum a vector elementwise over all workers. Every worker
/// passes its values in the same (sorted key) order.
pub trait StatsReducer {
    /// Index of this worker; rank 0 coordinates logging and checkpoints.
    fn rank(&self) -> usize;

    /// Number of workers.
    fn world_size(&self) -> usize;

    /// Replaces `values` with their elementwise sum over all workers.
    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<(), TrainError>;
}

/// Reducer for a single-process run.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReducer;

impl StatsReducer for LocalReducer {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&mut self, _values: &mut [f64]) -> Result<(), TrainError> {
        Ok(())
    }
}

/// Averages metrics across workers: sum, then divide by the worker count.
pub fn reduce_metrics<R: StatsReducer + ?Sized>(
    metrics: Metrics,
    reducer: &mut R,
) -> Result<Metrics, TrainError> {
    let (keys, mut values): (Vec<String>, Vec<f64>) = metrics.into_iter().unzip();
    reducer.all_reduce_sum(&mut values)?;
    let world = reducer.world_size().max(1) as f64;
    Ok(keys
        .into_iter()
        .zip(values)
        .map(|(k, v)| (k, v / world))
        .collect())
}
