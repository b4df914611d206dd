//! Per-environment episode bookkeeping.

/// A finished episode of one environment instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedEpisode {
    /// Instance that finished.
    pub env: usize,
    /// Return of each agent over the episode.
    pub agent_returns: Vec<f32>,
    /// Number of steps the episode lasted.
    pub steps: usize,
}

impl CompletedEpisode {
    /// Return summed over agents.
    pub fn total_return(&self) -> f32 {
        self.agent_returns.iter().sum()
    }
}

/// Running reward sums and step counts for every environment instance.
#[derive(Debug, Clone)]
pub struct EpisodeAccumulator {
    rewards: Vec<Vec<f32>>,
    steps: Vec<usize>,
}

impl EpisodeAccumulator {
    pub fn new(n_envs: usize, n_agents: usize) -> Self {
        Self {
            rewards: vec![vec![0.0; n_agents]; n_envs],
            steps: vec![0; n_envs],
        }
    }

    /// Adds one step of rewards (`[n_envs][n_agents]`) and flushes every
    /// instance in which any agent is done.
    ///
    /// Each flushed instance is reset to zero and reported exactly once.
    pub fn record(&mut self, rewards: &[Vec<f32>], dones: &[Vec<bool>]) -> Vec<CompletedEpisode> {
        let mut completed = Vec::new();
        for (env, (env_rewards, env_dones)) in rewards.iter().zip(dones).enumerate() {
            for (acc, r) in self.rewards[env].iter_mut().zip(env_rewards) {
                *acc += r;
            }
            self.steps[env] += 1;

            if env_dones.iter().any(|&d| d) {
                let n_agents = self.rewards[env].len();
                completed.push(CompletedEpisode {
                    env,
                    agent_returns: std::mem::replace(&mut self.rewards[env], vec![0.0; n_agents]),
                    steps: std::mem::take(&mut self.steps[env]),
                });
            }
        }
        completed
    }

    /// Running return of each agent in instance `env`.
    pub fn running_rewards(&self, env: usize) -> &[f32] {
        &self.rewards[env]
    }

    /// Steps taken so far in the current episode of instance `env`.
    pub fn running_steps(&self, env: usize) -> usize {
        self.steps[env]
    }
}
