//! Environment adapter contract and a small lane-keeping simulator.
//!
//! Training code only talks to [`MultiAgentEnv`]. The highway simulator used
//! for real experiments lives outside this crate; [`LaneKeepingEnv`] is a
//! cheap stand-in with the same batched shapes, used by tests and the CLI.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::types::{ActionBatch, ObsBatch, StepResult};
use crate::error::{ConfigError, TrainError};

/// A vectorized multi-agent environment.
///
/// Observations, rewards and done flags are batched as
/// `[n_envs][n_agents][...]`. An environment instance whose episode finished
/// during [`step`](MultiAgentEnv::step) is reset internally; the returned
/// observations for that instance are the first observations of the next
/// episode.
pub trait MultiAgentEnv {
    /// Number of parallel environment instances.
    fn n_envs(&self) -> usize;

    /// Number of agents per instance.
    fn n_agents(&self) -> usize;

    /// Observation length of `agent`.
    fn observation_dim(&self, agent: usize) -> usize;

    /// Action length, shared by all agents.
    fn action_dim(&self) -> usize;

    /// Starts a fresh episode in every instance.
    fn reset(&mut self) -> Result<ObsBatch, TrainError>;

    /// Advances every instance by one step.
    fn step(&mut self, actions: &ActionBatch) -> Result<StepResult, TrainError>;

    /// Releases environment resources.
    fn close(&mut self) {}
}

/// Configuration of [`LaneKeepingEnv`].
#[derive(Debug, Clone)]
pub struct LaneKeepingConfig {
    pub n_envs: usize,
    pub n_agents: usize,
    /// Steps before an episode is cut.
    pub episode_horizon: u32,
    /// Lateral distance from the lane center at which a car leaves the road.
    pub road_half_width: f32,
    /// Speed every car is rewarded for holding.
    pub target_speed: f32,
    /// Integration step.
    pub dt: f32,
}

impl LaneKeepingConfig {
    /// Rejects sizes and physical constants the simulator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::InvalidHyperparameter {
            field,
            reason: reason.to_string(),
        };
        if self.n_envs == 0 {
            return Err(invalid("n_envs", "must be positive"));
        }
        if self.n_agents == 0 {
            return Err(invalid("n_agents", "must be positive"));
        }
        if self.episode_horizon == 0 {
            return Err(invalid("episode_horizon", "must be positive"));
        }
        if !(self.road_half_width.is_finite() && self.road_half_width > 0.0) {
            return Err(invalid("road_half_width", "must be positive and finite"));
        }
        if !(self.target_speed.is_finite() && self.target_speed > 0.0) {
            return Err(invalid("target_speed", "must be positive and finite"));
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(invalid("dt", "must be positive and finite"));
        }
        Ok(())
    }
}

impl Default for LaneKeepingConfig {
    fn default() -> Self {
        Self {
            n_envs: 1,
            n_agents: 2,
            episode_horizon: 200,
            road_half_width: 2.0,
            target_speed: 1.0,
            dt: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Car {
    /// Lateral offset from the lane center.
    y: f32,
    /// Lateral velocity.
    vy: f32,
    /// Longitudinal speed.
    v: f32,
}

/// Cars on a straight road, each steering (`action[0]`) and throttling
/// (`action[1]`) to stay centered at the target speed.
///
/// Reward per agent is `-(y² + (v - v*)²)`, minus 1 when it leaves the road.
/// An instance is done when any car leaves the road or the horizon is reached.
///
/// # Lifecycle
///
/// 1. Create with [`LaneKeepingEnv::new`].
/// 2. Call [`MultiAgentEnv::reset`] once.
/// 3. Call [`MultiAgentEnv::step`] repeatedly; finished instances reset themselves.
#[derive(Debug)]
pub struct LaneKeepingEnv {
    config: LaneKeepingConfig,
    cars: Vec<Vec<Car>>,
    t: Vec<u32>,
    rng: StdRng,
}

impl LaneKeepingEnv {
    pub const OBS_DIM: usize = 4;
    pub const ACTION_DIM: usize = 2;

    pub fn new(config: LaneKeepingConfig, seed: u64) -> Result<Self, ConfigError> {
        config.validate()?;
        let cars = vec![vec![Car::default(); config.n_agents]; config.n_envs];
        let t = vec![0; config.n_envs];
        Ok(Self {
            config,
            cars,
            t,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &LaneKeepingConfig {
        &self.config
    }

    fn reset_instance(&mut self, env: usize) {
        let half = self.config.road_half_width * 0.5;
        for car in &mut self.cars[env] {
            car.y = self.rng.gen_range(-half..half);
            car.vy = 0.0;
            car.v = self.rng.gen_range(0.0..self.config.target_speed);
        }
        self.t[env] = 0;
    }

    fn observe_instance(&self, env: usize) -> Vec<Vec<f32>> {
        let cars = &self.cars[env];
        cars.iter()
            .enumerate()
            .map(|(i, car)| {
                let nearest = cars
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, other)| other.y - car.y)
                    .min_by(|a, b| a.abs().total_cmp(&b.abs()))
                    .unwrap_or(0.0);
                vec![car.y, car.vy, car.v - self.config.target_speed, nearest]
            })
            .collect()
    }
}

impl MultiAgentEnv for LaneKeepingEnv {
    fn n_envs(&self) -> usize {
        self.config.n_envs
    }

    fn n_agents(&self) -> usize {
        self.config.n_agents
    }

    fn observation_dim(&self, _agent: usize) -> usize {
        Self::OBS_DIM
    }

    fn action_dim(&self) -> usize {
        Self::ACTION_DIM
    }

    fn reset(&mut self) -> Result<ObsBatch, TrainError> {
        for env in 0..self.config.n_envs {
            self.reset_instance(env);
        }
        Ok((0..self.config.n_envs)
            .map(|env| self.observe_instance(env))
            .collect())
    }

    fn step(&mut self, actions: &ActionBatch) -> Result<StepResult, TrainError> {
        let n_envs = self.config.n_envs;
        let n_agents = self.config.n_agents;
        if actions.n_envs() != n_envs {
            return Err(TrainError::ShapeMismatch {
                what: "lane-keeping actions",
                expected: vec![n_envs, n_agents, Self::ACTION_DIM],
                actual: vec![actions.n_envs()],
            });
        }

        let dt = self.config.dt;
        let mut observations = Vec::with_capacity(n_envs);
        let mut rewards = Vec::with_capacity(n_envs);
        let mut dones = Vec::with_capacity(n_envs);
        let mut infos = Vec::with_capacity(n_envs);

        for env in 0..n_envs {
            self.t[env] += 1;
            let horizon_reached = self.t[env] >= self.config.episode_horizon;
            let mut env_rewards = Vec::with_capacity(n_agents);
            let mut env_dones = Vec::with_capacity(n_agents);
            let mut off_road = 0usize;

            for (agent, car) in self.cars[env].iter_mut().enumerate() {
                let action = actions.get(env, agent);
                let steer = action[0].clamp(-1.0, 1.0);
                let throttle = action[1].clamp(-1.0, 1.0);

                car.vy += steer * dt;
                car.y += car.vy * dt;
                car.v = (car.v + throttle * dt).max(0.0);

                let left_road = car.y.abs() > self.config.road_half_width;
                let speed_err = car.v - self.config.target_speed;
                let mut reward = -(car.y * car.y + speed_err * speed_err);
                if left_road {
                    reward -= 1.0;
                    off_road += 1;
                }
                env_rewards.push(reward);
                env_dones.push(left_road || horizon_reached);
            }

            let mut info = HashMap::new();
            info.insert("off_road".to_string(), off_road as f64);
            info.insert("t".to_string(), self.t[env] as f64);

            if env_dones.iter().any(|&d| d) {
                self.reset_instance(env);
            }
            observations.push(self.observe_instance(env));
            rewards.push(env_rewards);
            dones.push(env_dones);
            infos.push(info);
        }

        Ok(StepResult {
            observations,
            rewards,
            dones,
            infos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_actions(env: &LaneKeepingEnv) -> ActionBatch {
        ActionBatch::new(
            vec![vec![vec![0.0; 2]; env.n_agents()]; env.n_envs()],
            env.n_envs(),
            env.n_agents(),
            LaneKeepingEnv::ACTION_DIM,
        )
        .unwrap()
    }

    #[test]
    fn reset_returns_batched_observations() {
        let mut env = LaneKeepingEnv::new(
            LaneKeepingConfig {
                n_envs: 3,
                n_agents: 2,
                ..LaneKeepingConfig::default()
            },
            42,
        )
        .unwrap();
        let obs = env.reset().unwrap();
        assert_eq!(obs.len(), 3);
        for per_env in &obs {
            assert_eq!(per_env.len(), 2);
            for o in per_env {
                assert_eq!(o.len(), LaneKeepingEnv::OBS_DIM);
            }
        }
    }

    #[test]
    fn step_result_has_consistent_shape() {
        let mut env = LaneKeepingEnv::new(LaneKeepingConfig::default(), 1).unwrap();
        env.reset().unwrap();
        let result = env.step(&zero_actions(&env)).unwrap();
        assert!(result.check_shape(env.n_envs(), env.n_agents()).is_ok());
        assert!(result.rewards[0].iter().all(|r| *r <= 0.0));
    }

    #[test]
    fn episode_ends_at_horizon() {
        let mut env = LaneKeepingEnv::new(
            LaneKeepingConfig {
                episode_horizon: 5,
                ..LaneKeepingConfig::default()
            },
            3,
        )
        .unwrap();
        env.reset().unwrap();
        for t in 0..5 {
            let result = env.step(&zero_actions(&env)).unwrap();
            let done = result.dones[0].iter().any(|&d| d);
            assert_eq!(done, t == 4, "step {}", t);
        }
    }

    #[test]
    fn leaving_the_road_is_terminal_and_penalized() {
        let mut env = LaneKeepingEnv::new(
            LaneKeepingConfig {
                n_agents: 1,
                road_half_width: 0.01,
                ..LaneKeepingConfig::default()
            },
            5,
        )
        .unwrap();
        env.reset().unwrap();
        let steer_hard = ActionBatch::new(vec![vec![vec![1.0, 0.0]]], 1, 1, 2).unwrap();
        let mut finished = false;
        for _ in 0..50 {
            let result = env.step(&steer_hard).unwrap();
            if result.dones[0][0] {
                assert!(result.rewards[0][0] < -1.0);
                assert_eq!(result.infos[0]["off_road"], 1.0);
                finished = true;
                break;
            }
        }
        assert!(finished);
    }

    #[test]
    fn degenerate_road_or_speed_is_rejected() {
        for config in [
            LaneKeepingConfig {
                road_half_width: 0.0,
                ..LaneKeepingConfig::default()
            },
            LaneKeepingConfig {
                road_half_width: -1.0,
                ..LaneKeepingConfig::default()
            },
            LaneKeepingConfig {
                target_speed: 0.0,
                ..LaneKeepingConfig::default()
            },
            LaneKeepingConfig {
                n_agents: 0,
                ..LaneKeepingConfig::default()
            },
        ] {
            assert!(matches!(
                LaneKeepingEnv::new(config, 0),
                Err(ConfigError::InvalidHyperparameter { .. })
            ));
        }
    }
}
