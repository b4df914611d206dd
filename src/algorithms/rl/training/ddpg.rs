//! DDPG learner for a single agent.
//!
//! Actor `μ(s)` and critic `Q(s, a)` with target copies, trained off-policy
//! from the agent's own replay buffer:
//!
//! - critic target: `y = reward_scale * r + (1 - done) * γ * Q'(s', μ'(s'))`
//! - critic loss: `MSE(Q(s, a), y) + l2 * Σ‖W‖²`
//! - actor loss: `-mean(Q(s, μ(s)))`
//!
//! With `normalize_returns` the critic outputs standardized values: targets
//! are computed in return space, folded into running statistics, then
//! standardized; the actor maximizes the de-standardized Q.
//!
//! Exploration uses action-space noise, a parameter-perturbed copy of the
//! actor, or both.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::{debug, warn};

use super::buffer::{ReplayBuffer, TransitionBatch};
use super::target::{hard_update_var_store, soft_update_var_store};
use super::trainer::{ActionOutput, AgentTrainer, TrainLosses};
use crate::algorithms::rl::config::{CuriosityKind, TrainingConfig};
use crate::algorithms::rl::curiosity::{build_curiosity, CuriosityConfig, CuriosityModel};
use crate::algorithms::rl::network::{ActorNetwork, CriticNetwork, HeadConfig};
use crate::algorithms::rl::noise::{ActionNoise, AdaptiveParamNoiseSpec, NoiseConfig};
use crate::algorithms::rl::normalize::RunningMeanStd;
use crate::algorithms::rl::types::Transition;
use crate::error::{ConfigError, TrainError};

/// Hyperparameters of one DDPG learner.
#[derive(Debug, Clone)]
pub struct DdpgConfig {
    pub gamma: f64,
    pub tau: f64,
    pub actor_lr: f64,
    pub critic_lr: f64,
    pub critic_l2_reg: f64,
    pub clip_norm: Option<f64>,
    pub reward_scale: f64,
    pub batch_size: usize,
    pub memory_limit: usize,
    pub normalize_observations: bool,
    pub normalize_returns: bool,
    pub head: HeadConfig,
    pub curiosity: Option<CuriosityConfig>,
    pub device: Device,
}

impl DdpgConfig {
    pub fn from_training(config: &TrainingConfig, device: Device) -> Result<Self, ConfigError> {
        Ok(Self {
            gamma: config.gamma,
            tau: config.tau,
            actor_lr: config.actor_lr,
            critic_lr: config.critic_lr,
            critic_l2_reg: config.critic_l2_reg,
            clip_norm: config.clip_norm,
            reward_scale: config.reward_scale,
            batch_size: config.batch_size,
            memory_limit: config.memory_limit,
            normalize_observations: config.normalize_observations,
            normalize_returns: config.normalize_returns,
            head: HeadConfig::from_training(config)?,
            curiosity: match config.curiosity_beta {
                Some(beta) => Some(CuriosityConfig {
                    kind: config.curiosity_type.parse::<CuriosityKind>()?,
                    prediction_beta: beta,
                    ..CuriosityConfig::default()
                }),
                None => None,
            },
            device,
        })
    }

    /// Rejects sizes the learner cannot be built with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_limit == 0 {
            return Err(ConfigError::InvalidHyperparameter {
                field: "memory_limit",
                reason: "must be positive".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidHyperparameter {
                field: "batch_size",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Non-network state written next to the variable stores.
#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    obs_rms: Option<RunningMeanStd>,
    #[serde(default)]
    ret_rms: Option<RunningMeanStd>,
    param_noise_stddev: Option<f64>,
}

const STATE_FILE: &str = "state.json";
const ACTOR_FILE: &str = "actor.ot";
const CRITIC_FILE: &str = "critic.ot";
const TARGET_ACTOR_FILE: &str = "target_actor.ot";
const TARGET_CRITIC_FILE: &str = "target_critic.ot";
const CURIOSITY_FILE: &str = "curiosity.ot";

pub struct DdpgTrainer {
    config: DdpgConfig,
    obs_dim: usize,
    action_dim: usize,

    actor: ActorNetwork,
    target_actor: ActorNetwork,
    critic: CriticNetwork,
    target_critic: CriticNetwork,
    actor_opt: nn::Optimizer,
    critic_opt: nn::Optimizer,

    /// Acting copy of the actor with parameter noise.
    perturbed_actor: Option<ActorNetwork>,
    /// Scratch copy used to measure the effect of the current noise level.
    adaptive_actor: Option<ActorNetwork>,
    param_noise: Option<AdaptiveParamNoiseSpec>,
    action_noise: Option<ActionNoise>,

    curiosity: Option<Box<dyn CuriosityModel>>,
    memory: ReplayBuffer,
    obs_rms: Option<RunningMeanStd>,
    /// Statistics of critic targets, in return space.
    ret_rms: Option<RunningMeanStd>,
    /// Fixed batch for the reference statistics, drawn on first use.
    stats_sample: Option<TransitionBatch>,
    rng: StdRng,
}

impl DdpgTrainer {
    pub fn new(
        obs_dim: usize,
        action_dim: usize,
        config: DdpgConfig,
        noise: NoiseConfig,
        seed: u64,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        if let Some(n) = &noise.action_noise {
            if n.dim() != action_dim {
                return Err(TrainError::ShapeMismatch {
                    what: "action noise",
                    expected: vec![action_dim],
                    actual: vec![n.dim()],
                });
            }
        }
        let device = config.device;
        let head = &config.head;

        let actor = ActorNetwork::new(obs_dim, action_dim, head, device);
        let mut target_actor = ActorNetwork::new(obs_dim, action_dim, head, device);
        hard_update_var_store(target_actor.var_store_mut(), actor.var_store())?;
        let critic = CriticNetwork::new(obs_dim, action_dim, head, device);
        let mut target_critic = CriticNetwork::new(obs_dim, action_dim, head, device);
        hard_update_var_store(target_critic.var_store_mut(), critic.var_store())?;

        let actor_opt = nn::Adam::default().build(actor.var_store(), config.actor_lr)?;
        let critic_opt = nn::Adam::default().build(critic.var_store(), config.critic_lr)?;

        let (perturbed_actor, adaptive_actor) = match &noise.param_noise {
            Some(spec) => {
                let mut perturbed = ActorNetwork::new(obs_dim, action_dim, head, device);
                perturbed.perturb_from(&actor, spec.current_stddev)?;
                let adaptive = ActorNetwork::new(obs_dim, action_dim, head, device);
                (Some(perturbed), Some(adaptive))
            }
            None => (None, None),
        };

        let curiosity = config
            .curiosity
            .clone()
            .map(|c| build_curiosity(obs_dim, action_dim, c, device))
            .transpose()?;

        Ok(Self {
            obs_dim,
            action_dim,
            actor,
            target_actor,
            critic,
            target_critic,
            actor_opt,
            critic_opt,
            perturbed_actor,
            adaptive_actor,
            param_noise: noise.param_noise,
            action_noise: noise.action_noise,
            curiosity,
            memory: ReplayBuffer::new(config.memory_limit),
            obs_rms: config
                .normalize_observations
                .then(|| RunningMeanStd::new(obs_dim)),
            ret_rms: config.normalize_returns.then(|| RunningMeanStd::new(1)),
            stats_sample: None,
            rng: StdRng::seed_from_u64(seed),
            config,
        })
    }

    pub fn param_noise(&self) -> Option<&AdaptiveParamNoiseSpec> {
        self.param_noise.as_ref()
    }

    pub fn actor(&self) -> &ActorNetwork {
        &self.actor
    }

    pub fn target_actor(&self) -> &ActorNetwork {
        &self.target_actor
    }

    pub fn curiosity(&self) -> Option<&dyn CuriosityModel> {
        self.curiosity.as_deref()
    }

    /// Critic output to return space.
    fn denormalize_q(&self, q: Tensor) -> Tensor {
        match &self.ret_rms {
            Some(rms) => q * rms.std()[0] + rms.mean()[0],
            None => q,
        }
    }

    /// Return space to critic output.
    fn normalize_q(&self, q: Tensor) -> Tensor {
        match &self.ret_rms {
            Some(rms) => (q - rms.mean()[0]) / (rms.std()[0] + 1e-8),
            None => q,
        }
    }

    /// Normalized observations of `rows` samples as a `[rows, obs_dim]` tensor.
    fn obs_tensor(&self, flat: &[f32], rows: usize) -> Tensor {
        let values: Vec<f32> = match &self.obs_rms {
            Some(rms) => flat
                .chunks(self.obs_dim)
                .flat_map(|row| rms.normalize(row))
                .collect(),
            None => flat.to_vec(),
        };
        Tensor::from_slice(&values)
            .view([rows as i64, self.obs_dim as i64])
            .to_device(self.config.device)
    }

    fn batch_tensor(&self, flat: &[f32], rows: usize, cols: usize) -> Tensor {
        Tensor::from_slice(flat)
            .view([rows as i64, cols as i64])
            .to_device(self.config.device)
    }

    fn optimize(opt: &mut nn::Optimizer, loss: &Tensor, clip_norm: Option<f64>) {
        opt.zero_grad();
        loss.backward();
        if let Some(max) = clip_norm {
            opt.clip_grad_norm(max);
        }
        opt.step();
    }

    fn perturb_acting_actor(&mut self) -> Result<(), TrainError> {
        if let (Some(perturbed), Some(spec)) = (&mut self.perturbed_actor, &self.param_noise) {
            perturbed.perturb_from(&self.actor, spec.current_stddev)?;
        }
        Ok(())
    }

    fn check_obs(&self, obs: &[f32]) -> Result<(), TrainError> {
        if obs.len() != self.obs_dim {
            return Err(TrainError::ShapeMismatch {
                what: "agent observation",
                expected: vec![self.obs_dim],
                actual: vec![obs.len()],
            });
        }
        Ok(())
    }
}

fn mean_std(values: &[f32]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

impl AgentTrainer for DdpgTrainer {
    fn step(
        &mut self,
        obs: &[f32],
        apply_noise: bool,
        compute_q: bool,
    ) -> Result<ActionOutput, TrainError> {
        self.check_obs(obs)?;
        let obs_t = self.obs_tensor(obs, 1);

        let (action_t, q_t) = tch::no_grad(|| {
            let policy = match (&self.perturbed_actor, apply_noise) {
                (Some(perturbed), true) => perturbed,
                _ => &self.actor,
            };
            let action = policy.forward(&obs_t);
            let q = compute_q.then(|| {
                self.denormalize_q(self.critic.forward(&obs_t, &self.actor.forward(&obs_t)))
            });
            (action, q)
        });

        let mut action = Vec::<f32>::try_from(&action_t.flatten(0, -1).to_device(Device::Cpu))?;
        if apply_noise {
            if let Some(noise) = &mut self.action_noise {
                for (a, n) in action.iter_mut().zip(noise.sample(&mut self.rng)) {
                    *a += n;
                }
            }
        }
        action.iter_mut().for_each(|a| *a = a.clamp(-1.0, 1.0));

        let q = q_t.map(|q| q.double_value(&[0]) as f32);
        Ok(ActionOutput { action, q })
    }

    fn store_transition(&mut self, transition: Transition) {
        if let Some(rms) = &mut self.obs_rms {
            rms.update(&[transition.obs0.as_slice()]);
        }
        self.memory.push(transition);
    }

    fn memory_len(&self) -> usize {
        self.memory.len()
    }

    fn train(&mut self) -> Result<TrainLosses, TrainError> {
        let batch = self.memory.sample(self.config.batch_size, &mut self.rng)?;
        let rows = batch.batch_size;
        let obs0 = self.obs_tensor(&batch.obs0, rows);
        let obs1 = self.obs_tensor(&batch.obs1, rows);
        let actions = self.batch_tensor(&batch.actions, rows, self.action_dim);
        let rewards = Tensor::from_slice(&batch.rewards).to_device(self.config.device);
        let not_done: Vec<f32> = batch.terminals.iter().map(|t| 1.0 - t).collect();
        let not_done = Tensor::from_slice(&not_done).to_device(self.config.device);

        let mut rewards = rewards * self.config.reward_scale;
        if let Some(model) = &mut self.curiosity {
            let bonus = model.bonus(&obs0, &obs1, &actions);
            let curiosity_loss = model.train_step(&obs0, &obs1, &actions);
            debug!(curiosity_loss, "curiosity update");
            rewards = rewards + bonus;
        }

        let target_q = tch::no_grad(|| {
            let next_q = self.denormalize_q(
                self.target_critic
                    .forward(&obs1, &self.target_actor.forward(&obs1)),
            );
            &rewards + not_done * next_q * self.config.gamma
        });
        if let Some(rms) = &mut self.ret_rms {
            let returns = Vec::<f32>::try_from(&target_q.to_device(Device::Cpu))?;
            let rows: Vec<&[f32]> = returns.chunks(1).collect();
            rms.update(&rows);
        }
        let target_q = self.normalize_q(target_q);

        let q = self.critic.forward(&obs0, &actions);
        let mut critic_loss = q.mse_loss(&target_q, tch::Reduction::Mean);
        if self.config.critic_l2_reg > 0.0 {
            critic_loss = critic_loss + self.critic.hidden_weight_l2() * self.config.critic_l2_reg;
        }
        Self::optimize(&mut self.critic_opt, &critic_loss, self.config.clip_norm);

        let actor_loss = -self
            .denormalize_q(self.critic.forward(&obs0, &self.actor.forward(&obs0)))
            .mean(Kind::Float);
        Self::optimize(&mut self.actor_opt, &actor_loss, self.config.clip_norm);

        Ok(TrainLosses {
            critic_loss: f64::try_from(&critic_loss)?,
            actor_loss: f64::try_from(&actor_loss)?,
        })
    }

    fn update_target_net(&mut self) {
        let tau = self.config.tau;
        soft_update_var_store(self.target_actor.var_store_mut(), self.actor.var_store(), tau);
        soft_update_var_store(self.target_critic.var_store_mut(), self.critic.var_store(), tau);
    }

    fn adapt_param_noise(&mut self) -> Result<Option<f64>, TrainError> {
        let Some(stddev) = self.param_noise.as_ref().map(|s| s.current_stddev) else {
            return Ok(None);
        };
        let batch = self.memory.sample(self.config.batch_size, &mut self.rng)?;
        let obs0 = self.obs_tensor(&batch.obs0, batch.batch_size);
        let Some(adaptive) = &mut self.adaptive_actor else {
            return Ok(None);
        };
        adaptive.perturb_from(&self.actor, stddev)?;

        let distance = {
            let _guard = tch::no_grad_guard();
            (self.actor.forward(&obs0) - adaptive.forward(&obs0))
                .square()
                .mean(Kind::Float)
                .sqrt()
        };
        let distance = f64::try_from(&distance)?;

        if let Some(spec) = &mut self.param_noise {
            spec.adapt(distance);
            debug!(distance, stddev = spec.current_stddev, "adapted parameter noise");
        }
        Ok(Some(distance))
    }

    fn reset(&mut self) {
        if let Some(noise) = &mut self.action_noise {
            noise.reset();
        }
        if let Err(err) = self.perturb_acting_actor() {
            warn!(%err, "could not re-perturb the acting actor");
        }
    }

    fn stats(&mut self) -> Result<BTreeMap<String, f64>, TrainError> {
        let mut stats = BTreeMap::new();
        if let Some(rms) = &self.obs_rms {
            let n = rms.mean().len().max(1) as f64;
            stats.insert(
                "obs_rms_mean".to_string(),
                rms.mean().iter().sum::<f64>() / n,
            );
            stats.insert("obs_rms_std".to_string(), rms.std().iter().sum::<f64>() / n);
        }
        if let Some(rms) = &self.ret_rms {
            stats.insert("ret_rms_mean".to_string(), rms.mean()[0]);
            stats.insert("ret_rms_std".to_string(), rms.std()[0]);
        }
        if let Some(spec) = &self.param_noise {
            stats.extend(spec.stats());
        }

        if self.stats_sample.is_none() && !self.memory.is_empty() {
            self.stats_sample = Some(self.memory.sample(self.config.batch_size, &mut self.rng)?);
        }
        if let Some(sample) = &self.stats_sample {
            let obs0 = self.obs_tensor(&sample.obs0, sample.batch_size);
            let (q, actions) = tch::no_grad(|| {
                let actions = self.actor.forward(&obs0);
                (self.denormalize_q(self.critic.forward(&obs0, &actions)), actions)
            });
            let q = Vec::<f32>::try_from(&q.to_device(Device::Cpu))?;
            let actions = Vec::<f32>::try_from(&actions.flatten(0, -1).to_device(Device::Cpu))?;
            let (q_mean, q_std) = mean_std(&q);
            let (a_mean, a_std) = mean_std(&actions);
            stats.insert("reference_Q_mean".to_string(), q_mean);
            stats.insert("reference_Q_std".to_string(), q_std);
            stats.insert("reference_action_mean".to_string(), a_mean);
            stats.insert("reference_action_std".to_string(), a_std);
        }
        Ok(stats)
    }

    fn save(&self, dir: &Path) -> Result<(), TrainError> {
        self.actor.var_store().save(dir.join(ACTOR_FILE))?;
        self.critic.var_store().save(dir.join(CRITIC_FILE))?;
        self.target_actor.var_store().save(dir.join(TARGET_ACTOR_FILE))?;
        self.target_critic
            .var_store()
            .save(dir.join(TARGET_CRITIC_FILE))?;
        if let Some(model) = &self.curiosity {
            model.var_store().save(dir.join(CURIOSITY_FILE))?;
        }
        let state = SavedState {
            obs_rms: self.obs_rms.clone(),
            ret_rms: self.ret_rms.clone(),
            param_noise_stddev: self.param_noise.as_ref().map(|s| s.current_stddev),
        };
        serde_json::to_writer_pretty(BufWriter::new(File::create(dir.join(STATE_FILE))?), &state)?;
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> Result<(), TrainError> {
        self.actor.var_store_mut().load(dir.join(ACTOR_FILE))?;
        self.critic.var_store_mut().load(dir.join(CRITIC_FILE))?;
        self.target_actor
            .var_store_mut()
            .load(dir.join(TARGET_ACTOR_FILE))?;
        self.target_critic
            .var_store_mut()
            .load(dir.join(TARGET_CRITIC_FILE))?;
        if let Some(model) = &mut self.curiosity {
            let path = dir.join(CURIOSITY_FILE);
            if path.exists() {
                model.var_store_mut().load(path)?;
            } else {
                warn!(dir = %dir.display(), "checkpoint has no curiosity module; keeping fresh weights");
            }
        }

        let state: SavedState =
            serde_json::from_reader(BufReader::new(File::open(dir.join(STATE_FILE))?))?;
        if let (Some(current), Some(saved)) = (&mut self.obs_rms, state.obs_rms) {
            *current = saved;
        }
        if let (Some(current), Some(saved)) = (&mut self.ret_rms, state.ret_rms) {
            *current = saved;
        }
        if let (Some(spec), Some(stddev)) = (&mut self.param_noise, state.param_noise_stddev) {
            spec.current_stddev = stddev;
        }
        self.stats_sample = None;
        self.perturb_acting_actor()
    }
}
