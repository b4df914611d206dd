//! Multi-agent DDPG training loop.
//!
//! Each agent is an independent learner ([`AgentTrainer`]) acting on its own
//! slice of the vectorized environment's observations. One epoch runs
//! `nb_epoch_cycles` cycles of:
//!
//! 1. rollout: `nb_rollout_steps` noisy environment steps, every trainer
//!    storing its own transition for every environment instance;
//! 2. training: `nb_train_steps` gradient steps per trainer, each followed by
//!    a soft target update;
//! 3. evaluation (if an evaluation environment is given): `nb_eval_steps`
//!    noise-free steps.
//!
//! At the end of the epoch the metrics are reduced across workers, dumped on
//! rank 0 and a checkpoint is written when due.

use std::time::Instant;

use tracing::{debug, info};

use crate::algorithms::rl::checkpoint::{load_all, Checkpointer};
use crate::algorithms::rl::config::TrainingConfig;
use crate::algorithms::rl::environment::MultiAgentEnv;
use crate::algorithms::rl::logger::TabularLogger;
use crate::algorithms::rl::metrics::{
    epoch_metrics, reduce_metrics, EpochStats, Metrics, RunTotals, StatsReducer,
};
use crate::algorithms::rl::types::{ActionBatch, ObsBatch, Transition};
use crate::error::TrainError;

use super::episode::EpisodeAccumulator;
use super::trainer::AgentTrainer;

/// Outcome of [`learn`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub epochs: usize,
    /// Vectorized rollout steps taken.
    pub steps: usize,
    /// Training episodes completed.
    pub episodes: usize,
    /// Reduced metrics of the last epoch (empty if no epoch ran).
    pub last_metrics: Metrics,
}

/// Current observations and running episodes of one vectorized environment.
struct EnvState {
    obs: ObsBatch,
    episodes: EpisodeAccumulator,
}

impl EnvState {
    fn start<E: MultiAgentEnv>(env: &mut E) -> Result<Self, TrainError> {
        let obs = env.reset()?;
        check_observations(env, &obs)?;
        Ok(Self {
            obs,
            episodes: EpisodeAccumulator::new(env.n_envs(), env.n_agents()),
        })
    }
}

fn check_observations<E: MultiAgentEnv>(env: &E, obs: &ObsBatch) -> Result<(), TrainError> {
    let (n_envs, n_agents) = (env.n_envs(), env.n_agents());
    if obs.len() != n_envs || obs.iter().any(|o| o.len() != n_agents) {
        return Err(TrainError::ShapeMismatch {
            what: "observation batch",
            expected: vec![n_envs, n_agents],
            actual: vec![obs.len(), obs.first().map_or(0, Vec::len)],
        });
    }
    for per_env in obs {
        for (agent, o) in per_env.iter().enumerate() {
            let dim = env.observation_dim(agent);
            if o.len() != dim {
                return Err(TrainError::ShapeMismatch {
                    what: "agent observation",
                    expected: vec![dim],
                    actual: vec![o.len()],
                });
            }
        }
    }
    Ok(())
}

/// Asks every trainer for its action in every environment instance.
///
/// Q estimates are returned flattened in `[env][agent]` order.
fn act<E: MultiAgentEnv, T: AgentTrainer>(
    env: &E,
    trainers: &mut [T],
    obs: &ObsBatch,
    apply_noise: bool,
) -> Result<(ActionBatch, Vec<Option<f32>>), TrainError> {
    let mut actions = Vec::with_capacity(obs.len());
    let mut qs = Vec::with_capacity(obs.len() * trainers.len());
    for per_env in obs {
        let mut env_actions = Vec::with_capacity(trainers.len());
        for (trainer, agent_obs) in trainers.iter_mut().zip(per_env) {
            let out = trainer.step(agent_obs, apply_noise, true)?;
            env_actions.push(out.action);
            qs.push(out.q);
        }
        actions.push(env_actions);
    }
    let batch = ActionBatch::new(actions, env.n_envs(), env.n_agents(), env.action_dim())?;
    Ok((batch, qs))
}

fn rollout_step<E: MultiAgentEnv, T: AgentTrainer>(
    env: &mut E,
    state: &mut EnvState,
    trainers: &mut [T],
    stats: &mut EpochStats,
) -> Result<(), TrainError> {
    let (n_envs, n_agents) = (env.n_envs(), env.n_agents());
    let (actions, qs) = act(env, trainers, &state.obs, true)?;
    for e in 0..n_envs {
        for i in 0..n_agents {
            stats.record_action(actions.get(e, i), qs[e * n_agents + i]);
        }
    }

    let result = env.step(&actions)?;
    result.check_shape(n_envs, n_agents)?;
    check_observations(env, &result.observations)?;

    for (i, trainer) in trainers.iter_mut().enumerate() {
        for e in 0..n_envs {
            trainer.store_transition(Transition {
                obs0: state.obs[e][i].clone(),
                action: actions.get(e, i).to_vec(),
                reward: result.rewards[e][i],
                obs1: result.observations[e][i].clone(),
                terminal: result.dones[e][i],
            });
        }
    }

    let completed = state.episodes.record(&result.rewards, &result.dones);
    for episode in &completed {
        debug!(
            env = episode.env,
            steps = episode.steps,
            total_return = episode.total_return(),
            "episode finished"
        );
        stats.record_episode(episode);
    }
    // Noise can only be reset per episode when there is a single instance.
    if n_envs == 1 && !completed.is_empty() {
        trainers.iter_mut().for_each(AgentTrainer::reset);
    }

    state.obs = result.observations;
    Ok(())
}

fn train_phase<T: AgentTrainer>(
    config: &TrainingConfig,
    trainers: &mut [T],
    stats: &mut EpochStats,
) -> Result<(), TrainError> {
    for t_train in 0..config.nb_train_steps {
        for trainer in trainers.iter_mut() {
            if trainer.memory_len() >= config.batch_size
                && t_train % config.param_noise_adaption_interval == 0
            {
                if let Some(distance) = trainer.adapt_param_noise()? {
                    stats.record_param_noise_distance(distance);
                }
            }
            stats.record_losses(trainer.train()?);
            trainer.update_target_net();
        }
    }
    Ok(())
}

fn eval_step<E: MultiAgentEnv, T: AgentTrainer>(
    env: &mut E,
    state: &mut EnvState,
    trainers: &mut [T],
    stats: &mut EpochStats,
) -> Result<(), TrainError> {
    let (actions, qs) = act(env, trainers, &state.obs, false)?;
    qs.into_iter().flatten().for_each(|q| stats.record_eval_q(q));

    let result = env.step(&actions)?;
    result.check_shape(env.n_envs(), env.n_agents())?;
    check_observations(env, &result.observations)?;

    for episode in state.episodes.record(&result.rewards, &result.dones) {
        stats.record_eval_episode(episode.total_return());
    }
    state.obs = result.observations;
    Ok(())
}

/// Trains one [`AgentTrainer`] per agent of `env`.
///
/// Trainers are restored from `config.load_path` first when it is set. Metrics
/// are reduced through `reducer` and, on rank 0, written to `logger`;
/// checkpoints are also written only on rank 0. Environments are closed when
/// training completes. Any error aborts the run.
pub fn learn<E, T, R>(
    config: &TrainingConfig,
    env: &mut E,
    eval_env: Option<&mut E>,
    trainers: &mut [T],
    reducer: &mut R,
    logger: &mut TabularLogger,
) -> Result<RunSummary, TrainError>
where
    E: MultiAgentEnv,
    T: AgentTrainer,
    R: StatsReducer + ?Sized,
{
    config.validate()?;
    let nb_epochs = config.resolved_epochs()?;
    if trainers.len() != env.n_agents() {
        return Err(TrainError::ShapeMismatch {
            what: "trainers",
            expected: vec![env.n_agents()],
            actual: vec![trainers.len()],
        });
    }

    let rank = reducer.rank();
    let checkpointer = Checkpointer::new(config.run_paths(), config.save_interval, rank == 0);
    if let Some(dir) = config.load_checkpoint_dir() {
        load_all(&dir, trainers)?;
    }

    trainers.iter_mut().for_each(AgentTrainer::reset);
    let mut state = EnvState::start(env)?;
    let mut eval = match eval_env {
        Some(eval_env) => {
            let eval_state = EnvState::start(&mut *eval_env)?;
            Some((eval_env, eval_state))
        }
        None => None,
    };

    info!(
        nb_epochs,
        cycles = config.nb_epoch_cycles,
        n_envs = env.n_envs(),
        n_agents = env.n_agents(),
        rank,
        "starting training"
    );

    let root = config.metrics_root.as_str();
    let start = Instant::now();
    let mut totals = RunTotals::default();
    let mut last_metrics = Metrics::new();

    for epoch in 0..nb_epochs {
        let mut stats = EpochStats::default();
        for cycle in 0..config.nb_epoch_cycles {
            if env.n_envs() > 1 {
                trainers.iter_mut().for_each(AgentTrainer::reset);
            }
            for _ in 0..config.nb_rollout_steps {
                rollout_step(env, &mut state, trainers, &mut stats)?;
                totals.steps += 1;
            }

            train_phase(config, trainers, &mut stats)?;

            if let Some((eval_env, eval_state)) = eval.as_mut() {
                for _ in 0..config.nb_eval_steps {
                    eval_step(&mut **eval_env, eval_state, trainers, &mut stats)?;
                }
            }
            debug!(epoch, cycle, episodes = stats.episodes(), "cycle done");
        }

        totals.absorb(&stats);
        let trainer_stats = trainers
            .iter_mut()
            .map(AgentTrainer::stats)
            .collect::<Result<Vec<_>, _>>()?;
        let raw = epoch_metrics(
            root,
            &stats,
            &totals,
            &trainer_stats,
            start.elapsed().as_secs_f64(),
            eval.is_some(),
        );
        let mut metrics = reduce_metrics(raw, reducer)?;
        metrics.insert(format!("{}to/epochs", root), (epoch + 1) as f64);
        metrics.insert(format!("{}to/steps", root), totals.steps as f64);

        if rank == 0 {
            logger.dump(&metrics)?;
        }
        checkpointer.maybe_save(epoch, trainers)?;
        last_metrics = metrics;
    }

    checkpointer.save_final(trainers)?;
    env.close();
    if let Some((eval_env, _)) = eval.as_mut() {
        eval_env.close();
    }
    info!(
        epochs = nb_epochs,
        steps = totals.steps,
        episodes = totals.episodes,
        "training finished"
    );

    Ok(RunSummary {
        epochs: nb_epochs,
        steps: totals.steps,
        episodes: totals.episodes,
        last_metrics,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::algorithms::rl::metrics::LocalReducer;
    use crate::algorithms::rl::training::trainer::{ActionOutput, TrainLosses};
    use crate::algorithms::rl::types::StepResult;

    /// Observations are `[env, agent, t]`; every agent earns 1.0 per step and
    /// the episode ends after `horizon` steps.
    struct CountingEnv {
        n_envs: usize,
        n_agents: usize,
        horizon: usize,
        t: Vec<usize>,
        closed: bool,
    }

    impl CountingEnv {
        fn new(n_envs: usize, n_agents: usize, horizon: usize) -> Self {
            Self {
                n_envs,
                n_agents,
                horizon,
                t: vec![0; n_envs],
                closed: false,
            }
        }

        fn observe(&self) -> ObsBatch {
            (0..self.n_envs)
                .map(|e| {
                    (0..self.n_agents)
                        .map(|a| vec![e as f32, a as f32, self.t[e] as f32])
                        .collect()
                })
                .collect()
        }
    }

    impl MultiAgentEnv for CountingEnv {
        fn n_envs(&self) -> usize {
            self.n_envs
        }
        fn n_agents(&self) -> usize {
            self.n_agents
        }
        fn observation_dim(&self, _agent: usize) -> usize {
            3
        }
        fn action_dim(&self) -> usize {
            1
        }
        fn reset(&mut self) -> Result<ObsBatch, TrainError> {
            self.t = vec![0; self.n_envs];
            Ok(self.observe())
        }
        fn step(&mut self, _actions: &ActionBatch) -> Result<StepResult, TrainError> {
            let mut dones = Vec::new();
            for t in self.t.iter_mut() {
                *t += 1;
                let done = *t >= self.horizon;
                if done {
                    *t = 0;
                }
                dones.push(vec![done; self.n_agents]);
            }
            Ok(StepResult {
                observations: self.observe(),
                rewards: vec![vec![1.0; self.n_agents]; self.n_envs],
                dones,
                infos: vec![HashMap::new(); self.n_envs],
            })
        }
        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[derive(Default)]
    struct RecordingTrainer {
        transitions: Vec<Transition>,
        action_len: usize,
        param_noise: bool,
        train_calls: usize,
        target_updates: usize,
        adapt_calls: usize,
        resets: usize,
        loaded: bool,
    }

    impl RecordingTrainer {
        fn new() -> Self {
            Self {
                action_len: 1,
                ..Self::default()
            }
        }
    }

    impl AgentTrainer for RecordingTrainer {
        fn step(&mut self, _obs: &[f32], _noise: bool, _q: bool) -> Result<ActionOutput, TrainError> {
            Ok(ActionOutput {
                action: vec![0.5; self.action_len],
                q: Some(1.0),
            })
        }
        fn store_transition(&mut self, transition: Transition) {
            self.transitions.push(transition);
        }
        fn memory_len(&self) -> usize {
            self.transitions.len()
        }
        fn train(&mut self) -> Result<TrainLosses, TrainError> {
            self.train_calls += 1;
            Ok(TrainLosses {
                critic_loss: 0.5,
                actor_loss: -2.0,
            })
        }
        fn update_target_net(&mut self) {
            self.target_updates += 1;
        }
        fn adapt_param_noise(&mut self) -> Result<Option<f64>, TrainError> {
            self.adapt_calls += 1;
            Ok(self.param_noise.then_some(0.1))
        }
        fn reset(&mut self) {
            self.resets += 1;
        }
        fn stats(&mut self) -> Result<BTreeMap<String, f64>, TrainError> {
            Ok(BTreeMap::from([(
                "train_calls".to_string(),
                self.train_calls as f64,
            )]))
        }
        fn save(&self, dir: &Path) -> Result<(), TrainError> {
            fs::write(dir.join("memory.txt"), self.transitions.len().to_string())?;
            Ok(())
        }
        fn load(&mut self, _dir: &Path) -> Result<(), TrainError> {
            self.loaded = true;
            Ok(())
        }
    }

    fn config(results_dir: &Path) -> TrainingConfig {
        TrainingConfig {
            nb_epochs: Some(1),
            nb_epoch_cycles: 1,
            nb_rollout_steps: 10,
            nb_train_steps: 0,
            nb_eval_steps: 0,
            batch_size: 1,
            save_interval: 0,
            results_dir: results_dir.to_path_buf(),
            run_name: "test".to_string(),
            ..TrainingConfig::default()
        }
    }

    fn trainers(n: usize) -> Vec<RecordingTrainer> {
        (0..n).map(|_| RecordingTrainer::new()).collect()
    }

    fn run(
        config: &TrainingConfig,
        env: &mut CountingEnv,
        eval_env: Option<&mut CountingEnv>,
        trainers: &mut [RecordingTrainer],
    ) -> Result<RunSummary, TrainError> {
        learn(
            config,
            env,
            eval_env,
            trainers,
            &mut LocalReducer,
            &mut TabularLogger::default(),
        )
    }

    #[test]
    fn rollout_only_run_collects_one_transition_per_step_per_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut env = CountingEnv::new(3, 2, 1000);
        let mut agents = trainers(2);

        let summary = run(&config, &mut env, None, &mut agents).unwrap();

        for (i, agent) in agents.iter().enumerate() {
            assert_eq!(agent.transitions.len(), 30);
            for e in 0..3 {
                let from_env = agent
                    .transitions
                    .iter()
                    .filter(|t| t.obs0[0] == e as f32)
                    .count();
                assert_eq!(from_env, 10, "agent {} env {}", i, e);
            }
            assert!(agent.transitions.iter().all(|t| t.obs0[1] == i as f32));
            assert_eq!(agent.train_calls, 0);
            assert_eq!(agent.target_updates, 0);
        }
        assert_eq!(summary.steps, 10);
        assert_eq!(summary.last_metrics["to/steps"], 10.0);
        assert_eq!(summary.last_metrics["to/epochs"], 1.0);
        assert!(summary.last_metrics["tr/loss_critic"].is_nan());
        assert!(env.closed);
    }

    #[test]
    fn transitions_chain_observations() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.nb_rollout_steps = 3;
        let mut env = CountingEnv::new(1, 1, 1000);
        let mut agents = trainers(1);

        run(&config, &mut env, None, &mut agents).unwrap();

        let ts = &agents[0].transitions;
        assert_eq!(ts[0].obs0[2], 0.0);
        assert_eq!(ts[0].obs1[2], 1.0);
        assert_eq!(ts[1].obs0, ts[0].obs1);
        assert_eq!(ts[2].action, vec![0.5]);
        assert!(ts.iter().all(|t| t.reward == 1.0 && !t.terminal));
    }

    #[test]
    fn train_phase_follows_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.nb_epoch_cycles = 2;
        config.nb_train_steps = 4;
        config.param_noise_adaption_interval = 2;
        let mut env = CountingEnv::new(1, 2, 1000);
        let mut agents = trainers(2);
        agents[0].param_noise = true;

        let summary = run(&config, &mut env, None, &mut agents).unwrap();

        for agent in &agents {
            assert_eq!(agent.train_calls, 8);
            assert_eq!(agent.target_updates, 8);
            assert_eq!(agent.adapt_calls, 4);
        }
        let m = &summary.last_metrics;
        assert_eq!(m["tr/loss_critic"], 0.5);
        assert_eq!(m["tr/loss_actor"], -2.0);
        assert!((m["tr/param_noise_distance"] - 0.1).abs() < 1e-12);
        assert_eq!(m["st/ag1_train_calls"], 8.0);
    }

    #[test]
    fn noise_is_not_adapted_before_buffer_holds_a_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.nb_rollout_steps = 2;
        config.nb_train_steps = 1;
        config.batch_size = 5;
        let mut env = CountingEnv::new(1, 1, 1000);
        let mut agents = trainers(1);

        run(&config, &mut env, None, &mut agents).unwrap();

        assert_eq!(agents[0].adapt_calls, 0);
        assert_eq!(agents[0].train_calls, 1);
    }

    #[test]
    fn episodes_are_flushed_and_single_env_resets_trainers() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut env = CountingEnv::new(1, 2, 5);
        let mut agents = trainers(2);

        let summary = run(&config, &mut env, None, &mut agents).unwrap();

        let m = &summary.last_metrics;
        assert_eq!(m["ro/episodes"], 2.0);
        assert_eq!(m["ro/return"], 10.0);
        assert_eq!(m["ro/episode_steps"], 5.0);
        assert_eq!(m["ro/actions_mean"], 0.5);
        assert_eq!(m["ro/Q_mean"], 1.0);
        assert_eq!(summary.episodes, 2);
        // once at start, once per finished episode
        assert_eq!(agents[0].resets, 3);
        assert_eq!(agents[0].transitions.iter().filter(|t| t.terminal).count(), 2);
    }

    #[test]
    fn vectorized_env_resets_trainers_every_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.nb_epoch_cycles = 3;
        let mut env = CountingEnv::new(2, 1, 5);
        let mut agents = trainers(1);

        run(&config, &mut env, None, &mut agents).unwrap();

        assert_eq!(agents[0].resets, 1 + 3);
    }

    #[test]
    fn evaluation_is_noise_free_and_does_not_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.nb_rollout_steps = 4;
        config.nb_eval_steps = 6;
        let mut env = CountingEnv::new(1, 2, 1000);
        let mut eval_env = CountingEnv::new(1, 2, 3);
        let mut agents = trainers(2);

        let summary = run(&config, &mut env, Some(&mut eval_env), &mut agents).unwrap();

        assert_eq!(agents[0].transitions.len(), 4);
        let m = &summary.last_metrics;
        assert_eq!(m["eval/episodes"], 2.0);
        assert_eq!(m["eval/return"], 6.0);
        assert_eq!(m["eval/Q"], 1.0);
        assert!(eval_env.closed);
    }

    #[test]
    fn trainer_count_must_match_agents() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut env = CountingEnv::new(1, 3, 10);
        let mut agents = trainers(2);

        let err = run(&config, &mut env, None, &mut agents).unwrap_err();
        assert!(matches!(err, TrainError::ShapeMismatch { what: "trainers", .. }));
    }

    #[test]
    fn wrong_action_dim_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut env = CountingEnv::new(2, 1, 10);
        let mut agents = trainers(1);
        agents[0].action_len = 2;

        let err = run(&config, &mut env, None, &mut agents).unwrap_err();
        assert!(matches!(
            err,
            TrainError::ShapeMismatch {
                what: "action batch",
                ..
            }
        ));
    }

    #[test]
    fn checkpoints_are_written_per_interval_and_at_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.nb_epochs = Some(3);
        config.nb_rollout_steps = 2;
        config.save_interval = 2;
        let mut env = CountingEnv::new(1, 2, 10);
        let mut agents = trainers(2);

        run(&config, &mut env, None, &mut agents).unwrap();

        let paths = config.run_paths();
        assert!(paths.epoch_checkpoint_dir(0).join("agent_1").is_dir());
        assert!(!paths.epoch_checkpoint_dir(1).exists());
        assert!(paths.epoch_checkpoint_dir(2).join("agent_0").is_dir());
        let saved = fs::read_to_string(paths.final_checkpoint_dir().join("agent_0/memory.txt")).unwrap();
        assert_eq!(saved, "6");
    }

    #[test]
    fn load_path_restores_trainers_before_training() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = config(dir.path());
        first.run_name = "first".to_string();
        run(&first, &mut CountingEnv::new(1, 1, 10), None, &mut trainers(1)).unwrap();

        let mut second = config(dir.path());
        second.load_path = Some("first".to_string());
        let mut agents = trainers(1);
        run(&second, &mut CountingEnv::new(1, 1, 10), None, &mut agents).unwrap();
        assert!(agents[0].loaded);

        second.load_path = Some("missing".to_string());
        let err = run(&second, &mut CountingEnv::new(1, 1, 10), None, &mut trainers(1)).unwrap_err();
        assert!(matches!(err, TrainError::CheckpointNotFound(_)));
    }

    #[test]
    fn non_coordinating_worker_neither_logs_nor_saves() {
        struct Follower;
        impl StatsReducer for Follower {
            fn rank(&self) -> usize {
                1
            }
            fn world_size(&self) -> usize {
                2
            }
            fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<(), TrainError> {
                values.iter_mut().for_each(|v| *v *= 2.0);
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.save_interval = 1;
        let mut env = CountingEnv::new(1, 1, 5);
        let mut agents = trainers(1);

        let summary = learn(
            &config,
            &mut env,
            None,
            &mut agents,
            &mut Follower,
            &mut TabularLogger::default(),
        )
        .unwrap();

        assert!(!config.run_paths().checkpoints_dir().exists());
        assert_eq!(summary.last_metrics["ro/return"], 5.0);
    }
}
