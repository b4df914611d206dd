//! Command-line entry point: trains DDPG agents on the lane-keeping simulator.
//!
//! Configuration precedence: CLI flags > `--config` JSON file > defaults.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tch::Device;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use highway_maddpg::algorithms::rl::{
    learn, parse_noise, DdpgConfig, DdpgTrainer, LaneKeepingConfig, LaneKeepingEnv,
    LocalReducer, MultiAgentEnv, TabularLogger, TrainingConfig,
};
use highway_maddpg::TrainError;

#[derive(Debug, Parser)]
#[command(
    name = "maddpg-train",
    about = "Multi-agent DDPG training on a vectorized lane-keeping environment",
    version
)]
struct Args {
    /// JSON file with training hyperparameters.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of epochs (clears total_timesteps from the config file).
    #[arg(long)]
    nb_epochs: Option<usize>,

    /// Total rollout steps, converted to epochs (clears nb_epochs).
    #[arg(long, conflicts_with = "nb_epochs")]
    total_timesteps: Option<usize>,

    #[arg(long)]
    nb_epoch_cycles: Option<usize>,

    #[arg(long)]
    nb_rollout_steps: Option<usize>,

    #[arg(long)]
    nb_train_steps: Option<usize>,

    #[arg(long)]
    nb_eval_steps: Option<usize>,

    /// Exploration noise, e.g. `adaptive-param_0.2` or `ou_0.2`.
    #[arg(long)]
    noise_type: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Curiosity bonus scale; enables the curiosity module.
    #[arg(long)]
    curiosity_beta: Option<f64>,

    /// Curiosity model: `state-action` or `state`.
    #[arg(long)]
    curiosity_type: Option<String>,

    /// Standardize critic targets with running return statistics.
    #[arg(long)]
    normalize_returns: bool,

    /// Checkpoint every N epochs (0 disables).
    #[arg(long)]
    save_interval: Option<usize>,

    /// Run name to restore from before training.
    #[arg(long)]
    load_path: Option<String>,

    #[arg(long)]
    results_dir: Option<PathBuf>,

    #[arg(long)]
    run_name: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Parallel environment instances.
    #[arg(long, default_value_t = 1)]
    n_envs: usize,

    /// Cars per instance.
    #[arg(long, default_value_t = 2)]
    n_agents: usize,

    /// Also run noise-free evaluation episodes.
    #[arg(long)]
    evaluate: bool,

    /// Verbosity: -v, -vv
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn apply(&self, config: &mut TrainingConfig) {
        if let Some(n) = self.nb_epochs {
            config.nb_epochs = Some(n);
            config.total_timesteps = None;
        }
        if let Some(n) = self.total_timesteps {
            config.total_timesteps = Some(n);
            config.nb_epochs = None;
        }
        if let Some(n) = self.nb_epoch_cycles {
            config.nb_epoch_cycles = n;
        }
        if let Some(n) = self.nb_rollout_steps {
            config.nb_rollout_steps = n;
        }
        if let Some(n) = self.nb_train_steps {
            config.nb_train_steps = n;
        }
        if let Some(n) = self.nb_eval_steps {
            config.nb_eval_steps = n;
        }
        if let Some(noise) = &self.noise_type {
            config.noise_type = noise.clone();
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
        }
        if self.curiosity_beta.is_some() {
            config.curiosity_beta = self.curiosity_beta;
        }
        if let Some(kind) = &self.curiosity_type {
            config.curiosity_type = kind.clone();
        }
        if self.normalize_returns {
            config.normalize_returns = true;
        }
        if let Some(n) = self.save_interval {
            config.save_interval = n;
        }
        if self.load_path.is_some() {
            config.load_path = self.load_path.clone();
        }
        if let Some(dir) = &self.results_dir {
            config.results_dir = dir.clone();
        }
        if let Some(name) = &self.run_name {
            config.run_name = name.clone();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "highway_maddpg=debug,info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn main() -> Result<(), TrainError> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_json_file(path)?,
        None => TrainingConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let seed = config.seed.unwrap_or(0);
    tch::manual_seed(seed as i64);
    let device = Device::cuda_if_available();

    let env_config = LaneKeepingConfig {
        n_envs: args.n_envs,
        n_agents: args.n_agents,
        ..LaneKeepingConfig::default()
    };
    let mut env = LaneKeepingEnv::new(env_config.clone(), seed)?;
    let mut eval_env = args
        .evaluate
        .then(|| LaneKeepingEnv::new(env_config, seed.wrapping_add(1)))
        .transpose()?;

    let ddpg = DdpgConfig::from_training(&config, device)?;
    let mut trainers = (0..env.n_agents())
        .map(|agent| {
            let noise = parse_noise(&config.noise_type, env.action_dim())?;
            DdpgTrainer::new(
                env.observation_dim(agent),
                env.action_dim(),
                ddpg.clone(),
                noise,
                seed.wrapping_add(agent as u64),
            )
        })
        .collect::<Result<Vec<_>, TrainError>>()?;

    let paths = config.run_paths();
    fs::create_dir_all(paths.log_dir())?;
    serde_json::to_writer_pretty(
        BufWriter::new(File::create(paths.log_dir().join("config.json"))?),
        &config,
    )?;
    let mut logger = TabularLogger::for_run(paths.log_dir())?;

    info!(
        run = %config.run_name,
        noise = %config.noise_type,
        n_envs = args.n_envs,
        n_agents = args.n_agents,
        ?device,
        "configured run"
    );

    let summary = learn(
        &config,
        &mut env,
        eval_env.as_mut(),
        &mut trainers,
        &mut LocalReducer,
        &mut logger,
    )?;

    info!(
        epochs = summary.epochs,
        steps = summary.steps,
        episodes = summary.episodes,
        "done"
    );
    Ok(())
}
