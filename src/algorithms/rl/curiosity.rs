//! Intrinsic curiosity: dynamics models trained alongside the agent whose
//! prediction error is added to extrinsic rewards.
//!
//! Two models are available:
//!
//! - [`StateActionPredictor`]: a shared encoder `φ` maps observations to
//!   features. The inverse model predicts the action from `(φ(s1), φ(s2))`;
//!   the forward model predicts `φ(s2)` from `(φ(s1), a)`. The bonus is the
//!   forward error in feature space.
//! - [`StatePredictor`]: the forward model decodes `(φ(s1), a)` back to the
//!   observation space and the bonus is the error against the raw `s2`,
//!   averaged over observation dimensions.

use tch::{nn, nn::Module, nn::OptimizerConfig, Device, Kind, TchError, Tensor};

use super::config::{Activation, CuriosityKind};
use super::network::{fc_head, HeadConfig};

/// Forward loss is scaled by this so hyperparameters do not depend on the
/// feature width.
const FORWARD_LOSS_SCALE: f64 = 256.0;

#[derive(Debug, Clone, PartialEq)]
pub struct CuriosityConfig {
    pub kind: CuriosityKind,
    /// Width of the encoder features and of the model hidden layers.
    pub feature_size: usize,
    /// Bonus multiplier.
    pub prediction_beta: f64,
    /// Weight of the forward loss against the inverse loss.
    pub forward_weight: f64,
    pub learning_rate: f64,
}

impl Default for CuriosityConfig {
    fn default() -> Self {
        Self {
            kind: CuriosityKind::StateAction,
            feature_size: 256,
            prediction_beta: 0.01,
            forward_weight: 0.2,
            learning_rate: 1e-3,
        }
    }
}

/// A dynamics model that turns transitions into an exploration bonus.
pub trait CuriosityModel {
    /// Bonus for every sample of `(s1, s2, action)`: `[batch]`, no gradient.
    fn bonus(&self, s1: &Tensor, s2: &Tensor, action: &Tensor) -> Tensor;

    /// One optimizer step on a batch; returns the training loss.
    fn train_step(&mut self, s1: &Tensor, s2: &Tensor, action: &Tensor) -> f64;

    fn config(&self) -> &CuriosityConfig;

    fn var_store(&self) -> &nn::VarStore;

    fn var_store_mut(&mut self) -> &mut nn::VarStore;
}

/// Builds the model selected by `config.kind`.
pub fn build_curiosity(
    obs_dim: usize,
    action_dim: usize,
    config: CuriosityConfig,
    device: Device,
) -> Result<Box<dyn CuriosityModel>, TchError> {
    Ok(match config.kind {
        CuriosityKind::StateAction => Box::new(StateActionPredictor::new(
            obs_dim, action_dim, config, device,
        )?),
        CuriosityKind::State => Box::new(StatePredictor::new(obs_dim, action_dim, config, device)?),
    })
}

fn encoder(root: &nn::Path, obs_dim: usize, feature_size: usize) -> nn::Sequential {
    let head = HeadConfig {
        hidden_sizes: vec![feature_size, feature_size],
        activation: Activation::Relu,
        layer_norm: false,
    };
    fc_head(&(root / "encoder"), obs_dim, &head).0
}

/// Inverse and forward dynamics models over a shared encoder.
pub struct StateActionPredictor {
    vs: nn::VarStore,
    encoder: nn::Sequential,
    inverse: nn::Sequential,
    forward_model: nn::Sequential,
    optimizer: nn::Optimizer,
    config: CuriosityConfig,
}

impl StateActionPredictor {
    pub fn new(
        obs_dim: usize,
        action_dim: usize,
        config: CuriosityConfig,
        device: Device,
    ) -> Result<Self, TchError> {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let size = config.feature_size as i64;

        let encoder = encoder(&root, obs_dim, config.feature_size);

        let inverse = nn::seq()
            .add(nn::linear(&root / "g1", 2 * size, size, Default::default()))
            .add_fn(|x| x.relu())
            .add(nn::linear(
                &root / "glast",
                size,
                action_dim as i64,
                Default::default(),
            ))
            .add_fn(|x| x.tanh());

        let forward_model = nn::seq()
            .add(nn::linear(
                &root / "f1",
                size + action_dim as i64,
                size,
                Default::default(),
            ))
            .add_fn(|x| x.relu())
            .add(nn::linear(&root / "flast", size, size, Default::default()));

        let optimizer = nn::Adam::default().build(&vs, config.learning_rate)?;

        Ok(Self {
            vs,
            encoder,
            inverse,
            forward_model,
            optimizer,
            config,
        })
    }

    /// Per-sample scaled forward error `[batch]` and the mean inverse loss.
    fn errors(&self, s1: &Tensor, s2: &Tensor, action: &Tensor) -> (Tensor, Tensor) {
        let phi1 = self.encoder.forward(s1);
        let phi2 = self.encoder.forward(s2);

        let predicted_action = self.inverse.forward(&Tensor::cat(&[&phi1, &phi2], 1));
        let inverse_loss = predicted_action.mse_loss(action, tch::Reduction::Mean);

        let predicted_phi2 = self.forward_model.forward(&Tensor::cat(&[&phi1, action], 1));
        let forward_error = (predicted_phi2 - phi2)
            .square()
            .mean_dim([-1i64].as_slice(), false, Kind::Float)
            * (0.5 * FORWARD_LOSS_SCALE);
        (forward_error, inverse_loss)
    }
}

impl CuriosityModel for StateActionPredictor {
    fn bonus(&self, s1: &Tensor, s2: &Tensor, action: &Tensor) -> Tensor {
        tch::no_grad(|| {
            let (forward_error, _) = self.errors(s1, s2, action);
            forward_error * self.config.prediction_beta
        })
    }

    /// Loss is `(1 - w) * inverse + w * forward`.
    fn train_step(&mut self, s1: &Tensor, s2: &Tensor, action: &Tensor) -> f64 {
        let (forward_error, inverse_loss) = self.errors(s1, s2, action);
        let w = self.config.forward_weight;
        let loss = inverse_loss * (1.0 - w) + forward_error.mean(Kind::Float) * w;
        self.optimizer.backward_step(&loss);
        loss.double_value(&[])
    }

    fn config(&self) -> &CuriosityConfig {
        &self.config
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

/// Forward model predicting the next observation itself.
pub struct StatePredictor {
    vs: nn::VarStore,
    encoder: nn::Sequential,
    decoder: nn::Sequential,
    optimizer: nn::Optimizer,
    config: CuriosityConfig,
}

impl StatePredictor {
    pub fn new(
        obs_dim: usize,
        action_dim: usize,
        config: CuriosityConfig,
        device: Device,
    ) -> Result<Self, TchError> {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let size = config.feature_size as i64;

        let encoder = encoder(&root, obs_dim, config.feature_size);
        let decoder = nn::seq()
            .add(nn::linear(
                &root / "f1",
                size + action_dim as i64,
                size,
                Default::default(),
            ))
            .add_fn(|x| x.relu())
            .add(nn::linear(
                &root / "flast",
                size,
                obs_dim as i64,
                Default::default(),
            ));

        let optimizer = nn::Adam::default().build(&vs, config.learning_rate)?;

        Ok(Self {
            vs,
            encoder,
            decoder,
            optimizer,
            config,
        })
    }

    /// Predicted next observation: `[batch, obs_dim]`.
    pub fn predict_state(&self, s1: &Tensor, action: &Tensor) -> Tensor {
        let phi1 = self.encoder.forward(s1);
        self.decoder.forward(&Tensor::cat(&[&phi1, action], 1))
    }

    /// `0.5 * mean((ŝ2 - s2)²)` over observation dimensions: `[batch]`.
    fn forward_error(&self, s1: &Tensor, s2: &Tensor, action: &Tensor) -> Tensor {
        (self.predict_state(s1, action) - s2)
            .square()
            .mean_dim([-1i64].as_slice(), false, Kind::Float)
            * 0.5
    }
}

impl CuriosityModel for StatePredictor {
    fn bonus(&self, s1: &Tensor, s2: &Tensor, action: &Tensor) -> Tensor {
        tch::no_grad(|| self.forward_error(s1, s2, action) * self.config.prediction_beta)
    }

    fn train_step(&mut self, s1: &Tensor, s2: &Tensor, action: &Tensor) -> f64 {
        let loss = self.forward_error(s1, s2, action).mean(Kind::Float);
        self.optimizer.backward_step(&loss);
        loss.double_value(&[])
    }

    fn config(&self) -> &CuriosityConfig {
        &self.config
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}
