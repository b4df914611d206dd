//! Actor and critic networks using tch-rs (PyTorch bindings).
//!
//! Both are fully-connected heads built by [`fc_head`]; each network owns its
//! own `VarStore` so target and perturbed copies can be kept alongside the
//! online ones. This module is only available with the `rl-nn` feature.

use std::str::FromStr;

use tch::{nn, nn::Module, Device, TchError, Tensor};

use super::config::{Activation, TrainingConfig};
use crate::error::ConfigError;

/// Shape of a fully-connected head.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadConfig {
    pub hidden_sizes: Vec<usize>,
    pub activation: Activation,
    pub layer_norm: bool,
}

impl HeadConfig {
    pub fn from_training(config: &TrainingConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            hidden_sizes: config.hidden_sizes.clone(),
            activation: Activation::from_str(&config.activation)?,
            layer_norm: config.layer_norm,
        })
    }
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: vec![64, 64],
            activation: Activation::Relu,
            layer_norm: false,
        }
    }
}

fn activate(activation: Activation, x: &Tensor) -> Tensor {
    match activation {
        Activation::Relu => x.relu(),
        Activation::Tanh => x.tanh(),
        Activation::Elu => x.elu(),
    }
}

/// Stack of `linear → [layer_norm] → activation` blocks.
///
/// Linear layers are named `l{i}`, layer norms `ln{i}`. Returns the head and
/// its output width (the input width when `hidden_sizes` is empty).
pub fn fc_head(p: &nn::Path, input_dim: usize, head: &HeadConfig) -> (nn::Sequential, usize) {
    let mut seq = nn::seq();
    let mut width = input_dim;
    for (i, &size) in head.hidden_sizes.iter().enumerate() {
        seq = seq.add(nn::linear(
            p / format!("l{}", i),
            width as i64,
            size as i64,
            Default::default(),
        ));
        if head.layer_norm {
            seq = seq.add(nn::layer_norm(
                p / format!("ln{}", i),
                vec![size as i64],
                Default::default(),
            ));
        }
        let activation = head.activation;
        seq = seq.add_fn(move |x| activate(activation, x));
        width = size;
    }
    (seq, width)
}

/// Final layers start close to zero so initial actions and Q values are small.
pub(crate) fn output_layer(p: nn::Path, input: usize, output: usize) -> nn::Linear {
    let config = nn::LinearConfig {
        ws_init: nn::Init::Uniform { lo: -3e-3, up: 3e-3 },
        ..Default::default()
    };
    nn::linear(p, input as i64, output as i64, config)
}

fn is_layer_norm(name: &str) -> bool {
    name.split('.').any(|segment| segment.starts_with("ln"))
}

fn is_hidden_weight(name: &str) -> bool {
    let mut segments = name.split('.');
    let layer = segments.next().unwrap_or_default();
    let is_hidden_linear =
        layer.starts_with('l') && layer[1..].chars().all(|c| c.is_ascii_digit()) && layer.len() > 1;
    is_hidden_linear && segments.next() == Some("weight")
}

/// Deterministic policy `μ(s)` with actions in `[-1, 1]`.
pub struct ActorNetwork {
    vs: nn::VarStore,
    net: nn::Sequential,
    action_dim: usize,
}

impl ActorNetwork {
    pub fn new(obs_dim: usize, action_dim: usize, head: &HeadConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let p = &vs.root();
        let (body, width) = fc_head(p, obs_dim, head);
        let net = body
            .add(output_layer(p / "out", width, action_dim))
            .add_fn(|x| x.tanh());
        Self {
            vs,
            net,
            action_dim,
        }
    }

    /// `[batch, obs_dim] → [batch, action_dim]`.
    pub fn forward(&self, obs: &Tensor) -> Tensor {
        self.net.forward(obs)
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    /// Overwrites this network with `source` plus Gaussian parameter noise.
    ///
    /// Layer-norm parameters are copied but never perturbed.
    pub fn perturb_from(&mut self, source: &ActorNetwork, stddev: f64) -> Result<(), TchError> {
        self.vs.copy(&source.vs)?;
        tch::no_grad(|| {
            for (name, mut var) in self.vs.variables() {
                if is_layer_norm(&name) {
                    continue;
                }
                let noise = var.randn_like() * stddev;
                let _ = var.add_(&noise);
            }
        });
        Ok(())
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

/// Action-value function `Q(s, a)`.
pub struct CriticNetwork {
    vs: nn::VarStore,
    net: nn::Sequential,
}

impl CriticNetwork {
    pub fn new(obs_dim: usize, action_dim: usize, head: &HeadConfig, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let p = &vs.root();
        let (body, width) = fc_head(p, obs_dim + action_dim, head);
        let net = body.add(output_layer(p / "out", width, 1));
        Self { vs, net }
    }

    /// `([batch, obs_dim], [batch, action_dim]) → [batch]`.
    pub fn forward(&self, obs: &Tensor, action: &Tensor) -> Tensor {
        let input = Tensor::cat(&[obs, action], 1);
        self.net.forward(&input).squeeze_dim(-1)
    }

    /// Σ‖W‖² over the hidden linear weights (biases, layer norms and the
    /// output layer excluded).
    pub fn hidden_weight_l2(&self) -> Tensor {
        self.vs
            .variables()
            .into_iter()
            .filter(|(name, _)| is_hidden_weight(name))
            .fold(
                Tensor::zeros([0i64; 0], (tch::Kind::Float, self.vs.device())),
                |acc, (_, w)| acc + w.pow_tensor_scalar(2).sum(tch::Kind::Float),
            )
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}
