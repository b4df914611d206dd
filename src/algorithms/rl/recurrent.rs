//! Recurrent policy head.
//!
//! Observations go through a fully-connected encoder, then a single LSTM
//! layer whose output feeds a tanh action head and a scalar value head. The
//! recurrent state `(h, c)` is carried by the caller between steps, starting
//! from [`LstmPolicy::get_initial_features`].

use tch::{nn, nn::Module, nn::RNN, Device, Tensor};

use super::network::{fc_head, output_layer, HeadConfig};
use crate::error::TrainError;

/// Hidden width of the LSTM cell.
pub const DEFAULT_LSTM_SIZE: usize = 256;

/// Result of a single policy step.
#[derive(Debug)]
pub struct LstmStep {
    /// `[action_dim]`, each entry in `[-1, 1]`.
    pub action: Vec<f32>,
    pub value: f64,
    /// State to pass to the next step.
    pub state: nn::LSTMState,
}

pub struct LstmPolicy {
    vs: nn::VarStore,
    encoder: nn::Sequential,
    lstm: nn::LSTM,
    action_head: nn::Linear,
    value_head: nn::Linear,
    obs_dim: usize,
    lstm_size: usize,
}

impl LstmPolicy {
    pub fn new(
        obs_dim: usize,
        action_dim: usize,
        head: &HeadConfig,
        lstm_size: usize,
        device: Device,
    ) -> Self {
        let vs = nn::VarStore::new(device);
        let p = &vs.root();
        let (encoder, width) = fc_head(&(p / "encoder"), obs_dim, head);
        let lstm = nn::lstm(
            p / "lstm",
            width as i64,
            lstm_size as i64,
            Default::default(),
        );
        let action_head = output_layer(p / "action", lstm_size, action_dim);
        let value_head = nn::linear(p / "value", lstm_size as i64, 1, Default::default());
        Self {
            vs,
            encoder,
            lstm,
            action_head,
            value_head,
            obs_dim,
            lstm_size,
        }
    }

    pub fn lstm_size(&self) -> usize {
        self.lstm_size
    }

    /// Zeroed `(h, c)` for one rollout stream.
    pub fn get_initial_features(&self) -> nn::LSTMState {
        self.lstm.zero_state(1)
    }

    /// Runs the time-ordered observations `[T, obs_dim]` starting from `state`.
    ///
    /// Returns actions `[T, action_dim]`, values `[T]` and the state after the
    /// last step.
    pub fn forward_sequence(
        &self,
        obs: &Tensor,
        state: &nn::LSTMState,
    ) -> (Tensor, Tensor, nn::LSTMState) {
        let features = self.encoder.forward(obs).unsqueeze(0);
        let (outputs, next) = self.lstm.seq_init(&features, state);
        let outputs = outputs.squeeze_dim(0);
        let actions = self.action_head.forward(&outputs).tanh();
        let values = self.value_head.forward(&outputs).squeeze_dim(-1);
        (actions, values, next)
    }

    /// One step from a single observation, without gradients.
    pub fn act(&self, obs: &[f32], state: &nn::LSTMState) -> Result<LstmStep, TrainError> {
        if obs.len() != self.obs_dim {
            return Err(TrainError::ShapeMismatch {
                what: "recurrent policy observation",
                expected: vec![self.obs_dim],
                actual: vec![obs.len()],
            });
        }
        let obs_t = Tensor::from_slice(obs)
            .view([1, self.obs_dim as i64])
            .to_device(self.vs.device());
        let (actions, values, state) = tch::no_grad(|| self.forward_sequence(&obs_t, state));
        let action = Vec::<f32>::try_from(&actions.squeeze_dim(0).to_device(Device::Cpu))?;
        Ok(LstmStep {
            action,
            value: values.double_value(&[0]),
            state,
        })
    }

    /// Value estimate of `obs` under `state`.
    pub fn value(&self, obs: &[f32], state: &nn::LSTMState) -> Result<f64, TrainError> {
        Ok(self.act(obs, state)?.value)
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}
