//! Running observation normalization.

use serde::{Deserialize, Serialize};

/// Per-dimension running mean and variance (parallel-axis update).
///
/// Normalized values are clipped to `[-clip, clip]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningMeanStd {
    mean: Vec<f64>,
    var: Vec<f64>,
    count: f64,
    clip: f32,
}

impl RunningMeanStd {
    /// Observation clip range.
    pub const DEFAULT_CLIP: f32 = 5.0;

    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0.0; dim],
            var: vec![1.0; dim],
            count: 1e-4,
            clip: Self::DEFAULT_CLIP,
        }
    }

    /// Folds a batch of observations into the statistics.
    pub fn update(&mut self, batch: &[&[f32]]) {
        if batch.is_empty() {
            return;
        }
        let n = batch.len() as f64;
        let dim = self.mean.len();

        let mut batch_mean = vec![0.0; dim];
        for obs in batch {
            for (m, &x) in batch_mean.iter_mut().zip(obs.iter()) {
                *m += x as f64 / n;
            }
        }
        let mut batch_var = vec![0.0; dim];
        for obs in batch {
            for ((v, &x), m) in batch_var.iter_mut().zip(obs.iter()).zip(&batch_mean) {
                *v += (x as f64 - m).powi(2) / n;
            }
        }

        let total = self.count + n;
        for i in 0..dim {
            let delta = batch_mean[i] - self.mean[i];
            let m2 = self.var[i] * self.count
                + batch_var[i] * n
                + delta * delta * self.count * n / total;
            self.mean[i] += delta * n / total;
            self.var[i] = m2 / total;
        }
        self.count = total;
    }

    pub fn normalize(&self, obs: &[f32]) -> Vec<f32> {
        obs.iter()
            .zip(&self.mean)
            .zip(&self.var)
            .map(|((&x, &mean), &var)| {
                let z = (x as f64 - mean) / (var.sqrt() + 1e-8);
                (z as f32).clamp(-self.clip, self.clip)
            })
            .collect()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn std(&self) -> Vec<f64> {
        self.var.iter().map(|v| v.sqrt()).collect()
    }
}
