//! Exploration noise and the noise specification parser.
//!
//! A noise specification is a comma-separated list of `<kind>_<stddev>`
//! tokens (or `none`):
//!
//! | token                  | produces                              |
//! |------------------------|---------------------------------------|
//! | `none`                 | nothing                               |
//! | `adaptive-param_0.2`   | [`AdaptiveParamNoiseSpec`]            |
//! | `normal_0.1`           | [`ActionNoise::Normal`]               |
//! | `ou_0.05`              | [`ActionNoise::OrnsteinUhlenbeck`]    |
//!
//! A later token replaces an earlier one of the same class, so
//! `"normal_0.1,ou_0.05"` yields OU action noise.

use std::collections::BTreeMap;

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::ConfigError;

/// Parameter-space noise whose magnitude is adapted toward a target action
/// perturbation.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveParamNoiseSpec {
    pub initial_stddev: f64,
    pub desired_action_stddev: f64,
    pub adoption_coefficient: f64,
    pub current_stddev: f64,
}

impl AdaptiveParamNoiseSpec {
    pub fn new(initial_stddev: f64, desired_action_stddev: f64) -> Self {
        Self {
            initial_stddev,
            desired_action_stddev,
            adoption_coefficient: 1.01,
            current_stddev: initial_stddev,
        }
    }

    /// Shrinks the stddev when the measured action distance overshoots the
    /// target, grows it otherwise.
    pub fn adapt(&mut self, distance: f64) {
        if distance > self.desired_action_stddev {
            self.current_stddev /= self.adoption_coefficient;
        } else {
            self.current_stddev *= self.adoption_coefficient;
        }
    }

    pub fn stats(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([("param_noise_stddev".to_string(), self.current_stddev)])
    }
}

/// Gaussian noise, independent per action dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalActionNoise {
    pub mu: Vec<f32>,
    pub sigma: Vec<f32>,
}

/// Ornstein-Uhlenbeck process noise, correlated across time steps.
#[derive(Debug, Clone, PartialEq)]
pub struct OrnsteinUhlenbeckActionNoise {
    pub mu: Vec<f32>,
    pub sigma: Vec<f32>,
    pub theta: f32,
    pub dt: f32,
    x_prev: Vec<f32>,
}

impl OrnsteinUhlenbeckActionNoise {
    pub fn new(mu: Vec<f32>, sigma: Vec<f32>) -> Self {
        let x_prev = vec![0.0; mu.len()];
        Self {
            mu,
            sigma,
            theta: 0.15,
            dt: 1e-2,
            x_prev,
        }
    }

    /// Current state of the process.
    pub fn state(&self) -> &[f32] {
        &self.x_prev
    }
}

/// Action-space exploration noise.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionNoise {
    Normal(NormalActionNoise),
    OrnsteinUhlenbeck(OrnsteinUhlenbeckActionNoise),
}

impl ActionNoise {
    /// Draws one perturbation, one value per action dimension.
    pub fn sample<R: Rng>(&mut self, rng: &mut R) -> Vec<f32> {
        match self {
            ActionNoise::Normal(n) => n
                .mu
                .iter()
                .zip(&n.sigma)
                .map(|(mu, sigma)| mu + sigma * rng.sample::<f32, _>(StandardNormal))
                .collect(),
            ActionNoise::OrnsteinUhlenbeck(ou) => {
                let sqrt_dt = ou.dt.sqrt();
                for ((x, mu), sigma) in ou.x_prev.iter_mut().zip(&ou.mu).zip(&ou.sigma) {
                    let eps: f32 = rng.sample(StandardNormal);
                    *x += ou.theta * (mu - *x) * ou.dt + sigma * sqrt_dt * eps;
                }
                ou.x_prev.clone()
            }
        }
    }

    /// Restarts time-correlated noise; Gaussian noise is memoryless.
    pub fn reset(&mut self) {
        if let ActionNoise::OrnsteinUhlenbeck(ou) = self {
            ou.x_prev.iter_mut().for_each(|x| *x = 0.0);
        }
    }

    /// Number of action dimensions this noise perturbs.
    pub fn dim(&self) -> usize {
        match self {
            ActionNoise::Normal(n) => n.mu.len(),
            ActionNoise::OrnsteinUhlenbeck(ou) => ou.mu.len(),
        }
    }
}

/// Noise objects produced by [`parse_noise`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoiseConfig {
    pub action_noise: Option<ActionNoise>,
    pub param_noise: Option<AdaptiveParamNoiseSpec>,
}

impl NoiseConfig {
    pub fn is_empty(&self) -> bool {
        self.action_noise.is_none() && self.param_noise.is_none()
    }
}

/// Parses a noise specification for an action space of `nb_actions` dimensions.
pub fn parse_noise(spec: &str, nb_actions: usize) -> Result<NoiseConfig, ConfigError> {
    let mut noise = NoiseConfig::default();

    for token in spec.split(',').map(str::trim) {
        if token == "none" {
            continue;
        }
        let Some((kind, raw_stddev)) = token.split_once('_') else {
            return match token {
                "adaptive-param" | "normal" | "ou" => {
                    Err(ConfigError::MissingNoiseStddev(token.to_string()))
                }
                _ => Err(ConfigError::UnknownNoiseType(token.to_string())),
            };
        };
        if !matches!(kind, "adaptive-param" | "normal" | "ou") {
            return Err(ConfigError::UnknownNoiseType(token.to_string()));
        }
        let stddev = parse_stddev(token, raw_stddev)?;

        match kind {
            "adaptive-param" => {
                noise.param_noise = Some(AdaptiveParamNoiseSpec::new(stddev, stddev));
            }
            "normal" => {
                noise.action_noise = Some(ActionNoise::Normal(NormalActionNoise {
                    mu: vec![0.0; nb_actions],
                    sigma: vec![stddev as f32; nb_actions],
                }));
            }
            _ => {
                noise.action_noise = Some(ActionNoise::OrnsteinUhlenbeck(
                    OrnsteinUhlenbeckActionNoise::new(
                        vec![0.0; nb_actions],
                        vec![stddev as f32; nb_actions],
                    ),
                ));
            }
        }
    }

    Ok(noise)
}

fn parse_stddev(token: &str, raw: &str) -> Result<f64, ConfigError> {
    let value: f64 = raw
        .parse()
        .map_err(|e: std::num::ParseFloatError| ConfigError::InvalidNoiseStddev {
            token: token.to_string(),
            reason: e.to_string(),
        })?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidNoiseStddev {
            token: token.to_string(),
            reason: "must be a finite, non-negative number".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn none_yields_no_noise() {
        let noise = parse_noise("none", 3).unwrap();
        assert!(noise.is_empty());
    }

    #[test]
    fn normal_has_zero_mean_and_requested_stddev() {
        let noise = parse_noise("normal_0.1", 3).unwrap();
        assert!(noise.param_noise.is_none());
        match noise.action_noise {
            Some(ActionNoise::Normal(n)) => {
                assert_eq!(n.mu, vec![0.0; 3]);
                assert_eq!(n.sigma, vec![0.1; 3]);
            }
            other => panic!("expected normal noise, got {:?}", other),
        }
    }

    #[test]
    fn normal_samples_match_distribution() {
        let mut noise = parse_noise("normal_0.1", 2).unwrap().action_noise.unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let n = 20_000;
        let samples: Vec<f32> = (0..n).map(|_| noise.sample(&mut rng)[0]).collect();
        let mean = samples.iter().sum::<f32>() / n as f32;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.005, "mean {}", mean);
        assert!((var.sqrt() - 0.1).abs() < 0.005, "std {}", var.sqrt());
    }

    #[test]
    fn adaptive_param_uses_stddev_for_both_fields() {
        let noise = parse_noise("adaptive-param_0.2", 2).unwrap();
        let spec = noise.param_noise.unwrap();
        assert_eq!(spec.initial_stddev, 0.2);
        assert_eq!(spec.desired_action_stddev, 0.2);
        assert_eq!(spec.current_stddev, 0.2);
        assert!(noise.action_noise.is_none());
    }

    #[test]
    fn later_action_noise_replaces_earlier() {
        let noise = parse_noise("normal_0.1,ou_0.05", 2).unwrap();
        assert!(matches!(
            noise.action_noise,
            Some(ActionNoise::OrnsteinUhlenbeck(_))
        ));
    }

    #[test]
    fn mixed_param_and_action_noise() {
        let noise = parse_noise(" adaptive-param_0.2 , normal_0.3 ", 1).unwrap();
        assert!(noise.param_noise.is_some());
        assert!(noise.action_noise.is_some());
    }

    #[test]
    fn parsing_is_idempotent() {
        for spec in ["none", "normal_0.1", "ou_0.2,adaptive-param_0.1", "normal_0.1,none"] {
            assert_eq!(parse_noise(spec, 4), parse_noise(spec, 4));
        }
    }

    #[test]
    fn invalid_tokens_always_error() {
        for spec in ["gauss_0.1", "normal", "normal_abc", "normal_-1", "", "none,uniform_0.1"] {
            for _ in 0..3 {
                assert!(parse_noise(spec, 2).is_err(), "{:?} should fail", spec);
            }
        }
        assert_eq!(
            parse_noise("normal", 2),
            Err(ConfigError::MissingNoiseStddev("normal".to_string()))
        );
        assert_eq!(
            parse_noise("gauss_0.1", 2),
            Err(ConfigError::UnknownNoiseType("gauss_0.1".to_string()))
        );
    }

    #[test]
    fn adapt_moves_stddev_toward_target() {
        let mut spec = AdaptiveParamNoiseSpec::new(0.2, 0.2);
        spec.adapt(0.5);
        assert!((spec.current_stddev - 0.2 / 1.01).abs() < 1e-12);
        spec.adapt(0.0);
        assert!((spec.current_stddev - 0.2).abs() < 1e-12);
        assert_eq!(spec.stats()["param_noise_stddev"], spec.current_stddev);
    }

    #[test]
    fn ou_reset_restores_zero_state() {
        let mut noise = parse_noise("ou_0.5", 2).unwrap().action_noise.unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            noise.sample(&mut rng);
        }
        noise.reset();
        match &noise {
            ActionNoise::OrnsteinUhlenbeck(ou) => assert_eq!(ou.state(), &[0.0, 0.0]),
            _ => unreachable!(),
        }
        assert_eq!(noise.dim(), 2);
    }
}
