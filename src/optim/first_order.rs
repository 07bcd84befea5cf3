//! First-order update rules: plain SGD and Adam, with optional gradient
//! norm clipping and a stepwise learning-rate decay.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmcError};
use crate::wavefunction::ParamTree;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum UpdateRule {
    Sgd {
        learning_rate: f64,
    },
    Adam {
        learning_rate: f64,
        #[serde(default = "default_b1")]
        b1: f64,
        #[serde(default = "default_b2")]
        b2: f64,
        #[serde(default = "default_eps")]
        eps: f64,
    },
}

fn default_b1() -> f64 {
    0.9
}
fn default_b2() -> f64 {
    0.999
}
fn default_eps() -> f64 {
    1e-8
}
fn default_epoch_size() -> u64 {
    100
}

/// Learning rate as a function of the number of updates already applied.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    #[default]
    Constant,
    /// Multiply the rate by `gamma` after every `epoch_size` updates.
    Exponential {
        gamma: f64,
        #[serde(default = "default_epoch_size")]
        epoch_size: u64,
    },
}

impl LrSchedule {
    pub fn factor(&self, step: u64) -> f64 {
        match *self {
            LrSchedule::Constant => 1.0,
            LrSchedule::Exponential { gamma, epoch_size } => {
                let epochs = (step / epoch_size).min(i32::MAX as u64) as i32;
                gamma.powi(epochs)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FirstOrderConfig {
    #[serde(flatten)]
    pub rule: UpdateRule,
    /// Rescale the gradient whenever its global L2 norm exceeds this value
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    #[serde(default)]
    pub schedule: LrSchedule,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FirstOrderState {
    Sgd {
        count: u64,
    },
    Adam {
        count: u64,
        mu: ParamTree,
        nu: ParamTree,
    },
}

impl FirstOrderState {
    /// Number of updates applied so far.
    pub fn count(&self) -> u64 {
        match *self {
            FirstOrderState::Sgd { count } => count,
            FirstOrderState::Adam { count, .. } => count,
        }
    }
}

impl FirstOrderConfig {
    fn with_rule(rule: UpdateRule) -> Self {
        Self {
            rule,
            max_grad_norm: None,
            schedule: LrSchedule::Constant,
        }
    }

    pub fn sgd(learning_rate: f64) -> Self {
        Self::with_rule(UpdateRule::Sgd { learning_rate })
    }

    pub fn adam(learning_rate: f64) -> Self {
        Self::with_rule(UpdateRule::Adam {
            learning_rate,
            b1: default_b1(),
            b2: default_b2(),
            eps: default_eps(),
        })
    }

    pub fn with_max_grad_norm(mut self, max_grad_norm: f64) -> Self {
        self.max_grad_norm = Some(max_grad_norm);
        self
    }

    pub fn with_schedule(mut self, schedule: LrSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Initial learning rate of the rule.
    pub fn learning_rate(&self) -> f64 {
        match self.rule {
            UpdateRule::Sgd { learning_rate } => learning_rate,
            UpdateRule::Adam { learning_rate, .. } => learning_rate,
        }
    }

    /// Learning rate used for the update after `count` earlier ones.
    pub fn learning_rate_at(&self, count: u64) -> f64 {
        self.learning_rate() * self.schedule.factor(count)
    }

    pub fn validate(&self) -> Result<()> {
        let lr = self.learning_rate();
        if !(lr > 0.0 && lr.is_finite()) {
            return Err(VmcError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                lr
            )));
        }
        if let UpdateRule::Adam { b1, b2, eps, .. } = self.rule {
            if !((0.0..1.0).contains(&b1) && (0.0..1.0).contains(&b2) && eps > 0.0) {
                return Err(VmcError::InvalidConfig(format!(
                    "Adam needs b1, b2 in [0, 1) and eps > 0, got b1={}, b2={}, eps={}",
                    b1, b2, eps
                )));
            }
        }
        if let Some(max) = self.max_grad_norm {
            if !(max > 0.0) {
                return Err(VmcError::InvalidConfig(format!(
                    "max_grad_norm must be positive, got {}",
                    max
                )));
            }
        }
        if let LrSchedule::Exponential { gamma, epoch_size } = self.schedule {
            if !(gamma > 0.0 && gamma <= 1.0) || epoch_size == 0 {
                return Err(VmcError::InvalidConfig(format!(
                    "exponential schedule needs 0 < gamma <= 1 and epoch_size > 0, got {} and {}",
                    gamma, epoch_size
                )));
            }
        }
        Ok(())
    }

    pub fn init(&self, params: &ParamTree) -> FirstOrderState {
        match self.rule {
            UpdateRule::Sgd { .. } => FirstOrderState::Sgd { count: 0 },
            UpdateRule::Adam { .. } => FirstOrderState::Adam {
                count: 0,
                mu: params.zeros_like(),
                nu: params.zeros_like(),
            },
        }
    }

    /// `grads` scaled down to `max_grad_norm` if it is longer.
    fn clip(&self, grads: &ParamTree) -> ParamTree {
        let norm = grads.flatten().norm();
        match self.max_grad_norm {
            Some(max) if norm > max => grads.map(|g| g * max / (norm + 1e-6)),
            _ => grads.clone(),
        }
    }

    /// Parameter deltas for `grads`; the caller adds them to the parameters.
    pub fn update(
        &self,
        grads: &ParamTree,
        state: &FirstOrderState,
    ) -> Result<(ParamTree, FirstOrderState)> {
        let lr = self.learning_rate_at(state.count());
        let grads = self.clip(grads);
        match (&self.rule, state) {
            (UpdateRule::Sgd { .. }, FirstOrderState::Sgd { count }) => Ok((
                grads.map(|g| -lr * g),
                FirstOrderState::Sgd { count: count + 1 },
            )),
            (&UpdateRule::Adam { b1, b2, eps, .. }, FirstOrderState::Adam { count, mu, nu }) => {
                let count = count + 1;
                let mu = mu.zip_map(&grads, |m, g| b1 * m + (1.0 - b1) * g)?;
                let nu = nu.zip_map(&grads, |v, g| b2 * v + (1.0 - b2) * g * g)?;
                let mu_hat_scale = 1.0 / (1.0 - b1.powi(count as i32));
                let nu_hat_scale = 1.0 / (1.0 - b2.powi(count as i32));
                let updates = mu.zip_map(&nu, |m, v| {
                    -lr * (m * mu_hat_scale) / ((v * nu_hat_scale).sqrt() + eps)
                })?;
                Ok((updates, FirstOrderState::Adam { count, mu, nu }))
            }
            _ => Err(VmcError::InvalidConfig(
                "optimizer state does not match the first-order rule".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wavefunction::TensorKind;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn tree(values: &[f64]) -> ParamTree {
        ParamTree::new()
            .with_tensor("p", TensorKind::Generic, DVector::from_column_slice(values))
            .unwrap()
    }

    #[test]
    fn test_sgd_update() {
        let config = FirstOrderConfig::sgd(0.1);
        let state = config.init(&tree(&[0.0, 0.0]));
        let (updates, state) = config.update(&tree(&[1.0, -2.0]), &state).unwrap();
        assert_eq!(updates.flatten().as_slice(), &[-0.1, 0.2]);
        assert_eq!(state.count(), 1);
    }

    #[test]
    fn test_adam_first_step_is_sign_times_lr() {
        let config = FirstOrderConfig::adam(0.01);
        let state = config.init(&tree(&[0.0, 0.0]));
        let (updates, state) = config.update(&tree(&[3.0, -0.5]), &state).unwrap();
        let flat = updates.flatten();
        assert_relative_eq!(flat[0], -0.01, epsilon = 1e-8);
        assert_relative_eq!(flat[1], 0.01, epsilon = 1e-8);
        assert!(matches!(state, FirstOrderState::Adam { count: 1, .. }));
    }

    #[test]
    fn test_gradient_norm_clipped() {
        let config = FirstOrderConfig::sgd(1.0).with_max_grad_norm(1.0);
        let state = config.init(&tree(&[0.0, 0.0]));
        let (updates, _) = config.update(&tree(&[3.0, -4.0]), &state).unwrap();
        let flat = updates.flatten();
        assert_relative_eq!(flat.norm(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(flat[0] / flat[1], -0.75, epsilon = 1e-12);

        // short gradients pass unchanged
        let (updates, _) = config.update(&tree(&[0.3, -0.4]), &state).unwrap();
        assert_eq!(updates.flatten().as_slice(), &[-0.3, 0.4]);
    }

    #[test]
    fn test_exponential_schedule_steps_per_epoch() {
        let schedule = LrSchedule::Exponential { gamma: 0.5, epoch_size: 3 };
        let config = FirstOrderConfig::sgd(0.8).with_schedule(schedule);
        let mut state = config.init(&tree(&[0.0]));
        let mut rates = Vec::new();
        for _ in 0..7 {
            let (updates, next) = config.update(&tree(&[-1.0]), &state).unwrap();
            rates.push(updates.flatten()[0]);
            state = next;
        }
        assert_eq!(rates, vec![0.8, 0.8, 0.8, 0.4, 0.4, 0.4, 0.2]);
        assert_eq!(config.learning_rate_at(7), 0.2);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let config = FirstOrderConfig::adam(0.01);
        assert!(config.update(&tree(&[1.0]), &FirstOrderState::Sgd { count: 0 }).is_err());
        assert!(FirstOrderConfig::adam(-1.0).validate().is_err());
        assert!(FirstOrderConfig::sgd(0.1).with_max_grad_norm(0.0).validate().is_err());
        let bad = LrSchedule::Exponential { gamma: 0.5, epoch_size: 0 };
        assert!(FirstOrderConfig::sgd(0.1).with_schedule(bad).validate().is_err());
    }
}
