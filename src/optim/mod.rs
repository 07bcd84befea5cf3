//! Optimizer adapter: one training step behind a single contract.
//!
//! Each step samples the walker ensemble under the current parameters,
//! evaluates the loss and its surrogate gradient, and hands the gradient to
//! the configured backend. The backend is chosen once, from configuration.

mod first_order;
mod kfac;

pub use first_order::{FirstOrderConfig, FirstOrderState, LrSchedule, UpdateRule};
pub use kfac::{
    register_layers, CurvatureBlock, JacobianRecorder, KfacConfig, KfacState, KfacStats,
    LayerPattern,
};

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VmcError};
use crate::fit::{exp_normalize_mean, split_seed, step_rng, Batch, LossFn, NoCurvature, Stats};
use crate::hamiltonian::Hamiltonian;
use crate::sampling::{Sampler, SamplerState};
use crate::wavefunction::{Ansatz, ParamTree};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerConfig {
    FirstOrder(FirstOrderConfig),
    CurvatureAware(KfacConfig),
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            OptimizerConfig::FirstOrder(config) => config.validate(),
            OptimizerConfig::CurvatureAware(config) => config.validate(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OptState {
    FirstOrder(FirstOrderState),
    CurvatureAware(KfacState),
}

/// Everything one optimizer step produces.
#[derive(Clone, Debug)]
pub struct StepOutput<S> {
    pub params: ParamTree,
    pub opt: OptState,
    pub sampler: SamplerState<S>,
    pub stats: Stats,
}

pub struct Optimizer<A, H, Smp> {
    loss: LossFn<A, H>,
    sampler: Smp,
    config: OptimizerConfig,
}

impl<A, H, Smp> Optimizer<A, H, Smp>
where
    A: Ansatz,
    H: Hamiltonian<A>,
    Smp: Sampler<A>,
{
    pub fn new(loss: LossFn<A, H>, sampler: Smp, config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            loss,
            sampler,
            config,
        })
    }

    pub fn loss(&self) -> &LossFn<A, H> {
        &self.loss
    }

    pub fn sampler(&self) -> &Smp {
        &self.sampler
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Backend state for `params`. The curvature backend is seeded with one
    /// batch built from the walkers of `sampler_state`.
    pub fn init(
        &self,
        rng: &mut ChaCha8Rng,
        params: &ParamTree,
        sampler_state: &SamplerState<A::State>,
    ) -> Result<OptState> {
        match &self.config {
            OptimizerConfig::FirstOrder(config) => Ok(OptState::FirstOrder(config.init(params))),
            OptimizerConfig::CurvatureAware(config) => {
                let batch = Batch {
                    r: sampler_state.r.clone(),
                    weights: exp_normalize_mean(&sampler_state.log_weights),
                };
                let mut recorder = JacobianRecorder::default();
                self.loss
                    .value_and_grad(params, &sampler_state.wf_state, &batch, &mut recorder)?;
                Ok(OptState::CurvatureAware(config.init(params, rng, &recorder)?))
            }
        }
    }

    /// Sample, evaluate the gradient and update the parameters.
    ///
    /// All randomness of the step derives from `seed`, so calling twice with
    /// the same arguments gives the same result.
    pub fn step(
        &self,
        seed: u64,
        params: &ParamTree,
        opt: &OptState,
        sampler_state: SamplerState<A::State>,
    ) -> Result<StepOutput<A::State>> {
        match (&self.config, opt) {
            (OptimizerConfig::FirstOrder(config), OptState::FirstOrder(state)) => {
                let mut rng = step_rng(seed);
                let (r, mut sampler_state, mut stats) =
                    self.sampler.sample(&mut rng, params, sampler_state)?;
                let batch = Batch {
                    r,
                    weights: exp_normalize_mean(&sampler_state.log_weights),
                };
                let (out, grads) = self.loss.value_and_grad(
                    params,
                    &sampler_state.wf_state,
                    &batch,
                    &mut NoCurvature,
                )?;
                let learning_rate = config.learning_rate_at(state.count());
                let (updates, state) = config.update(&grads, state)?;

                stats.insert("opt/learning_rate".to_string(), learning_rate);
                stats.insert("opt/param_norm".to_string(), params.norm());
                stats.insert("opt/grad_norm".to_string(), grads.norm());
                stats.insert("opt/update_norm".to_string(), updates.norm());
                stats.insert("loss".to_string(), out.loss);
                stats.extend(out.stats);
                sampler_state.wf_state = out.state;

                Ok(StepOutput {
                    params: params.add_scaled(&updates, 1.0)?,
                    opt: OptState::FirstOrder(state),
                    sampler: sampler_state,
                    stats,
                })
            }
            (OptimizerConfig::CurvatureAware(config), OptState::CurvatureAware(state)) => {
                let (sample_seed, curvature_seed) = split_seed(seed);
                let mut rng = step_rng(sample_seed);
                let (r, mut sampler_state, mut stats) =
                    self.sampler.sample(&mut rng, params, sampler_state)?;

                // the backend works on copies; sampler-owned data stays untouched
                let weights = exp_normalize_mean(&sampler_state.log_weights);
                let wf_state = sampler_state.wf_state.clone();
                let batch = Batch { r, weights };

                let mut recorder = JacobianRecorder::default();
                let (out, grads) =
                    self.loss.value_and_grad(params, &wf_state, &batch, &mut recorder)?;
                let mut curvature_rng = step_rng(curvature_seed);
                let (updates, state, kfac_stats) =
                    config.update(&mut curvature_rng, params, &grads, &recorder, state)?;

                stats.insert("opt/param_norm".to_string(), params.norm());
                stats.insert("opt/grad_norm".to_string(), kfac_stats.precon_grad_norm);
                stats.insert("opt/update_norm".to_string(), kfac_stats.update_norm);
                stats.insert("loss".to_string(), out.loss);
                stats.extend(out.stats);
                sampler_state.wf_state = out.state;

                Ok(StepOutput {
                    params: params.add_scaled(&updates, 1.0)?,
                    opt: OptState::CurvatureAware(state),
                    sampler: sampler_state,
                    stats,
                })
            }
            _ => Err(VmcError::InvalidConfig(
                "optimizer state was created for a different backend".into(),
            )),
        }
    }
}
