//! Metropolis-Hastings sampling of |Ψ|² with an adaptive step size.

use nalgebra::Vector3;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{Sampler, SamplerState};
use crate::error::{Result, VmcError};
use crate::fit::Stats;
use crate::wavefunction::{Ansatz, Electrons, ParamTree};

/// Parameters for the Metropolis sampler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetropolisConfig {
    pub n_walkers: usize,
    pub n_electrons: usize,
    /// Sweeps over all walkers per training step
    #[serde(default = "default_n_sweeps")]
    pub n_sweeps: usize,
    /// Sweeps performed once when the ensemble is created
    #[serde(default = "default_n_equilibrate")]
    pub n_equilibrate: usize,
    #[serde(default = "default_initial_step_size")]
    pub initial_step_size: f64,
    #[serde(default = "default_min_step_size")]
    pub min_step_size: f64,
    #[serde(default = "default_max_step_size")]
    pub max_step_size: f64,
    #[serde(default = "default_target_acceptance")]
    pub target_acceptance: f64,
    /// Standard deviation of the initial electron cloud
    #[serde(default = "default_init_width")]
    pub init_width: f64,
}

fn default_n_sweeps() -> usize {
    10
}
fn default_n_equilibrate() -> usize {
    100
}
fn default_initial_step_size() -> f64 {
    0.5
}
fn default_min_step_size() -> f64 {
    0.05
}
fn default_max_step_size() -> f64 {
    2.0
}
fn default_target_acceptance() -> f64 {
    0.5
}
fn default_init_width() -> f64 {
    1.0
}

impl MetropolisConfig {
    pub fn new(n_walkers: usize, n_electrons: usize) -> Self {
        Self {
            n_walkers,
            n_electrons,
            n_sweeps: default_n_sweeps(),
            n_equilibrate: default_n_equilibrate(),
            initial_step_size: default_initial_step_size(),
            min_step_size: default_min_step_size(),
            max_step_size: default_max_step_size(),
            target_acceptance: default_target_acceptance(),
            init_width: default_init_width(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_walkers == 0 || self.n_electrons == 0 {
            return Err(VmcError::InvalidConfig(
                "sampler needs at least one walker and one electron".into(),
            ));
        }
        if !(self.min_step_size > 0.0 && self.min_step_size <= self.max_step_size) {
            return Err(VmcError::InvalidConfig(format!(
                "step size bounds [{}, {}] are not a positive interval",
                self.min_step_size, self.max_step_size
            )));
        }
        if !(self.target_acceptance > 0.0 && self.target_acceptance < 1.0) {
            return Err(VmcError::InvalidConfig(format!(
                "target_acceptance must lie in (0, 1), got {}",
                self.target_acceptance
            )));
        }
        Ok(())
    }
}

/// Metropolis sampler over a fixed ensemble of walkers.
#[derive(Clone, Debug)]
pub struct MetropolisSampler<A> {
    ansatz: A,
    config: MetropolisConfig,
}

impl<A: Ansatz> MetropolisSampler<A> {
    pub fn new(ansatz: A, config: MetropolisConfig) -> Result<Self> {
        config.validate()?;
        if let Some(expected) = ansatz.n_electrons() {
            if expected != config.n_electrons {
                return Err(VmcError::ShapeMismatch {
                    expected,
                    found: config.n_electrons,
                });
            }
        }
        Ok(Self { ansatz, config })
    }

    pub fn config(&self) -> &MetropolisConfig {
        &self.config
    }

    /// One sweep: a single all-electron move proposal per walker.
    /// Returns the number of accepted moves.
    fn sweep(
        &self,
        rng: &mut ChaCha8Rng,
        params: &ParamTree,
        state: &mut SamplerState<A::State>,
    ) -> Result<usize> {
        let normal = Normal::new(0.0, state.step_size)
            .map_err(|e| VmcError::InvalidConfig(e.to_string()))?;
        let mut accepted = 0;
        for k in 0..state.n_walkers() {
            let proposal: Electrons = state.r[k]
                .iter()
                .map(|pos| {
                    pos + Vector3::new(
                        normal.sample(rng),
                        normal.sample(rng),
                        normal.sample(rng),
                    )
                })
                .collect();
            let (amplitude, new_wf_state) =
                self.ansatz.apply(params, &state.wf_state[k], &proposal)?;
            let acceptance_ratio = (2.0 * (amplitude.log - state.log_psi[k])).exp();
            if rng.gen::<f64>() < acceptance_ratio {
                state.r[k] = proposal;
                state.log_psi[k] = amplitude.log;
                state.wf_state[k] = new_wf_state;
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    /// Adapt the step size toward the target acceptance rate.
    fn adapt_step_size(&self, state: &mut SamplerState<A::State>, acceptance_rate: f64) {
        let adjustment = (acceptance_rate / self.config.target_acceptance).sqrt();
        state.step_size = (state.step_size * adjustment)
            .clamp(self.config.min_step_size, self.config.max_step_size);
    }

    /// Re-evaluate ln|Ψ| for every walker under the current parameters.
    fn refresh(&self, params: &ParamTree, state: &mut SamplerState<A::State>) -> Result<()> {
        let evaluated = state
            .r
            .par_iter()
            .zip(state.wf_state.par_iter())
            .map(|(r, wf_state)| self.ansatz.apply(params, wf_state, r))
            .collect::<Result<Vec<_>>>()?;
        for (k, (amplitude, wf_state)) in evaluated.into_iter().enumerate() {
            state.log_psi[k] = amplitude.log;
            state.wf_state[k] = wf_state;
        }
        Ok(())
    }

    fn run_sweeps(
        &self,
        rng: &mut ChaCha8Rng,
        params: &ParamTree,
        state: &mut SamplerState<A::State>,
        n_sweeps: usize,
    ) -> Result<f64> {
        let mut accepted = 0;
        for _ in 0..n_sweeps {
            accepted += self.sweep(rng, params, state)?;
        }
        let total = (n_sweeps * state.n_walkers()).max(1);
        let acceptance_rate = accepted as f64 / total as f64;
        if n_sweeps > 0 {
            self.adapt_step_size(state, acceptance_rate);
        }
        Ok(acceptance_rate)
    }
}

impl<A: Ansatz> Sampler<A> for MetropolisSampler<A> {
    fn init(&self, rng: &mut ChaCha8Rng, params: &ParamTree) -> Result<SamplerState<A::State>> {
        let cloud = Normal::new(0.0, self.config.init_width)
            .map_err(|e| VmcError::InvalidConfig(e.to_string()))?;
        let r: Vec<Electrons> = (0..self.config.n_walkers)
            .map(|_| {
                (0..self.config.n_electrons)
                    .map(|_| Vector3::new(cloud.sample(rng), cloud.sample(rng), cloud.sample(rng)))
                    .collect()
            })
            .collect();
        let n = r.len();
        let mut state = SamplerState {
            r,
            log_psi: vec![0.0; n],
            log_weights: vec![0.0; n],
            wf_state: vec![self.ansatz.init_state(); n],
            step_size: self.config.initial_step_size,
        };
        self.refresh(params, &mut state)?;
        let acceptance = self.run_sweeps(rng, params, &mut state, self.config.n_equilibrate)?;
        debug!(
            acceptance,
            step_size = state.step_size,
            "equilibrated {} walkers",
            state.n_walkers()
        );
        Ok(state)
    }

    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        params: &ParamTree,
        mut state: SamplerState<A::State>,
    ) -> Result<(Vec<Electrons>, SamplerState<A::State>, Stats)> {
        self.refresh(params, &mut state)?;
        let acceptance = self.run_sweeps(rng, params, &mut state, self.config.n_sweeps)?;

        let mut stats = Stats::new();
        stats.insert("sampling/acceptance".to_string(), acceptance);
        stats.insert("sampling/step_size".to_string(), state.step_size);
        Ok((state.r.clone(), state, stats))
    }
}
