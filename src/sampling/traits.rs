//! Traits for Monte Carlo samplers.

use rand_chacha::ChaCha8Rng;

use crate::error::Result;
use crate::fit::Stats;
use crate::wavefunction::{Ansatz, Electrons, ParamTree};

/// Walker ensemble threaded through the training loop.
///
/// `r`, `log_weights` and `wf_state` are read by the loss estimator; the
/// remaining fields are bookkeeping for the Metropolis sampler.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplerState<S> {
    pub r: Vec<Electrons>,
    pub log_psi: Vec<f64>,
    pub log_weights: Vec<f64>,
    pub wf_state: Vec<S>,
    pub step_size: f64,
}

impl<S> SamplerState<S> {
    pub fn n_walkers(&self) -> usize {
        self.r.len()
    }
}

/// Draws electron configurations distributed as |Ψ|².
pub trait Sampler<A: Ansatz> {
    /// Create the initial walker ensemble for `params`.
    fn init(&self, rng: &mut ChaCha8Rng, params: &ParamTree) -> Result<SamplerState<A::State>>;

    /// Advance the ensemble under `params` and return the sampled positions.
    fn sample(
        &self,
        rng: &mut ChaCha8Rng,
        params: &ParamTree,
        state: SamplerState<A::State>,
    ) -> Result<(Vec<Electrons>, SamplerState<A::State>, Stats)>;
}
