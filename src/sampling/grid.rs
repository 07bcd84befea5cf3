//! Deterministic sampler over a fixed grid of configurations.
//!
//! Every call returns the same grid with uniform weights and consumes no
//! randomness. The per-walker wavefunction state is carried over between
//! calls, so repairs applied to it persist.

use rand_chacha::ChaCha8Rng;

use super::traits::{Sampler, SamplerState};
use crate::error::{Result, VmcError};
use crate::fit::Stats;
use crate::wavefunction::{Ansatz, Electrons, ParamTree};

#[derive(Clone, Debug)]
pub struct GridSampler<A> {
    ansatz: A,
    grid: Vec<Electrons>,
}

impl<A: Ansatz> GridSampler<A> {
    pub fn new(ansatz: A, grid: Vec<Electrons>) -> Result<Self> {
        if grid.is_empty() {
            return Err(VmcError::EmptyBatch);
        }
        if let Some(expected) = ansatz.n_electrons() {
            if let Some(bad) = grid.iter().find(|r| r.len() != expected) {
                return Err(VmcError::ShapeMismatch {
                    expected,
                    found: bad.len(),
                });
            }
        }
        Ok(Self { ansatz, grid })
    }

    fn evaluate(
        &self,
        params: &ParamTree,
        wf_state: &[A::State],
    ) -> Result<SamplerState<A::State>> {
        let (log_psi, wf_state): (Vec<f64>, Vec<A::State>) = self
            .grid
            .iter()
            .zip(wf_state.iter())
            .map(|(r, state)| {
                let (amplitude, state) = self.ansatz.apply(params, state, r)?;
                Ok((amplitude.log, state))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        Ok(SamplerState {
            r: self.grid.clone(),
            log_weights: vec![0.0; log_psi.len()],
            log_psi,
            wf_state,
            step_size: 0.0,
        })
    }
}

impl<A: Ansatz> Sampler<A> for GridSampler<A> {
    fn init(&self, _rng: &mut ChaCha8Rng, params: &ParamTree) -> Result<SamplerState<A::State>> {
        let wf_state = vec![self.ansatz.init_state(); self.grid.len()];
        self.evaluate(params, &wf_state)
    }

    fn sample(
        &self,
        _rng: &mut ChaCha8Rng,
        params: &ParamTree,
        state: SamplerState<A::State>,
    ) -> Result<(Vec<Electrons>, SamplerState<A::State>, Stats)> {
        if state.wf_state.len() != self.grid.len() {
            return Err(VmcError::ShapeMismatch {
                expected: self.grid.len(),
                found: state.wf_state.len(),
            });
        }
        let state = self.evaluate(params, &state.wf_state)?;
        let mut stats = Stats::new();
        stats.insert("sampling/grid_points".to_string(), self.grid.len() as f64);
        Ok((state.r.clone(), state, stats))
    }
}
