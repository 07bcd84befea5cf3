//! Lazy training loop.
//!
//! [`Fit`] is an iterator that advances a [`TrainState`] by one optimizer
//! step per index drawn from the caller's step sequence. It ends when the
//! step sequence ends, or after yielding the first error.
//!
//! An optional state callback inspects the wavefunction state after every
//! step. If it reports an overflow, the step is discarded and re-run once
//! from the previous state with the repaired wavefunction state and the same
//! random seed. The retried result is accepted as is.

use tracing::{debug, warn};

use super::rng::{split_seed, step_rng, RngSequence};
use super::stats::{NullSink, Stats, StatsSink};
use crate::error::Result;
use crate::hamiltonian::Hamiltonian;
use crate::optim::{OptState, Optimizer, StepOutput};
use crate::sampling::{Sampler, SamplerState};
use crate::wavefunction::{Ansatz, ParamTree};

#[derive(Clone, Debug, PartialEq)]
pub struct TrainState<S> {
    pub params: ParamTree,
    pub opt: OptState,
    pub sampler: SamplerState<S>,
}

fn into_parts<S>(out: StepOutput<S>) -> (TrainState<S>, Stats) {
    let state = TrainState {
        params: out.params,
        opt: out.opt,
        sampler: out.sampler,
    };
    (state, out.stats)
}

/// Repairs the per-walker wavefunction state; returns the repaired state and
/// whether an overflow was detected.
pub type StateCallback<S> = Box<dyn FnMut(&[S]) -> (Vec<S>, bool)>;

pub struct Fit<A, H, Smp, I, K = NullSink>
where
    A: Ansatz,
{
    optimizer: Optimizer<A, H, Smp>,
    state: Option<TrainState<A::State>>,
    steps: I,
    seeds: RngSequence,
    callback: Option<StateCallback<A::State>>,
    sink: K,
}

impl<A, H, Smp, I> Fit<A, H, Smp, I, NullSink>
where
    A: Ansatz,
    H: Hamiltonian<A>,
    Smp: Sampler<A>,
    I: Iterator<Item = u64>,
{
    /// Initialise the walkers and the optimizer state from `seed`.
    pub fn new<S>(
        optimizer: Optimizer<A, H, Smp>,
        params: ParamTree,
        steps: S,
        seed: u64,
    ) -> Result<Self>
    where
        S: IntoIterator<IntoIter = I>,
    {
        let (init_seed, sequence_seed) = split_seed(seed);
        let mut rng = step_rng(init_seed);
        let sampler = optimizer.sampler().init(&mut rng, &params)?;
        let opt = optimizer.init(&mut rng, &params, &sampler)?;
        debug!(
            walkers = sampler.n_walkers(),
            params = params.len_flat(),
            "initialised training state"
        );
        Ok(Self::from_state(optimizer, TrainState { params, opt, sampler }, steps, sequence_seed))
    }

    /// Continue from an existing state; per-step seeds are drawn from `seed`.
    pub fn from_state<S>(
        optimizer: Optimizer<A, H, Smp>,
        state: TrainState<A::State>,
        steps: S,
        seed: u64,
    ) -> Self
    where
        S: IntoIterator<IntoIter = I>,
    {
        Self {
            optimizer,
            state: Some(state),
            steps: steps.into_iter(),
            seeds: RngSequence::new(seed),
            callback: None,
            sink: NullSink,
        }
    }
}

impl<A, H, Smp, I, K> Fit<A, H, Smp, I, K>
where
    A: Ansatz,
    H: Hamiltonian<A>,
    Smp: Sampler<A>,
    I: Iterator<Item = u64>,
    K: StatsSink,
{
    pub fn with_state_callback(mut self, callback: StateCallback<A::State>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_sink<K2: StatsSink>(self, sink: K2) -> Fit<A, H, Smp, I, K2> {
        Fit {
            optimizer: self.optimizer,
            state: self.state,
            steps: self.steps,
            seeds: self.seeds,
            callback: self.callback,
            sink,
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Current state; `None` once an error has been yielded.
    pub fn state(&self) -> Option<&TrainState<A::State>> {
        self.state.as_ref()
    }

    fn advance(
        &mut self,
        step: u64,
        seed: u64,
        state: TrainState<A::State>,
    ) -> Result<(TrainState<A::State>, Stats)> {
        let out = self
            .optimizer
            .step(seed, &state.params, &state.opt, state.sampler.clone())?;

        if let Some(callback) = self.callback.as_mut() {
            let (repaired, overflow) = callback(out.sampler.wf_state.as_slice());
            if overflow {
                warn!(step, "wavefunction state overflow, retrying step");
                let mut sampler = state.sampler;
                sampler.wf_state = repaired;
                let retried = self.optimizer.step(seed, &state.params, &state.opt, sampler)?;
                return Ok(into_parts(retried));
            }
        }
        Ok(into_parts(out))
    }
}

impl<A, H, Smp, I, K> Iterator for Fit<A, H, Smp, I, K>
where
    A: Ansatz,
    H: Hamiltonian<A>,
    Smp: Sampler<A>,
    I: Iterator<Item = u64>,
    K: StatsSink,
{
    type Item = Result<(u64, TrainState<A::State>, Stats)>;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.state.take()?;
        let step = match self.steps.next() {
            Some(step) => step,
            None => {
                self.state = Some(state);
                return None;
            }
        };
        let seed = self.seeds.next_seed();
        match self.advance(step, seed, state) {
            Ok((state, stats)) => {
                self.sink.record(step, &stats);
                self.state = Some(state.clone());
                Some(Ok((step, state, stats)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
