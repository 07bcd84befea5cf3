//! Model problems shared by the unit tests, and end-to-end training scenarios.

use std::cell::Cell;
use std::rc::Rc;

use approx::assert_relative_eq;
use nalgebra::{DVector, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{Result, VmcError};
use crate::fit::{ClipConfig, Fit, HistorySink, LossFn, Stats, TrainState};
use crate::hamiltonian::{FnHamiltonian, Potential, PotentialHamiltonian};
use crate::optim::{FirstOrderConfig, KfacConfig, Optimizer, OptimizerConfig};
use crate::sampling::{GridSampler, MetropolisConfig, MetropolisSampler, Sampler, SamplerState};
use crate::wavefunction::{Ansatz, Electrons, GaussianMlp, LogAmplitude, ParamTree, TensorKind};

/// ln ψ = -θ₀ x² + θ₁ y of the first electron. The per-walker state is a
/// marker value passed through unchanged.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ToyAnsatz;

pub(crate) fn toy_params(theta0: f64, theta1: f64) -> ParamTree {
    ParamTree::new()
        .with_tensor("theta", TensorKind::Generic, DVector::from_vec(vec![theta0, theta1]))
        .unwrap()
}

impl Ansatz for ToyAnsatz {
    type State = f64;

    fn init_state(&self) -> f64 {
        0.0
    }

    fn apply(
        &self,
        params: &ParamTree,
        state: &f64,
        r: &[Vector3<f64>],
    ) -> Result<(LogAmplitude, f64)> {
        let theta = &params.tensors()[0].values;
        let log = -theta[0] * r[0].x * r[0].x + theta[1] * r[0].y;
        Ok((LogAmplitude { sign: 1.0, log }, *state))
    }

    fn log_derivatives(
        &self,
        params: &ParamTree,
        _state: &f64,
        r: &[Vector3<f64>],
    ) -> Result<ParamTree> {
        Ok(params.map_flat_indexed(|i, _| if i == 0 { -r[0].x * r[0].x } else { r[0].y }))
    }
}

/// Places walkers at fixed quantiles of |ψ|², so the positions (and the
/// energy of the batch) follow θ₀ without any randomness.
struct WidthGridSampler {
    z: Vec<f64>,
}

impl WidthGridSampler {
    fn place(&self, params: &ParamTree, wf_state: Vec<f64>) -> Result<SamplerState<f64>> {
        let width = 1.0 / (4.0 * params.tensors()[0].values[0]).sqrt();
        let r: Vec<Electrons> = self
            .z
            .iter()
            .map(|z| vec![Vector3::new(z * width, 0.0, 0.0)])
            .collect();
        let log_psi = r
            .iter()
            .map(|ri| ToyAnsatz.log_psi(params, &0.0, ri))
            .collect::<Result<Vec<f64>>>()?;
        Ok(SamplerState {
            log_weights: vec![0.0; r.len()],
            r,
            log_psi,
            wf_state,
            step_size: 0.0,
        })
    }
}

impl Sampler<ToyAnsatz> for WidthGridSampler {
    fn init(&self, _rng: &mut ChaCha8Rng, params: &ParamTree) -> Result<SamplerState<f64>> {
        self.place(params, vec![0.0; self.z.len()])
    }

    fn sample(
        &self,
        _rng: &mut ChaCha8Rng,
        params: &ParamTree,
        state: SamplerState<f64>,
    ) -> Result<(Vec<Electrons>, SamplerState<f64>, Stats)> {
        let state = self.place(params, state.wf_state)?;
        Ok((state.r.clone(), state, Stats::new()))
    }
}

type Energy = fn(&[Vector3<f64>]) -> f64;

fn quadratic(r: &[Vector3<f64>]) -> f64 {
    r[0].x * r[0].x
}

fn toy_grid() -> Vec<Electrons> {
    (0..12)
        .map(|k| vec![Vector3::new(-1.1 + 0.2 * k as f64, 0.0, 0.0)])
        .collect()
}

fn grid_optimizer(
    energy: Energy,
    clip: ClipConfig,
    grid: Vec<Electrons>,
) -> Optimizer<ToyAnsatz, FnHamiltonian<Energy>, GridSampler<ToyAnsatz>> {
    let loss = LossFn::new(ToyAnsatz, FnHamiltonian(energy), clip).unwrap();
    let sampler = GridSampler::new(ToyAnsatz, grid).unwrap();
    let config = OptimizerConfig::FirstOrder(FirstOrderConfig::adam(0.05));
    Optimizer::new(loss, sampler, config).unwrap()
}

fn harmonium_optimizer(
    config: OptimizerConfig,
) -> (Optimizer<GaussianMlp, PotentialHamiltonian, MetropolisSampler<GaussianMlp>>, ParamTree) {
    let ansatz = GaussianMlp::new(2, 3);
    let params = ansatz.init_params(0.7, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
    let mut sampler_config = MetropolisConfig::new(16, 2);
    sampler_config.n_equilibrate = 20;
    sampler_config.n_sweeps = 2;
    let sampler = MetropolisSampler::new(ansatz.clone(), sampler_config).unwrap();
    let hamiltonian = PotentialHamiltonian::new(Potential::HarmonicTrap {
        omega: 1.0,
        interacting: true,
    });
    let loss = LossFn::new(ansatz, hamiltonian, ClipConfig::new(5.0)).unwrap();
    (Optimizer::new(loss, sampler, config).unwrap(), params)
}

fn train_params(config: OptimizerConfig, seed: u64) -> Vec<ParamTree> {
    let (optimizer, params) = harmonium_optimizer(config);
    Fit::new(optimizer, params, 0..3, seed)
        .unwrap()
        .map(|item| item.map(|(_, state, _)| state.params))
        .collect::<Result<Vec<_>>>()
        .unwrap()
}

#[test]
fn test_training_is_reproducible() {
    for config in [
        OptimizerConfig::FirstOrder(FirstOrderConfig::adam(0.01)),
        OptimizerConfig::CurvatureAware(KfacConfig::default()),
    ] {
        let first = train_params(config.clone(), 7);
        let second = train_params(config.clone(), 7);
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);

        let other = train_params(config, 8);
        assert_ne!(first, other);
    }
}

#[test]
fn test_overflow_is_retried_exactly_once() {
    let calls = Rc::new(Cell::new(0usize));
    let counter = calls.clone();
    let callback = Box::new(move |state: &[f64]| {
        counter.set(counter.get() + 1);
        if counter.get() == 3 {
            (vec![42.0; state.len()], true)
        } else {
            (state.to_vec(), false)
        }
    });

    let optimizer = grid_optimizer(quadratic, ClipConfig::new(2.0), toy_grid());
    let mut fit = Fit::new(optimizer, toy_params(0.5, 0.0), 0..5, 3)
        .unwrap()
        .with_state_callback(callback)
        .with_sink(HistorySink::new());
    let items: Vec<(u64, TrainState<f64>, Stats)> =
        fit.by_ref().collect::<Result<Vec<_>>>().unwrap();

    assert_eq!(items.iter().map(|(step, _, _)| *step).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    assert_eq!(calls.get(), 5);
    assert_eq!(fit.sink().records.len(), 5);

    // the accepted step 2 is the retried one, run from the repaired state
    assert!(items[1].1.sampler.wf_state.iter().all(|&s| s == 0.0));
    assert!(items[2].1.sampler.wf_state.iter().all(|&s| s == 42.0));
    assert!(items[4].1.sampler.wf_state.iter().all(|&s| s == 42.0));

    // the discarded attempt leaves no trace in the parameter trajectory
    let reference = grid_optimizer(quadratic, ClipConfig::new(2.0), toy_grid());
    let plain: Vec<ParamTree> = Fit::new(reference, toy_params(0.5, 0.0), 0..5, 3)
        .unwrap()
        .map(|item| item.map(|(_, state, _)| state.params))
        .collect::<Result<Vec<_>>>()
        .unwrap();
    for ((_, state, _), params) in items.iter().zip(plain.iter()) {
        assert_eq!(&state.params, params);
    }
}

#[test]
fn test_persistent_overflow_does_not_loop() {
    let calls = Rc::new(Cell::new(0usize));
    let counter = calls.clone();
    let callback = Box::new(move |state: &[f64]| {
        counter.set(counter.get() + 1);
        (state.iter().map(|s| s + 1.0).collect::<Vec<f64>>(), true)
    });

    let optimizer = grid_optimizer(quadratic, ClipConfig::new(2.0), toy_grid());
    let items = Fit::new(optimizer, toy_params(0.5, 0.0), 0..3, 0)
        .unwrap()
        .with_state_callback(callback)
        .collect::<Result<Vec<_>>>()
        .unwrap();

    assert_eq!(items.len(), 3);
    assert_eq!(calls.get(), 3);
    // one repair per step is carried into the next step
    assert!(items[2].1.sampler.wf_state.iter().all(|&s| s == 3.0));
}

#[test]
fn test_outlier_leaves_parameters_but_not_statistics() {
    fn energy(r: &[Vector3<f64>]) -> f64 {
        r[0].x * r[0].x + 1e6 * r[0].y
    }
    let mut grid: Vec<Electrons> = (0..40)
        .map(|k| vec![Vector3::new(-1.95 + 0.1 * k as f64, 0.0, 0.0)])
        .collect();
    grid[17][0].y = 1.0;

    let optimizer = grid_optimizer(energy, ClipConfig::new(1.0).with_exclude_width(10.0), grid);
    let mut fit = Fit::new(optimizer, toy_params(0.5, 0.2), 0..4, 1)
        .unwrap()
        .with_sink(HistorySink::new());
    let last = fit.by_ref().last().unwrap().unwrap();

    let theta = &last.1.params.tensors()[0].values;
    assert_eq!(theta[1], 0.2);
    assert!(theta[0] != 0.5);
    for max in fit.sink().series("E_loc/max") {
        assert!(max > 1e6);
    }
    for mean in fit.sink().series("E_loc/mean") {
        assert!(mean > 1e6 / 40.0);
    }
}

#[test]
fn test_error_ends_iteration() {
    let optimizer = grid_optimizer(quadratic, ClipConfig::new(2.0), toy_grid());
    let params = toy_params(0.5, 0.0);
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let mut sampler = optimizer.sampler().init(&mut rng, &params).unwrap();
    let opt = optimizer.init(&mut rng, &params, &sampler).unwrap();
    sampler.wf_state.pop();

    let mut fit = Fit::from_state(optimizer, TrainState { params, opt, sampler }, 0.., 0);
    assert!(matches!(fit.next(), Some(Err(VmcError::ShapeMismatch { .. }))));
    assert!(fit.next().is_none());
    assert!(fit.state().is_none());
}

fn toy_descent(config: OptimizerConfig) -> Vec<f64> {
    let z = (0..41).map(|k| -2.0 + 0.1 * k as f64).collect();
    let hamiltonian = FnHamiltonian(quadratic as Energy);
    let loss = LossFn::new(ToyAnsatz, hamiltonian, ClipConfig::new(5.0)).unwrap();
    let optimizer = Optimizer::new(loss, WidthGridSampler { z }, config).unwrap();
    let mut fit = Fit::new(optimizer, toy_params(0.25, 0.0), 0..=10, 5)
        .unwrap()
        .with_sink(HistorySink::new());
    fit.by_ref().collect::<Result<Vec<_>>>().unwrap();
    fit.sink().series("loss")
}

fn assert_monotone_descent(losses: &[f64]) {
    assert_eq!(losses.len(), 11);
    for pair in losses.windows(2) {
        assert!(pair[1] < pair[0], "loss went up: {:?}", losses);
    }
    assert!(losses[10] < losses[0]);
}

#[test]
fn test_first_order_descends_on_toy_problem() {
    let losses = toy_descent(OptimizerConfig::FirstOrder(FirstOrderConfig::adam(0.05)));
    // z² averaged over the grid, at θ₀ = 1/4
    assert_relative_eq!(losses[0], 1.4, epsilon = 1e-9);
    assert_monotone_descent(&losses);
}

#[test]
fn test_curvature_aware_descends_on_toy_problem() {
    let losses = toy_descent(OptimizerConfig::CurvatureAware(KfacConfig::default()));
    assert_monotone_descent(&losses);
}
