//! Rust VMC - variational Monte Carlo training of neural-network wavefunctions
//!
//! This crate provides the training loop of a VMC fit: a robust energy loss
//! with a surrogate gradient, first-order and curvature-aware optimizers, and
//! a lazy iterator over training steps with recovery from wavefunction-state
//! overflow.

pub mod error;
pub mod wavefunction;
pub mod hamiltonian;
pub mod sampling;
pub mod fit;
pub mod optim;
pub mod linalg;
pub mod io;

// Re-export commonly used types at crate root
pub use error::{Result, VmcError};
pub use wavefunction::{Ansatz, Electrons, GaussianMlp, LogAmplitude, ParamTree, TensorKind};
pub use hamiltonian::{FnHamiltonian, Hamiltonian, Potential, PotentialHamiltonian};
pub use sampling::{GridSampler, MetropolisConfig, MetropolisSampler, Sampler, SamplerState};
pub use fit::{ClipConfig, Fit, HistorySink, LossFn, Stats, StatsSink, TracingSink, TrainState};
pub use optim::{FirstOrderConfig, KfacConfig, OptState, Optimizer, OptimizerConfig};
pub use linalg::BatchDet;
pub use io::{read_run_config, RunConfig};

#[cfg(test)]
mod tests;
