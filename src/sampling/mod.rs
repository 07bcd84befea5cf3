//! Sampling module - Monte Carlo samplers producing walker batches.

mod traits;
mod metropolis;
mod grid;

pub use traits::{Sampler, SamplerState};
pub use metropolis::{MetropolisConfig, MetropolisSampler};
pub use grid::GridSampler;
