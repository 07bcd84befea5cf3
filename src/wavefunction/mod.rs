//! Wavefunction module - parameter trees and neural-network ansätze.

mod params;
mod traits;
mod gaussian_mlp;

pub use params::{ParamTree, Tensor, TensorKind};
pub use traits::{
    numerical_log_derivatives, Ansatz, Electrons, LogAmplitude, COORD_FD_STEP, PARAM_FD_STEP,
};
pub use gaussian_mlp::GaussianMlp;
