//! Wavefunction ansatz trait.
//!
//! An ansatz maps parameters, a per-walker state and an electron
//! configuration to `ln|Ψ|` and its sign. The loss estimator needs the
//! parameter log-derivatives O_i = ∂ ln|Ψ| / ∂p_i; the Hamiltonian needs
//! the coordinate gradient and Laplacian of ln|Ψ|. Both default to central
//! differences so a new ansatz only has to implement `apply`.

use nalgebra::{DVector, Vector3};

use super::params::ParamTree;
use crate::error::Result;

/// One electron configuration.
pub type Electrons = Vec<Vector3<f64>>;

/// Finite-difference step for parameter derivatives.
pub const PARAM_FD_STEP: f64 = 1e-5;
/// Finite-difference step for coordinate derivatives.
pub const COORD_FD_STEP: f64 = 1e-4;

/// Log-amplitude of the wavefunction: Ψ = sign · exp(log).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LogAmplitude {
    pub sign: f64,
    pub log: f64,
}

pub trait Ansatz: Sync {
    /// Per-walker cached state threaded through the sampler.
    type State: Clone + std::fmt::Debug + Send + Sync;

    /// Fresh state for a newly created walker.
    fn init_state(&self) -> Self::State;

    /// Number of electrons the ansatz is built for, if it is fixed.
    fn n_electrons(&self) -> Option<usize> {
        None
    }

    /// Evaluate the wavefunction at `r`.
    fn apply(
        &self,
        params: &ParamTree,
        state: &Self::State,
        r: &[Vector3<f64>],
    ) -> Result<(LogAmplitude, Self::State)>;

    fn log_psi(&self, params: &ParamTree, state: &Self::State, r: &[Vector3<f64>]) -> Result<f64> {
        Ok(self.apply(params, state, r)?.0.log)
    }

    /// O_i = ∂ ln|Ψ(R)| / ∂p_i, with the structure of `params`.
    fn log_derivatives(
        &self,
        params: &ParamTree,
        state: &Self::State,
        r: &[Vector3<f64>],
    ) -> Result<ParamTree> {
        numerical_log_derivatives(self, params, state, r, PARAM_FD_STEP)
    }

    /// Forward-mode derivative of ln|Ψ| along `tangent`.
    ///
    /// Returns `(ln|Ψ|, d ln|Ψ| · tangent)`.
    fn jvp(
        &self,
        params: &ParamTree,
        state: &Self::State,
        r: &[Vector3<f64>],
        tangent: &ParamTree,
    ) -> Result<(f64, f64)> {
        let log_psi = self.log_psi(params, state, r)?;
        let tangent_out = self.log_derivatives(params, state, r)?.dot(tangent)?;
        Ok((log_psi, tangent_out))
    }

    /// Gradient of ln|Ψ| with respect to every electron coordinate.
    fn log_psi_gradient(
        &self,
        params: &ParamTree,
        state: &Self::State,
        r: &[Vector3<f64>],
    ) -> Result<Vec<Vector3<f64>>> {
        let h = COORD_FD_STEP;
        let mut grad = vec![Vector3::zeros(); r.len()];
        for i in 0..r.len() {
            for axis in 0..3 {
                let mut r_fwd = r.to_vec();
                let mut r_bwd = r.to_vec();
                r_fwd[i][axis] += h;
                r_bwd[i][axis] -= h;
                grad[i][axis] = (self.log_psi(params, state, &r_fwd)?
                    - self.log_psi(params, state, &r_bwd)?)
                    / (2.0 * h);
            }
        }
        Ok(grad)
    }

    /// Laplacian of ln|Ψ| for every electron.
    fn log_psi_laplacian(
        &self,
        params: &ParamTree,
        state: &Self::State,
        r: &[Vector3<f64>],
    ) -> Result<Vec<f64>> {
        let h = COORD_FD_STEP;
        let center = self.log_psi(params, state, r)?;
        let mut laplacian = vec![0.0; r.len()];
        for i in 0..r.len() {
            for axis in 0..3 {
                let mut r_fwd = r.to_vec();
                let mut r_bwd = r.to_vec();
                r_fwd[i][axis] += h;
                r_bwd[i][axis] -= h;
                laplacian[i] += (self.log_psi(params, state, &r_fwd)? - 2.0 * center
                    + self.log_psi(params, state, &r_bwd)?)
                    / (h * h);
            }
        }
        Ok(laplacian)
    }
}

/// Central-difference parameter log-derivatives.
pub fn numerical_log_derivatives<A: Ansatz + ?Sized>(
    ansatz: &A,
    params: &ParamTree,
    state: &A::State,
    r: &[Vector3<f64>],
    h: f64,
) -> Result<ParamTree> {
    let flat = (0..params.len_flat())
        .map(|i| {
            let fwd = ansatz.log_psi(&params.perturbed(i, h), state, r)?;
            let bwd = ansatz.log_psi(&params.perturbed(i, -h), state, r)?;
            Ok((fwd - bwd) / (2.0 * h))
        })
        .collect::<Result<Vec<f64>>>()?;
    params.unflatten(&DVector::from_vec(flat))
}
