//! Trait for computing local energies from an ansatz.

use nalgebra::Vector3;

use crate::error::Result;
use crate::fit::Stats;
use crate::wavefunction::{Ansatz, ParamTree};

/// Local-energy operator E_L = (ĤΨ)/Ψ evaluated through an ansatz.
///
/// Implementations differentiate ln|Ψ| with respect to the electron
/// coordinates only; the result is treated as a constant with respect to the
/// network parameters by the loss estimator. Samples are evaluated
/// concurrently, hence the `Sync` bound.
pub trait Hamiltonian<A: Ansatz>: Sync {
    /// Returns the local energy and per-sample diagnostics.
    fn local_energy(
        &self,
        ansatz: &A,
        params: &ParamTree,
        state: &A::State,
        r: &[Vector3<f64>],
    ) -> Result<(f64, Stats)>;
}

/// Local energy given directly as a function of the coordinates.
///
/// Handy for model problems where E_L does not depend on Ψ.
#[derive(Clone, Debug)]
pub struct FnHamiltonian<F>(pub F);

impl<A, F> Hamiltonian<A> for FnHamiltonian<F>
where
    A: Ansatz,
    F: Fn(&[Vector3<f64>]) -> f64 + Sync,
{
    fn local_energy(
        &self,
        _ansatz: &A,
        _params: &ParamTree,
        _state: &A::State,
        r: &[Vector3<f64>],
    ) -> Result<(f64, Stats)> {
        Ok(((self.0)(r), Stats::new()))
    }
}
