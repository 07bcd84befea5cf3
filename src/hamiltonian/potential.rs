//! Electrons in a scalar external potential.
//!
//! E_L = -½ Σᵢ (∇ᵢ² ln|Ψ| + |∇ᵢ ln|Ψ||²) + V(R)
//!
//! The kinetic term is written in terms of ln|Ψ| so it stays finite where
//! Ψ itself underflows.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::traits::Hamiltonian;
use crate::error::Result;
use crate::fit::Stats;
use crate::wavefunction::{Ansatz, ParamTree};

/// External potential acting on the electrons.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Potential {
    /// ½ ω² Σ|rᵢ|², optionally with electron-electron Coulomb repulsion (harmonium).
    HarmonicTrap { omega: f64, interacting: bool },
    /// Point nucleus of charge Z at the origin plus electron-electron repulsion.
    Atom { charge: f64 },
}

impl Potential {
    pub fn evaluate(&self, r: &[Vector3<f64>]) -> f64 {
        match *self {
            Potential::HarmonicTrap { omega, interacting } => {
                let trap: f64 = r.iter().map(|ri| 0.5 * omega * omega * ri.norm_squared()).sum();
                if interacting {
                    trap + electron_repulsion(r)
                } else {
                    trap
                }
            }
            Potential::Atom { charge } => {
                let v_en: f64 = r.iter().map(|ri| -charge / ri.norm()).sum();
                v_en + electron_repulsion(r)
            }
        }
    }
}

fn electron_repulsion(r: &[Vector3<f64>]) -> f64 {
    let n = r.len();
    (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .map(|(i, j)| 1.0 / (r[i] - r[j]).norm())
        .sum()
}

#[derive(Clone, Debug)]
pub struct PotentialHamiltonian {
    pub potential: Potential,
}

impl PotentialHamiltonian {
    pub fn new(potential: Potential) -> Self {
        Self { potential }
    }
}

impl<A: Ansatz> Hamiltonian<A> for PotentialHamiltonian {
    fn local_energy(
        &self,
        ansatz: &A,
        params: &ParamTree,
        state: &A::State,
        r: &[Vector3<f64>],
    ) -> Result<(f64, Stats)> {
        let grad = ansatz.log_psi_gradient(params, state, r)?;
        let laplacian = ansatz.log_psi_laplacian(params, state, r)?;
        let e_kin = -0.5
            * grad
                .iter()
                .zip(laplacian.iter())
                .map(|(g, lap)| lap + g.norm_squared())
                .sum::<f64>();
        let e_pot = self.potential.evaluate(r);

        let mut stats = Stats::new();
        stats.insert("E_kin".to_string(), e_kin);
        stats.insert("E_pot".to_string(), e_pot);
        Ok((e_kin + e_pot, stats))
    }
}
