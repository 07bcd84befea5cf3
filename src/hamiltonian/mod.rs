//! Hamiltonian module - local-energy evaluators.

mod traits;
mod potential;

pub use traits::{FnHamiltonian, Hamiltonian};
pub use potential::{Potential, PotentialHamiltonian};
