//! Batched determinant with closed-form derivatives up to third order.
//!
//! For y = det X and an incoming cotangent v, with K = X⁻¹:
//!
//!   backward:        ∂(v y)/∂X = v y Kᵀ
//!   double backward: ∂⟨V', v y Kᵀ⟩/∂X = (v y K tr(K V') - K V' v y K)ᵀ
//!   triple backward: the derivative of ⟨V'', double⟩ with respect to X
//!
//! Writing these out keeps every order of differentiation on one LU
//! factorisation instead of differentiating through a matrix inverse.

use nalgebra::DMatrix;

use crate::error::{Result, VmcError};

/// LU-factorised batch of square matrices.
#[derive(Clone, Debug)]
pub struct BatchDet {
    dets: Vec<f64>,
    inverses: Vec<DMatrix<f64>>,
}

/// Gradients of ⟨V', backward(v)⟩.
#[derive(Clone, Debug)]
pub struct DoubleBackward {
    pub grad_x: Vec<DMatrix<f64>>,
    pub grad_v: Vec<f64>,
}

/// Gradients of ⟨V'', double_backward(v, V').grad_x⟩.
#[derive(Clone, Debug)]
pub struct TripleBackward {
    pub grad_x: Vec<DMatrix<f64>>,
    pub grad_vp: Vec<DMatrix<f64>>,
}

/// Σᵢⱼ Aᵢⱼ Bᵢⱼ
fn contract(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    a.component_mul(b).sum()
}

impl BatchDet {
    /// Factorise every matrix. Fails with the indices of all singular entries.
    pub fn new(xs: &[DMatrix<f64>]) -> Result<Self> {
        let mut dets = Vec::with_capacity(xs.len());
        let mut inverses = Vec::with_capacity(xs.len());
        let mut failed = Vec::new();
        for (i, x) in xs.iter().enumerate() {
            if !x.is_square() {
                return Err(VmcError::ShapeMismatch {
                    expected: x.nrows(),
                    found: x.ncols(),
                });
            }
            let lu = x.clone().lu();
            // the permutation parity carries the sign of the determinant
            let det = lu.determinant();
            match lu.try_inverse() {
                Some(inverse) if det != 0.0 => {
                    dets.push(det);
                    inverses.push(inverse);
                }
                _ => failed.push(i),
            }
        }
        if !failed.is_empty() {
            return Err(VmcError::SingularMatrix { indices: failed });
        }
        Ok(Self { dets, inverses })
    }

    pub fn dets(&self) -> &[f64] {
        &self.dets
    }

    pub fn len(&self) -> usize {
        self.dets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dets.is_empty()
    }

    fn check_len(&self, n: usize) -> Result<()> {
        if n != self.len() {
            return Err(VmcError::ShapeMismatch {
                expected: self.len(),
                found: n,
            });
        }
        Ok(())
    }

    /// v y Kᵀ for every batch entry.
    pub fn backward(&self, vs: &[f64]) -> Result<Vec<DMatrix<f64>>> {
        self.check_len(vs.len())?;
        Ok(self
            .inverses
            .iter()
            .zip(self.dets.iter().zip(vs))
            .map(|(k, (y, v))| k.transpose() * (v * y))
            .collect())
    }

    pub fn double_backward(&self, vs: &[f64], vps: &[DMatrix<f64>]) -> Result<DoubleBackward> {
        self.check_len(vs.len())?;
        self.check_len(vps.len())?;
        let mut grad_x = Vec::with_capacity(self.len());
        let mut grad_v = Vec::with_capacity(self.len());
        for i in 0..self.len() {
            let k = &self.inverses[i];
            let vy_k = k * (vs[i] * self.dets[i]);
            let k_vp = k * &vps[i];
            let tr_k_vp = contract(&k.transpose(), &vps[i]);
            grad_x.push((&vy_k * tr_k_vp - &k_vp * &vy_k).transpose());
            grad_v.push(self.dets[i] * tr_k_vp);
        }
        Ok(DoubleBackward { grad_x, grad_v })
    }

    pub fn triple_backward(
        &self,
        vs: &[f64],
        vps: &[DMatrix<f64>],
        vpps: &[DMatrix<f64>],
    ) -> Result<TripleBackward> {
        self.check_len(vs.len())?;
        self.check_len(vps.len())?;
        self.check_len(vpps.len())?;
        let mut grad_x = Vec::with_capacity(self.len());
        let mut grad_vp = Vec::with_capacity(self.len());
        for i in 0..self.len() {
            let k = &self.inverses[i];
            let kt = k.transpose();
            let vy_k = k * (vs[i] * self.dets[i]);
            let k_vp = k * &vps[i];
            let k_vpp = k * &vpps[i];
            let tr_k_vp = contract(&kt, &vps[i]);
            let tr_k_vpp = contract(&kt, &vpps[i]);
            let tr_k_vp_k_vpp = contract(&k_vp.transpose(), &k_vpp);

            let contractions =
                &k_vp * &k_vpp + &k_vpp * &k_vp - &k_vp * tr_k_vpp - &k_vpp * tr_k_vp;
            let gx = &vy_k * (tr_k_vp * tr_k_vpp - tr_k_vp_k_vpp) + contractions * &vy_k;
            grad_x.push(gx.transpose());
            grad_vp.push((&vy_k * tr_k_vpp - &k_vpp * &vy_k).transpose());
        }
        Ok(TripleBackward { grad_x, grad_vp })
    }
}
