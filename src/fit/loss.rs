//! Energy loss with a surrogate gradient.
//!
//! The loss value is the weighted mean local energy. Its gradient is not the
//! derivative of that expression: local energies are held constant and only
//! ln|Ψ| is differentiated,
//!
//!   ∇L = ⟨ (Ẽ_L - mean Ẽ_L) · w · ∇ ln|Ψ| ⟩_mask
//!
//! where Ẽ_L are the median-log-squeezed local energies and the mask drops
//! samples whose deviation score reaches `exclude_width`. Excluded samples
//! still enter the reported statistics.
//!
//! With `sub_batch_size` set, squeezing, centring and masking happen per
//! consecutive sub-batch and the sub-batch gradients are averaged in
//! proportion to their size. Per-sample work runs on the rayon pool; results
//! are reduced in sample order, so the outcome does not depend on the number
//! of threads.

use std::collections::BTreeMap;

use nalgebra::DVector;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::clip::{masked_mean, median_log_squeeze};
use super::stats::Stats;
use crate::error::{Result, VmcError};
use crate::hamiltonian::Hamiltonian;
use crate::wavefunction::{Ansatz, Electrons, ParamTree};

/// Outlier handling for the local energies.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClipConfig {
    /// Half-width of the squeeze window in units of the robust scale
    pub clip_width: f64,
    /// Deviation score at which samples leave the gradient estimate
    #[serde(default = "default_exclude_width")]
    pub exclude_width: f64,
    /// Percentile of |E_L - median| used as the robust scale
    #[serde(default = "default_clip_quantile")]
    pub clip_quantile: f64,
    /// Clip and centre the batch in chunks of this many samples
    #[serde(default)]
    pub sub_batch_size: Option<usize>,
}

fn default_exclude_width() -> f64 {
    f64::INFINITY
}
fn default_clip_quantile() -> f64 {
    0.95
}

impl ClipConfig {
    pub fn new(clip_width: f64) -> Self {
        Self {
            clip_width,
            exclude_width: default_exclude_width(),
            clip_quantile: default_clip_quantile(),
            sub_batch_size: None,
        }
    }

    pub fn with_exclude_width(mut self, exclude_width: f64) -> Self {
        self.exclude_width = exclude_width;
        self
    }

    pub fn with_clip_quantile(mut self, clip_quantile: f64) -> Self {
        self.clip_quantile = clip_quantile;
        self
    }

    pub fn with_sub_batch_size(mut self, sub_batch_size: usize) -> Self {
        self.sub_batch_size = Some(sub_batch_size);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.clip_width > 0.0 && self.clip_width.is_finite()) {
            return Err(VmcError::InvalidConfig(format!(
                "clip_width must be a positive number, got {}",
                self.clip_width
            )));
        }
        if !(self.clip_quantile > 0.0 && self.clip_quantile < 1.0) {
            return Err(VmcError::InvalidConfig(format!(
                "clip_quantile must lie in (0, 1), got {}",
                self.clip_quantile
            )));
        }
        if !(self.exclude_width > 0.0) {
            return Err(VmcError::InvalidConfig(format!(
                "exclude_width must be positive, got {}",
                self.exclude_width
            )));
        }
        if self.sub_batch_size == Some(0) {
            return Err(VmcError::InvalidConfig("sub_batch_size must be positive".into()));
        }
        Ok(())
    }
}

/// Sampled configurations with their importance weights (mean one).
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub r: Vec<Electrons>,
    pub weights: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LossOutput<S> {
    pub loss: f64,
    /// Wavefunction state, returned unchanged.
    pub state: Vec<S>,
    pub local_energies: Vec<f64>,
    pub stats: Stats,
}

/// Side channel through which the gradient evaluation exposes the model
/// output to a curvature estimator.
pub trait CurvatureSink {
    /// ln|Ψ| of every sample and its flattened parameter Jacobian, treated as
    /// the mean of a unit-variance normal predictive distribution.
    fn register_normal_predictive(&mut self, log_psi: &[f64], jacobian: &[DVector<f64>]);
}

/// Ignores curvature registrations.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCurvature;

impl CurvatureSink for NoCurvature {
    fn register_normal_predictive(&mut self, _log_psi: &[f64], _jacobian: &[DVector<f64>]) {}
}

/// Surrogate-gradient weights of one batch.
struct Surrogate {
    /// c_k in ∇L = Σₖ c_k w_k ∇ ln|Ψ_k|; zero for excluded samples.
    coefficients: Vec<f64>,
    mask: Vec<bool>,
}

pub struct LossFn<A, H> {
    ansatz: A,
    hamiltonian: H,
    clip: ClipConfig,
}

impl<A: Ansatz, H: Hamiltonian<A>> LossFn<A, H> {
    pub fn new(ansatz: A, hamiltonian: H, clip: ClipConfig) -> Result<Self> {
        clip.validate()?;
        Ok(Self {
            ansatz,
            hamiltonian,
            clip,
        })
    }

    fn check_batch(state: &[A::State], batch: &Batch) -> Result<()> {
        if batch.r.is_empty() {
            return Err(VmcError::EmptyBatch);
        }
        for len in [batch.weights.len(), state.len()] {
            if len != batch.r.len() {
                return Err(VmcError::ShapeMismatch {
                    expected: batch.r.len(),
                    found: len,
                });
            }
        }
        Ok(())
    }

    /// Loss value and statistics; no derivatives.
    pub fn evaluate(
        &self,
        params: &ParamTree,
        state: &[A::State],
        batch: &Batch,
    ) -> Result<LossOutput<A::State>> {
        Self::check_batch(state, batch)?;

        let evaluated = batch
            .r
            .par_iter()
            .zip(state.par_iter())
            .map(|(r, s)| self.hamiltonian.local_energy(&self.ansatz, params, s, r))
            .collect::<Result<Vec<_>>>()?;

        let mut local_energies = Vec::with_capacity(evaluated.len());
        let mut hamil_sums: BTreeMap<String, f64> = BTreeMap::new();
        for (e_loc, hamil_stats) in evaluated {
            local_energies.push(e_loc);
            for (key, value) in hamil_stats {
                *hamil_sums.entry(key).or_insert(0.0) += value;
            }
        }

        let n = local_energies.len() as f64;
        let loss = local_energies
            .iter()
            .zip(batch.weights.iter())
            .map(|(e, w)| e * w)
            .sum::<f64>()
            / n;
        let mean = local_energies.iter().sum::<f64>() / n;
        let variance = local_energies.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
        let max = local_energies.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = local_energies.iter().copied().fold(f64::INFINITY, f64::min);

        let mut stats = Stats::new();
        stats.insert("E_loc/mean".to_string(), mean);
        stats.insert("E_loc/std".to_string(), variance.sqrt());
        stats.insert("E_loc/max".to_string(), max);
        stats.insert("E_loc/min".to_string(), min);
        for (key, sum) in hamil_sums {
            stats.insert(key, sum / n);
        }

        Ok(LossOutput {
            loss,
            state: state.to_vec(),
            local_energies,
            stats,
        })
    }

    fn surrogate(&self, local_energies: &[f64]) -> Surrogate {
        let n = local_energies.len();
        let chunk = self.clip.sub_batch_size.unwrap_or(n).max(1);
        let mut coefficients = Vec::with_capacity(n);
        let mut mask = Vec::with_capacity(n);
        for sub in local_energies.chunks(chunk) {
            let squeezed = median_log_squeeze(sub, self.clip.clip_width, self.clip.clip_quantile);
            let mean = squeezed.values.iter().sum::<f64>() / sub.len() as f64;
            let keep: Vec<bool> = squeezed
                .deviation
                .iter()
                .map(|sigma| *sigma < self.clip.exclude_width)
                .collect();
            let count = keep.iter().filter(|k| **k).count();
            let share = sub.len() as f64 / n as f64;
            for (e, k) in squeezed.values.iter().zip(keep.iter()) {
                coefficients.push(if *k {
                    (e - mean) * share / count as f64
                } else {
                    0.0
                });
            }
            mask.extend(keep);
        }
        Surrogate { coefficients, mask }
    }

    /// Mean and variance over the samples kept in the gradient. Only
    /// reported when outliers can be excluded at all.
    fn record_inlier_stats(&self, out: &mut LossOutput<A::State>, mask: &[bool]) {
        if !self.clip.exclude_width.is_finite() {
            return;
        }
        let mean0 = masked_mean(&out.local_energies, mask);
        let sq_dev: Vec<f64> = out.local_energies.iter().map(|e| (e - mean0).powi(2)).collect();
        out.stats.insert("E_loc/mean0".to_string(), mean0);
        out.stats.insert("E_loc/var0".to_string(), masked_mean(&sq_dev, mask));
    }

    /// Loss value together with the surrogate parameter gradient.
    ///
    /// ln|Ψ| and its Jacobian are handed to `curvature` before the gradient
    /// is assembled.
    pub fn value_and_grad(
        &self,
        params: &ParamTree,
        state: &[A::State],
        batch: &Batch,
        curvature: &mut dyn CurvatureSink,
    ) -> Result<(LossOutput<A::State>, ParamTree)> {
        let mut out = self.evaluate(params, state, batch)?;
        let surrogate = self.surrogate(&out.local_energies);
        self.record_inlier_stats(&mut out, &surrogate.mask);

        let n_params = params.len_flat();
        let (log_psi, jacobian): (Vec<f64>, Vec<DVector<f64>>) = batch
            .r
            .par_iter()
            .zip(state.par_iter())
            .map(|(r, s)| {
                let row = self.ansatz.log_derivatives(params, s, r)?.flatten();
                if row.len() != n_params {
                    return Err(VmcError::ShapeMismatch {
                        expected: n_params,
                        found: row.len(),
                    });
                }
                Ok((self.ansatz.log_psi(params, s, r)?, row))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        curvature.register_normal_predictive(&log_psi, &jacobian);

        let mut grad = DVector::zeros(n_params);
        for k in 0..jacobian.len() {
            if surrogate.mask[k] {
                grad.axpy(surrogate.coefficients[k] * batch.weights[k], &jacobian[k], 1.0);
            }
        }
        Ok((out, params.unflatten(&grad)?))
    }

    /// Forward-mode form of the same rule: the loss tangent along `tangent`.
    pub fn jvp(
        &self,
        params: &ParamTree,
        state: &[A::State],
        batch: &Batch,
        tangent: &ParamTree,
    ) -> Result<(LossOutput<A::State>, f64)> {
        let mut out = self.evaluate(params, state, batch)?;
        let surrogate = self.surrogate(&out.local_energies);
        self.record_inlier_stats(&mut out, &surrogate.mask);

        let log_psi_tangents = batch
            .r
            .par_iter()
            .zip(state.par_iter())
            .map(|(r, s)| -> Result<f64> { Ok(self.ansatz.jvp(params, s, r, tangent)?.1) })
            .collect::<Result<Vec<f64>>>()?;
        let loss_tangent = (0..log_psi_tangents.len())
            .filter(|&k| surrogate.mask[k])
            .map(|k| surrogate.coefficients[k] * batch.weights[k] * log_psi_tangents[k])
            .sum::<f64>();
        Ok((out, loss_tangent))
    }
}
