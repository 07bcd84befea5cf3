//! Curvature-aware (natural-gradient) updates.
//!
//! The Fisher information of ln|Ψ|, registered as the mean of a unit-variance
//! normal predictive distribution, is estimated block by block:
//!
//!   F_b ≈ (1/N) Σₖ (εₖ J_k,b)(εₖ J_k,b)ᵀ,   εₖ ~ N(0, 1)
//!
//! where J_k,b holds the log-derivatives of sample k restricted to block b.
//! Blocks come from matching the parameter tree against [`LayerPattern`]s:
//! a dense weight and its bias form one block, other tensors stand alone.
//! The estimate is averaged with an exponential moving average, damped,
//! inverted every step and applied to the gradient. The update size is
//! bounded by a norm constraint on lr² · gᵀF⁻¹g.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, VmcError};
use crate::fit::CurvatureSink;
use crate::wavefunction::{ParamTree, TensorKind};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KfacConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_damping")]
    pub damping: f64,
    #[serde(default)]
    pub momentum: f64,
    /// Upper bound on lr² · gᵀF⁻¹g
    #[serde(default = "default_norm_constraint")]
    pub norm_constraint: f64,
    /// Weight of the previous curvature estimate in the moving average
    #[serde(default = "default_curvature_decay")]
    pub curvature_decay: f64,
    #[serde(default)]
    pub l2_reg: f64,
}

fn default_learning_rate() -> f64 {
    0.05
}
fn default_damping() -> f64 {
    1e-3
}
fn default_norm_constraint() -> f64 {
    1e-3
}
fn default_curvature_decay() -> f64 {
    0.95
}

impl Default for KfacConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            damping: default_damping(),
            momentum: 0.0,
            norm_constraint: default_norm_constraint(),
            curvature_decay: default_curvature_decay(),
            l2_reg: 0.0,
        }
    }
}

/// Computation patterns recognised during layer registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerPattern {
    DenseWithBias,
    Dense,
    Generic,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CurvatureBlock {
    pub pattern: LayerPattern,
    pub name: String,
    /// Flat parameter indices covered by the block.
    pub indices: Vec<usize>,
    pub factor: DMatrix<f64>,
    pub inverse: DMatrix<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KfacState {
    pub blocks: Vec<CurvatureBlock>,
    pub velocity: DVector<f64>,
    pub step: u64,
}

/// Diagnostics of one curvature-aware update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KfacStats {
    pub precon_grad_norm: f64,
    pub update_norm: f64,
}

/// Records what the loss estimator registers for the curvature estimate.
#[derive(Clone, Debug, Default)]
pub struct JacobianRecorder {
    pub log_psi: Vec<f64>,
    pub jacobian: Vec<DVector<f64>>,
}

impl CurvatureSink for JacobianRecorder {
    fn register_normal_predictive(&mut self, log_psi: &[f64], jacobian: &[DVector<f64>]) {
        self.log_psi = log_psi.to_vec();
        self.jacobian = jacobian.to_vec();
    }
}

/// Group the parameter tensors into curvature blocks.
///
/// Each dense weight claims the bias of the same layer if there is one; a
/// bias without a dense weight cannot be registered.
pub fn register_layers(params: &ParamTree) -> Result<Vec<(LayerPattern, String, Vec<usize>)>> {
    let tensors = params.tensors();
    let offsets = params.offsets();
    let mut claimed = vec![false; tensors.len()];
    let mut blocks = Vec::new();

    for (i, tensor) in tensors.iter().enumerate() {
        match &tensor.kind {
            TensorKind::Dense { layer, .. } => {
                let bias = tensors.iter().position(
                    |t| matches!(&t.kind, TensorKind::Bias { layer: l } if l == layer),
                );
                let mut indices: Vec<usize> = offsets[i].clone().collect();
                let pattern = match bias {
                    Some(j) => {
                        if claimed[j] {
                            return Err(VmcError::Registration(format!(
                                "bias {} claimed by two dense tensors",
                                tensors[j].name
                            )));
                        }
                        claimed[j] = true;
                        indices.extend(offsets[j].clone());
                        LayerPattern::DenseWithBias
                    }
                    None => LayerPattern::Dense,
                };
                claimed[i] = true;
                blocks.push((pattern, layer.clone(), indices));
            }
            TensorKind::Generic => {
                claimed[i] = true;
                let indices = offsets[i].clone().collect();
                blocks.push((LayerPattern::Generic, tensor.name.clone(), indices));
            }
            TensorKind::Bias { .. } => {}
        }
    }

    if let Some(orphan) = tensors.iter().zip(claimed.iter()).find(|(_, c)| !**c) {
        return Err(VmcError::Registration(format!(
            "bias {} has no matching dense layer",
            orphan.0.name
        )));
    }
    Ok(blocks)
}

impl KfacConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("learning_rate", self.learning_rate),
            ("damping", self.damping),
            ("norm_constraint", self.norm_constraint),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(VmcError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(0.0..1.0).contains(&self.curvature_decay) || !(0.0..1.0).contains(&self.momentum) {
            return Err(VmcError::InvalidConfig(format!(
                "curvature_decay and momentum must lie in [0, 1), got {} and {}",
                self.curvature_decay, self.momentum
            )));
        }
        if self.l2_reg < 0.0 {
            return Err(VmcError::InvalidConfig("l2_reg must be non-negative".into()));
        }
        Ok(())
    }

    /// Monte Carlo Fisher estimate for each block.
    fn estimate(
        &self,
        blocks: &[(LayerPattern, String, Vec<usize>)],
        recorder: &JacobianRecorder,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<DMatrix<f64>>> {
        if recorder.jacobian.is_empty() {
            return Err(VmcError::EmptyBatch);
        }
        let n = recorder.jacobian.len() as f64;
        let noise: Vec<f64> = (0..recorder.jacobian.len())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        Ok(blocks
            .iter()
            .map(|(_, _, indices)| {
                let mut factor = DMatrix::zeros(indices.len(), indices.len());
                for (eps, row) in noise.iter().zip(recorder.jacobian.iter()) {
                    let g = DVector::from_iterator(
                        indices.len(),
                        indices.iter().map(|&i| eps * row[i]),
                    );
                    factor.ger(1.0 / n, &g, &g, 1.0);
                }
                factor
            })
            .collect())
    }

    /// (F + damping·I)⁻¹, falling back to the identity if F is not usable.
    fn damped_inverse(&self, name: &str, factor: &DMatrix<f64>) -> DMatrix<f64> {
        let dim = factor.nrows();
        let damped = factor + DMatrix::identity(dim, dim) * self.damping;
        match damped.clone().cholesky() {
            Some(chol) => chol.inverse(),
            None => damped.try_inverse().unwrap_or_else(|| {
                warn!(block = name, "curvature block is singular, using the raw gradient");
                DMatrix::identity(dim, dim)
            }),
        }
    }

    /// Register layers and seed the curvature estimate from one batch.
    pub fn init(
        &self,
        params: &ParamTree,
        rng: &mut ChaCha8Rng,
        recorder: &JacobianRecorder,
    ) -> Result<KfacState> {
        self.validate()?;
        let registered = register_layers(params)?;
        if let Some(row) = recorder.jacobian.first() {
            if row.len() != params.len_flat() {
                return Err(VmcError::ShapeMismatch {
                    expected: params.len_flat(),
                    found: row.len(),
                });
            }
        }
        let factors = self.estimate(&registered, recorder, rng)?;
        let blocks = registered
            .into_iter()
            .zip(factors)
            .map(|((pattern, name, indices), factor)| {
                let inverse = self.damped_inverse(&name, &factor);
                CurvatureBlock {
                    pattern,
                    name,
                    indices,
                    factor,
                    inverse,
                }
            })
            .collect();
        Ok(KfacState {
            blocks,
            velocity: DVector::zeros(params.len_flat()),
            step: 0,
        })
    }

    /// Preconditioned update for `grads`; returns parameter deltas.
    pub fn update(
        &self,
        rng: &mut ChaCha8Rng,
        params: &ParamTree,
        grads: &ParamTree,
        recorder: &JacobianRecorder,
        state: &KfacState,
    ) -> Result<(ParamTree, KfacState, KfacStats)> {
        let registered: Vec<_> = state
            .blocks
            .iter()
            .map(|b| (b.pattern, b.name.clone(), b.indices.clone()))
            .collect();
        let estimates = self.estimate(&registered, recorder, rng)?;

        let decay = self.curvature_decay;
        let blocks: Vec<CurvatureBlock> = state
            .blocks
            .iter()
            .zip(estimates)
            .map(|(block, estimate)| {
                let factor = &block.factor * decay + estimate * (1.0 - decay);
                let inverse = self.damped_inverse(&block.name, &factor);
                CurvatureBlock {
                    factor,
                    inverse,
                    ..block.clone()
                }
            })
            .collect();

        let grad = grads.add_scaled(params, self.l2_reg)?.flatten();
        let mut precon: DVector<f64> = DVector::zeros(grad.len());
        for block in &blocks {
            let g = DVector::from_iterator(
                block.indices.len(),
                block.indices.iter().map(|&i| grad[i]),
            );
            let pg = &block.inverse * g;
            for (k, &i) in block.indices.iter().enumerate() {
                precon[i] = pg[k];
            }
        }

        let lr = self.learning_rate;
        let sq_norm = lr * lr * precon.dot(&grad);
        if sq_norm > 0.0 {
            let coefficient = (self.norm_constraint / sq_norm).sqrt().min(1.0);
            precon *= coefficient;
        }

        let velocity = &state.velocity * self.momentum + &precon;
        let update = &velocity * -lr;

        let stats = KfacStats {
            precon_grad_norm: params.unflatten(&precon)?.norm(),
            update_norm: params.unflatten(&update)?.norm(),
        };
        let new_state = KfacState {
            blocks,
            velocity,
            step: state.step + 1,
        };
        Ok((params.unflatten(&update)?, new_state, stats))
    }
}
