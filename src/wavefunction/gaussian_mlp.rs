//! Gaussian envelope times a small neural-network correlation factor.
//!
//!   ln|Ψ(R)| = -α² Σᵢ |rᵢ|² + w₂ · tanh(W₁ x(R) + b₁) + b₂
//!
//! where x(R) collects the electron radii |rᵢ| and pair distances |rᵢ - rⱼ|.
//! The features are rotation invariant, and the bounded hidden layer keeps
//! the envelope in charge of normalizability. Ψ is symmetric under exchange
//! of electrons only through its features, which suits spatially symmetric
//! ground states (harmonium, helium 1s²).

use nalgebra::{DVector, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::params::{missing_tensor, ParamTree, Tensor, TensorKind};
use super::traits::{Ansatz, LogAmplitude};
use crate::error::{Result, VmcError};

const ALPHA: &str = "envelope/alpha";
const HIDDEN_W: &str = "mlp/hidden/w";
const HIDDEN_B: &str = "mlp/hidden/b";
const OUT_W: &str = "mlp/out/w";
const OUT_B: &str = "mlp/out/b";

#[derive(Clone, Debug)]
pub struct GaussianMlp {
    pub n_electrons: usize,
    pub hidden: usize,
}

struct Forward {
    alpha: f64,
    r2: f64,
    features: DVector<f64>,
    hidden: DVector<f64>,
    log: f64,
}

impl GaussianMlp {
    pub fn new(n_electrons: usize, hidden: usize) -> Self {
        Self { n_electrons, hidden }
    }

    pub fn n_features(&self) -> usize {
        self.n_electrons + self.n_electrons * self.n_electrons.saturating_sub(1) / 2
    }

    /// Parameters with envelope exponent `alpha` and small random weights.
    pub fn init_params<R: Rng + ?Sized>(&self, alpha: f64, rng: &mut R) -> Result<ParamTree> {
        if self.n_electrons == 0 || self.hidden == 0 {
            return Err(VmcError::InvalidConfig(
                "ansatz needs at least one electron and one hidden unit".into(),
            ));
        }
        let normal = Normal::new(0.0, 0.1).map_err(|e| VmcError::InvalidConfig(e.to_string()))?;
        let n_in = self.n_features();
        let mut draw = |n: usize| DVector::from_fn(n, |_, _| normal.sample(&mut *rng));
        let hidden_w = draw(self.hidden * n_in);
        let out_w = draw(self.hidden);
        ParamTree::new()
            .with_tensor(ALPHA, TensorKind::Generic, DVector::from_element(1, alpha))?
            .with_tensor(
                HIDDEN_W,
                TensorKind::Dense { layer: "mlp/hidden".into(), rows: self.hidden, cols: n_in },
                hidden_w,
            )?
            .with_tensor(
                HIDDEN_B,
                TensorKind::Bias { layer: "mlp/hidden".into() },
                DVector::zeros(self.hidden),
            )?
            .with_tensor(
                OUT_W,
                TensorKind::Dense { layer: "mlp/out".into(), rows: 1, cols: self.hidden },
                out_w,
            )?
            .with_tensor(OUT_B, TensorKind::Bias { layer: "mlp/out".into() }, DVector::zeros(1))
    }

    fn features(&self, r: &[Vector3<f64>]) -> DVector<f64> {
        let n = r.len();
        let radii = r.iter().map(|ri| ri.norm());
        let pairs = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .map(|(i, j)| (r[i] - r[j]).norm());
        DVector::from_iterator(n + n * n.saturating_sub(1) / 2, radii.chain(pairs))
    }

    fn tensor<'a>(params: &'a ParamTree, name: &str) -> Result<&'a Tensor> {
        params.get(name).ok_or_else(|| missing_tensor(name))
    }

    fn scalar(params: &ParamTree, name: &str) -> Result<f64> {
        let values = &Self::tensor(params, name)?.values;
        match values.len() {
            1 => Ok(values[0]),
            found => Err(VmcError::ShapeMismatch { expected: 1, found }),
        }
    }

    fn forward(&self, params: &ParamTree, r: &[Vector3<f64>]) -> Result<Forward> {
        if r.len() != self.n_electrons {
            return Err(VmcError::ShapeMismatch {
                expected: self.n_electrons,
                found: r.len(),
            });
        }
        let alpha = Self::scalar(params, ALPHA)?;
        let hidden_w = Self::tensor(params, HIDDEN_W)?;
        let w1 = hidden_w
            .as_matrix()
            .filter(|m| m.shape() == (self.hidden, self.n_features()))
            .ok_or_else(|| VmcError::ShapeMismatch {
                expected: self.hidden * self.n_features(),
                found: hidden_w.values.len(),
            })?;
        let b1 = &Self::tensor(params, HIDDEN_B)?.values;
        let w2 = &Self::tensor(params, OUT_W)?.values;
        let b2 = Self::scalar(params, OUT_B)?;
        for (expected, found) in [(self.hidden, b1.len()), (self.hidden, w2.len())] {
            if expected != found {
                return Err(VmcError::ShapeMismatch { expected, found });
            }
        }

        let r2: f64 = r.iter().map(|ri| ri.norm_squared()).sum();
        let features = self.features(r);
        let hidden = (w1 * &features + b1).map(f64::tanh);
        let log = -alpha * alpha * r2 + w2.dot(&hidden) + b2;
        Ok(Forward { alpha, r2, features, hidden, log })
    }
}

impl Ansatz for GaussianMlp {
    type State = ();

    fn init_state(&self) -> Self::State {}

    fn n_electrons(&self) -> Option<usize> {
        Some(self.n_electrons)
    }

    fn apply(
        &self,
        params: &ParamTree,
        _state: &(),
        r: &[Vector3<f64>],
    ) -> Result<(LogAmplitude, ())> {
        let fwd = self.forward(params, r)?;
        Ok((LogAmplitude { sign: 1.0, log: fwd.log }, ()))
    }

    fn log_derivatives(
        &self,
        params: &ParamTree,
        _state: &(),
        r: &[Vector3<f64>],
    ) -> Result<ParamTree> {
        let fwd = self.forward(params, r)?;
        let w2 = &Self::tensor(params, OUT_W)?.values;

        // backprop through the single tanh layer
        let dz = w2.component_mul(&fwd.hidden.map(|h| 1.0 - h * h));
        let d_w1 = &dz * fwd.features.transpose();

        let mut grads = params.zeros_like();
        for (name, grad) in [
            (ALPHA, DVector::from_element(1, -2.0 * fwd.alpha * fwd.r2)),
            (HIDDEN_W, DVector::from_column_slice(d_w1.as_slice())),
            (HIDDEN_B, dz),
            (OUT_W, fwd.hidden),
            (OUT_B, DVector::from_element(1, 1.0)),
        ] {
            grads = grads.with_values(name, grad)?;
        }
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wavefunction::traits::{numerical_log_derivatives, PARAM_FD_STEP};
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn two_electrons() -> Vec<Vector3<f64>> {
        vec![Vector3::new(0.3, -0.2, 0.5), Vector3::new(-0.7, 0.1, 0.4)]
    }

    #[test]
    fn test_param_layout() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let ansatz = GaussianMlp::new(2, 4);
        let params = ansatz.init_params(1.0, &mut rng).unwrap();
        assert_eq!(ansatz.n_features(), 3);
        assert_eq!(params.len_flat(), 1 + 12 + 4 + 4 + 1);
    }

    #[test]
    fn test_pure_envelope_value() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let ansatz = GaussianMlp::new(2, 3);
        let params = ansatz.init_params(0.5, &mut rng).unwrap();
        // zero the network output
        let params = params.map_flat_indexed(|i, x| if i == 0 { x } else { 0.0 });
        let r = two_electrons();
        let r2: f64 = r.iter().map(|v| v.norm_squared()).sum();
        assert_relative_eq!(ansatz.log_psi(&params, &(), &r).unwrap(), -0.25 * r2, epsilon = 1e-12);
    }

    #[test]
    fn test_analytic_log_derivatives_match_numerical() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let ansatz = GaussianMlp::new(2, 5);
        let params = ansatz.init_params(0.8, &mut rng).unwrap();
        let r = two_electrons();

        let analytic = ansatz.log_derivatives(&params, &(), &r).unwrap().flatten();
        let numerical = numerical_log_derivatives(&ansatz, &params, &(), &r, PARAM_FD_STEP)
            .unwrap()
            .flatten();
        for (a, n) in analytic.iter().zip(numerical.iter()) {
            assert_relative_eq!(*a, *n, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_jvp_is_directional_derivative() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let ansatz = GaussianMlp::new(2, 2);
        let params = ansatz.init_params(1.0, &mut rng).unwrap();
        let tangent = params.map(|_| 1.0);
        let r = two_electrons();
        let (log_psi, tangent_out) = ansatz.jvp(&params, &(), &r, &tangent).unwrap();

        let h = 1e-6;
        let shifted = params.add_scaled(&tangent, h).unwrap();
        let fd = (ansatz.log_psi(&shifted, &(), &r).unwrap() - log_psi) / h;
        assert_relative_eq!(tangent_out, fd, epsilon = 1e-4);
    }

    #[test]
    fn test_foreign_tree_and_wrong_electron_count_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let ansatz = GaussianMlp::new(2, 3);
        let params = ansatz.init_params(1.0, &mut rng).unwrap();

        let one_electron = vec![Vector3::new(0.1, 0.2, 0.3)];
        assert!(matches!(
            ansatz.log_psi(&params, &(), &one_electron),
            Err(VmcError::ShapeMismatch { expected: 2, found: 1 })
        ));

        let foreign = ParamTree::new()
            .with_tensor("theta", TensorKind::Generic, DVector::from_element(2, 0.5))
            .unwrap();
        assert!(matches!(
            ansatz.log_psi(&foreign, &(), &two_electrons()),
            Err(VmcError::InvalidConfig(_))
        ));

        // the wider network's weights do not fit this one
        let wider = GaussianMlp::new(2, 5).init_params(1.0, &mut rng).unwrap();
        assert!(ansatz.log_derivatives(&wider, &(), &two_electrons()).is_err());
    }
}
