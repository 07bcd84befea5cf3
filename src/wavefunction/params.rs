//! Parameter trees: ordered, named tensors of network weights.
//!
//! Each tensor carries a [`TensorKind`] tag so the curvature-aware optimizer
//! can recognise dense layers (weight matrix plus optional bias) and treat
//! everything else as generic parameters.

use std::ops::Range;

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, VmcError};

/// Role of a tensor inside the network.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorKind {
    /// Weight matrix of a linear layer, stored column-major (`rows` outputs, `cols` inputs).
    Dense { layer: String, rows: usize, cols: usize },
    /// Bias vector belonging to the linear layer of the same name.
    Bias { layer: String },
    /// Any other parameter.
    Generic,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub kind: TensorKind,
    pub values: DVector<f64>,
}

impl Tensor {
    /// View a dense tensor as a matrix. Returns `None` for other kinds.
    pub fn as_matrix(&self) -> Option<DMatrix<f64>> {
        match self.kind {
            TensorKind::Dense { rows, cols, .. } => {
                Some(DMatrix::from_column_slice(rows, cols, self.values.as_slice()))
            }
            _ => None,
        }
    }
}

pub(crate) fn missing_tensor(name: &str) -> VmcError {
    VmcError::InvalidConfig(format!("parameter tree has no tensor {}", name))
}

/// Ordered collection of named parameter tensors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamTree {
    tensors: Vec<Tensor>,
}

impl ParamTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tensor. Dense tensors must hold `rows * cols` values.
    pub fn with_tensor(
        mut self,
        name: &str,
        kind: TensorKind,
        values: DVector<f64>,
    ) -> Result<Self> {
        if let TensorKind::Dense { rows, cols, .. } = kind {
            if rows * cols != values.len() {
                return Err(VmcError::ShapeMismatch {
                    expected: rows * cols,
                    found: values.len(),
                });
            }
        }
        self.tensors.push(Tensor {
            name: name.to_string(),
            kind,
            values,
        });
        Ok(self)
    }

    /// Replace the values of the tensor called `name`, keeping its length.
    pub fn with_values(mut self, name: &str, values: DVector<f64>) -> Result<Self> {
        let tensor = self
            .tensors
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| missing_tensor(name))?;
        if tensor.values.len() != values.len() {
            return Err(VmcError::ShapeMismatch {
                expected: tensor.values.len(),
                found: values.len(),
            });
        }
        tensor.values = values;
        Ok(self)
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Total number of scalar parameters.
    pub fn len_flat(&self) -> usize {
        self.tensors.iter().map(|t| t.values.len()).sum()
    }

    /// Flat index range occupied by each tensor, in order.
    pub fn offsets(&self) -> Vec<Range<usize>> {
        let mut start = 0;
        self.tensors
            .iter()
            .map(|t| {
                let range = start..start + t.values.len();
                start = range.end;
                range
            })
            .collect()
    }

    pub fn flatten(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.len_flat(),
            self.tensors.iter().flat_map(|t| t.values.iter().copied()),
        )
    }

    /// Rebuild a tree with the structure of `self` from flat values.
    pub fn unflatten(&self, flat: &DVector<f64>) -> Result<Self> {
        if flat.len() != self.len_flat() {
            return Err(VmcError::ShapeMismatch {
                expected: self.len_flat(),
                found: flat.len(),
            });
        }
        Ok(self.map_flat_indexed(|i, _| flat[i]))
    }

    /// Apply `f(flat_index, value)` to every scalar, keeping the structure.
    pub fn map_flat_indexed<F: FnMut(usize, f64) -> f64>(&self, mut f: F) -> Self {
        let mut index = 0;
        let tensors = self
            .tensors
            .iter()
            .map(|t| {
                let values = t.values.map(|x| {
                    let y = f(index, x);
                    index += 1;
                    y
                });
                Tensor {
                    name: t.name.clone(),
                    kind: t.kind.clone(),
                    values,
                }
            })
            .collect();
        Self { tensors }
    }

    pub fn map<F: Fn(f64) -> f64>(&self, f: F) -> Self {
        self.map_flat_indexed(|_, x| f(x))
    }

    pub fn zeros_like(&self) -> Self {
        self.map(|_| 0.0)
    }

    /// Copy of `self` with one flat entry shifted by `delta`.
    pub fn perturbed(&self, index: usize, delta: f64) -> Self {
        self.map_flat_indexed(|i, x| if i == index { x + delta } else { x })
    }

    fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.tensors.len() != other.tensors.len() {
            return Err(VmcError::ShapeMismatch {
                expected: self.tensors.len(),
                found: other.tensors.len(),
            });
        }
        for (a, b) in self.tensors.iter().zip(other.tensors.iter()) {
            if a.values.len() != b.values.len() {
                return Err(VmcError::ShapeMismatch {
                    expected: a.values.len(),
                    found: b.values.len(),
                });
            }
        }
        Ok(())
    }

    /// Elementwise combination of two trees with identical structure.
    pub fn zip_map<F: Fn(f64, f64) -> f64>(&self, other: &Self, f: F) -> Result<Self> {
        self.check_compatible(other)?;
        let tensors = self
            .tensors
            .iter()
            .zip(other.tensors.iter())
            .map(|(a, b)| Tensor {
                name: a.name.clone(),
                kind: a.kind.clone(),
                values: a.values.zip_map(&b.values, &f),
            })
            .collect();
        Ok(Self { tensors })
    }

    /// `self + alpha * other`.
    pub fn add_scaled(&self, other: &Self, alpha: f64) -> Result<Self> {
        self.zip_map(other, |a, b| a + alpha * b)
    }

    pub fn dot(&self, other: &Self) -> Result<f64> {
        self.check_compatible(other)?;
        Ok(self
            .tensors
            .iter()
            .zip(other.tensors.iter())
            .map(|(a, b)| a.values.dot(&b.values))
            .sum())
    }

    /// Sum of the L2 norms of the individual tensors.
    pub fn norm(&self) -> f64 {
        self.tensors.iter().map(|t| t.values.norm()).sum()
    }
}
