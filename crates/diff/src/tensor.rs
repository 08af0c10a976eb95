//! # Runtime Tensors
//!
//! A small dense tensor with a dynamic shape and row-major `f64` storage.
//!
//! Every learnable quantity in the parser (grammar scores, emission means,
//! coupling-network weights) is a `Tensor`, and every gradient shares the
//! layout of the parameter it belongs to. Optimizers therefore only ever see
//! flat `data` vectors paired by position.
//!
//! ## Example
//!
//! ```rust
//! use dmvflow_diff::Tensor;
//!
//! let mut t = Tensor::zeros(vec![2, 3]);
//! *t.get_mut(&[1, 2]) = 4.0;
//! assert_eq!(t.get(&[1, 2]), 4.0);
//! assert_eq!(t.row(1), &[0.0, 0.0, 4.0]);
//! ```

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::DiffError;

/// A dense tensor with a runtime shape.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Shape of the tensor
    pub shape: Vec<usize>,
    /// Flattened data in row-major order
    pub data: Vec<f64>,
}

impl Tensor {
    /// Create a tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: Vec<usize>, value: f64) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            data: vec![value; size],
        }
    }

    /// Create a tensor from data with given shape.
    pub fn from_data(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, DiffError> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(DiffError::DataLength {
                len: data.len(),
                shape,
            });
        }
        Ok(Self { shape, data })
    }

    /// Create a 1D vector tensor.
    pub fn vector(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Create a 2D tensor from equally long rows.
    pub fn from_rows(rows: &[Vec<f64>], cols: usize) -> Result<Self, DiffError> {
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(DiffError::ShapeMismatch {
                    expected: vec![cols],
                    got: vec![row.len()],
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            shape: vec![rows.len(), cols],
            data,
        })
    }

    /// Create a tensor with entries drawn uniformly from `[low, high)`.
    pub fn uniform(shape: Vec<usize>, low: f64, high: f64, rng: &mut impl Rng) -> Self {
        let size: usize = shape.iter().product();
        let data = (0..size).map(|_| rng.gen_range(low..high)).collect();
        Self { shape, data }
    }

    /// Create a tensor of zeros with the same shape.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.clone())
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Fail unless the tensor has exactly the given shape.
    pub fn expect_shape(&self, expected: &[usize]) -> Result<(), DiffError> {
        if self.shape != expected {
            return Err(DiffError::ShapeMismatch {
                expected: expected.to_vec(),
                got: self.shape.clone(),
            });
        }
        Ok(())
    }

    /// Flat offset of a multi-index.
    pub fn offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.shape.len(), "index rank mismatch");
        let mut offset = 0;
        for (i, (&idx, &dim)) in index.iter().zip(self.shape.iter()).enumerate() {
            debug_assert!(idx < dim, "index {} out of bounds on axis {}", idx, i);
            offset = offset * dim + idx;
        }
        offset
    }

    /// Element at a multi-index.
    pub fn get(&self, index: &[usize]) -> f64 {
        self.data[self.offset(index)]
    }

    /// Mutable element at a multi-index.
    pub fn get_mut(&mut self, index: &[usize]) -> &mut f64 {
        let offset = self.offset(index);
        &mut self.data[offset]
    }

    /// Length of the innermost axis.
    pub fn row_len(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of innermost-axis rows.
    pub fn num_rows(&self) -> usize {
        let len = self.row_len();
        if len == 0 {
            0
        } else {
            self.data.len() / len
        }
    }

    /// The `i`-th innermost-axis row.
    pub fn row(&self, i: usize) -> &[f64] {
        let len = self.row_len();
        &self.data[i * len..(i + 1) * len]
    }

    /// The `i`-th innermost-axis row, mutably.
    pub fn row_mut(&mut self, i: usize) -> &mut [f64] {
        let len = self.row_len();
        &mut self.data[i * len..(i + 1) * len]
    }

    /// In-place `self += alpha * other`.
    pub fn axpy(&mut self, alpha: f64, other: &Tensor) -> Result<(), DiffError> {
        other.expect_shape(&self.shape)?;
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += alpha * b;
        }
        Ok(())
    }

    /// Scalar multiplication.
    pub fn scale(&self, scalar: f64) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// Apply a function to each element.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    /// Sum of squared elements.
    pub fn norm_sq(&self) -> f64 {
        self.data.iter().map(|x| x * x).sum()
    }

    /// Largest element (`-inf` for an empty tensor).
    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Smallest element (`+inf` for an empty tensor).
    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.len() == 1 {
            write!(f, "Tensor(vec[{}]={:?})", self.shape[0], self.data)
        } else {
            write!(f, "Tensor(shape={:?}, data={:?})", self.shape, self.data)
        }
    }
}
