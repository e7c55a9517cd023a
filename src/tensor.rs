//! Tensor Operations for Neural Networks
//!
//! This module provides the minimal dense tensor the engine runs on. Tensors
//! store a flat `Vec<f64>` plus shape and stride information; every layer,
//! loss and optimizer reads and writes this one type.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f64>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! The engine only uses three ranks:
//!
//! ```text
//! 1D  [n]                 biases, moment vectors, per-sample losses
//! 2D  [batch, features]   dense activations, targets
//! 4D  [batch, h, w, c]    image volumes (NHWC)
//! ```
//!
//! ## Broadcasting
//!
//! Only one broadcast rule exists: a 1D vector whose length equals the last
//! axis of a 2D or 4D tensor is repeated across every other position. This is
//! how biases are added in Dense and Conv2D.
//!
//! ## Example
//!
//! ```rust
//! use sequent::Tensor;
//!
//! let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let w = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let y = x.matmul(&w)?;
//! assert_eq!(y.shape, vec![2, 2]);
//! # Ok::<(), sequent::EngineError>(())
//! ```
//!
//! ## Performance
//!
//! Element-wise operations iterate with Rayon. Matrix multiplication switches
//! to a parallel cache-blocked kernel once the work exceeds a small threshold.

use crate::error::{EngineError, Result};
use rayon::prelude::*;

/// A multi-dimensional array of `f64` values
///
/// # Memory Layout
///
/// For shape `[2, 3]`, data is stored as
/// `[r0c0, r0c1, r0c2, r1c0, r1c1, r1c2]` and strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f64>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length.
    /// Use [`Tensor::from_vec`] when the shape comes from outside the crate.
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Fallible constructor for caller-provided data
    ///
    /// ```rust
    /// # use sequent::Tensor;
    /// assert!(Tensor::from_vec(vec![1.0, 2.0, 3.0], vec![2, 2]).is_err());
    /// ```
    pub fn from_vec(data: Vec<f64>, shape: Vec<usize>) -> Result<Self> {
        let expected_size: usize = shape.iter().product();
        if data.len() != expected_size || shape.is_empty() {
            return Err(EngineError::ShapeMismatch(format!(
                "data length {} does not fill shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self::new(data, shape))
    }

    /// Build a 2D tensor from equally sized rows
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != cols) {
            return Err(EngineError::shape("row length", cols, bad.len()));
        }
        let data: Vec<f64> = rows.iter().flatten().copied().collect();
        Self::from_vec(data, vec![rows.len(), cols])
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: Vec<usize>) -> Self {
        Self::full(shape, 1.0)
    }

    /// Create a tensor with every element set to `value`
    pub fn full(shape: Vec<usize>, value: f64) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the leading (batch) axis
    pub fn batch_size(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Flat index of a multi-dimensional coordinate
    #[inline]
    pub fn offset(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(&self.strides)
            .map(|(&i, &stride)| i * stride)
            .sum()
    }

    /// Read one element by coordinate
    pub fn get(&self, index: &[usize]) -> f64 {
        self.data[self.offset(index)]
    }

    /// One row of a 2D tensor
    pub fn row(&self, i: usize) -> &[f64] {
        let cols = self.shape[1];
        &self.data[i * cols..(i + 1) * cols]
    }

    fn require_rank(&self, rank: usize, context: &str) -> Result<()> {
        if self.shape.len() != rank {
            return Err(EngineError::ShapeMismatch(format!(
                "{} requires a {}D tensor, got shape {:?}",
                context, rank, self.shape
            )));
        }
        Ok(())
    }

    #[inline(always)]
    fn matmul_inner_simd(a_val: f64, b: &[f64], result: &mut [f64]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// 2D matrix multiplication
    ///
    /// For `A @ B` where `A` is `[m, k]` and `B` is `[k, n]` the result is
    /// `[m, n]`. Large products use a parallel cache-blocked kernel.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        self.require_rank(2, "matmul")?;
        other.require_rank(2, "matmul")?;
        if self.shape[1] != other.shape[0] {
            return Err(EngineError::ShapeMismatch(format!(
                "matrix dimensions incompatible: {:?} @ {:?}",
                self.shape, other.shape
            )));
        }

        let m = self.shape[0];
        let n = other.shape[1];
        let k = self.shape[1];

        if m * n * k >= 1_000 {
            return Ok(self.matmul_parallel_blocked(other, m, n, k));
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            for l in 0..k {
                let a_val = self.data[i * k + l];
                Self::matmul_inner_simd(
                    a_val,
                    &other.data[l * n..(l + 1) * n],
                    &mut result[i * n..(i + 1) * n],
                );
            }
        }

        Ok(Tensor::new(result, vec![m, n]))
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Output rows are split into blocks of `BLOCK_SIZE` rows, one Rayon task
    /// per block; each task walks column and inner-dimension blocks so the
    /// working set stays in L1.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Transpose a 2D matrix
    pub fn transpose(&self) -> Result<Tensor> {
        self.require_rank(2, "transpose")?;
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];

        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }

        Ok(Tensor::new(result, vec![cols, rows]))
    }

    /// Apply a binary op, either on identical shapes or broadcasting a 1D
    /// `other` across the last axis of `self`
    fn broadcast_with<F>(&self, other: &Tensor, op_name: &str, op: F) -> Result<Tensor>
    where
        F: Fn(f64, f64) -> f64 + Sync + Send,
    {
        // === EXACT MATCH ===
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(&a, &b)| op(a, b))
                .collect();
            return Ok(Tensor::new(result, self.shape.clone()));
        }

        // === BROADCAST LAST DIM: [*, n] (op) [n] ===
        if other.shape.len() == 1 && matches!(self.shape.len(), 2 | 4) {
            let last_dim = self.shape[self.shape.len() - 1];
            if other.data.len() == last_dim {
                let result = self
                    .data
                    .par_iter()
                    .enumerate()
                    .map(|(i, &a)| op(a, other.data[i % last_dim]))
                    .collect();
                return Ok(Tensor::new(result, self.shape.clone()));
            }
        }

        Err(EngineError::ShapeMismatch(format!(
            "unsupported broadcast for {}: {:?} and {:?}",
            op_name, self.shape, other.shape
        )))
    }

    /// Element-wise addition with last-axis broadcasting
    ///
    /// ```rust
    /// # use sequent::Tensor;
    /// let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let b = Tensor::new(vec![10.0, 20.0], vec![2]);
    /// assert_eq!(x.add(&b)?.data, vec![11.0, 22.0, 13.0, 24.0]);
    /// # Ok::<(), sequent::EngineError>(())
    /// ```
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_with(other, "add", |a, b| a + b)
    }

    /// Element-wise multiplication with last-axis broadcasting
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_with(other, "mul", |a, b| a * b)
    }

    /// Element-wise subtraction with last-axis broadcasting
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_with(other, "sub", |a, b| a - b)
    }

    /// Element-wise division with last-axis broadcasting
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.broadcast_with(other, "div", |a, b| a / b)
    }

    /// Apply `f` to every element
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f64) -> f64 + Sync + Send,
    {
        let result = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Add scalar to all elements
    pub fn add_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x + scalar)
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// Divide all elements by scalar
    pub fn div_scalar(&self, scalar: f64) -> Tensor {
        self.map(|x| x / scalar)
    }

    /// Element-wise square root
    pub fn sqrt(&self) -> Tensor {
        self.map(f64::sqrt)
    }

    /// Sum of every element
    pub fn sum(&self) -> f64 {
        self.data.par_iter().sum()
    }

    /// Mean of every element
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f64
    }

    /// Split the shape around `axis` into (outer, dim, inner) extents
    fn axis_extents(&self, axis: usize) -> Result<(usize, usize, usize)> {
        if axis >= self.shape.len() {
            return Err(EngineError::InvalidConfiguration(format!(
                "axis {} out of range for shape {:?}",
                axis, self.shape
            )));
        }
        let outer: usize = self.shape[..axis].iter().product();
        let inner: usize = self.shape[axis + 1..].iter().product();
        Ok((outer, self.shape[axis], inner))
    }

    fn reduce_axis<F>(&self, axis: usize, init: f64, fold: F) -> Result<Tensor>
    where
        F: Fn(f64, f64) -> f64 + Sync + Send,
    {
        let (outer, dim, inner) = self.axis_extents(axis)?;
        let result: Vec<f64> = (0..outer * inner)
            .into_par_iter()
            .map(|idx| {
                let o = idx / inner;
                let i = idx % inner;
                (0..dim).fold(init, |acc, d| fold(acc, self.data[(o * dim + d) * inner + i]))
            })
            .collect();

        let mut new_shape = self.shape.clone();
        new_shape.remove(axis);
        if new_shape.is_empty() {
            new_shape.push(1);
        }
        Ok(Tensor::new(result, new_shape))
    }

    /// Sum along an axis, removing it
    ///
    /// ```rust
    /// # use sequent::Tensor;
    /// let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
    /// assert_eq!(x.sum_axis(0)?.data, vec![5.0, 7.0, 9.0]);
    /// assert_eq!(x.sum_axis(1)?.data, vec![6.0, 15.0]);
    /// # Ok::<(), sequent::EngineError>(())
    /// ```
    pub fn sum_axis(&self, axis: usize) -> Result<Tensor> {
        self.reduce_axis(axis, 0.0, |acc, x| acc + x)
    }

    /// Maximum along an axis, removing it
    pub fn max_axis(&self, axis: usize) -> Result<Tensor> {
        self.reduce_axis(axis, f64::NEG_INFINITY, f64::max)
    }

    /// Index of the largest value in every row of a 2D tensor
    ///
    /// Ties resolve to the first occurrence.
    pub fn argmax_rows(&self) -> Result<Vec<usize>> {
        self.require_rank(2, "argmax_rows")?;
        Ok((0..self.shape[0])
            .map(|i| {
                let mut best = 0;
                for (j, &v) in self.row(i).iter().enumerate() {
                    if v > self.row(i)[best] {
                        best = j;
                    }
                }
                best
            })
            .collect())
    }

    /// Reshape tensor to new shape
    ///
    /// Total number of elements must remain the same.
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Tensor> {
        let new_size: usize = new_shape.iter().product();
        if self.data.len() != new_size {
            return Err(EngineError::ShapeMismatch(format!(
                "cannot reshape {:?} into {:?}",
                self.shape, new_shape
            )));
        }
        Ok(Tensor::new(self.data.clone(), new_shape.to_vec()))
    }

    /// Rows `start..end` along the batch axis
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Tensor> {
        let rows = self.batch_size();
        if start > end || end > rows {
            return Err(EngineError::ShapeMismatch(format!(
                "row range {}..{} out of bounds for batch of {}",
                start, end, rows
            )));
        }
        let row_len: usize = self.shape[1..].iter().product();
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Ok(Tensor::new(
            self.data[start * row_len..end * row_len].to_vec(),
            shape,
        ))
    }

    /// Concatenate tensors along the batch axis
    pub fn concat_rows(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts.first().ok_or_else(|| {
            EngineError::InvalidConfiguration("cannot concatenate zero tensors".to_string())
        })?;
        let tail = &first.shape[1..];
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            if &part.shape[1..] != tail {
                return Err(EngineError::shape("concat_rows", tail, &part.shape[1..]));
            }
            rows += part.shape[0];
            data.extend_from_slice(&part.data);
        }
        let mut shape = first.shape.clone();
        shape[0] = rows;
        Ok(Tensor::new(data, shape))
    }

    /// Embed a 4D NHWC tensor into a larger one filled with `fill`
    ///
    /// The original lands at offset `(top, left)`; the new spatial extent is
    /// `h + top + bottom` by `w + left + right`.
    pub fn pad_spatial(
        &self,
        top: usize,
        bottom: usize,
        left: usize,
        right: usize,
        fill: f64,
    ) -> Result<Tensor> {
        self.require_rank(4, "pad_spatial")?;
        if top + bottom + left + right == 0 {
            return Ok(self.clone());
        }
        let (n, h, w, c) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        let (ph, pw) = (h + top + bottom, w + left + right);
        let mut padded = Tensor::full(vec![n, ph, pw, c], fill);

        padded
            .data
            .par_chunks_mut(ph * pw * c)
            .enumerate()
            .for_each(|(b, dst)| {
                for y in 0..h {
                    let src_start = ((b * h + y) * w) * c;
                    let dst_start = ((y + top) * pw + left) * c;
                    dst[dst_start..dst_start + w * c]
                        .copy_from_slice(&self.data[src_start..src_start + w * c]);
                }
            });

        Ok(padded)
    }

    /// Extract the `height x width` window at `(top, left)` of a 4D NHWC tensor
    pub fn crop_spatial(&self, top: usize, left: usize, height: usize, width: usize) -> Result<Tensor> {
        self.require_rank(4, "crop_spatial")?;
        let (n, h, w, c) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        if top + height > h || left + width > w {
            return Err(EngineError::ShapeMismatch(format!(
                "crop {}x{} at ({}, {}) exceeds spatial extent {}x{}",
                height, width, top, left, h, w
            )));
        }
        if top == 0 && left == 0 && height == h && width == w {
            return Ok(self.clone());
        }

        let mut cropped = Tensor::zeros(vec![n, height, width, c]);
        cropped
            .data
            .par_chunks_mut(height * width * c)
            .enumerate()
            .for_each(|(b, dst)| {
                for y in 0..height {
                    let src_start = ((b * h + y + top) * w + left) * c;
                    dst[y * width * c..(y + 1) * width * c]
                        .copy_from_slice(&self.data[src_start..src_start + width * c]);
                }
            });

        Ok(cropped)
    }
}
