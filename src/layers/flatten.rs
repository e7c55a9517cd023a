//! Flatten Layer
//!
//! Collapses every axis after the batch axis into one:
//! `[batch, h, w, c] -> [batch, h·w·c]`. The backward pass reshapes the
//! gradient back to the exact shape recorded in the cache. No parameters.

use crate::error::{EngineError, Result};
use crate::tensor::Tensor;

/// Reshape layer bridging spatial layers and Dense
#[derive(Clone, Debug)]
pub struct Flatten {
    /// Number of features per sample after flattening
    pub output_size: usize,
}

/// Pre-flatten shape recorded by the forward pass
#[derive(Clone, Debug)]
pub struct FlattenCache {
    pub input_shape: Vec<usize>,
}

impl Flatten {
    pub fn new(output_size: usize) -> Self {
        Self { output_size }
    }

    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, FlattenCache)> {
        if x.ndim() < 2 || self.output_size == 0 || x.len() % self.output_size != 0 {
            return Err(EngineError::ShapeMismatch(format!(
                "flatten: {:?} cannot be flattened into rows of {}",
                x.shape, self.output_size
            )));
        }
        let per_sample: usize = x.shape[1..].iter().product();
        if per_sample != self.output_size {
            return Err(EngineError::shape(
                "flatten per-sample size",
                self.output_size,
                per_sample,
            ));
        }
        let rows = x.len() / self.output_size;
        let y = x.reshape(&[rows, self.output_size])?;
        Ok((
            y,
            FlattenCache {
                input_shape: x.shape.clone(),
            },
        ))
    }

    pub fn backward(&self, grad: &Tensor, cache: &FlattenCache) -> Result<Tensor> {
        grad.reshape(&cache.input_shape)
    }
}
