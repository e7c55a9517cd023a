//! Input Layer
//!
//! The first layer of every model. It declares the per-sample shape and
//! checks incoming batches against it; the tensor passes through unchanged.
//! It has no backward pass.

use crate::error::{EngineError, Result};
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct Input {
    /// Per-sample shape: `[features]` or `[H, W, C]`
    pub shape: Vec<usize>,
}

impl Input {
    pub fn new(shape: Vec<usize>) -> Result<Self> {
        if !matches!(shape.len(), 1 | 3) || shape.contains(&0) {
            return Err(EngineError::InvalidConfiguration(format!(
                "input shape must be [features] or [height, width, channels] with positive sizes, got {:?}",
                shape
            )));
        }
        Ok(Self { shape })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if x.ndim() != self.shape.len() + 1 || x.shape[1..] != self.shape[..] {
            return Err(EngineError::ShapeMismatch(format!(
                "input: expected [batch, {}], got {:?}",
                self.shape
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                x.shape
            )));
        }
        Ok(x.clone())
    }
}
