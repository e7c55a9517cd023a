//! Activation Functions
//!
//! This module provides the activation functions that can be attached to a
//! Dense or Conv2D layer, together with their derivatives for backpropagation.
//!
//! ## ReLU
//!
//! ```text
//! y = max(0, x)
//! dx = dvalues ⊙ 1[x > 0]
//! ```
//!
//! The subgradient at exactly zero is taken as 0.
//!
//! ## Sigmoid
//!
//! ```text
//! y = 1 / (1 + e^-x)
//! dx = dvalues ⊙ y(1 - y)
//! ```
//!
//! ## Softmax
//!
//! Applied per row of a 2D batch, subtracting the row maximum before
//! exponentiating so large logits never overflow:
//!
//! ```text
//! y_i = exp(x_i - max) / Σ_j exp(x_j - max)
//! ```
//!
//! The backward pass multiplies each incoming gradient row by the Jacobian
//! `diag(y) - y yᵀ`, which reduces to
//!
//! ```text
//! dx_i = y_i (dvalues_i - Σ_j dvalues_j y_j)
//! ```
//!
//! so the full matrix never has to be materialised.

use crate::error::{EngineError, Result};
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Activation attached to a trainable layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    ReLU,
    Sigmoid,
    Softmax,
}

/// Values kept from the forward pass for the activation's backward pass
#[derive(Clone, Debug)]
pub struct ActivationCache {
    /// Pre-activation input (needed by ReLU)
    pub input: Tensor,
    /// Activated output (needed by Sigmoid and Softmax)
    pub output: Tensor,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Activation::ReLU => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Softmax => "softmax",
        }
    }

    /// Apply the activation without keeping anything for backward
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Activation::ReLU => relu_forward(x),
            Activation::Sigmoid => x.map(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Softmax => softmax_forward(x)?,
        })
    }

    /// Apply the activation and return the output with its cache
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, ActivationCache)> {
        let output = self.apply(x)?;
        let cache = ActivationCache {
            input: x.clone(),
            output: output.clone(),
        };
        Ok((output, cache))
    }

    /// Gradient w.r.t. the activation's input given the gradient w.r.t. its output
    pub fn backward(&self, dvalues: &Tensor, cache: &ActivationCache) -> Result<Tensor> {
        if dvalues.shape != cache.output.shape {
            return Err(EngineError::shape(
                "activation gradient",
                &cache.output.shape,
                &dvalues.shape,
            ));
        }
        match self {
            Activation::ReLU => Ok(relu_backward(dvalues, &cache.input)),
            Activation::Sigmoid => dvalues.mul(&cache.output.map(|y| y * (1.0 - y))),
            Activation::Softmax => softmax_backward(dvalues, &cache.output),
        }
    }
}

/// ReLU forward pass
pub fn relu_forward(x: &Tensor) -> Tensor {
    x.map(|v| v.max(0.0))
}

/// ReLU backward pass: passes the gradient only where the input was positive
pub fn relu_backward(dvalues: &Tensor, x: &Tensor) -> Tensor {
    let grad_data: Vec<f64> = x
        .data
        .par_iter()
        .zip(&dvalues.data)
        .map(|(&x_val, &grad_val)| if x_val > 0.0 { grad_val } else { 0.0 })
        .collect();
    Tensor::new(grad_data, x.shape.clone())
}

/// Row-wise softmax over a 2D batch
pub fn softmax_forward(x: &Tensor) -> Result<Tensor> {
    if x.ndim() != 2 {
        return Err(EngineError::ShapeMismatch(format!(
            "softmax expects a 2D batch, got shape {:?}",
            x.shape
        )));
    }
    let cols = x.shape[1];
    if cols == 0 {
        return Err(EngineError::ShapeMismatch(
            "softmax needs at least one column".to_string(),
        ));
    }

    let result: Vec<f64> = x
        .data
        .par_chunks(cols)
        .flat_map_iter(|row| {
            let max = row.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let exp_values: Vec<f64> = row.iter().map(|&v| (v - max).exp()).collect();
            let sum: f64 = exp_values.iter().sum();
            exp_values.into_iter().map(move |v| v / sum)
        })
        .collect();

    Ok(Tensor::new(result, x.shape.clone()))
}

/// Softmax backward pass, one Jacobian-vector product per sample
pub fn softmax_backward(dvalues: &Tensor, output: &Tensor) -> Result<Tensor> {
    if output.ndim() != 2 {
        return Err(EngineError::ShapeMismatch(format!(
            "softmax backward expects a 2D batch, got shape {:?}",
            output.shape
        )));
    }
    let cols = output.shape[1];
    if cols == 0 || dvalues.shape != output.shape {
        return Err(EngineError::shape(
            "softmax backward gradient",
            &output.shape,
            &dvalues.shape,
        ));
    }

    let result: Vec<f64> = output
        .data
        .par_chunks(cols)
        .zip(dvalues.data.par_chunks(cols))
        .flat_map_iter(|(y, dy)| {
            let dot: f64 = y.iter().zip(dy).map(|(a, b)| a * b).sum();
            y.iter()
                .zip(dy)
                .map(move |(&yi, &dyi)| yi * (dyi - dot))
                .collect::<Vec<_>>()
        })
        .collect();

    Ok(Tensor::new(result, output.shape.clone()))
}
