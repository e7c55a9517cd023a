//! Neural Network Layers
//!
//! This module contains the fixed catalogue of layers a model can be built
//! from. Each variant provides a forward pass and a hand-written backward pass.
//!
//! ## Layers
//!
//! - **input**: Declares and validates the per-sample shape
//! - **dense**: Fully connected layer
//! - **conv2d**: 2D convolution over NHWC volumes
//! - **flatten**: Reshape from image volume to feature rows
//! - **max_pool**: 2D max pooling
//! - **activation**: ReLU, Sigmoid and Softmax attached to Dense/Conv2D
//!
//! ## Design Pattern
//!
//! Every layer follows the same pattern:
//!
//! ```rust,ignore
//! impl SomeLayer {
//!     pub fn forward(&self, x: &Tensor) -> Result<(Tensor, SomeCache)> { }
//!     pub fn backward(&mut self, grad: ..., cache: &SomeCache) -> Result<Tensor> { }
//! }
//! ```
//!
//! The forward pass never mutates the layer: everything the backward pass
//! needs travels in the returned cache, and the caller hands it back. The
//! backward pass writes the parameter gradients (`dweights`, `dbiases`) onto
//! trainable layers, overwriting the previous ones, and returns the gradient
//! w.r.t. the layer's input.
//!
//! [`Layer`] is a closed enum over the variants, so every operation that
//! treats layers differently (optimizer updates, checkpoints, summaries) is a
//! single exhaustive `match`.

pub mod activation;
pub mod conv2d;
pub mod dense;
pub mod flatten;
pub mod input;
pub mod max_pool;
pub mod padding;

pub use activation::{Activation, ActivationCache};
pub use conv2d::{Conv2D, Conv2DCache};
pub use dense::{Dense, DenseCache, BIAS_INIT};
pub use flatten::{Flatten, FlattenCache};
pub use input::Input;
pub use max_pool::{MaxPoolCache, MaxPooling2D};
pub use padding::{AxisPlan, Padding};

use crate::error::{EngineError, Result};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};

/// Draw `size` values uniformly from `[-scale, scale]`
pub fn uniform_init(size: usize, scale: f64, rng: &mut StdRng) -> Vec<f64> {
    let dist = Uniform::new_inclusive(-scale, scale);
    (0..size).map(|_| dist.sample(rng)).collect()
}

/// Gradient flowing into a layer's backward pass
#[derive(Clone, Copy, Debug)]
pub enum Upstream<'a> {
    /// Gradient w.r.t. the layer's (activated) output
    Output(&'a Tensor),
    /// Gradient already taken through the layer's activation, e.g. the fused
    /// softmax + cross-entropy gradient
    PreActivation(&'a Tensor),
}

impl<'a> Upstream<'a> {
    pub fn tensor(&self) -> &'a Tensor {
        match self {
            Upstream::Output(t) | Upstream::PreActivation(t) => t,
        }
    }
}

/// A layer of a sequential model
#[derive(Clone, Debug)]
pub enum Layer {
    Input(Input),
    Dense(Dense),
    Conv2D(Conv2D),
    Flatten(Flatten),
    MaxPooling2D(MaxPooling2D),
}

/// Backward context produced by [`Layer::forward`]
#[derive(Clone, Debug)]
pub enum LayerCache {
    Input,
    Dense(DenseCache),
    Conv2D(Conv2DCache),
    Flatten(FlattenCache),
    MaxPooling2D(MaxPoolCache),
}

/// Mutable view of a trainable layer's parameters next to their gradients
pub struct ParamsMut<'a> {
    pub weights: &'a mut Tensor,
    pub biases: &'a mut Tensor,
    pub dweights: &'a Tensor,
    pub dbiases: &'a Tensor,
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Input(_) => "input",
            Layer::Dense(_) => "dense",
            Layer::Conv2D(_) => "conv2d",
            Layer::Flatten(_) => "flatten",
            Layer::MaxPooling2D(_) => "max_pooling2d",
        }
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, Layer::Dense(_) | Layer::Conv2D(_))
    }

    /// Activation attached to the layer, if any
    pub fn activation(&self) -> Option<Activation> {
        match self {
            Layer::Dense(d) => d.activation,
            Layer::Conv2D(c) => c.activation,
            _ => None,
        }
    }

    /// Per-sample output shape
    pub fn output_shape(&self) -> Result<Vec<usize>> {
        Ok(match self {
            Layer::Input(i) => i.shape.clone(),
            Layer::Dense(d) => vec![d.n_neurons()],
            Layer::Conv2D(c) => c.output_shape()?.to_vec(),
            Layer::Flatten(f) => vec![f.output_size],
            Layer::MaxPooling2D(p) => p.output_shape()?.to_vec(),
        })
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters()
            .map(|(w, b)| w.len() + b.len())
            .unwrap_or(0)
    }

    /// Weights and biases of a trainable layer
    pub fn parameters(&self) -> Option<(&Tensor, &Tensor)> {
        match self {
            Layer::Dense(d) => Some((&d.weights, &d.biases)),
            Layer::Conv2D(c) => Some((&c.weights, &c.biases)),
            _ => None,
        }
    }

    /// Stored `dweights` and `dbiases` of a trainable layer
    pub fn gradients(&self) -> Option<(&Tensor, &Tensor)> {
        match self {
            Layer::Dense(d) => Some((&d.dweights, &d.dbiases)),
            Layer::Conv2D(c) => Some((&c.dweights, &c.dbiases)),
            _ => None,
        }
    }

    pub fn gradients_mut(&mut self) -> Option<(&mut Tensor, &mut Tensor)> {
        match self {
            Layer::Dense(d) => Some((&mut d.dweights, &mut d.dbiases)),
            Layer::Conv2D(c) => Some((&mut c.dweights, &mut c.dbiases)),
            _ => None,
        }
    }

    /// Parameters and gradients together, for an optimizer step
    pub fn params_mut(&mut self) -> Result<ParamsMut<'_>> {
        match self {
            Layer::Dense(Dense {
                weights,
                biases,
                dweights,
                dbiases,
                ..
            })
            | Layer::Conv2D(Conv2D {
                weights,
                biases,
                dweights,
                dbiases,
                ..
            }) => Ok(ParamsMut {
                weights,
                biases,
                dweights,
                dbiases,
            }),
            other => Err(EngineError::UnsupportedLayerType(format!(
                "{} layer has no parameters to update",
                other.name()
            ))),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, LayerCache)> {
        match self {
            Layer::Input(layer) => Ok((layer.forward(x)?, LayerCache::Input)),
            Layer::Dense(layer) => {
                let (y, cache) = layer.forward(x)?;
                Ok((y, LayerCache::Dense(cache)))
            }
            Layer::Conv2D(layer) => {
                let (y, cache) = layer.forward(x)?;
                Ok((y, LayerCache::Conv2D(cache)))
            }
            Layer::Flatten(layer) => {
                let (y, cache) = layer.forward(x)?;
                Ok((y, LayerCache::Flatten(cache)))
            }
            Layer::MaxPooling2D(layer) => {
                let (y, cache) = layer.forward(x)?;
                Ok((y, LayerCache::MaxPooling2D(cache)))
            }
        }
    }

    /// Forward pass for inference: the output without a backward cache
    pub fn infer(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Layer::Input(layer) => layer.forward(x),
            Layer::Dense(layer) => layer.infer(x),
            Layer::Conv2D(layer) => layer.infer(x),
            Layer::Flatten(layer) => Ok(layer.forward(x)?.0),
            Layer::MaxPooling2D(layer) => Ok(layer.forward(x)?.0),
        }
    }

    pub fn backward(&mut self, upstream: Upstream<'_>, cache: &LayerCache) -> Result<Tensor> {
        match (self, cache) {
            (Layer::Input(_), _) => Err(EngineError::UnsupportedLayerType(
                "input layer has no backward pass".to_string(),
            )),
            (Layer::Dense(layer), LayerCache::Dense(cache)) => layer.backward(upstream, cache),
            (Layer::Conv2D(layer), LayerCache::Conv2D(cache)) => layer.backward(upstream, cache),
            (Layer::Flatten(layer), LayerCache::Flatten(cache)) => {
                layer.backward(upstream.tensor(), cache)
            }
            (Layer::MaxPooling2D(layer), LayerCache::MaxPooling2D(cache)) => {
                layer.backward(upstream.tensor(), cache)
            }
            (layer, _) => Err(EngineError::InvalidConfiguration(format!(
                "{} layer was handed a cache produced by a different layer",
                layer.name()
            ))),
        }
    }
}
