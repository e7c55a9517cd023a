//! Dense Layer (Fully Connected)
//!
//! The dense layer performs an affine transformation followed by an optional
//! activation: y = act(x @ W + b)
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [batch, n_inputs]
//! Weight: W [n_inputs, n_neurons]
//! Bias:   b [n_neurons]
//! Output: y = act(x @ W + b) [batch, n_neurons]
//! ```
//!
//! ## Backward Pass
//!
//! Using the chain rule, with `dz` the gradient after the activation's backward:
//! ```text
//! dW = x^T @ dz
//! db = sum(dz, axis=0)
//! dx = dz @ W^T
//! ```
//!
//! `dW` and `db` always have the shapes of `W` and `b`, whatever the batch size.
//!
//! ## Implementation Notes
//!
//! - Glorot uniform initialization: scale = √(2/(n_inputs + n_neurons))
//! - Bias initialized to 0.01 so ReLU units start alive
//! - Parameter gradients are stored on the layer and overwritten on every
//!   backward call; the input lives in the [`DenseCache`] returned by forward

use super::activation::{Activation, ActivationCache};
use super::{uniform_init, Upstream};
use crate::error::{EngineError, Result};
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Initial value of every bias
pub const BIAS_INIT: f64 = 0.01;

/// Fully connected layer
#[derive(Clone, Debug)]
pub struct Dense {
    pub weights: Tensor,
    pub biases: Tensor,
    pub dweights: Tensor,
    pub dbiases: Tensor,
    pub activation: Option<Activation>,
}

impl Dense {
    /// Create a new dense layer with Glorot uniform weights
    pub fn new(
        n_inputs: usize,
        n_neurons: usize,
        activation: Option<Activation>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if n_inputs == 0 || n_neurons == 0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "dense layer needs positive sizes, got {} -> {}",
                n_inputs, n_neurons
            )));
        }
        let scale = (2.0 / (n_inputs + n_neurons) as f64).sqrt();
        let weights = Tensor::new(
            uniform_init(n_inputs * n_neurons, scale, rng),
            vec![n_inputs, n_neurons],
        );
        let biases = Tensor::full(vec![n_neurons], BIAS_INIT);
        Self::from_parameters(weights, biases, activation)
    }

    /// Build a layer around existing parameters
    pub fn from_parameters(
        weights: Tensor,
        biases: Tensor,
        activation: Option<Activation>,
    ) -> Result<Self> {
        if weights.ndim() != 2 || biases.shape != vec![weights.shape[1]] {
            return Err(EngineError::ShapeMismatch(format!(
                "dense parameters {:?} / {:?} are inconsistent",
                weights.shape, biases.shape
            )));
        }
        Ok(Self {
            dweights: Tensor::zeros(weights.shape.clone()),
            dbiases: Tensor::zeros(biases.shape.clone()),
            weights,
            biases,
            activation,
        })
    }

    pub fn n_inputs(&self) -> usize {
        self.weights.shape[0]
    }

    pub fn n_neurons(&self) -> usize {
        self.weights.shape[1]
    }

    /// `x · W + b`, before the activation
    fn linear(&self, x: &Tensor) -> Result<Tensor> {
        if x.ndim() != 2 || x.shape[1] != self.n_inputs() {
            return Err(EngineError::ShapeMismatch(format!(
                "dense input: expected [batch, {}], got {:?}",
                self.n_inputs(),
                x.shape
            )));
        }

        x.matmul(&self.weights)?.add(&self.biases)
    }

    /// Output only, for inference
    pub fn infer(&self, x: &Tensor) -> Result<Tensor> {
        let z = self.linear(x)?;
        match self.activation {
            Some(act) => act.apply(&z),
            None => Ok(z),
        }
    }

    /// Forward pass
    ///
    /// Returns the (activated) output and the cache the backward pass needs.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, DenseCache)> {
        let z = self.linear(x)?;
        let (y, activation) = match self.activation {
            Some(act) => {
                let (y, cache) = act.forward(&z)?;
                (y, Some(cache))
            }
            None => (z, None),
        };

        let cache = DenseCache {
            input: x.clone(),
            activation,
        };
        Ok((y, cache))
    }

    /// Backward pass
    ///
    /// Stores `dweights`/`dbiases` on the layer and returns the gradient
    /// w.r.t. the layer's input.
    pub fn backward(&mut self, upstream: Upstream<'_>, cache: &DenseCache) -> Result<Tensor> {
        let dz = match (upstream, self.activation, &cache.activation) {
            (Upstream::Output(grad), Some(act), Some(act_cache)) => act.backward(grad, act_cache)?,
            (Upstream::Output(grad), _, _) | (Upstream::PreActivation(grad), _, _) => grad.clone(),
        };

        if dz.ndim() != 2 || dz.shape != vec![cache.input.shape[0], self.n_neurons()] {
            return Err(EngineError::shape(
                "dense output gradient",
                [cache.input.shape[0], self.n_neurons()],
                &dz.shape,
            ));
        }

        // dW = x^T @ dz
        self.dweights = cache.input.transpose()?.matmul(&dz)?;

        // db = sum over the batch
        self.dbiases = dz.sum_axis(0)?;

        // dx = dz @ W^T
        dz.matmul(&self.weights.transpose()?)
    }
}

/// Cache for dense layer backward pass
#[derive(Clone, Debug)]
pub struct DenseCache {
    pub input: Tensor,
    pub activation: Option<ActivationCache>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn identity_layer() -> Dense {
        Dense::from_parameters(
            Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]),
            Tensor::zeros(vec![2]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_identity_forward() {
        let layer = identity_layer();
        let x = Tensor::new(vec![1.0, 2.0], vec![1, 2]);
        let (y, _) = layer.forward(&x).unwrap();
        assert_eq!(y.data, vec![1.0, 2.0]);
        assert_eq!(y.shape, vec![1, 2]);
    }

    #[test]
    fn test_init_ranges() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Dense::new(30, 10, Some(Activation::ReLU), &mut rng).unwrap();
        let scale = (2.0f64 / 40.0).sqrt();
        assert!(layer.weights.data.iter().all(|w| w.abs() <= scale));
        assert!(layer.biases.data.iter().all(|&b| b == BIAS_INIT));
    }

    #[test]
    fn test_gradient_shapes_for_any_batch() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Dense::new(4, 3, Some(Activation::ReLU), &mut rng).unwrap();
        for batch in [1, 2, 7] {
            let x = Tensor::new((0..batch * 4).map(|i| i as f64 * 0.1).collect(), vec![batch, 4]);
            let (y, cache) = layer.forward(&x).unwrap();
            let dx = layer
                .backward(Upstream::Output(&Tensor::full(y.shape.clone(), 1.0)), &cache)
                .unwrap();
            assert_eq!(layer.dweights.shape, layer.weights.shape);
            assert_eq!(layer.dbiases.shape, layer.biases.shape);
            assert_eq!(dx.shape, x.shape);
        }
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut layer = Dense::from_parameters(
            Tensor::new(vec![0.5, -0.3, 0.8, 0.1, -0.6, 0.2], vec![3, 2]),
            Tensor::new(vec![0.05, -0.1], vec![2]),
            Some(Activation::ReLU),
        )
        .unwrap();
        let x = Tensor::new(vec![1.0, 0.5, -0.2, 0.3, 0.9, 1.1], vec![2, 3]);

        // L = sum(y), so dL/dy = 1
        let (y, cache) = layer.forward(&x).unwrap();
        layer
            .backward(Upstream::Output(&Tensor::full(y.shape.clone(), 1.0)), &cache)
            .unwrap();

        let h = 1e-6;
        for idx in 0..layer.weights.len() {
            let mut plus = layer.clone();
            plus.weights.data[idx] += h;
            let mut minus = layer.clone();
            minus.weights.data[idx] -= h;
            let numeric = (plus.forward(&x).unwrap().0.sum() - minus.forward(&x).unwrap().0.sum())
                / (2.0 * h);
            assert_relative_eq!(layer.dweights.data[idx], numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rejects_wrong_width() {
        let layer = identity_layer();
        let x = Tensor::zeros(vec![1, 3]);
        assert!(matches!(
            layer.forward(&x),
            Err(EngineError::ShapeMismatch(_))
        ));
        let img = Tensor::zeros(vec![1, 2, 1, 1]);
        assert!(layer.forward(&img).is_err());
    }
}
