//! Optimizers
//!
//! Gradient-descent rules applied to one trainable layer at a time.
//!
//! ## SGD
//!
//! ```text
//! velocity = momentum * velocity - lr * g     # only when momentum > 0
//! θ = θ + velocity
//!
//! θ = θ - lr * g                              # plain SGD
//! ```
//!
//! ## Adam
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! m = β₁ * m + (1 - β₁) * g        # First moment (momentum)
//! v = β₂ * v + (1 - β₂) * g²       # Second moment (variance)
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)           # Bias correction
//! θ = θ - α * m_hat / (√v_hat + ε) # Parameter update
//! ```
//!
//! Defaults: α = 0.001, β₁ = 0.9, β₂ = 0.999, ε = 1e-7. The timestep `t` is
//! shared by a layer's weights and biases and advances once per `update`.
//!
//! ## State Ownership
//!
//! A model holds one optimizer per layer, cloned from the configured
//! prototype at build time, so moment buffers never leak between layers.
//! Buffers are allocated by [`Optimizer::initialize`] during the build, not
//! on first use; updating an Adam optimizer that was never initialized is an
//! error.
//!
//! Tensors over 1000 elements are updated in parallel with Rayon; smaller
//! ones sequentially.

use crate::error::{EngineError, Result};
use crate::layers::Layer;
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const PARALLEL_THRESHOLD: usize = 1000;

/// Per-layer buffers shaped like the layer's weights and biases
#[derive(Clone, Debug)]
pub struct ParamState {
    pub weights: Tensor,
    pub biases: Tensor,
}

impl ParamState {
    fn zeros_like(layer: &Layer) -> Option<Self> {
        layer.parameters().map(|(w, b)| Self {
            weights: Tensor::zeros(w.shape.clone()),
            biases: Tensor::zeros(b.shape.clone()),
        })
    }
}

/// Stochastic gradient descent, optionally with momentum
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    #[serde(skip)]
    pub velocity: Option<ParamState>,
}

/// Adam state for a single layer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    #[serde(skip)]
    pub t: usize,
    #[serde(skip)]
    pub m: Option<ParamState>,
    #[serde(skip)]
    pub v: Option<ParamState>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Optimizer {
    Sgd(Sgd),
    Adam(Adam),
}

impl Optimizer {
    /// Plain SGD with the given learning rate
    pub fn sgd(learning_rate: f64) -> Self {
        Optimizer::Sgd(Sgd {
            learning_rate,
            momentum: 0.0,
            velocity: None,
        })
    }

    /// Adam with default hyperparameters and the given learning rate
    pub fn adam(learning_rate: f64) -> Self {
        Optimizer::Adam(Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            t: 0,
            m: None,
            v: None,
        })
    }

    /// Set SGD momentum. No effect on Adam.
    pub fn with_momentum(mut self, momentum: f64) -> Self {
        if let Optimizer::Sgd(sgd) = &mut self {
            sgd.momentum = momentum;
        }
        self
    }

    /// Set Adam's decay rates. No effect on SGD.
    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        if let Optimizer::Adam(adam) = &mut self {
            adam.beta1 = beta1;
            adam.beta2 = beta2;
        }
        self
    }

    /// Set Adam's epsilon. No effect on SGD.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        if let Optimizer::Adam(adam) = &mut self {
            adam.epsilon = epsilon;
        }
        self
    }

    pub fn name(&self) -> &'static str {
        match self {
            Optimizer::Sgd(_) => "sgd",
            Optimizer::Adam(_) => "adam",
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Optimizer::Sgd(sgd) => sgd.learning_rate,
            Optimizer::Adam(adam) => adam.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        match self {
            Optimizer::Sgd(sgd) => sgd.learning_rate = learning_rate,
            Optimizer::Adam(adam) => adam.learning_rate = learning_rate,
        }
    }

    /// Check the hyperparameters
    pub fn validate(&self) -> Result<()> {
        let ok = match self {
            Optimizer::Sgd(sgd) => {
                sgd.learning_rate > 0.0 && (0.0..1.0).contains(&sgd.momentum)
            }
            Optimizer::Adam(adam) => {
                adam.learning_rate > 0.0
                    && (0.0..1.0).contains(&adam.beta1)
                    && (0.0..1.0).contains(&adam.beta2)
                    && adam.epsilon > 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidConfiguration(format!(
                "invalid {} hyperparameters: {:?}",
                self.name(),
                self
            )))
        }
    }

    /// Allocate state for the layer this optimizer will update
    ///
    /// Resets any previous state. Non-trainable layers get no buffers.
    pub fn initialize(&mut self, layer: &Layer) {
        match self {
            Optimizer::Sgd(sgd) => {
                sgd.velocity = if sgd.momentum > 0.0 {
                    ParamState::zeros_like(layer)
                } else {
                    None
                };
            }
            Optimizer::Adam(adam) => {
                adam.t = 0;
                adam.m = ParamState::zeros_like(layer);
                adam.v = ParamState::zeros_like(layer);
            }
        }
    }

    /// Apply one step to the layer's weights and biases using its stored
    /// `dweights` and `dbiases`
    pub fn update(&mut self, layer: &mut Layer) -> Result<()> {
        let params = layer.params_mut()?;
        match self {
            Optimizer::Sgd(sgd) => {
                let lr = sgd.learning_rate;
                match (&mut sgd.velocity, sgd.momentum > 0.0) {
                    (Some(velocity), true) => {
                        check_state(&velocity.weights, params.weights)?;
                        check_state(&velocity.biases, params.biases)?;
                        momentum_step(params.weights, params.dweights, &mut velocity.weights, lr, sgd.momentum);
                        momentum_step(params.biases, params.dbiases, &mut velocity.biases, lr, sgd.momentum);
                    }
                    (None, true) => {
                        return Err(EngineError::InvalidConfiguration(
                            "sgd momentum buffers were never initialized".to_string(),
                        ))
                    }
                    _ => {
                        sgd_step(params.weights, params.dweights, lr);
                        sgd_step(params.biases, params.dbiases, lr);
                    }
                }
            }
            Optimizer::Adam(adam) => {
                let (Some(m), Some(v)) = (adam.m.as_mut(), adam.v.as_mut()) else {
                    return Err(EngineError::InvalidConfiguration(
                        "adam moment buffers were never initialized".to_string(),
                    ));
                };
                check_state(&m.weights, params.weights)?;
                check_state(&m.biases, params.biases)?;

                adam.t += 1;
                let step = AdamStep {
                    lr: adam.learning_rate,
                    beta1: adam.beta1,
                    beta2: adam.beta2,
                    epsilon: adam.epsilon,
                    bias_correction1: 1.0 - adam.beta1.powi(adam.t as i32),
                    bias_correction2: 1.0 - adam.beta2.powi(adam.t as i32),
                };
                step.apply(params.weights, params.dweights, &mut m.weights, &mut v.weights);
                step.apply(params.biases, params.dbiases, &mut m.biases, &mut v.biases);
            }
        }
        Ok(())
    }
}

fn check_state(state: &Tensor, param: &Tensor) -> Result<()> {
    if state.shape != param.shape {
        return Err(EngineError::shape("optimizer state", &param.shape, &state.shape));
    }
    Ok(())
}

fn sgd_step(param: &mut Tensor, grad: &Tensor, lr: f64) {
    if param.data.len() > PARALLEL_THRESHOLD {
        param
            .data
            .par_iter_mut()
            .zip(grad.data.par_iter())
            .for_each(|(p, &g)| *p -= lr * g);
    } else {
        for (p, &g) in param.data.iter_mut().zip(&grad.data) {
            *p -= lr * g;
        }
    }
}

fn momentum_step(param: &mut Tensor, grad: &Tensor, velocity: &mut Tensor, lr: f64, momentum: f64) {
    let apply = |(p, (&g, vel)): (&mut f64, (&f64, &mut f64))| {
        *vel = momentum * *vel - lr * g;
        *p += *vel;
    };
    if param.data.len() > PARALLEL_THRESHOLD {
        param
            .data
            .par_iter_mut()
            .zip(grad.data.par_iter().zip(velocity.data.par_iter_mut()))
            .for_each(apply);
    } else {
        param
            .data
            .iter_mut()
            .zip(grad.data.iter().zip(velocity.data.iter_mut()))
            .for_each(apply);
    }
}

struct AdamStep {
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    bias_correction1: f64,
    bias_correction2: f64,
}

impl AdamStep {
    fn element(&self, param: &mut f64, grad: f64, m: &mut f64, v: &mut f64) {
        *m = self.beta1 * *m + (1.0 - self.beta1) * grad;
        *v = self.beta2 * *v + (1.0 - self.beta2) * grad * grad;
        let m_hat = *m / self.bias_correction1;
        let v_hat = *v / self.bias_correction2;
        *param -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
    }

    fn apply(&self, param: &mut Tensor, grad: &Tensor, m: &mut Tensor, v: &mut Tensor) {
        if param.data.len() > PARALLEL_THRESHOLD {
            param
                .data
                .par_iter_mut()
                .zip(grad.data.par_iter())
                .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
                .for_each(|((p, &g), (m, v))| self.element(p, g, m, v));
        } else {
            for i in 0..param.data.len() {
                self.element(&mut param.data[i], grad.data[i], &mut m.data[i], &mut v.data[i]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Dense, Flatten};
    use approx::assert_relative_eq;

    fn dense_with_unit_grads(n_in: usize, n_out: usize) -> Layer {
        let mut dense = Dense::from_parameters(
            Tensor::zeros(vec![n_in, n_out]),
            Tensor::zeros(vec![n_out]),
            None,
        )
        .unwrap();
        dense.dweights = Tensor::full(vec![n_in, n_out], 1.0);
        dense.dbiases = Tensor::full(vec![n_out], 1.0);
        Layer::Dense(dense)
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let mut layer = dense_with_unit_grads(2, 3);
        let mut opt = Optimizer::adam(0.001);
        opt.initialize(&layer);
        opt.update(&mut layer).unwrap();

        let (w, b) = layer.parameters().unwrap();
        for &value in w.data.iter().chain(&b.data) {
            assert_relative_eq!(value, -0.001, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_adam_large_tensor_matches_small() {
        // 40x40 goes through the parallel path, the biases through the sequential one
        let mut layer = dense_with_unit_grads(40, 40);
        let mut opt = Optimizer::adam(0.01);
        opt.initialize(&layer);
        opt.update(&mut layer).unwrap();
        opt.update(&mut layer).unwrap();

        let (w, b) = layer.parameters().unwrap();
        assert_relative_eq!(w.data[0], b.data[0], epsilon = 1e-12);
        assert_relative_eq!(w.data[0], -0.02, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_requires_initialize() {
        let mut layer = dense_with_unit_grads(1, 1);
        let mut opt = Optimizer::adam(0.001);
        assert!(matches!(
            opt.update(&mut layer),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_sgd_step() {
        let mut layer = dense_with_unit_grads(2, 2);
        let mut opt = Optimizer::sgd(0.5);
        opt.initialize(&layer);
        opt.update(&mut layer).unwrap();
        let (w, b) = layer.parameters().unwrap();
        assert!(w.data.iter().chain(&b.data).all(|&v| v == -0.5));
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let mut layer = dense_with_unit_grads(1, 1);
        let mut opt = Optimizer::sgd(0.1).with_momentum(0.9);
        opt.initialize(&layer);
        opt.update(&mut layer).unwrap();
        opt.update(&mut layer).unwrap();
        // -0.1, then -(0.09 + 0.1)
        let (w, _) = layer.parameters().unwrap();
        assert_relative_eq!(w.data[0], -0.29, epsilon = 1e-12);
    }

    #[test]
    fn test_non_trainable_layer_is_rejected() {
        let mut layer = Layer::Flatten(Flatten::new(4));
        let mut opt = Optimizer::sgd(0.1);
        opt.initialize(&layer);
        assert!(matches!(
            opt.update(&mut layer),
            Err(EngineError::UnsupportedLayerType(_))
        ));
    }

    #[test]
    fn test_clones_do_not_share_moments() {
        let mut first = dense_with_unit_grads(1, 1);
        let second = dense_with_unit_grads(1, 1);
        let prototype = Optimizer::adam(0.001);
        let mut a = prototype.clone();
        let mut b = prototype.clone();
        a.initialize(&first);
        b.initialize(&second);
        a.update(&mut first).unwrap();
        match (&a, &b) {
            (Optimizer::Adam(a), Optimizer::Adam(b)) => {
                assert_eq!(a.t, 1);
                assert_eq!(b.t, 0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_validate() {
        assert!(Optimizer::adam(0.001).validate().is_ok());
        assert!(Optimizer::adam(0.0).validate().is_err());
        assert!(Optimizer::sgd(0.1).with_momentum(1.5).validate().is_err());
    }
}
