//! Loss Functions
//!
//! A loss scores a batch of predictions against targets and produces the
//! gradient that starts backpropagation.
//!
//! ## Catalogue
//!
//! ```text
//! MSE   loss_i = mean_j (p_ij - t_ij)²          grad = 2(p - t) / batch
//! CCE   loss_i = Σ_j t_ij · -ln(max(p_ij, ε))   grad = -t / max(p, ε) / batch
//! BCE   loss_i = mean_j -(t ln p + (1-t) ln(1-p)), p clipped to [ε, 1-ε]
//! ```
//!
//! with `ε = 1e-7`.
//!
//! ## Fused gradients
//!
//! Softmax followed by categorical cross-entropy has the closed-form gradient
//! `(p - t) / batch` w.r.t. the *logits*. Sigmoid followed by binary
//! cross-entropy collapses the same way. [`Loss::fused_backward`] returns that
//! shortcut only for those two exact pairings; every other pairing goes
//! through [`Loss::backward`] and then the activation's own backward pass.

use crate::error::{EngineError, Result};
use crate::layers::Activation;
use crate::tensor::Tensor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Clipping floor applied to predictions before taking logarithms
pub const EPSILON: f64 = 1e-7;

/// Loss function used by a model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Loss {
    MeanSquaredError,
    CategoricalCrossEntropy,
    BinaryCrossEntropy,
}

impl Loss {
    pub fn name(&self) -> &'static str {
        match self {
            Loss::MeanSquaredError => "mean_squared_error",
            Loss::CategoricalCrossEntropy => "categorical_crossentropy",
            Loss::BinaryCrossEntropy => "binary_crossentropy",
        }
    }

    fn check_shapes(predictions: &Tensor, targets: &Tensor) -> Result<(usize, usize)> {
        if predictions.ndim() != 2 || predictions.shape != targets.shape {
            return Err(EngineError::shape(
                "loss targets",
                &predictions.shape,
                &targets.shape,
            ));
        }
        if predictions.shape[1] == 0 {
            return Err(EngineError::ShapeMismatch(
                "loss needs at least one output column".to_string(),
            ));
        }
        Ok((predictions.shape[0], predictions.shape[1]))
    }

    /// Per-sample loss, shape `[batch]`
    pub fn forward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (batch, cols) = Self::check_shapes(predictions, targets)?;

        let per_sample: Vec<f64> = predictions
            .data
            .par_chunks(cols)
            .zip(targets.data.par_chunks(cols))
            .map(|(p, t)| match self {
                Loss::MeanSquaredError => {
                    p.iter().zip(t).map(|(a, b)| (a - b) * (a - b)).sum::<f64>() / cols as f64
                }
                Loss::CategoricalCrossEntropy => p
                    .iter()
                    .zip(t)
                    .map(|(&a, &b)| b * -a.max(EPSILON).ln())
                    .sum(),
                Loss::BinaryCrossEntropy => {
                    p.iter()
                        .zip(t)
                        .map(|(&a, &b)| {
                            let a = a.clamp(EPSILON, 1.0 - EPSILON);
                            -(b * a.ln() + (1.0 - b) * (1.0 - a).ln())
                        })
                        .sum::<f64>()
                        / cols as f64
                }
            })
            .collect();

        Ok(Tensor::new(per_sample, vec![batch]))
    }

    /// Mean loss over the batch
    pub fn calculate(&self, predictions: &Tensor, targets: &Tensor) -> Result<f64> {
        Ok(self.forward(predictions, targets)?.mean())
    }

    /// Gradient of the mean batch loss w.r.t. the predictions
    pub fn backward(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (batch, cols) = Self::check_shapes(predictions, targets)?;
        let n = batch as f64;

        let grad: Vec<f64> = predictions
            .data
            .par_iter()
            .zip(&targets.data)
            .map(|(&p, &t)| match self {
                Loss::MeanSquaredError => 2.0 * (p - t) / n,
                Loss::CategoricalCrossEntropy => -t / p.max(EPSILON) / n,
                Loss::BinaryCrossEntropy => {
                    let p = p.clamp(EPSILON, 1.0 - EPSILON);
                    -(t / p - (1.0 - t) / (1.0 - p)) / cols as f64 / n
                }
            })
            .collect();

        Ok(Tensor::new(grad, predictions.shape.clone()))
    }

    /// Combined gradient w.r.t. the pre-activation output of the final layer
    ///
    /// Returns `None` unless the final activation and this loss form one of
    /// the two closed-form pairs (Softmax + CCE, Sigmoid + BCE).
    pub fn fused_backward(
        &self,
        activation: Option<Activation>,
        predictions: &Tensor,
        targets: &Tensor,
    ) -> Result<Option<Tensor>> {
        let (batch, cols) = Self::check_shapes(predictions, targets)?;
        let scale = match (self, activation) {
            (Loss::CategoricalCrossEntropy, Some(Activation::Softmax)) => batch as f64,
            (Loss::BinaryCrossEntropy, Some(Activation::Sigmoid)) => (batch * cols) as f64,
            _ => return Ok(None),
        };

        let grad: Vec<f64> = predictions
            .data
            .par_iter()
            .zip(&targets.data)
            .map(|(&p, &t)| (p.max(EPSILON) - t) / scale)
            .collect();

        Ok(Some(Tensor::new(grad, predictions.shape.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::activation::softmax_forward;
    use approx::assert_relative_eq;

    #[test]
    fn test_mse_zero_on_identical() {
        let p = Tensor::new(vec![0.1, 0.9, -2.0, 3.0], vec![2, 2]);
        let loss = Loss::MeanSquaredError;
        assert_eq!(loss.forward(&p, &p).unwrap().data, vec![0.0, 0.0]);
        assert!(loss.backward(&p, &p).unwrap().data.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_mse_values() {
        let p = Tensor::new(vec![1.0, 3.0], vec![1, 2]);
        let t = Tensor::new(vec![0.0, 1.0], vec![1, 2]);
        let loss = Loss::MeanSquaredError;
        assert_eq!(loss.forward(&p, &t).unwrap().data, vec![2.5]);
        assert_eq!(loss.backward(&p, &t).unwrap().data, vec![2.0, 4.0]);
    }

    #[test]
    fn test_cce_clips_zero_predictions() {
        let p = Tensor::new(vec![0.0, 1.0], vec![1, 2]);
        let t = Tensor::new(vec![1.0, 0.0], vec![1, 2]);
        let l = Loss::CategoricalCrossEntropy.forward(&p, &t).unwrap();
        assert!(l.data[0].is_finite());
        assert_relative_eq!(l.data[0], -(EPSILON.ln()), epsilon = 1e-9);
    }

    #[test]
    fn test_fused_matches_chain_rule() {
        let logits = Tensor::new(vec![0.2, -0.4, 1.3, 0.0, 0.5, -1.0], vec![2, 3]);
        let targets = Tensor::new(vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0], vec![2, 3]);
        let (probs, cache) = Activation::Softmax.forward(&logits).unwrap();

        let loss = Loss::CategoricalCrossEntropy;
        let fused = loss
            .fused_backward(Some(Activation::Softmax), &probs, &targets)
            .unwrap()
            .unwrap();
        let dprobs = loss.backward(&probs, &targets).unwrap();
        let chained = Activation::Softmax.backward(&dprobs, &cache).unwrap();

        for (a, b) in fused.data.iter().zip(&chained.data) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
        assert_eq!(softmax_forward(&logits).unwrap(), probs);
    }

    #[test]
    fn test_fused_only_for_matching_pairs() {
        let p = Tensor::new(vec![0.5, 0.5], vec![1, 2]);
        let loss = Loss::CategoricalCrossEntropy;
        assert!(loss.fused_backward(Some(Activation::ReLU), &p, &p).unwrap().is_none());
        assert!(loss.fused_backward(None, &p, &p).unwrap().is_none());
        assert!(Loss::MeanSquaredError
            .fused_backward(Some(Activation::Softmax), &p, &p)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_bce_sigmoid_fused_matches_chain_rule() {
        let logits = Tensor::new(vec![0.3, -1.2, 2.0, 0.1], vec![2, 2]);
        let targets = Tensor::new(vec![1.0, 0.0, 1.0, 1.0], vec![2, 2]);
        let (probs, cache) = Activation::Sigmoid.forward(&logits).unwrap();

        let loss = Loss::BinaryCrossEntropy;
        let fused = loss
            .fused_backward(Some(Activation::Sigmoid), &probs, &targets)
            .unwrap()
            .unwrap();
        let chained = Activation::Sigmoid
            .backward(&loss.backward(&probs, &targets).unwrap(), &cache)
            .unwrap();
        for (a, b) in fused.data.iter().zip(&chained.data) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let p = Tensor::zeros(vec![2, 3]);
        let t = Tensor::zeros(vec![2, 2]);
        for loss in [
            Loss::MeanSquaredError,
            Loss::CategoricalCrossEntropy,
            Loss::BinaryCrossEntropy,
        ] {
            assert!(matches!(
                loss.forward(&p, &t),
                Err(EngineError::ShapeMismatch(_))
            ));
            assert!(loss.backward(&p, &t).is_err());
        }
    }

    #[test]
    fn test_zero_width_rows_are_rejected() {
        let empty = Tensor::from_rows(&[vec![], vec![]]).unwrap();
        assert_eq!(empty.shape, vec![2, 0]);
        for loss in [
            Loss::MeanSquaredError,
            Loss::CategoricalCrossEntropy,
            Loss::BinaryCrossEntropy,
        ] {
            assert!(matches!(
                loss.forward(&empty, &empty),
                Err(EngineError::ShapeMismatch(_))
            ));
            assert!(matches!(
                loss.backward(&empty, &empty),
                Err(EngineError::ShapeMismatch(_))
            ));
            assert!(matches!(
                loss.fused_backward(Some(Activation::Softmax), &empty, &empty),
                Err(EngineError::ShapeMismatch(_))
            ));
        }
    }

    #[test]
    fn test_bce_negative_target_row() {
        // target 0 scores the complement: -ln(1 - 0.8)
        let p = Tensor::new(vec![0.8], vec![1, 1]);
        let t = Tensor::new(vec![0.0], vec![1, 1]);
        let loss = Loss::BinaryCrossEntropy;
        assert_relative_eq!(
            loss.forward(&p, &t).unwrap().data[0],
            -(0.2f64.ln()),
            epsilon = 1e-12
        );
        assert_relative_eq!(loss.backward(&p, &t).unwrap().data[0], 5.0, epsilon = 1e-9);

        // two outputs average rather than sum
        let p = Tensor::new(vec![0.8, 0.8], vec![1, 2]);
        let t = Tensor::new(vec![0.0, 1.0], vec![1, 2]);
        assert_relative_eq!(
            loss.forward(&p, &t).unwrap().data[0],
            -(0.2f64.ln() + 0.8f64.ln()) / 2.0,
            epsilon = 1e-12
        );
    }
}
