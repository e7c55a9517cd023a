//! Gradient Utilities
//!
//! Gradient norm and clipping over the `dweights`/`dbiases` stored on a
//! model's trainable layers, run between the backward pass and the optimizer
//! step.
//!
//! ## Why Gradient Clipping?
//!
//! An occasional batch can produce a very large gradient that throws the
//! parameters far off. Clipping scales all gradients down together when
//! their joint norm exceeds a threshold:
//!
//! ```text
//! norm = √(Σ gradient²)  // over every trainable layer
//! if norm > max_norm:
//!     gradients *= (max_norm / norm)
//! ```
//!
//! Every gradient gets the same factor, so the update keeps its direction.

use crate::layers::Layer;
use rayon::prelude::*;

fn sum_sq(data: &[f64]) -> f64 {
    data.par_iter().map(|&val| val * val).sum()
}

/// L2 norm of the stored gradients of every trainable layer
pub fn compute_grad_norm(layers: &[Layer]) -> f64 {
    layers
        .iter()
        .filter_map(Layer::gradients)
        .map(|(dw, db)| sum_sq(&dw.data) + sum_sq(&db.data))
        .sum::<f64>()
        .sqrt()
}

/// Scale all stored gradients so their joint norm is at most `max_norm`
///
/// Returns the norm measured before clipping.
pub fn clip_gradients(layers: &mut [Layer], max_norm: f64) -> f64 {
    let norm = compute_grad_norm(layers);

    if norm > max_norm {
        let scale = max_norm / norm;
        for (dw, db) in layers.iter_mut().filter_map(Layer::gradients_mut) {
            dw.data.par_iter_mut().for_each(|val| *val *= scale);
            db.data.par_iter_mut().for_each(|val| *val *= scale);
        }
    }
    norm
}
