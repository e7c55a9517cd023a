//! 2D Max Pooling Layer
//!
//! Takes the maximum of each pooling window, channel by channel.
//!
//! ## Forward Pass
//!
//! ```text
//! y[b, oh, ow, c] = max_{ph, pw} x[b, oh·sH + ph, ow·sW + pw, c]
//! ```
//!
//! The flat index of each window's winner is recorded. Ties go to the first
//! element in scan order (row-major over the window).
//!
//! ## Backward Pass
//!
//! Each incoming gradient value is routed entirely to its window's winner;
//! every other input cell gets zero. Overlapping windows (stride < pool size)
//! can pick the same winner, in which case the contributions add up.
//!
//! ## Padding
//!
//! "same" uses the convolution padding arithmetic, but pads with `-inf` so a
//! padding cell can never win a window. The gradient is cropped back to the
//! unpadded input before being returned.

use super::padding::Padding;
use crate::error::{EngineError, Result};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Max pooling over the spatial axes of an NHWC tensor
#[derive(Clone, Debug)]
pub struct MaxPooling2D {
    pub pool_size: [usize; 2],
    pub strides: [usize; 2],
    pub padding: Padding,
    /// Per-sample input shape `[H, W, C]`
    pub input_shape: [usize; 3],
}

/// Winners of the forward pass, plus the geometry to undo padding
#[derive(Clone, Debug)]
pub struct MaxPoolCache {
    /// For every output cell, the flat offset of its maximum inside the
    /// padded input
    pub argmax: Vec<usize>,
    pub padded_shape: Vec<usize>,
    pub pad_top: usize,
    pub pad_left: usize,
}

impl MaxPooling2D {
    pub fn new(
        input_shape: [usize; 3],
        pool_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
    ) -> Result<Self> {
        let layer = Self {
            pool_size,
            strides,
            padding,
            input_shape,
        };
        layer.output_shape()?;
        Ok(layer)
    }

    /// Per-sample output shape `[H_out, W_out, C]`
    pub fn output_shape(&self) -> Result<[usize; 3]> {
        let rows = self
            .padding
            .plan(self.input_shape[0], self.pool_size[0], self.strides[0])?;
        let cols = self
            .padding
            .plan(self.input_shape[1], self.pool_size[1], self.strides[1])?;
        Ok([rows.output, cols.output, self.input_shape[2]])
    }

    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, MaxPoolCache)> {
        if x.ndim() != 4 || x.shape[1..] != self.input_shape {
            return Err(EngineError::ShapeMismatch(format!(
                "max_pooling2d input: expected [batch, {}, {}, {}], got {:?}",
                self.input_shape[0], self.input_shape[1], self.input_shape[2], x.shape
            )));
        }

        let [kh, kw] = self.pool_size;
        let [sh, sw] = self.strides;
        let rows = self.padding.plan(self.input_shape[0], kh, sh)?;
        let cols = self.padding.plan(self.input_shape[1], kw, sw)?;
        let padded = x.pad_spatial(
            rows.before,
            rows.after,
            cols.before,
            cols.after,
            f64::NEG_INFINITY,
        )?;

        let batch = x.shape[0];
        let (ph, pw, c) = (padded.shape[1], padded.shape[2], padded.shape[3]);
        let (oh_n, ow_n) = (rows.output, cols.output);
        let sample_in = ph * pw * c;
        let sample_out = oh_n * ow_n * c;

        let pooled: Vec<(f64, usize)> = (0..batch * sample_out)
            .into_par_iter()
            .map(|idx| {
                let b = idx / sample_out;
                let rem = idx % sample_out;
                let oh = rem / (ow_n * c);
                let ow = (rem / c) % ow_n;
                let ch = rem % c;

                let mut best = f64::NEG_INFINITY;
                let mut best_at = None;
                for ky in 0..kh {
                    let ih = oh * sh + ky;
                    if ih >= ph {
                        continue;
                    }
                    for kx in 0..kw {
                        let iw = ow * sw + kx;
                        if iw >= pw {
                            continue;
                        }
                        let at = b * sample_in + (ih * pw + iw) * c + ch;
                        let v = padded.data[at];
                        if best_at.is_none() || v > best {
                            best = v;
                            best_at = Some(at);
                        }
                    }
                }
                (best, best_at.unwrap_or(b * sample_in + ch))
            })
            .collect();

        let (values, argmax): (Vec<f64>, Vec<usize>) = pooled.into_iter().unzip();
        let y = Tensor::new(values, vec![batch, oh_n, ow_n, c]);
        let cache = MaxPoolCache {
            argmax,
            padded_shape: padded.shape.clone(),
            pad_top: rows.before,
            pad_left: cols.before,
        };
        Ok((y, cache))
    }

    pub fn backward(&self, grad: &Tensor, cache: &MaxPoolCache) -> Result<Tensor> {
        if grad.len() != cache.argmax.len() {
            return Err(EngineError::shape(
                "max_pooling2d output gradient",
                cache.argmax.len(),
                grad.len(),
            ));
        }

        let batch = cache.padded_shape[0];
        let sample_in: usize = cache.padded_shape[1..].iter().product();
        let sample_out = cache.argmax.len() / batch.max(1);

        let mut dpadded = Tensor::zeros(cache.padded_shape.clone());
        dpadded
            .data
            .par_chunks_mut(sample_in)
            .enumerate()
            .for_each(|(b, dx)| {
                let range = b * sample_out..(b + 1) * sample_out;
                for (&at, &g) in cache.argmax[range.clone()].iter().zip(&grad.data[range]) {
                    dx[at - b * sample_in] += g;
                }
            });

        dpadded.crop_spatial(
            cache.pad_top,
            cache.pad_left,
            self.input_shape[0],
            self.input_shape[1],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_2x2() {
        let pool = MaxPooling2D::new([4, 4, 1], [2, 2], [2, 2], Padding::Valid).unwrap();
        let x = Tensor::new(
            vec![
                1.0, 3.0, 2.0, 0.0, //
                4.0, 2.0, 1.0, 5.0, //
                0.0, 0.0, 7.0, 7.0, //
                6.0, 1.0, 7.0, 2.0,
            ],
            vec![1, 4, 4, 1],
        );
        let (y, _) = pool.forward(&x).unwrap();
        assert_eq!(y.data, vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_backward_routes_to_first_maximum() {
        let pool = MaxPooling2D::new([2, 2, 1], [2, 2], [2, 2], Padding::Valid).unwrap();
        let x = Tensor::new(vec![7.0, 7.0, 1.0, 7.0], vec![1, 2, 2, 1]);
        let (_, cache) = pool.forward(&x).unwrap();
        let dx = pool
            .backward(&Tensor::new(vec![3.0], vec![1, 1, 1, 1]), &cache)
            .unwrap();
        assert_eq!(dx.data, vec![3.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_same_padding_crops_gradient() {
        let pool = MaxPooling2D::new([3, 3, 2], [2, 2], [2, 2], Padding::Same).unwrap();
        assert_eq!(pool.output_shape().unwrap(), [2, 2, 2]);

        // All negative input: padding must never win
        let x = Tensor::new((0..18).map(|v| -(v as f64) - 1.0).collect(), vec![1, 3, 3, 2]);
        let (y, cache) = pool.forward(&x).unwrap();
        assert!(y.data.iter().all(|v| v.is_finite()));

        let dx = pool
            .backward(&Tensor::full(y.shape.clone(), 1.0), &cache)
            .unwrap();
        assert_eq!(dx.shape, x.shape);
        assert_eq!(dx.sum(), y.len() as f64);
    }

    #[test]
    fn test_channels_pool_independently() {
        let pool = MaxPooling2D::new([2, 2, 2], [2, 2], [2, 2], Padding::Valid).unwrap();
        let x = Tensor::new(
            vec![1.0, 8.0, 5.0, 2.0, 3.0, 4.0, 0.0, 6.0],
            vec![1, 2, 2, 2],
        );
        let (y, cache) = pool.forward(&x).unwrap();
        assert_eq!(y.data, vec![5.0, 8.0]);
        let dx = pool
            .backward(&Tensor::new(vec![1.0, 2.0], vec![1, 1, 1, 2]), &cache)
            .unwrap();
        assert_eq!(dx.data, vec![0.0, 2.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }
}
