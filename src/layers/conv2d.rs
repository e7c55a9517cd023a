//! 2D Convolution Layer
//!
//! Slides `F` learned filters over an NHWC image volume, computing a direct
//! (nested-loop) correlation rather than lowering to a matrix multiply.
//!
//! ## Shapes
//!
//! ```text
//! Input:   x [batch, H, W, C_in]
//! Weights: W [kH, kW, C_in, F]
//! Bias:    b [F]
//! Output:  y [batch, H_out, W_out, F]
//! ```
//!
//! ## Forward Pass
//!
//! For every output cell and filter:
//!
//! ```text
//! z[b, oh, ow, oc] = b[oc] + Σ_{kh, kw, ic} x[b, oh·sH + kh, ow·sW + kw, ic] · W[kh, kw, ic, oc]
//! ```
//!
//! With "same" padding the input is first copied into a zero-filled larger
//! tensor; the correlation then runs over that padded volume.
//!
//! ## Backward Pass
//!
//! ```text
//! dW[kh, kw, ic, oc] = Σ_{b, oh, ow} x[b, oh·sH + kh, ow·sW + kw, ic] · dz[b, oh, ow, oc]
//! db[oc]             = Σ_{b, oh, ow} dz[b, oh, ow, oc]
//! dx[b, oh·sH + kh, ow·sW + kw, ic] += dz[b, oh, ow, oc] · W[kh, kw, ic, oc]
//! ```
//!
//! `dx` is accumulated over the padded volume and then cropped back to the
//! unpadded input, so the layer above always receives a gradient shaped like
//! the tensor it produced.
//!
//! ## Parallelism
//!
//! Forward and `dx` run one Rayon task per sample (each writes a disjoint
//! slice). `dW` overlaps across samples, so every task folds into a private
//! buffer and the buffers are summed in a final reduction.

use super::activation::{Activation, ActivationCache};
use super::padding::Padding;
use super::{uniform_init, Upstream, BIAS_INIT};
use crate::error::{EngineError, Result};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rayon::prelude::*;

/// 2D convolution layer
#[derive(Clone, Debug)]
pub struct Conv2D {
    pub weights: Tensor,
    pub biases: Tensor,
    pub dweights: Tensor,
    pub dbiases: Tensor,
    pub strides: [usize; 2],
    pub padding: Padding,
    pub activation: Option<Activation>,
    /// Per-sample input shape `[H, W, C_in]`
    pub input_shape: [usize; 3],
}

/// Everything the backward pass needs from one forward call
#[derive(Clone, Debug)]
pub struct Conv2DCache {
    /// Input after padding (identical to the input under "valid")
    pub padded_input: Tensor,
    pub pad_top: usize,
    pub pad_left: usize,
    pub activation: Option<ActivationCache>,
}

impl Conv2D {
    /// Create a convolution layer with He uniform weights
    pub fn new(
        input_shape: [usize; 3],
        filters: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
        activation: Option<Activation>,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let [kh, kw] = kernel_size;
        let channels = input_shape[2];
        if filters == 0 || kh == 0 || kw == 0 || channels == 0 {
            return Err(EngineError::InvalidConfiguration(format!(
                "conv2d needs positive filters/kernel/channels, got {} filters, kernel {:?}, {} channels",
                filters, kernel_size, channels
            )));
        }
        let scale = (2.0 / (channels * kh * kw) as f64).sqrt();
        let weights = Tensor::new(
            uniform_init(kh * kw * channels * filters, scale, rng),
            vec![kh, kw, channels, filters],
        );
        let biases = Tensor::full(vec![filters], BIAS_INIT);
        Self::from_parameters(input_shape, weights, biases, strides, padding, activation)
    }

    /// Build a layer around existing parameters
    pub fn from_parameters(
        input_shape: [usize; 3],
        weights: Tensor,
        biases: Tensor,
        strides: [usize; 2],
        padding: Padding,
        activation: Option<Activation>,
    ) -> Result<Self> {
        if weights.ndim() != 4
            || weights.shape[2] != input_shape[2]
            || biases.shape != vec![weights.shape[3]]
        {
            return Err(EngineError::ShapeMismatch(format!(
                "conv2d parameters {:?} / {:?} do not fit input {:?}",
                weights.shape, biases.shape, input_shape
            )));
        }
        let layer = Self {
            dweights: Tensor::zeros(weights.shape.clone()),
            dbiases: Tensor::zeros(biases.shape.clone()),
            weights,
            biases,
            strides,
            padding,
            activation,
            input_shape,
        };
        // Validates kernel/stride against the input once, up front
        layer.output_shape()?;
        Ok(layer)
    }

    pub fn filters(&self) -> usize {
        self.weights.shape[3]
    }

    pub fn kernel_size(&self) -> [usize; 2] {
        [self.weights.shape[0], self.weights.shape[1]]
    }

    /// Per-sample output shape `[H_out, W_out, F]`
    pub fn output_shape(&self) -> Result<[usize; 3]> {
        let [kh, kw] = self.kernel_size();
        let rows = self.padding.plan(self.input_shape[0], kh, self.strides[0])?;
        let cols = self.padding.plan(self.input_shape[1], kw, self.strides[1])?;
        Ok([rows.output, cols.output, self.filters()])
    }

    /// Correlate the padded input with every filter, before the activation
    ///
    /// Returns the pre-activation output, the padded input and the
    /// top/left padding.
    fn convolve(&self, x: &Tensor) -> Result<(Tensor, Tensor, usize, usize)> {
        if x.ndim() != 4 || x.shape[1..] != self.input_shape {
            return Err(EngineError::ShapeMismatch(format!(
                "conv2d input: expected [batch, {}, {}, {}], got {:?}",
                self.input_shape[0], self.input_shape[1], self.input_shape[2], x.shape
            )));
        }

        let [kh, kw] = self.kernel_size();
        let [sh, sw] = self.strides;
        let rows = self.padding.plan(self.input_shape[0], kh, sh)?;
        let cols = self.padding.plan(self.input_shape[1], kw, sw)?;
        let padded = x.pad_spatial(rows.before, rows.after, cols.before, cols.after, 0.0)?;

        let batch = x.shape[0];
        let (ph, pw, cin) = (padded.shape[1], padded.shape[2], padded.shape[3]);
        let (oh_n, ow_n, f) = (rows.output, cols.output, self.filters());
        let sample_in = ph * pw * cin;

        let mut z = Tensor::zeros(vec![batch, oh_n, ow_n, f]);
        let weights = &self.weights.data;
        let biases = &self.biases.data;

        z.data
            .par_chunks_mut(oh_n * ow_n * f)
            .enumerate()
            .for_each(|(b, out)| {
                let input = &padded.data[b * sample_in..(b + 1) * sample_in];
                for oh in 0..oh_n {
                    for ow in 0..ow_n {
                        let cell = &mut out[(oh * ow_n + ow) * f..(oh * ow_n + ow + 1) * f];
                        cell.copy_from_slice(biases);
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
                                for ic in 0..cin {
                                    let x_val = input[(ih * pw + iw) * cin + ic];
                                    let w_base = ((ky * kw + kx) * cin + ic) * f;
                                    for (acc, &w) in cell.iter_mut().zip(&weights[w_base..w_base + f]) {
                                        *acc += x_val * w;
                                    }
                                }
                            }
                        }
                    }
                }
            });

        Ok((z, padded, rows.before, cols.before))
    }

    /// Output only, for inference
    pub fn infer(&self, x: &Tensor) -> Result<Tensor> {
        let (z, _, _, _) = self.convolve(x)?;
        match self.activation {
            Some(act) => act.apply(&z),
            None => Ok(z),
        }
    }

    /// Forward pass
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Conv2DCache)> {
        let (z, padded, pad_top, pad_left) = self.convolve(x)?;
        let (y, activation) = match self.activation {
            Some(act) => {
                let (y, cache) = act.forward(&z)?;
                (y, Some(cache))
            }
            None => (z, None),
        };

        let cache = Conv2DCache {
            padded_input: padded,
            pad_top,
            pad_left,
            activation,
        };
        Ok((y, cache))
    }

    /// Backward pass
    ///
    /// Overwrites `dweights`/`dbiases` and returns the gradient w.r.t. the
    /// unpadded input.
    pub fn backward(&mut self, upstream: Upstream<'_>, cache: &Conv2DCache) -> Result<Tensor> {
        let dz = match (upstream, self.activation, &cache.activation) {
            (Upstream::Output(grad), Some(act), Some(act_cache)) => act.backward(grad, act_cache)?,
            (Upstream::Output(grad), _, _) | (Upstream::PreActivation(grad), _, _) => grad.clone(),
        };

        let padded = &cache.padded_input;
        let batch = padded.shape[0];
        let [oh_n, ow_n, f] = self.output_shape()?;
        if dz.shape != vec![batch, oh_n, ow_n, f] {
            return Err(EngineError::shape(
                "conv2d output gradient",
                [batch, oh_n, ow_n, f],
                &dz.shape,
            ));
        }

        let [kh, kw] = self.kernel_size();
        let [sh, sw] = self.strides;
        let (ph, pw, cin) = (padded.shape[1], padded.shape[2], padded.shape[3]);
        let sample_in = ph * pw * cin;
        let sample_out = oh_n * ow_n * f;
        let weights = &self.weights.data;

        // db = Σ over batch and positions
        self.dbiases = dz.reshape(&[batch * oh_n * ow_n, f])?.sum_axis(0)?;

        // dW: per-sample partial sums, reduced
        let w_len = self.weights.len();
        let dweights = (0..batch)
            .into_par_iter()
            .fold(
                || vec![0.0; w_len],
                |mut acc, b| {
                    let input = &padded.data[b * sample_in..(b + 1) * sample_in];
                    let grad = &dz.data[b * sample_out..(b + 1) * sample_out];
                    for oh in 0..oh_n {
                        for ow in 0..ow_n {
                            let g = &grad[(oh * ow_n + ow) * f..(oh * ow_n + ow + 1) * f];
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
                                    for ic in 0..cin {
                                        let x_val = input[(ih * pw + iw) * cin + ic];
                                        let w_base = ((ky * kw + kx) * cin + ic) * f;
                                        for (dw, &gv) in acc[w_base..w_base + f].iter_mut().zip(g) {
                                            *dw += x_val * gv;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    acc
                },
            )
            .reduce(
                || vec![0.0; w_len],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            );
        self.dweights = Tensor::new(dweights, self.weights.shape.clone());

        // dx over the padded volume, one task per sample
        let mut dpadded = Tensor::zeros(padded.shape.clone());
        dpadded
            .data
            .par_chunks_mut(sample_in)
            .enumerate()
            .for_each(|(b, dx)| {
                let grad = &dz.data[b * sample_out..(b + 1) * sample_out];
                for oh in 0..oh_n {
                    for ow in 0..ow_n {
                        let g = &grad[(oh * ow_n + ow) * f..(oh * ow_n + ow + 1) * f];
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
                                for ic in 0..cin {
                                    let w_base = ((ky * kw + kx) * cin + ic) * f;
                                    let s: f64 = g
                                        .iter()
                                        .zip(&weights[w_base..w_base + f])
                                        .map(|(gv, w)| gv * w)
                                        .sum();
                                    dx[(ih * pw + iw) * cin + ic] += s;
                                }
                            }
                        }
                    }
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
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Uniform};

    fn ramp(shape: Vec<usize>, scale: f64) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::new(
            (0..n).map(|i| ((i * 7 % 11) as f64 - 5.0) * scale).collect(),
            shape,
        )
    }

    fn layer(input: [usize; 3], filters: usize, kernel: [usize; 2], strides: [usize; 2], padding: Padding) -> Conv2D {
        let mut rng = StdRng::seed_from_u64(42);
        Conv2D::new(input, filters, kernel, strides, padding, None, &mut rng).unwrap()
    }

    #[test]
    fn test_valid_output_shape() {
        let conv = layer([7, 9, 2], 4, [3, 2], [2, 3], Padding::Valid);
        let x = ramp(vec![2, 7, 9, 2], 0.1);
        let (y, _) = conv.forward(&x).unwrap();
        assert_eq!(y.shape, vec![2, (7 - 3) / 2 + 1, (9 - 2) / 3 + 1, 4]);
    }

    #[test]
    fn test_same_stride_one_keeps_spatial_shape() {
        for kernel in [[1, 1], [2, 2], [3, 3], [4, 2]] {
            let conv = layer([5, 6, 1], 2, kernel, [1, 1], Padding::Same);
            let x = ramp(vec![1, 5, 6, 1], 0.1);
            let (y, cache) = conv.forward(&x).unwrap();
            assert_eq!(y.shape, vec![1, 5, 6, 2]);

            let mut conv = conv;
            let dx = conv
                .backward(Upstream::Output(&Tensor::full(y.shape.clone(), 1.0)), &cache)
                .unwrap();
            assert_eq!(dx.shape, x.shape);
        }
    }

    #[test]
    fn test_forward_by_hand() {
        // 3x3 single-channel input, 2x2 kernel of ones, bias 0.5
        let conv = Conv2D::from_parameters(
            [3, 3, 1],
            Tensor::full(vec![2, 2, 1, 1], 1.0),
            Tensor::new(vec![0.5], vec![1]),
            [1, 1],
            Padding::Valid,
            None,
        )
        .unwrap();
        let x = Tensor::new((1..=9).map(|v| v as f64).collect(), vec![1, 3, 3, 1]);
        let (y, _) = conv.forward(&x).unwrap();
        assert_eq!(y.data, vec![12.5, 16.5, 24.5, 28.5]);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut conv = layer([4, 5, 2], 3, [3, 2], [1, 2], Padding::Same);
        let x = ramp(vec![2, 4, 5, 2], 0.13);
        let upstream = ramp(vec![2, 4, 3, 3], 0.07);

        // L = Σ y ⊙ upstream
        let loss = |c: &Conv2D, x: &Tensor| -> f64 {
            let (y, _) = c.forward(x).unwrap();
            y.data.iter().zip(&upstream.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = conv.forward(&x).unwrap();
        let dx = conv.backward(Upstream::Output(&upstream), &cache).unwrap();

        let h = 1e-6;
        for idx in (0..conv.weights.len()).step_by(5) {
            let mut plus = conv.clone();
            plus.weights.data[idx] += h;
            let mut minus = conv.clone();
            minus.weights.data[idx] -= h;
            let numeric = (loss(&plus, &x) - loss(&minus, &x)) / (2.0 * h);
            assert_relative_eq!(conv.dweights.data[idx], numeric, epsilon = 1e-6);
        }
        for idx in (0..x.len()).step_by(7) {
            let mut xp = x.clone();
            xp.data[idx] += h;
            let mut xm = x.clone();
            xm.data[idx] -= h;
            let numeric = (loss(&conv, &xp) - loss(&conv, &xm)) / (2.0 * h);
            assert_relative_eq!(dx.data[idx], numeric, epsilon = 1e-6);
        }
        let expected_db: Vec<f64> = (0..3)
            .map(|oc| upstream.data.iter().skip(oc).step_by(3).sum())
            .collect();
        for (a, b) in conv.dbiases.data.iter().zip(&expected_db) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    /// Batch `dweights`/`dbiases` must equal the sum over single-sample passes
    fn assert_batch_gradient_is_sum(mut conv: Conv2D, x: &Tensor, rng: &mut StdRng) {
        let dist = Uniform::new_inclusive(-1.0, 1.0);
        let batch = x.shape[0];
        let (y, cache) = conv.forward(x).unwrap();
        let upstream = Tensor::new((0..y.len()).map(|_| dist.sample(rng)).collect(), y.shape.clone());
        let batch_dx = conv.backward(Upstream::Output(&upstream), &cache).unwrap();
        let batch_dw = conv.dweights.clone();
        let batch_db = conv.dbiases.clone();

        let mut summed_dw = vec![0.0; batch_dw.len()];
        let mut summed_db = vec![0.0; batch_db.len()];
        for b in 0..batch {
            let xs = x.slice_rows(b, b + 1).unwrap();
            let us = upstream.slice_rows(b, b + 1).unwrap();
            let (_, c) = conv.forward(&xs).unwrap();
            let dx = conv.backward(Upstream::Output(&us), &c).unwrap();
            for (s, d) in summed_dw.iter_mut().zip(&conv.dweights.data) {
                *s += d;
            }
            for (s, d) in summed_db.iter_mut().zip(&conv.dbiases.data) {
                *s += d;
            }
            // dinputs never mixes samples
            let batch_rows = batch_dx.slice_rows(b, b + 1).unwrap();
            for (a, d) in batch_rows.data.iter().zip(&dx.data) {
                assert_relative_eq!(a, d, epsilon = 1e-10);
            }
        }
        for (a, b) in batch_dw.data.iter().zip(&summed_dw) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
        for (a, b) in batch_db.data.iter().zip(&summed_db) {
            assert_relative_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_batch_gradient_is_sum_of_sample_gradients() {
        let mut rng = StdRng::seed_from_u64(2024);
        let dist = Uniform::new_inclusive(-1.0, 1.0);

        // fixed corners: odd total padding, stride past the kernel
        let mut configs: Vec<([usize; 3], usize, [usize; 2], [usize; 2], Padding)> = vec![
            ([5, 5, 2], 2, [2, 3], [2, 1], Padding::Valid),
            ([6, 7, 1], 2, [3, 3], [2, 2], Padding::Same),
            ([5, 6, 2], 3, [2, 3], [1, 3], Padding::Same),
            ([7, 6, 3], 2, [1, 1], [3, 2], Padding::Valid),
        ];
        for _ in 0..12 {
            let kernel = [rng.gen_range(1..=4), rng.gen_range(1..=4)];
            let strides = [rng.gen_range(1..=3), rng.gen_range(1..=3)];
            let padding = if rng.gen_bool(0.5) { Padding::Same } else { Padding::Valid };
            let input = [
                rng.gen_range(kernel[0]..=kernel[0] + 4),
                rng.gen_range(kernel[1]..=kernel[1] + 4),
                rng.gen_range(1..=3),
            ];
            configs.push((input, rng.gen_range(1..=3), kernel, strides, padding));
        }

        for (input, filters, kernel, strides, padding) in configs {
            let activation = if rng.gen_bool(0.5) { Some(Activation::ReLU) } else { None };
            let conv =
                Conv2D::new(input, filters, kernel, strides, padding, activation, &mut rng).unwrap();
            let batch = rng.gen_range(2..=4);
            let shape = vec![batch, input[0], input[1], input[2]];
            let n: usize = shape.iter().product();
            let x = Tensor::new((0..n).map(|_| dist.sample(&mut rng)).collect(), shape);
            assert_batch_gradient_is_sum(conv, &x, &mut rng);
        }
    }

    #[test]
    fn test_rejects_wrong_input() {
        let conv = layer([4, 4, 1], 1, [2, 2], [1, 1], Padding::Valid);
        assert!(conv.forward(&Tensor::zeros(vec![1, 4, 4, 2])).is_err());
        assert!(conv.forward(&Tensor::zeros(vec![4, 16])).is_err());
    }

    #[test]
    fn test_kernel_larger_than_input() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = Conv2D::new([2, 2, 1], 1, [3, 3], [1, 1], Padding::Valid, None, &mut rng);
        assert!(matches!(err, Err(EngineError::ShapeMismatch(_))));
    }
}
