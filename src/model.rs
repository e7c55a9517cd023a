//! Sequential Model
//!
//! A model is an ordered list of layers, one optimizer per layer and one loss.
//! It is put together with [`ModelBuilder`] and, once built, can be trained
//! and queried but not extended.
//!
//! ## Architecture Overview
//!
//! ```text
//! Input [batch, features] or [batch, H, W, C]
//!     ↓
//! Conv2D / MaxPooling2D ...   (4D layers)
//!     ↓
//! Flatten                     (4D → 2D)
//!     ↓
//! Dense ...                   (2D layers)
//!     ↓
//! Output [batch, outputs]
//! ```
//!
//! ## Training Step
//!
//! ```text
//! forward (keep every layer's cache)
//!   → loss, accumulated into the epoch's running mean
//!   → loss gradient (fused with the final activation where exact)
//!   → backward through the layers in reverse, Input skipped
//!   → optional gradient clipping
//!   → optimizer.update(layer) for every trainable layer
//! ```
//!
//! Parameters only change once every gradient of the step has been computed,
//! so a failing step leaves the model as the previous step left it.
//!
//! ## Example
//!
//! ```rust
//! use sequent::{Activation, Loss, ModelBuilder, Optimizer, Tensor};
//!
//! let mut model = ModelBuilder::new()
//!     .add_input(&[2])
//!     .add_dense(8, Some(Activation::ReLU))
//!     .add_dense(2, Some(Activation::Softmax))
//!     .set_optimizer(Optimizer::adam(0.01))
//!     .set_loss(Loss::CategoricalCrossEntropy)
//!     .seed(7)
//!     .build()?;
//!
//! let x = Tensor::from_rows(&[vec![0.0, 0.0], vec![1.0, 1.0]])?;
//! let y = Tensor::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]])?;
//! model.fit_with_config(&x, &y, &sequent::TrainingConfig { verbose: false, ..sequent::TrainingConfig::new(5, 2) })?;
//! let probs = model.predict(&x)?;
//! assert_eq!(probs.shape, vec![2, 2]);
//! # Ok::<(), sequent::EngineError>(())
//! ```

use crate::error::{EngineError, Result};
use crate::gradients::clip_gradients;
use crate::layers::{
    Activation, Conv2D, Dense, Flatten, Input, Layer, LayerCache, MaxPooling2D, Padding, Upstream,
};
use crate::loss::Loss;
use crate::optimizer::Optimizer;
use crate::tensor::Tensor;
use crate::train::{Batches, TrainingConfig};
use crate::training_logger::TrainingLogger;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Rows per forward pass in [`Sequential::predict`]
pub const DEFAULT_PREDICT_BATCH: usize = 128;

/// Declarative description of one layer, resolved to a [`Layer`] at build
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerSpec {
    Input {
        shape: Vec<usize>,
    },
    Dense {
        neurons: usize,
        activation: Option<Activation>,
    },
    Conv2D {
        filters: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
        activation: Option<Activation>,
    },
    Flatten,
    MaxPooling2D {
        pool_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
    },
}

/// Fluent model configuration
///
/// Every call consumes the builder and returns it, so a configuration reads
/// as one chain ending in [`ModelBuilder::build`]. All validation happens in
/// `build`.
#[derive(Clone, Debug, Default)]
pub struct ModelBuilder {
    specs: Vec<LayerSpec>,
    optimizer: Option<Optimizer>,
    loss: Option<Loss>,
    seed: Option<u64>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append any layer description
    pub fn add(mut self, spec: LayerSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Declare the per-sample input shape: `[features]` or `[H, W, C]`
    pub fn add_input(self, shape: &[usize]) -> Self {
        self.add(LayerSpec::Input {
            shape: shape.to_vec(),
        })
    }

    /// Fully connected layer; its input width comes from the previous layer
    pub fn add_dense(self, neurons: usize, activation: Option<Activation>) -> Self {
        self.add(LayerSpec::Dense {
            neurons,
            activation,
        })
    }

    /// Convolution with stride 1
    pub fn add_conv2d(
        self,
        filters: usize,
        kernel_size: [usize; 2],
        padding: Padding,
        activation: Option<Activation>,
    ) -> Self {
        self.add_conv2d_strided(filters, kernel_size, [1, 1], padding, activation)
    }

    pub fn add_conv2d_strided(
        self,
        filters: usize,
        kernel_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
        activation: Option<Activation>,
    ) -> Self {
        self.add(LayerSpec::Conv2D {
            filters,
            kernel_size,
            strides,
            padding,
            activation,
        })
    }

    pub fn add_flatten(self) -> Self {
        self.add(LayerSpec::Flatten)
    }

    /// Max pooling with non-overlapping windows and "valid" padding
    pub fn add_max_pooling2d(self, pool_size: [usize; 2]) -> Self {
        self.add_max_pooling2d_with(pool_size, pool_size, Padding::Valid)
    }

    pub fn add_max_pooling2d_with(
        self,
        pool_size: [usize; 2],
        strides: [usize; 2],
        padding: Padding,
    ) -> Self {
        self.add(LayerSpec::MaxPooling2D {
            pool_size,
            strides,
            padding,
        })
    }

    /// Prototype cloned once per layer
    pub fn set_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn set_loss(mut self, loss: Loss) -> Self {
        self.loss = Some(loss);
        self
    }

    /// Seed weight initialization for reproducible models
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Resolve every layer against the shape flowing into it
    pub fn build(self) -> Result<Sequential> {
        let optimizer = self.optimizer.ok_or_else(|| {
            EngineError::InvalidConfiguration("no optimizer set".to_string())
        })?;
        optimizer.validate()?;
        let loss = self
            .loss
            .ok_or_else(|| EngineError::InvalidConfiguration("no loss function set".to_string()))?;

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut specs = self.specs.iter();
        let mut current = match specs.next() {
            Some(LayerSpec::Input { shape }) => shape.clone(),
            _ => {
                return Err(EngineError::InvalidConfiguration(
                    "a model must start with an input layer".to_string(),
                ))
            }
        };
        let mut layers = vec![Layer::Input(Input::new(current.clone())?)];

        for spec in specs {
            let layer = build_layer(spec, &current, &mut rng)?;
            current = layer.output_shape()?;
            layers.push(layer);
        }

        if layers.len() < 2 {
            return Err(EngineError::InvalidConfiguration(
                "a model needs at least one layer after the input".to_string(),
            ));
        }
        if current.len() != 1 {
            return Err(EngineError::InvalidConfiguration(format!(
                "model output must be flat [outputs], got per-sample shape {:?}; add a flatten layer",
                current
            )));
        }

        let optimizers = layers
            .iter()
            .map(|layer| {
                let mut opt = optimizer.clone();
                opt.initialize(layer);
                opt
            })
            .collect();

        Ok(Sequential {
            layers,
            optimizers,
            loss,
            specs: self.specs,
            batch_losses: Vec::new(),
        })
    }
}

fn require_spatial(shape: &[usize], what: &str) -> Result<[usize; 3]> {
    match *shape {
        [h, w, c] => Ok([h, w, c]),
        _ => Err(EngineError::InvalidConfiguration(format!(
            "{} needs a [height, width, channels] input, got {:?}",
            what, shape
        ))),
    }
}

fn build_layer(spec: &LayerSpec, input: &[usize], rng: &mut StdRng) -> Result<Layer> {
    Ok(match spec {
        LayerSpec::Input { .. } => {
            return Err(EngineError::InvalidConfiguration(
                "only the first layer may be an input layer".to_string(),
            ))
        }
        LayerSpec::Dense {
            neurons,
            activation,
        } => match *input {
            [width] => Layer::Dense(Dense::new(width, *neurons, *activation, rng)?),
            _ => {
                return Err(EngineError::InvalidConfiguration(format!(
                    "dense layer needs a flat input, got {:?}; add a flatten layer first",
                    input
                )))
            }
        },
        LayerSpec::Conv2D {
            filters,
            kernel_size,
            strides,
            padding,
            activation,
        } => {
            if *activation == Some(Activation::Softmax) {
                return Err(EngineError::InvalidConfiguration(
                    "softmax is only supported on dense layers".to_string(),
                ));
            }
            Layer::Conv2D(Conv2D::new(
                require_spatial(input, "conv2d")?,
                *filters,
                *kernel_size,
                *strides,
                *padding,
                *activation,
                rng,
            )?)
        }
        LayerSpec::Flatten => Layer::Flatten(Flatten::new(input.iter().product())),
        LayerSpec::MaxPooling2D {
            pool_size,
            strides,
            padding,
        } => Layer::MaxPooling2D(MaxPooling2D::new(
            require_spatial(input, "max_pooling2d")?,
            *pool_size,
            *strides,
            *padding,
        )?),
    })
}

/// Mean loss of every epoch run by `fit`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub epoch_losses: Vec<f64>,
}

impl History {
    pub fn first_loss(&self) -> Option<f64> {
        self.epoch_losses.first().copied()
    }

    pub fn final_loss(&self) -> Option<f64> {
        self.epoch_losses.last().copied()
    }
}

/// A built model
#[derive(Clone, Debug)]
pub struct Sequential {
    layers: Vec<Layer>,
    /// Index-aligned with `layers`
    optimizers: Vec<Optimizer>,
    loss: Loss,
    specs: Vec<LayerSpec>,
    /// Losses of the batches seen so far in the current epoch
    batch_losses: Vec<f64>,
}

impl Sequential {
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn optimizers(&self) -> &[Optimizer] {
        &self.optimizers
    }

    pub fn loss(&self) -> Loss {
        self.loss
    }

    /// The layer descriptions the model was built from
    pub fn specs(&self) -> &[LayerSpec] {
        &self.specs
    }

    pub fn input_shape(&self) -> &[usize] {
        match self.layers.first() {
            Some(Layer::Input(input)) => &input.shape,
            _ => &[],
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(Layer::parameter_count).sum()
    }

    /// Mean of the batch losses accumulated since the epoch started
    pub fn running_loss(&self) -> f64 {
        if self.batch_losses.is_empty() {
            return 0.0;
        }
        self.batch_losses.iter().sum::<f64>() / self.batch_losses.len() as f64
    }

    /// Run every layer in order, keeping the caches for `backward`
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Vec<LayerCache>)> {
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut current = x.clone();
        for layer in &self.layers {
            let (next, cache) = layer.forward(&current)?;
            caches.push(cache);
            current = next;
        }
        Ok((current, caches))
    }

    /// Run every layer in order without keeping backward caches
    pub fn infer(&self, x: &Tensor) -> Result<Tensor> {
        let mut current = x.clone();
        for layer in &self.layers {
            current = layer.infer(&current)?;
        }
        Ok(current)
    }

    /// Gradient of the loss w.r.t. the output, or w.r.t. the final
    /// pre-activation when the loss fuses with the final activation
    pub fn loss_gradient(&self, output: &Tensor, targets: &Tensor) -> Result<(Tensor, bool)> {
        let last_activation = self.layers.last().and_then(Layer::activation);
        match self.loss.fused_backward(last_activation, output, targets)? {
            Some(grad) => Ok((grad, true)),
            None => Ok((self.loss.backward(output, targets)?, false)),
        }
    }

    /// Thread a gradient back through every layer in reverse, skipping Input
    ///
    /// Stores `dweights`/`dbiases` on the trainable layers and returns the
    /// gradient w.r.t. the first layer after Input.
    pub fn backward(&mut self, grad: Upstream<'_>, caches: &[LayerCache]) -> Result<Tensor> {
        if caches.len() != self.layers.len() {
            return Err(EngineError::InvalidConfiguration(format!(
                "backward needs one cache per layer: {} layers, {} caches",
                self.layers.len(),
                caches.len()
            )));
        }

        let mut dinputs: Option<Tensor> = None;
        for (layer, cache) in self.layers.iter_mut().zip(caches).rev() {
            if let Layer::Input(_) = layer {
                continue;
            }
            let upstream = match &dinputs {
                Some(d) => Upstream::Output(d),
                None => grad,
            };
            let dx = layer.backward(upstream, cache)?;
            dinputs = Some(dx);
        }

        dinputs.ok_or_else(|| {
            EngineError::InvalidConfiguration("model has no layers to backpropagate".to_string())
        })
    }

    /// One minibatch: forward, loss, backward, update. Returns the batch loss.
    pub fn train_step(&mut self, x: &Tensor, y: &Tensor) -> Result<f64> {
        self.train_step_clipped(x, y, None)
    }

    fn train_step_clipped(&mut self, x: &Tensor, y: &Tensor, clip: Option<f64>) -> Result<f64> {
        let (output, caches) = self.forward(x)?;
        let batch_loss = self.loss.calculate(&output, y)?;

        let (grad, fused) = self.loss_gradient(&output, y)?;
        let upstream = if fused {
            Upstream::PreActivation(&grad)
        } else {
            Upstream::Output(&grad)
        };
        self.backward(upstream, &caches)?;

        if let Some(max_norm) = clip {
            clip_gradients(&mut self.layers, max_norm);
        }

        for (layer, optimizer) in self.layers.iter_mut().zip(&mut self.optimizers) {
            if layer.is_trainable() {
                optimizer.update(layer)?;
            }
        }

        self.batch_losses.push(batch_loss);
        Ok(batch_loss)
    }

    /// Train for `epochs` passes in minibatches of `batch_size`
    pub fn fit(
        &mut self,
        x: &Tensor,
        y: &Tensor,
        epochs: usize,
        batch_size: usize,
    ) -> Result<History> {
        self.fit_with_config(x, y, &TrainingConfig::new(epochs, batch_size))
    }

    pub fn fit_with_config(
        &mut self,
        x: &Tensor,
        y: &Tensor,
        config: &TrainingConfig,
    ) -> Result<History> {
        config.validate()?;
        if x.batch_size() == 0 {
            return Err(EngineError::InvalidConfiguration(
                "cannot fit on an empty dataset".to_string(),
            ));
        }
        let mut batches = Batches::new(x, y, config.batch_size)?;
        let num_batches = batches.num_batches();

        let mut logger = match &config.log_path {
            Some(path) => Some(TrainingLogger::new(path)?),
            None => None,
        };
        let learning_rate = self.learning_rate();

        if config.verbose {
            println!(
                "Training {} parameters for {} epochs ({} batches of up to {})",
                self.parameter_count(),
                config.epochs,
                num_batches,
                config.batch_size
            );
        }

        let mut history = History::default();
        let start = std::time::Instant::now();

        for epoch in 1..=config.epochs {
            self.batch_losses.clear();
            batches.reset();

            for (i, batch) in batches.by_ref().enumerate() {
                let (bx, by) = batch?;
                let batch_loss = self.train_step_clipped(&bx, &by, config.clip_grad_norm)?;
                let running = self.running_loss();

                if let Some(logger) = logger.as_mut() {
                    logger.log(epoch, i + 1, learning_rate, batch_loss, running)?;
                }
                if config.verbose && config.print_every > 0 && (i + 1) % config.print_every == 0 {
                    println!(
                        "Epoch {:3} | Batch {:4}/{} | Loss: {:.4} | Running: {:.4}",
                        epoch,
                        i + 1,
                        num_batches,
                        batch_loss,
                        running
                    );
                }
            }

            let epoch_loss = self.running_loss();
            history.epoch_losses.push(epoch_loss);
            if config.verbose {
                println!(
                    "Epoch {:3}/{} | Loss: {:.6} | Time: {:6.1}s",
                    epoch,
                    config.epochs,
                    epoch_loss,
                    start.elapsed().as_secs_f32()
                );
            }
        }

        Ok(history)
    }

    /// Learning rate of the optimizers
    pub fn learning_rate(&self) -> f64 {
        self.optimizers
            .first()
            .map(Optimizer::learning_rate)
            .unwrap_or(0.0)
    }

    /// Change the learning rate of every layer's optimizer
    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        for optimizer in &mut self.optimizers {
            optimizer.set_learning_rate(learning_rate);
        }
    }

    /// Outputs for every row of `x`
    pub fn predict(&self, x: &Tensor) -> Result<Tensor> {
        self.predict_with_batch_size(x, DEFAULT_PREDICT_BATCH)
    }

    /// Outputs for every row of `x`, `batch_size` rows per forward pass
    ///
    /// The result equals a single full-batch forward pass.
    pub fn predict_with_batch_size(&self, x: &Tensor, batch_size: usize) -> Result<Tensor> {
        if batch_size == 0 {
            return Err(EngineError::InvalidConfiguration(
                "batch size must be positive".to_string(),
            ));
        }
        let rows = x.batch_size();
        if rows == 0 {
            return Err(EngineError::InvalidConfiguration(
                "cannot predict on an empty batch".to_string(),
            ));
        }

        let mut outputs = Vec::with_capacity(rows.div_ceil(batch_size));
        for start in (0..rows).step_by(batch_size) {
            let end = (start + batch_size).min(rows);
            outputs.push(self.infer(&x.slice_rows(start, end)?)?);
        }
        Tensor::concat_rows(&outputs)
    }

    /// Mean loss over the whole dataset
    pub fn evaluate(&self, x: &Tensor, y: &Tensor) -> Result<f64> {
        let predictions = self.predict(x)?;
        self.loss.calculate(&predictions, y)
    }

    /// Table of layers, output shapes and parameter counts
    pub fn summary(&self) -> String {
        let rule = "-".repeat(62);
        let mut out = format!(
            "{}\n{:<24}{:<24}{:>14}\n{}\n",
            rule, "Layer (type)", "Output Shape", "Param #", rule
        );
        for layer in &self.layers {
            let kind = match layer.activation() {
                Some(act) => format!("{} ({})", layer.name(), act.name()),
                None => layer.name().to_string(),
            };
            let shape = match layer.output_shape() {
                Ok(shape) => format!("(None, {})", join_dims(&shape)),
                Err(_) => "?".to_string(),
            };
            out.push_str(&format!(
                "{:<24}{:<24}{:>14}\n",
                kind,
                shape,
                layer.parameter_count()
            ));
        }
        out.push_str(&format!(
            "{}\nTotal params: {}\nOptimizer: {} (lr {})\nLoss: {}\n",
            rule,
            self.parameter_count(),
            self.optimizers.first().map(Optimizer::name).unwrap_or("none"),
            self.learning_rate(),
            self.loss.name()
        ));
        out
    }
}

fn join_dims(dims: &[usize]) -> String {
    dims.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
