//! Sequent: A Small Neural Network Engine
//!
//! Sequential models built from a fixed catalogue of layers, each with a
//! hand-written backward pass. No computation graph, no autodiff: every
//! layer knows its own calculus.
//!
//! # Modules
//!
//! - [`tensor`] - Dense `f64` tensors with broadcasting and NHWC helpers
//! - [`layers`] - Input, Dense, Conv2D, Flatten, MaxPooling2D and activations
//! - [`loss`] - Mean squared error and cross-entropy losses
//! - [`optimizer`] - SGD and Adam
//! - [`model`] - The builder and the trainable [`Sequential`] model
//! - [`gradients`] - Gradient norm and clipping
//! - [`train`] - Minibatching, one-hot encoding and training configuration
//! - [`training_logger`] - CSV metrics, validation splits and accuracy
//! - [`checkpoint`] - Saving and restoring trained models
//!
//! # Example
//!
//! ```rust
//! use sequent::{Activation, Loss, ModelBuilder, Optimizer, Padding, Tensor};
//!
//! let model = ModelBuilder::new()
//!     .add_input(&[8, 8, 1])
//!     .add_conv2d(4, [3, 3], Padding::Same, Some(Activation::ReLU))
//!     .add_max_pooling2d([2, 2])
//!     .add_flatten()
//!     .add_dense(3, Some(Activation::Softmax))
//!     .set_optimizer(Optimizer::adam(0.001))
//!     .set_loss(Loss::CategoricalCrossEntropy)
//!     .build()?;
//!
//! println!("{}", model.summary());
//! let probs = model.predict(&Tensor::zeros(vec![2, 8, 8, 1]))?;
//! assert_eq!(probs.shape, vec![2, 3]);
//! # Ok::<(), sequent::EngineError>(())
//! ```

pub mod checkpoint;
pub mod error;
pub mod gradients;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod tensor;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use checkpoint::Checkpoint;
pub use error::{EngineError, Result};
pub use gradients::{clip_gradients, compute_grad_norm};
pub use layers::{Activation, Layer, LayerCache, Padding, Upstream};
pub use loss::Loss;
pub use model::{History, LayerSpec, ModelBuilder, Sequential};
pub use optimizer::Optimizer;
pub use tensor::Tensor;
pub use train::{one_hot, Batches, TrainingConfig};
pub use training_logger::{accuracy, train_val_split, TrainingLogger};
