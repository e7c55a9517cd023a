//! Training Data and Configuration
//!
//! Minibatch iteration over in-memory tensors, one-hot target encoding, and
//! the [`TrainingConfig`] that drives [`Sequential::fit_with_config`].
//!
//! ## How Batches Are Cut
//!
//! Rows are taken in order, in contiguous blocks of `batch_size`. The final
//! batch holds whatever is left:
//!
//! ```text
//! Rows: 10, batch size: 4
//!
//! Batch 1: rows 0..4
//! Batch 2: rows 4..8
//! Batch 3: rows 8..10
//! ```
//!
//! ## Example
//!
//! ```rust
//! # use sequent::{Batches, Tensor};
//! let x = Tensor::zeros(vec![10, 3]);
//! let y = Tensor::zeros(vec![10, 2]);
//!
//! let sizes: Vec<usize> = Batches::new(&x, &y, 4)?
//!     .map(|batch| batch.map(|(bx, _)| bx.shape[0]))
//!     .collect::<Result<_, _>>()?;
//! assert_eq!(sizes, vec![4, 4, 2]);
//! # Ok::<(), sequent::EngineError>(())
//! ```
//!
//! [`Sequential::fit_with_config`]: crate::model::Sequential::fit_with_config

use crate::error::{EngineError, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A batch of inputs and matching targets
pub type Batch = (Tensor, Tensor);

/// Iterator over contiguous minibatches of `(x, y)` rows
pub struct Batches<'a> {
    x: &'a Tensor,
    y: &'a Tensor,
    batch_size: usize,
    position: usize,
}

impl<'a> Batches<'a> {
    pub fn new(x: &'a Tensor, y: &'a Tensor, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(EngineError::InvalidConfiguration(
                "batch size must be positive".to_string(),
            ));
        }
        if x.batch_size() != y.batch_size() {
            return Err(EngineError::shape(
                "target rows",
                x.batch_size(),
                y.batch_size(),
            ));
        }
        Ok(Self {
            x,
            y,
            batch_size,
            position: 0,
        })
    }

    /// Number of batches in one pass
    pub fn num_batches(&self) -> usize {
        self.x.batch_size().div_ceil(self.batch_size)
    }

    /// Start over from the first row
    pub fn reset(&mut self) {
        self.position = 0;
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let rows = self.x.batch_size();
        if self.position >= rows {
            return None;
        }
        let start = self.position;
        let end = (start + self.batch_size).min(rows);
        self.position = end;
        Some(
            self.x
                .slice_rows(start, end)
                .and_then(|bx| Ok((bx, self.y.slice_rows(start, end)?))),
        )
    }
}

/// One-hot encode class labels into a `[labels, classes]` tensor
pub fn one_hot(labels: &[usize], classes: usize) -> Result<Tensor> {
    let mut out = Tensor::zeros(vec![labels.len(), classes]);
    for (i, &label) in labels.iter().enumerate() {
        if label >= classes {
            return Err(EngineError::InvalidConfiguration(format!(
                "label {} out of range for {} classes",
                label, classes
            )));
        }
        out.data[i * classes + label] = 1.0;
    }
    Ok(out)
}

/// Training configuration
///
/// # Common Configurations
///
/// - **Default**: 10 epochs of 32 rows, an epoch summary each epoch
/// - **Quick**: Few epochs, silent; for tests and smoke runs
/// - **Thorough**: Longer runs with batch-level progress and clipping
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of passes through the dataset
    pub epochs: usize,
    /// Number of rows per batch
    pub batch_size: usize,
    /// Print the running loss every N batches (0 = epoch summaries only)
    pub print_every: usize,
    /// Console progress at all
    pub verbose: bool,
    /// Clip the joint gradient norm to this value before each update
    pub clip_grad_norm: Option<f64>,
    /// Write a CSV row per batch to this file
    pub log_path: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            print_every: 0,
            verbose: true,
            clip_grad_norm: None,
            log_path: None,
        }
    }
}

impl TrainingConfig {
    /// Configuration used by `Sequential::fit(x, y, epochs, batch_size)`
    pub fn new(epochs: usize, batch_size: usize) -> Self {
        Self {
            epochs,
            batch_size,
            ..Self::default()
        }
    }

    /// A few silent epochs on small batches
    pub fn quick() -> Self {
        Self {
            epochs: 5,
            batch_size: 8,
            verbose: false,
            ..Self::default()
        }
    }

    /// Longer runs with batch-level progress and gradient clipping
    pub fn thorough() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            print_every: 10,
            clip_grad_norm: Some(5.0),
            ..Self::default()
        }
    }

    /// Read a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EngineError::InvalidConfiguration(
                "batch size must be positive".to_string(),
            ));
        }
        if let Some(max_norm) = self.clip_grad_norm {
            if max_norm.is_nan() || max_norm <= 0.0 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "gradient clip norm must be positive, got {}",
                    max_norm
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_batch_is_smaller() {
        let x = Tensor::new((0..20).map(|v| v as f64).collect(), vec![10, 2]);
        let y = Tensor::zeros(vec![10, 1]);
        let batches = Batches::new(&x, &y, 4).unwrap();
        assert_eq!(batches.num_batches(), 3);

        let collected: Vec<Batch> = batches.collect::<Result<_>>().unwrap();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[2].0.shape, vec![2, 2]);
        assert_eq!(collected[2].0.data, vec![16.0, 17.0, 18.0, 19.0]);
    }

    #[test]
    fn test_batches_reject_row_mismatch() {
        let x = Tensor::zeros(vec![3, 2]);
        let y = Tensor::zeros(vec![4, 1]);
        assert!(matches!(
            Batches::new(&x, &y, 2),
            Err(EngineError::ShapeMismatch(_))
        ));
        assert!(Batches::new(&x, &x, 0).is_err());
    }

    #[test]
    fn test_batches_over_image_volumes() {
        let x = Tensor::zeros(vec![5, 2, 2, 1]);
        let y = Tensor::zeros(vec![5, 3]);
        let shapes: Vec<Vec<usize>> = Batches::new(&x, &y, 2)
            .unwrap()
            .map(|b| b.unwrap().0.shape)
            .collect();
        assert_eq!(shapes, vec![vec![2, 2, 2, 1], vec![2, 2, 2, 1], vec![1, 2, 2, 1]]);
    }

    #[test]
    fn test_one_hot() {
        let t = one_hot(&[2, 0], 3).unwrap();
        assert_eq!(t.data, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        assert!(one_hot(&[3], 3).is_err());
    }

    #[test]
    fn test_config_json_roundtrip_and_validation() {
        let config = TrainingConfig::thorough();
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let bad = TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
