//! Training Logger and Utilities
//!
//! Tracks training metrics over time and provides the small helpers that sit
//! around a training run.
//!
//! ## Components
//!
//! - **TrainingLogger**: Appends one CSV row per batch, flushed immediately
//! - **train_val_split**: Holds out the last rows of a dataset for validation
//! - **accuracy**: Fraction of rows whose predicted class matches the target
//!
//! ## CSV Format
//!
//! - `epoch`: Epoch number, starting at 1
//! - `batch`: Batch number within the epoch, starting at 1
//! - `elapsed_seconds`: Time since the logger was created
//! - `learning_rate`: Optimizer learning rate
//! - `batch_loss`: Mean loss over the batch
//! - `running_loss`: Mean of the batch losses so far this epoch

use crate::error::{EngineError, Result};
use crate::tensor::Tensor;
use crate::train::Batch;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// CSV logger for per-batch training metrics
pub struct TrainingLogger {
    log_file: BufWriter<File>,
    start_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file and write its header
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let mut log_file = BufWriter::new(File::create(log_path)?);
        writeln!(
            log_file,
            "epoch,batch,elapsed_seconds,learning_rate,batch_loss,running_loss"
        )?;
        log_file.flush()?;

        Ok(Self {
            log_file,
            start_time: Instant::now(),
        })
    }

    /// Seconds since the logger was created
    pub fn elapsed(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Append one batch's metrics
    pub fn log(
        &mut self,
        epoch: usize,
        batch: usize,
        learning_rate: f64,
        batch_loss: f64,
        running_loss: f64,
    ) -> Result<()> {
        writeln!(
            self.log_file,
            "{},{},{:.3},{:.6},{:.6},{:.6}",
            epoch,
            batch,
            self.elapsed(),
            learning_rate,
            batch_loss,
            running_loss
        )?;

        // Keep the file current if training aborts
        self.log_file.flush()?;
        Ok(())
    }
}

/// Split rows into training and validation sets
///
/// The validation rows are taken from the end.
///
/// # Example
///
/// ```rust
/// # use sequent::{train_val_split, Tensor};
/// let x = Tensor::zeros(vec![10, 3]);
/// let y = Tensor::zeros(vec![10, 1]);
/// let ((train_x, _), (val_x, _)) = train_val_split(&x, &y, 0.2)?;
/// assert_eq!(train_x.shape[0], 8);
/// assert_eq!(val_x.shape[0], 2);
/// # Ok::<(), sequent::EngineError>(())
/// ```
pub fn train_val_split(x: &Tensor, y: &Tensor, val_fraction: f64) -> Result<(Batch, Batch)> {
    if !(0.0..1.0).contains(&val_fraction) {
        return Err(EngineError::InvalidConfiguration(format!(
            "validation fraction must be in [0, 1), got {}",
            val_fraction
        )));
    }
    let rows = x.batch_size();
    if y.batch_size() != rows {
        return Err(EngineError::shape("target rows", rows, y.batch_size()));
    }
    let val_rows = ((rows as f64) * val_fraction).round() as usize;
    let split_idx = rows - val_rows.min(rows);
    Ok((
        (x.slice_rows(0, split_idx)?, y.slice_rows(0, split_idx)?),
        (x.slice_rows(split_idx, rows)?, y.slice_rows(split_idx, rows)?),
    ))
}

/// Fraction of rows where the prediction picks the target's class
///
/// Multi-column targets compare argmax indices. Single-column targets are
/// treated as binary labels with a 0.5 threshold.
pub fn accuracy(predictions: &Tensor, targets: &Tensor) -> Result<f64> {
    if predictions.shape != targets.shape || predictions.ndim() != 2 {
        return Err(EngineError::shape(
            "accuracy targets",
            &predictions.shape,
            &targets.shape,
        ));
    }
    let rows = predictions.shape[0];
    if rows == 0 {
        return Ok(0.0);
    }

    let correct = if predictions.shape[1] == 1 {
        predictions
            .data
            .iter()
            .zip(&targets.data)
            .filter(|&(&p, &t)| (p >= 0.5) == (t >= 0.5))
            .count()
    } else {
        predictions
            .argmax_rows()?
            .iter()
            .zip(targets.argmax_rows()?)
            .filter(|&(&p, t)| p == t)
            .count()
    };
    Ok(correct as f64 / rows as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_logger_writes_header_and_rows() {
        let path = std::env::temp_dir().join(format!(
            "sequent_logger_{}.csv",
            std::process::id()
        ));
        {
            let mut logger = TrainingLogger::new(&path).unwrap();
            logger.log(1, 1, 0.001, 0.5, 0.5).unwrap();
            logger.log(1, 2, 0.001, 0.3, 0.4).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("epoch,batch"));
        assert!(lines[2].starts_with("1,2,"));
        assert!(lines[2].ends_with("0.300000,0.400000"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_split_takes_tail_for_validation() {
        let x = Tensor::new((0..5).map(|v| v as f64).collect(), vec![5, 1]);
        let ((tx, ty), (vx, vy)) = train_val_split(&x, &x, 0.4).unwrap();
        assert_eq!(tx.data, vec![0.0, 1.0, 2.0]);
        assert_eq!(vx.data, vec![3.0, 4.0]);
        assert_eq!(ty.shape, vec![3, 1]);
        assert_eq!(vy.shape, vec![2, 1]);
        assert!(train_val_split(&x, &x, 1.0).is_err());
    }

    #[test]
    fn test_accuracy_multiclass_and_binary() {
        let p = Tensor::new(vec![0.9, 0.1, 0.2, 0.8, 0.6, 0.4], vec![3, 2]);
        let t = Tensor::new(vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0], vec![3, 2]);
        assert_relative_eq!(accuracy(&p, &t).unwrap(), 2.0 / 3.0);

        let p = Tensor::new(vec![0.7, 0.2], vec![2, 1]);
        let t = Tensor::new(vec![1.0, 1.0], vec![2, 1]);
        assert_relative_eq!(accuracy(&p, &t).unwrap(), 0.5);
    }
}
