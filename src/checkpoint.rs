//! Model Checkpointing
//!
//! Saves a model's architecture and trained parameters to one binary file and
//! restores them later, either into a freshly built model of the same
//! architecture or by rebuilding the model from the file alone.
//!
//! ## File Format
//!
//! ```text
//! "SEQUENT_CKPT"                  magic
//! u8                              version (1)
//! u32 + JSON                      header: layer specs, loss, optimizer
//! u32                             number of tensors
//! per tensor:
//!   u32 rank, u32 dims..., u32 len, f64 values...
//! ```
//!
//! All integers and floats are little-endian. Tensors are written as
//! weights then biases for every trainable layer, in layer order.
//! Optimizer moment buffers are not saved; a restored model starts them
//! fresh.

use crate::error::{EngineError, Result};
use crate::loss::Loss;
use crate::model::{LayerSpec, ModelBuilder, Sequential};
use crate::optimizer::Optimizer;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 12] = b"SEQUENT_CKPT";
const VERSION: u8 = 1;

/// JSON header describing how to rebuild the model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub specs: Vec<LayerSpec>,
    pub loss: Loss,
    pub optimizer: Option<Optimizer>,
}

pub struct Checkpoint;

fn invalid_data(msg: impl Into<String>) -> EngineError {
    EngineError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        msg.into(),
    ))
}

fn write_u32(w: &mut impl Write, value: usize) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| invalid_data(format!("{} does not fit in a u32 field", value)))?;
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn write_tensor(w: &mut impl Write, tensor: &Tensor) -> Result<()> {
    write_u32(w, tensor.shape.len())?;
    for &dim in &tensor.shape {
        write_u32(w, dim)?;
    }
    write_u32(w, tensor.data.len())?;
    for &val in &tensor.data {
        w.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

/// Reads a checkpoint while tracking how many bytes the file has left, so
/// lengths read from the file are checked before anything is allocated
struct CheckpointReader<R> {
    inner: R,
    remaining: u64,
}

impl CheckpointReader<BufReader<File>> {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let remaining = file.metadata()?.len();
        Ok(Self {
            inner: BufReader::new(file),
            remaining,
        })
    }
}

impl<R: Read> CheckpointReader<R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        self.remaining = self.remaining.saturating_sub(buf.len() as u64);
        Ok(())
    }

    fn read_u32(&mut self) -> Result<usize> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes) as usize)
    }

    /// Fail unless `count` items of `width` bytes can still be in the file
    fn ensure_available(&self, count: usize, width: u64, what: &str) -> Result<()> {
        let needed = (count as u64).saturating_mul(width);
        if needed > self.remaining {
            return Err(invalid_data(format!(
                "{} claims {} bytes but only {} remain",
                what, needed, self.remaining
            )));
        }
        Ok(())
    }

    fn read_tensor(&mut self) -> Result<Tensor> {
        let rank = self.read_u32()?;
        self.ensure_available(rank, 4, "tensor rank")?;
        let shape = (0..rank)
            .map(|_| self.read_u32())
            .collect::<Result<Vec<_>>>()?;
        let len = self.read_u32()?;
        self.ensure_available(len, 8, "tensor data")?;
        let mut data = Vec::with_capacity(len);
        let mut bytes = [0u8; 8];
        for _ in 0..len {
            self.read_exact(&mut bytes)?;
            data.push(f64::from_le_bytes(bytes));
        }
        Tensor::from_vec(data, shape)
    }

    fn read_header(&mut self) -> Result<CheckpointHeader> {
        let mut magic = [0u8; 12];
        self.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid_data("not a checkpoint file"));
        }
        let mut version = [0u8; 1];
        self.read_exact(&mut version)?;
        if version[0] != VERSION {
            return Err(invalid_data(format!(
                "unsupported checkpoint version {}",
                version[0]
            )));
        }

        let header_len = self.read_u32()?;
        self.ensure_available(header_len, 1, "header")?;
        let mut header_bytes = vec![0u8; header_len];
        self.read_exact(&mut header_bytes)?;
        Ok(serde_json::from_slice(&header_bytes)?)
    }
}

impl Checkpoint {
    /// Write the model's architecture and parameters to `path`
    pub fn save(model: &Sequential, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        println!("Saving checkpoint to {}...", path.display());

        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(MAGIC)?;
        file.write_all(&[VERSION])?;

        let header = CheckpointHeader {
            specs: model.specs().to_vec(),
            loss: model.loss(),
            optimizer: model.optimizers().first().cloned(),
        };
        let header_json = serde_json::to_string(&header)?;
        write_u32(&mut file, header_json.len())?;
        file.write_all(header_json.as_bytes())?;

        let params: Vec<&Tensor> = model
            .layers()
            .iter()
            .filter_map(|layer| layer.parameters())
            .flat_map(|(w, b)| [w, b])
            .collect();
        write_u32(&mut file, params.len())?;
        for tensor in params {
            write_tensor(&mut file, tensor)?;
        }
        file.flush()?;

        println!(
            "Checkpoint saved: {} layers, {} parameters",
            model.layers().len(),
            model.parameter_count()
        );
        Ok(())
    }

    /// Copy the parameters stored at `path` into an already built model
    ///
    /// The model must have been built from the same layer specs.
    pub fn load_into(model: &mut Sequential, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        println!("Loading checkpoint from {}...", path.display());

        let mut file = CheckpointReader::open(path)?;
        let header = file.read_header()?;
        if header.specs != model.specs() {
            return Err(EngineError::ShapeMismatch(format!(
                "checkpoint architecture {:?} differs from model {:?}",
                header.specs,
                model.specs()
            )));
        }

        let count = file.read_u32()?;
        let trainable = model.layers().iter().filter(|l| l.is_trainable()).count();
        if count != 2 * trainable {
            return Err(EngineError::shape("checkpoint tensor count", 2 * trainable, count));
        }

        // Read everything before touching the model
        let tensors = (0..count)
            .map(|_| file.read_tensor())
            .collect::<Result<Vec<_>>>()?;
        let mut loaded = tensors.chunks_exact(2);
        let mut updates = Vec::with_capacity(trainable);
        for (index, layer) in model.layers().iter().enumerate() {
            if let Some((w, b)) = layer.parameters() {
                let pair = loaded
                    .next()
                    .ok_or_else(|| invalid_data("checkpoint ended early"))?;
                if pair[0].shape != w.shape || pair[1].shape != b.shape {
                    return Err(EngineError::ShapeMismatch(format!(
                        "{} layer {}: checkpoint has {:?}/{:?}, model has {:?}/{:?}",
                        layer.name(),
                        index,
                        pair[0].shape,
                        pair[1].shape,
                        w.shape,
                        b.shape
                    )));
                }
                updates.push((index, pair[0].clone(), pair[1].clone()));
            }
        }

        let layers = model.layers_mut();
        for (index, weights, biases) in updates {
            let params = layers[index].params_mut()?;
            *params.weights = weights;
            *params.biases = biases;
        }

        println!("Checkpoint loaded: {} tensors", count);
        Ok(())
    }

    /// Rebuild a model from the checkpoint alone
    ///
    /// Uses the saved optimizer settings when present, else `fallback`.
    pub fn load(path: impl AsRef<Path>, fallback: Optimizer) -> Result<Sequential> {
        let path = path.as_ref();
        let header = CheckpointReader::open(path)?.read_header()?;

        let builder = header.specs.into_iter().fold(ModelBuilder::new(), ModelBuilder::add);
        let mut model = builder
            .set_loss(header.loss)
            .set_optimizer(header.optimizer.unwrap_or(fallback))
            .seed(0)
            .build()?;
        Self::load_into(&mut model, path)?;
        Ok(model)
    }
}
