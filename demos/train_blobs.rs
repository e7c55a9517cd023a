//! Train a dense classifier on synthetic Gaussian blobs
//!
//! This demo shows:
//! - Building a multi-layer dense model with the fluent builder
//! - Holding out a validation split
//! - Training with per-epoch progress and an optional CSV log
//! - Saving the trained model to a checkpoint
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example train_blobs
//! cargo run --release --example train_blobs -- --classes 4 --epochs 40 --optimizer sgd --lr 0.1
//! cargo run --release --example train_blobs -- --log blobs.csv --checkpoint blobs.ckpt
//! ```

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use sequent::{
    accuracy, one_hot, train_val_split, Activation, Checkpoint, Loss, ModelBuilder, Optimizer,
    Tensor, TrainingConfig,
};
use std::f64::consts::TAU;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "train_blobs", about = "Dense classifier on synthetic 2D blobs")]
struct Args {
    /// Number of blobs (classes)
    #[arg(long, default_value_t = 3)]
    classes: usize,

    /// Points per class
    #[arg(long, default_value_t = 200)]
    points: usize,

    /// Standard deviation of each blob
    #[arg(long, default_value_t = 0.35)]
    spread: f64,

    #[arg(long, default_value_t = 25)]
    epochs: usize,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// "adam" or "sgd"
    #[arg(long, default_value = "adam")]
    optimizer: String,

    #[arg(long, default_value_t = 0.01)]
    lr: f64,

    /// Hidden layer width
    #[arg(long, default_value_t = 16)]
    hidden: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Write per-batch metrics to this CSV file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Save the trained model here
    #[arg(long)]
    checkpoint: Option<PathBuf>,
}

/// Blobs centred on a circle, rows interleaved by class
fn make_blobs(
    classes: usize,
    points: usize,
    spread: f64,
    rng: &mut StdRng,
) -> Result<(Tensor, Vec<usize>), Box<dyn std::error::Error>> {
    let noise = Normal::new(0.0, spread)?;
    let mut rows = Vec::with_capacity(classes * points);
    let mut labels = Vec::with_capacity(classes * points);
    for _ in 0..points {
        for class in 0..classes {
            let angle = TAU * class as f64 / classes as f64;
            rows.push(vec![
                2.0 * angle.cos() + noise.sample(rng),
                2.0 * angle.sin() + noise.sample(rng),
            ]);
            labels.push(class);
        }
    }
    Ok((Tensor::from_rows(&rows)?, labels))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("\n{}", "=".repeat(70));
    println!("  Blob Classification");
    println!("{}", "=".repeat(70));

    let mut rng = StdRng::seed_from_u64(args.seed);
    let (x, labels) = make_blobs(args.classes, args.points, args.spread, &mut rng)?;
    let y = one_hot(&labels, args.classes)?;
    let ((train_x, train_y), (val_x, val_y)) = train_val_split(&x, &y, 0.2)?;
    println!(
        "\nData: {} training rows, {} validation rows, {} classes",
        train_x.shape[0], val_x.shape[0], args.classes
    );

    let optimizer = match args.optimizer.as_str() {
        "sgd" => Optimizer::sgd(args.lr),
        "adam" => Optimizer::adam(args.lr),
        other => return Err(format!("unknown optimizer '{}'", other).into()),
    };

    let mut model = ModelBuilder::new()
        .add_input(&[2])
        .add_dense(args.hidden, Some(Activation::ReLU))
        .add_dense(args.hidden, Some(Activation::ReLU))
        .add_dense(args.classes, Some(Activation::Softmax))
        .set_optimizer(optimizer)
        .set_loss(Loss::CategoricalCrossEntropy)
        .seed(args.seed)
        .build()?;
    println!("\n{}", model.summary());

    let config = TrainingConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        log_path: args.log.clone(),
        ..TrainingConfig::default()
    };
    let history = model.fit_with_config(&train_x, &train_y, &config)?;

    let train_acc = accuracy(&model.predict(&train_x)?, &train_y)?;
    let val_acc = accuracy(&model.predict(&val_x)?, &val_y)?;
    println!("\nResults:");
    println!(
        "  Loss: {:.4} -> {:.4}",
        history.first_loss().unwrap_or(f64::NAN),
        history.final_loss().unwrap_or(f64::NAN)
    );
    println!("  Validation loss: {:.4}", model.evaluate(&val_x, &val_y)?);
    println!("  Train accuracy: {:.1}%", train_acc * 100.0);
    println!("  Validation accuracy: {:.1}%", val_acc * 100.0);

    if let Some(path) = &args.checkpoint {
        Checkpoint::save(&model, path)?;
    }

    Ok(())
}
