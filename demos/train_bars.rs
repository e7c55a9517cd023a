//! Train a small CNN to tell vertical bars from horizontal ones
//!
//! This demo shows:
//! - A Conv2D → MaxPooling2D → Flatten → Dense pipeline on NHWC images
//! - Loading training settings from a JSON file or presets
//! - Gradient clipping and batch-level progress
//! - Restoring a saved model and checking it predicts identically
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example train_bars
//! cargo run --release --example train_bars -- --size 12 --filters 8 --preset thorough
//! cargo run --release --example train_bars -- --config training.json
//! ```

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sequent::{
    accuracy, one_hot, Activation, Checkpoint, Loss, ModelBuilder, Optimizer, Padding, Tensor,
    TrainingConfig,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "train_bars", about = "CNN on synthetic bar images")]
struct Args {
    /// Image side length in pixels
    #[arg(long, default_value_t = 8)]
    size: usize,

    /// Number of images
    #[arg(long, default_value_t = 256)]
    samples: usize,

    /// Convolution filters
    #[arg(long, default_value_t = 4)]
    filters: usize,

    /// Padding mode of the convolution: "valid" or "same"
    #[arg(long, default_value = "same")]
    padding: String,

    /// Training preset: "default", "quick" or "thorough"
    #[arg(long, default_value = "default")]
    preset: String,

    /// JSON training configuration (overrides --preset)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 0.005)]
    lr: f64,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Where to write the checkpoint used for the reload check
    #[arg(long, default_value = "bars.ckpt")]
    checkpoint: PathBuf,
}

/// One bar per image at a random row or column, with pixel noise
fn make_bars(size: usize, samples: usize, rng: &mut StdRng) -> sequent::Result<(Tensor, Tensor)> {
    let mut data = Vec::with_capacity(samples * size * size);
    let mut labels = Vec::with_capacity(samples);
    for i in 0..samples {
        let class = i % 2;
        let pos = rng.gen_range(0..size);
        for r in 0..size {
            for c in 0..size {
                let on = if class == 0 { c == pos } else { r == pos };
                let base = if on { 1.0 } else { 0.0 };
                data.push(base + rng.gen_range(-0.1..0.1));
            }
        }
        labels.push(class);
    }
    Ok((
        Tensor::from_vec(data, vec![samples, size, size, 1])?,
        one_hot(&labels, 2)?,
    ))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("\n{}", "=".repeat(70));
    println!("  Bar Orientation CNN");
    println!("{}", "=".repeat(70));

    let config = match &args.config {
        Some(path) => TrainingConfig::from_file(path)?,
        None => match args.preset.as_str() {
            "quick" => TrainingConfig {
                verbose: true,
                ..TrainingConfig::quick()
            },
            "thorough" => TrainingConfig::thorough(),
            "default" => TrainingConfig {
                epochs: 8,
                batch_size: 16,
                print_every: 4,
                clip_grad_norm: Some(5.0),
                ..TrainingConfig::default()
            },
            other => return Err(format!("unknown preset '{}'", other).into()),
        },
    };
    println!("\nTraining configuration:\n{}", serde_json::to_string_pretty(&config)?);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let (x, y) = make_bars(args.size, args.samples, &mut rng)?;

    let mut model = ModelBuilder::new()
        .add_input(&[args.size, args.size, 1])
        .add_conv2d(
            args.filters,
            [3, 3],
            args.padding.parse::<Padding>()?,
            Some(Activation::ReLU),
        )
        .add_max_pooling2d([2, 2])
        .add_flatten()
        .add_dense(2, Some(Activation::Softmax))
        .set_optimizer(Optimizer::adam(args.lr))
        .set_loss(Loss::CategoricalCrossEntropy)
        .seed(args.seed)
        .build()?;
    println!("\n{}", model.summary());

    model.fit_with_config(&x, &y, &config)?;
    let predictions = model.predict(&x)?;
    println!("\nAccuracy: {:.1}%", accuracy(&predictions, &y)? * 100.0);

    Checkpoint::save(&model, &args.checkpoint)?;
    let restored = Checkpoint::load(&args.checkpoint, Optimizer::adam(args.lr))?;
    let same = restored.predict(&x)? == predictions;
    println!(
        "Reloaded model predicts {}",
        if same { "identically" } else { "DIFFERENTLY" }
    );

    Ok(())
}
