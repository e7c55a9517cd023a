//! End-to-end training behaviour through the public API

use approx::assert_relative_eq;
use sequent::layers::Dense;
use sequent::{
    accuracy, one_hot, Activation, EngineError, Layer, Loss, ModelBuilder, Optimizer, Padding,
    Sequential, Tensor, TrainingConfig,
};
use std::str::FromStr;

fn quiet(epochs: usize, batch_size: usize) -> TrainingConfig {
    TrainingConfig {
        verbose: false,
        ..TrainingConfig::new(epochs, batch_size)
    }
}

fn separable_points() -> (Tensor, Tensor) {
    let x = Tensor::from_rows(&[
        vec![0.0, 0.0],
        vec![0.2, 0.1],
        vec![1.0, 1.0],
        vec![0.9, 0.8],
    ])
    .unwrap();
    let y = one_hot(&[0, 0, 1, 1], 2).unwrap();
    (x, y)
}

/// 6x6 single-channel images: class 0 has a vertical bar, class 1 a horizontal one
fn bars(n: usize) -> (Tensor, Tensor) {
    let mut data = Vec::with_capacity(n * 36);
    let mut labels = Vec::with_capacity(n);
    for i in 0..n {
        let class = i % 2;
        let pos = 1 + (i / 2) % 4;
        for r in 0..6 {
            for c in 0..6 {
                let on = if class == 0 { c == pos } else { r == pos };
                data.push(if on { 1.0 } else { 0.0 });
            }
        }
        labels.push(class);
    }
    (
        Tensor::new(data, vec![n, 6, 6, 1]),
        one_hot(&labels, 2).unwrap(),
    )
}

#[test]
fn identity_dense_passes_input_through() {
    let dense = Dense::from_parameters(
        Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]),
        Tensor::zeros(vec![2]),
        None,
    )
    .unwrap();
    let layer = Layer::Dense(dense);
    let (y, _) = layer.forward(&Tensor::new(vec![1.0, 2.0], vec![1, 2])).unwrap();
    assert_eq!(y.data, vec![1.0, 2.0]);
}

#[test]
fn adam_first_step_through_public_api() {
    let mut dense = Dense::from_parameters(Tensor::zeros(vec![3, 1]), Tensor::zeros(vec![1]), None)
        .unwrap();
    dense.dweights = Tensor::ones(vec![3, 1]);
    dense.dbiases = Tensor::ones(vec![1]);
    let mut layer = Layer::Dense(dense);

    let mut adam = Optimizer::adam(0.001);
    adam.initialize(&layer);
    adam.update(&mut layer).unwrap();

    let (w, b) = layer.parameters().unwrap();
    assert_relative_eq!(w.data[1], -0.001, epsilon = 1e-9);
    assert_relative_eq!(b.data[0], -0.001, epsilon = 1e-9);
}

#[test]
fn softmax_classifier_loss_falls_over_fifty_epochs() {
    let (x, y) = separable_points();
    let mut model = ModelBuilder::new()
        .add_input(&[2])
        .add_dense(2, Some(Activation::Softmax))
        .set_optimizer(Optimizer::sgd(0.5))
        .set_loss(Loss::CategoricalCrossEntropy)
        .seed(11)
        .build()
        .unwrap();

    let history = model.fit_with_config(&x, &y, &quiet(60, 4)).unwrap();
    let first = history.first_loss().unwrap();
    let fiftieth = history.epoch_losses[49];
    assert!(fiftieth < first, "epoch 50 loss {} !< epoch 1 loss {}", fiftieth, first);
}

#[test]
fn cnn_learns_bar_orientation() {
    let (x, y) = bars(16);
    let mut model = ModelBuilder::new()
        .add_input(&[6, 6, 1])
        .add_conv2d(4, [3, 3], Padding::Same, Some(Activation::ReLU))
        .add_max_pooling2d([2, 2])
        .add_flatten()
        .add_dense(2, Some(Activation::Softmax))
        .set_optimizer(Optimizer::adam(0.01))
        .set_loss(Loss::CategoricalCrossEntropy)
        .seed(5)
        .build()
        .unwrap();

    let history = model.fit_with_config(&x, &y, &quiet(30, 4)).unwrap();
    assert!(history.final_loss().unwrap() < history.first_loss().unwrap());
    assert!(model.evaluate(&x, &y).unwrap() < history.first_loss().unwrap());
}

#[test]
fn sigmoid_binary_cross_entropy_trains() {
    let x = Tensor::from_rows(&[vec![-1.0], vec![-0.5], vec![0.5], vec![1.0]]).unwrap();
    let y = Tensor::from_rows(&[vec![0.0], vec![0.0], vec![1.0], vec![1.0]]).unwrap();
    let mut model = ModelBuilder::new()
        .add_input(&[1])
        .add_dense(1, Some(Activation::Sigmoid))
        .set_optimizer(Optimizer::sgd(1.0))
        .set_loss(Loss::BinaryCrossEntropy)
        .seed(2)
        .build()
        .unwrap();

    let history = model.fit_with_config(&x, &y, &quiet(40, 2)).unwrap();
    assert!(history.final_loss().unwrap() < history.first_loss().unwrap());
    assert_eq!(accuracy(&model.predict(&x).unwrap(), &y).unwrap(), 1.0);
}

#[test]
fn mse_regression_with_relu_hidden_layer() {
    let rows: Vec<Vec<f64>> = (0..8).map(|i| vec![i as f64 / 8.0]).collect();
    let targets: Vec<Vec<f64>> = rows.iter().map(|r| vec![2.0 * r[0] + 0.5]).collect();
    let x = Tensor::from_rows(&rows).unwrap();
    let y = Tensor::from_rows(&targets).unwrap();

    let mut model = ModelBuilder::new()
        .add_input(&[1])
        .add_dense(8, Some(Activation::ReLU))
        .add_dense(1, None)
        .set_optimizer(Optimizer::sgd(0.02).with_momentum(0.9))
        .set_loss(Loss::MeanSquaredError)
        .seed(3)
        .build()
        .unwrap();

    let before = model.evaluate(&x, &y).unwrap();
    model.fit_with_config(&x, &y, &quiet(100, 4)).unwrap();
    assert!(model.evaluate(&x, &y).unwrap() < before);
}

#[test]
fn predict_is_independent_of_batch_size() {
    let (x, _) = bars(9);
    let model: Sequential = ModelBuilder::new()
        .add_input(&[6, 6, 1])
        .add_conv2d_strided(3, [2, 2], [2, 2], Padding::Valid, None)
        .add_max_pooling2d_with([2, 2], [1, 1], Padding::Same)
        .add_flatten()
        .add_dense(4, None)
        .set_optimizer(Optimizer::sgd(0.1))
        .set_loss(Loss::MeanSquaredError)
        .seed(8)
        .build()
        .unwrap();

    let (full, _) = model.forward(&x).unwrap();
    for batch_size in [1, 2, 4, 9, 50] {
        let predicted = model.predict_with_batch_size(&x, batch_size).unwrap();
        assert_eq!(predicted.shape, full.shape);
        for (a, b) in predicted.data.iter().zip(&full.data) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }
}

#[test]
fn errors_propagate_out_of_fit() {
    let (x, _) = separable_points();
    let mut model = ModelBuilder::new()
        .add_input(&[2])
        .add_dense(2, Some(Activation::Softmax))
        .set_optimizer(Optimizer::sgd(0.1))
        .set_loss(Loss::CategoricalCrossEntropy)
        .build()
        .unwrap();

    let wrong_width = one_hot(&[0, 1, 2, 0], 3).unwrap();
    assert!(matches!(
        model.fit_with_config(&x, &wrong_width, &quiet(1, 2)),
        Err(EngineError::ShapeMismatch(_))
    ));

    let wrong_input = Tensor::zeros(vec![4, 3]);
    let y = one_hot(&[0, 1, 0, 1], 2).unwrap();
    assert!(matches!(
        model.fit_with_config(&wrong_input, &y, &quiet(1, 2)),
        Err(EngineError::ShapeMismatch(_))
    ));

    assert!(matches!(
        Padding::from_str("full"),
        Err(EngineError::InvalidConfiguration(_))
    ));
}

#[test]
fn fit_writes_csv_log() {
    let (x, y) = separable_points();
    let path = std::env::temp_dir().join(format!("sequent_fit_{}.csv", std::process::id()));
    let mut model = ModelBuilder::new()
        .add_input(&[2])
        .add_dense(2, Some(Activation::Softmax))
        .set_optimizer(Optimizer::adam(0.01))
        .set_loss(Loss::CategoricalCrossEntropy)
        .seed(1)
        .build()
        .unwrap();

    let config = TrainingConfig {
        log_path: Some(path.clone()),
        ..quiet(3, 2)
    };
    model.fit_with_config(&x, &y, &config).unwrap();

    let log = std::fs::read_to_string(&path).unwrap();
    // header + 3 epochs of 2 batches
    assert_eq!(log.lines().count(), 7);
    assert!(log.lines().last().unwrap().starts_with("3,2,"));
    std::fs::remove_file(&path).ok();
}
