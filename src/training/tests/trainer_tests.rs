//! Tests for the epoch runners and the training orchestrator

use std::sync::Arc;

use anyhow::Result;
use approx::assert_relative_eq;
use candle_core::Device;
use tempfile::TempDir;
use test_case::test_case;

use crate::config::{DeviceType, WarmupConfig};
use crate::error::Error;
use crate::model::{Detector, LossTerm};
use crate::training::checkpoints::load_checkpoint;
use crate::training::data::{DataLoader, DataLoaderConfig};
use crate::training::metrics::{LossHistory, LossKind, Phase};
use crate::training::optimizers::{Optimizer, SgdOptimizer};
use crate::training::{train_one_epoch, validate_one_epoch, Trainer};

use super::mock_data::{test_config, RecordingOptimizer, ScriptedDetector, SyntheticDataset};

fn loader(samples: usize, batch_size: usize) -> DataLoader {
    DataLoader::new(
        Arc::new(SyntheticDataset::new(samples, 8)),
        DataLoaderConfig {
            batch_size,
            shuffle: false,
            num_workers: 0,
            prefetch: 2,
            drop_last: false,
            seed: None,
        },
    )
    .unwrap()
}

fn sgd(model: &dyn Detector, lr: f64) -> SgdOptimizer {
    SgdOptimizer::new(model.trainable_parameters().unwrap(), lr, 0.9, 5e-4).unwrap()
}

fn warmup(start_factor: f64, max_iters: usize) -> WarmupConfig {
    WarmupConfig {
        start_factor,
        max_iters,
    }
}

#[test]
fn test_loss_sum_is_sum_of_terms() -> Result<()> {
    let mut model = ScriptedDetector::new();
    let mut optimizer = sgd(&model, 0.01);
    let loader = loader(8, 2);

    let losses = train_one_epoch(
        &mut model,
        &mut optimizer,
        &loader,
        &Device::Cpu,
        1,
        &WarmupConfig::default(),
        false,
    )?;

    assert_eq!(losses.num_batches(), 4);
    let sums = losses.get(LossKind::Sum);
    for (i, sum) in sums.iter().enumerate() {
        let terms: f64 = LossTerm::ALL
            .iter()
            .map(|t| losses.get(LossKind::Term(*t))[i])
            .sum();
        assert_relative_eq!(*sum, terms, max_relative = 1e-12);
    }
    assert_relative_eq!(sums[0], 1.0 + 0.25 + 0.0625 + 4.0 + 0.01, max_relative = 1e-5);
    assert!(sums[3] < sums[0]);
    assert_eq!(optimizer.step_count(), 4);
    Ok(())
}

#[test]
fn test_warmup_ramps_only_in_first_epoch() -> Result<()> {
    let mut model = ScriptedDetector::new();
    let mut optimizer = RecordingOptimizer::new(sgd(&model, 0.01));
    let loader = loader(8, 2);
    let config = warmup(0.001, 1000);

    train_one_epoch(&mut model, &mut optimizer, &loader, &Device::Cpu, 0, &config, false)?;
    let lrs = optimizer.lrs();
    assert_eq!(lrs.len(), 4);
    // three warmup iterations for four batches
    let expected = [0.001, 0.001 + 0.999 / 3.0, 0.001 + 2.0 * 0.999 / 3.0, 1.0];
    for (lr, factor) in lrs.iter().zip(expected) {
        assert_relative_eq!(*lr, 0.01 * factor, max_relative = 1e-9);
    }
    assert_relative_eq!(optimizer.learning_rate(), 0.01);

    train_one_epoch(&mut model, &mut optimizer, &loader, &Device::Cpu, 1, &config, false)?;
    for lr in &optimizer.lrs()[4..] {
        assert_relative_eq!(*lr, 0.01);
    }
    Ok(())
}

#[test_case(8, 1, 1 ; "capped by max_iters")]
#[test_case(2, 1000, 0 ; "single batch loader has no warmup")]
fn test_warmup_length(samples: usize, max_iters: usize, ramped_steps: usize) -> Result<()> {
    let mut model = ScriptedDetector::new();
    let mut optimizer = RecordingOptimizer::new(sgd(&model, 0.02));
    let loader = loader(samples, 2);

    train_one_epoch(
        &mut model,
        &mut optimizer,
        &loader,
        &Device::Cpu,
        0,
        &warmup(0.1, max_iters),
        false,
    )?;
    let lrs = optimizer.lrs();
    for (i, lr) in lrs.iter().enumerate() {
        if i < ramped_steps {
            assert!(*lr < 0.02);
        } else {
            assert_relative_eq!(*lr, 0.02);
        }
    }
    Ok(())
}

#[test]
fn test_non_finite_loss_is_fatal_before_the_step() {
    let mut model = ScriptedDetector::new().with_nan_at(2);
    let mut optimizer = sgd(&model, 0.01);
    let loader = loader(8, 2);

    let err = train_one_epoch(
        &mut model,
        &mut optimizer,
        &loader,
        &Device::Cpu,
        3,
        &WarmupConfig::default(),
        false,
    )
    .unwrap_err();

    assert!(err.is_fatal_divergence());
    match err {
        Error::LossDiverged {
            epoch,
            batch,
            loss_sum,
            losses,
        } => {
            assert_eq!((epoch, batch), (3, 2));
            assert!(loss_sum.is_nan());
            assert!(losses.contains("loss_classifier"));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(model.calls(), 3);
    assert_eq!(optimizer.step_count(), 2);
}

#[test]
fn test_validation_runs_without_gradients() -> Result<()> {
    let mut model = ScriptedDetector::new();
    let before = model.weights();
    let loader = loader(5, 2);

    let losses = validate_one_epoch(&mut model, &loader, &Device::Cpu, 0, false)?;

    assert_eq!(losses.num_batches(), 3);
    assert_eq!(losses.phase(), Phase::Validation);
    assert_eq!(model.modes(), vec![(true, false); 3]);
    assert!(model.grad_enabled());
    assert_eq!(model.weights(), before);
    Ok(())
}

#[test]
fn test_validation_tolerates_non_finite_losses() -> Result<()> {
    let mut model = ScriptedDetector::new().with_nan_at(0);
    let losses = validate_one_epoch(&mut model, &loader(4, 2), &Device::Cpu, 0, false)?;
    let sums = losses.get(LossKind::Sum);
    assert!(sums[0].is_nan());
    assert!(sums[1].is_finite());
    Ok(())
}

#[test]
fn test_history_has_one_entry_per_epoch() -> Result<()> {
    let dir = TempDir::new()?;
    let mut trainer = Trainer::new(
        test_config(dir.path(), 3),
        Box::new(ScriptedDetector::new()),
        Arc::new(SyntheticDataset::new(10, 8)),
    )?;
    let result = trainer.train()?;

    assert_eq!(result.epochs_completed, 3);
    assert_eq!(LossHistory::keys().len(), 12);
    for key in LossHistory::keys() {
        assert_eq!(result.history.get_key(&key).map(<[f64]>::len), Some(3), "{key}");
    }
    assert!(result.history.get_key("val_loss_sum").is_some());
    assert_eq!(result.final_val_loss, result.history.latest(Phase::Validation, LossKind::Sum));
    Ok(())
}

#[test]
fn test_one_epoch_run_writes_best_but_not_periodic() -> Result<()> {
    let dir = TempDir::new()?;
    let mut trainer = Trainer::new(
        test_config(dir.path(), 1),
        Box::new(ScriptedDetector::new()),
        Arc::new(SyntheticDataset::new(10, 8)),
    )?;
    let result = trainer.train()?;
    let paths = trainer.checkpoints();

    assert!(paths.best_path().is_file());
    assert!(!paths.periodic_path().exists());
    assert!(paths.final_path().is_file());
    assert!(paths.plot_path().is_file());
    assert!(paths.config_path().is_file());
    assert_eq!(result.best_checkpoint_path, Some(paths.best_path()));
    assert_eq!(result.periodic_checkpoint_path, None);
    assert_eq!(load_checkpoint(paths.best_path())?.epoch, 0);
    Ok(())
}

#[test_case(4, None ; "not yet due")]
#[test_case(5, Some(4) ; "fifth epoch")]
#[test_case(7, Some(4) ; "kept until the next period")]
fn test_periodic_checkpoint(num_epochs: usize, saved_epoch: Option<usize>) -> Result<()> {
    let dir = TempDir::new()?;
    let mut trainer = Trainer::new(
        test_config(dir.path(), num_epochs),
        Box::new(ScriptedDetector::new()),
        Arc::new(SyntheticDataset::new(10, 8)),
    )?;
    trainer.train()?;
    let path = trainer.checkpoints().periodic_path();
    match saved_epoch {
        Some(epoch) => assert_eq!(load_checkpoint(path)?.epoch, epoch),
        None => assert!(!path.exists()),
    }
    Ok(())
}

#[test]
fn test_best_checkpoint_holds_the_minimum() -> Result<()> {
    let dir = TempDir::new()?;
    let mut trainer = Trainer::new(
        test_config(dir.path(), 4),
        Box::new(ScriptedDetector::new()),
        Arc::new(SyntheticDataset::new(10, 8)),
    )?;
    let result = trainer.train()?;

    let best = load_checkpoint(trainer.checkpoints().best_path())?;
    let val_sums = result.history.get(Phase::Validation, LossKind::Sum);
    let min = val_sums.iter().copied().fold(f64::INFINITY, f64::min);
    assert_eq!(best.loss.epochs(), best.epoch + 1);
    assert_relative_eq!(val_sums[best.epoch], min);
    assert_eq!(result.best_val_loss, Some(min));
    // the first epoch reaching the minimum wins
    assert!(val_sums[..best.epoch].iter().all(|v| *v > min));
    Ok(())
}

#[test]
fn test_divergence_stops_the_run_without_artifacts() {
    let dir = TempDir::new().unwrap();
    let mut trainer = Trainer::new(
        test_config(dir.path(), 3),
        Box::new(ScriptedDetector::new().with_nan_at(0)),
        Arc::new(SyntheticDataset::new(10, 8)),
    )
    .unwrap();

    let err = trainer.train().unwrap_err();
    assert!(err.is_fatal_divergence());
    assert!(!trainer.checkpoints().best_path().exists());
    assert!(!trainer.checkpoints().final_path().exists());
    assert_eq!(trainer.history().epochs(), 0);
}

#[test]
fn test_empty_validation_split_is_rejected() {
    let dir = TempDir::new().unwrap();
    let result = Trainer::new(
        test_config(dir.path(), 1),
        Box::new(ScriptedDetector::new()),
        Arc::new(SyntheticDataset::new(1, 8)),
    );
    match result {
        Err(Error::EmptyLoader { split, samples, .. }) => {
            assert_eq!(split, "validation");
            assert_eq!(samples, 0);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("an empty validation split must be rejected"),
    }
}

#[test]
fn test_resume_continues_from_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(dir.path(), 2);
    config.output.periodic_every = 2;
    let mut first = Trainer::new(
        config.clone(),
        Box::new(ScriptedDetector::new()),
        Arc::new(SyntheticDataset::new(10, 8)),
    )?;
    let first_result = first.train()?;
    let periodic = first.checkpoints().periodic_path();
    let trained_state = first.model().state_dict()?;

    config.training.num_epochs = 4;
    config.training.resume_from = Some(periodic);
    let mut resumed = Trainer::new(
        config,
        Box::new(ScriptedDetector::new()),
        Arc::new(SyntheticDataset::new(10, 8)),
    )?;
    assert_eq!(resumed.start_epoch(), 2);
    assert_eq!(resumed.model().state_dict()?, trained_state);
    assert_eq!(resumed.optimizer().step_count(), 8);
    assert_relative_eq!(resumed.optimizer().learning_rate(), 0.05);

    let result = resumed.train()?;
    assert_eq!(result.epochs_completed, 2);
    assert_eq!(result.history.epochs(), 4);
    assert_eq!(
        &result.history.get(Phase::Train, LossKind::Sum)[..2],
        first_result.history.get(Phase::Train, LossKind::Sum)
    );
    Ok(())
}

#[test]
fn test_first_epoch_writes_best_despite_non_finite_validation() -> Result<()> {
    let dir = TempDir::new()?;
    // four training batches, then the single validation batch
    let mut trainer = Trainer::new(
        test_config(dir.path(), 2),
        Box::new(ScriptedDetector::new().with_nan_at(4)),
        Arc::new(SyntheticDataset::new(10, 8)),
    )?;
    let result = trainer.train()?;

    let val_sums = result.history.get(Phase::Validation, LossKind::Sum);
    assert!(val_sums[0].is_nan());
    assert!(val_sums[1].is_finite());
    // the NaN epoch is saved first, then replaced by the first finite one
    assert_eq!(load_checkpoint(trainer.checkpoints().best_path())?.epoch, 1);
    assert_eq!(result.best_val_loss, Some(val_sums[1]));
    Ok(())
}

#[test]
fn test_more_categories_than_classes_is_rejected_before_training() -> Result<()> {
    let dir = TempDir::new()?;
    let annotations = dir.path().join("annotations.json");
    let json = serde_json::json!({
        "images": [{"id": 1, "file_name": "a.png", "width": 8, "height": 8}],
        "annotations": [
            {"id": 1, "image_id": 1, "category_id": 1, "bbox": [0, 0, 4, 4]},
            {"id": 2, "image_id": 1, "category_id": 2, "bbox": [2, 2, 4, 4]}
        ],
        "categories": [{"id": 1, "name": "tree"}, {"id": 2, "name": "shrub"}]
    });
    std::fs::write(&annotations, serde_json::to_string(&json)?)?;

    let mut config = test_config(dir.path(), 1);
    config.data.coco_path = annotations;
    config.model.num_classes = 1;
    config.training.device = DeviceType::Cpu;

    match Trainer::from_config(config) {
        Err(Error::Config(msg)) => {
            assert!(msg.contains("2 categories"), "{msg}");
            assert!(msg.contains("num_classes is 1"), "{msg}");
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("a class-count mismatch must be rejected"),
    }
    assert!(!dir.path().join("trees.pt").exists());
    Ok(())
}
