//! Epoch runners and the training orchestrator
//!
//! [`train_one_epoch`] and [`validate_one_epoch`] each make one pass over a
//! loader and return the per-batch losses. [`Trainer`] owns the model, the
//! optimizer, both schedules, the loss history and the checkpoint policy, and
//! drives the epoch loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::Device;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, WarmupConfig};
use crate::error::{Error, Result};
use crate::model::{build_detector, Detector, NoGradGuard};
use crate::training::checkpoints::{
    self, Checkpoint, CheckpointManager, CheckpointPolicy, CheckpointSlot, ModelArtifact,
};
use crate::training::data::{random_split, CocoDataset, DataLoader, DataLoaderConfig, Dataset};
use crate::training::metrics::{self, EpochLosses, LossHistory, LossKind, Phase};
use crate::training::optimizers::{
    create_optimizer, LinearWarmup, Optimizer, Scheduler, SchedulerStateDict, StepScheduler,
};
use crate::training::progress::PassProgress;

/// Run one training pass.
///
/// In epoch 0 a linear warmup ramps the learning rate once per batch. A
/// non-finite summed loss stops the pass with [`Error::LossDiverged`] before
/// the optimizer touches the parameters.
#[instrument(skip_all, fields(epoch))]
pub fn train_one_epoch(
    model: &mut dyn Detector,
    optimizer: &mut dyn Optimizer,
    loader: &DataLoader,
    device: &Device,
    epoch: usize,
    warmup: &WarmupConfig,
    show_progress: bool,
) -> Result<EpochLosses> {
    model.set_training(true);
    let mut losses = EpochLosses::new(Phase::Train);

    let mut warmup_schedule = if epoch == 0 {
        let iters = warmup.iterations(loader.len());
        debug!("warming up over {} iterations", iters);
        Some(LinearWarmup::new(optimizer, warmup.start_factor, iters))
    } else {
        None
    };

    let progress = PassProgress::new(Phase::Train, epoch, loader.len(), show_progress);
    for (batch_idx, batch) in loader.iter().enumerate() {
        let batch = batch?.to_device(device)?;
        let loss_dict = model.losses(&batch.images, &batch.targets)?;
        let loss_sum = losses.record(&loss_dict)?;

        if !loss_sum.is_finite() {
            error!("Loss is {}, stopping training", loss_sum);
            error!("{}", loss_dict);
            return Err(Error::LossDiverged {
                epoch,
                batch: batch_idx,
                loss_sum,
                losses: loss_dict.to_string(),
            });
        }

        optimizer.zero_grad()?;
        let grads = loss_dict.total()?.backward()?;
        optimizer.step(&grads)?;

        if let Some(schedule) = warmup_schedule.as_mut() {
            schedule.step(optimizer);
        }
        progress.advance(loss_sum);
    }
    progress.finish();

    Ok(losses)
}

/// Run one validation pass with gradients disabled.
///
/// The detector stays in training mode because only that mode produces
/// losses. Non-finite losses are recorded and reported, never fatal.
#[instrument(skip_all, fields(epoch))]
pub fn validate_one_epoch(
    model: &mut dyn Detector,
    loader: &DataLoader,
    device: &Device,
    epoch: usize,
    show_progress: bool,
) -> Result<EpochLosses> {
    let mut guard = NoGradGuard::new(model);
    let model = guard.model();
    model.set_training(true);

    let mut losses = EpochLosses::new(Phase::Validation);
    let progress = PassProgress::new(Phase::Validation, epoch, loader.len(), show_progress);
    for (batch_idx, batch) in loader.iter().enumerate() {
        let batch = batch?.to_device(device)?;
        let loss_dict = model.losses(&batch.images, &batch.targets)?;
        let loss_sum = losses.record(&loss_dict)?;
        if !loss_sum.is_finite() {
            warn!(
                "validation loss is {} at epoch {} batch {}: {}",
                loss_sum, epoch, batch_idx, loss_dict
            );
        }
        progress.advance(loss_sum);
    }
    progress.finish();

    Ok(losses)
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Epochs run by this call
    pub epochs_completed: usize,
    /// Mean training `loss_sum` of the last epoch
    pub final_train_loss: Option<f64>,
    /// Mean validation `loss_sum` of the last epoch
    pub final_val_loss: Option<f64>,
    /// Lowest validation `loss_sum` so far
    pub best_val_loss: Option<f64>,
    /// Full loss history
    pub history: LossHistory,
    /// Best checkpoint, if one was ever written
    pub best_checkpoint_path: Option<PathBuf>,
    /// Periodic checkpoint, if one was ever written
    pub periodic_checkpoint_path: Option<PathBuf>,
    /// Final model, if any epoch ran
    pub model_path: Option<PathBuf>,
    /// Training duration
    pub training_duration: Duration,
}

/// Owns everything a run needs and drives the epoch loop
pub struct Trainer {
    config: Config,
    model: Box<dyn Detector>,
    optimizer: Box<dyn Optimizer>,
    scheduler: StepScheduler,
    train_loader: DataLoader,
    val_loader: DataLoader,
    device: Device,
    history: LossHistory,
    policy: CheckpointPolicy,
    checkpoints: CheckpointManager,
    start_epoch: usize,
    show_progress: bool,
}

impl Trainer {
    /// Set up a run for `model` over `dataset`.
    ///
    /// Splits the dataset, builds both loaders, the optimizer over the
    /// trainable parameters and the step schedule, and restores
    /// `training.resume_from` when set.
    pub fn new(config: Config, mut model: Box<dyn Detector>, dataset: Arc<dyn Dataset>) -> Result<Self> {
        config.validate()?;
        let device = model.device().clone();
        debug!("detector parameters live on {:?}", device);

        let subsets = random_split(
            dataset,
            &[config.data.train_fraction, config.val_fraction()],
            config.data.split_seed,
        )?;
        let mut subsets = subsets.into_iter();
        let (train_set, val_set) = match (subsets.next(), subsets.next()) {
            (Some(train), Some(val)) => (train, val),
            _ => return Err(Error::internal("split did not produce two subsets")),
        };
        info!(
            "Split dataset into {} training and {} validation samples",
            train_set.len(),
            val_set.len()
        );

        let loader_config = |seed_offset: u64| DataLoaderConfig {
            batch_size: config.training.batch_size,
            shuffle: config.data.shuffle,
            num_workers: config.data.num_workers,
            prefetch: config.data.prefetch,
            drop_last: false,
            seed: config.data.shuffle_seed.map(|s| s.wrapping_add(seed_offset)),
        };
        let train_loader = DataLoader::new(Arc::new(train_set), loader_config(0))?;
        let val_loader = DataLoader::new(Arc::new(val_set), loader_config(1 << 32))?;

        for (split, loader) in [("training", &train_loader), ("validation", &val_loader)] {
            if loader.is_empty() {
                return Err(Error::EmptyLoader {
                    split: split.to_string(),
                    samples: loader.dataset_size(),
                    batch_size: config.training.batch_size,
                });
            }
        }

        let parameters = model.trainable_parameters()?;
        info!("Optimizing {} parameter tensors", parameters.len());
        let mut optimizer: Box<dyn Optimizer> =
            Box::new(create_optimizer(&config.optimizer, parameters)?);
        let mut scheduler = StepScheduler::new(
            optimizer.as_ref(),
            config.scheduler.step_size,
            config.scheduler.gamma,
        );

        let checkpoints = CheckpointManager::new(&config.output.dir, &config.output.model_name)?;
        let mut history = LossHistory::new();
        let mut start_epoch = 0;

        if let Some(path) = &config.training.resume_from {
            info!("Resuming from checkpoint: {}", path.display());
            let checkpoint = checkpoints::load_checkpoint(path)?;
            model.load_state_dict(&checkpoint.model_state_dict)?;
            optimizer.load_state_dict(&checkpoint.optimizer_state_dict)?;
            if !checkpoint.loss.is_consistent() || checkpoint.loss.epochs() != checkpoint.epoch + 1 {
                return Err(Error::checkpoint(format!(
                    "{} has a loss history inconsistent with epoch {}",
                    path.display(),
                    checkpoint.epoch
                )));
            }
            history = checkpoint.loss;
            start_epoch = checkpoint.epoch + 1;
            scheduler.load_state_dict(&SchedulerStateDict {
                scheduler_type: scheduler.name().to_string(),
                step_count: start_epoch,
                base_lr: config.optimizer.learning_rate,
            });
            optimizer.set_learning_rate(scheduler.get_lr());
        }

        let policy = CheckpointPolicy::from_history(&history, config.output.periodic_every);

        Ok(Self {
            config,
            model,
            optimizer,
            scheduler,
            train_loader,
            val_loader,
            device,
            history,
            policy,
            checkpoints,
            start_epoch,
            show_progress: false,
        })
    }

    /// Set up a run entirely from configuration: device, COCO dataset and detector
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let device = config.training.device.resolve()?;
        let dataset = CocoDataset::open(&config.data.coco_path, config.data.image_dir.as_deref())?;
        if dataset.num_categories() > config.model.num_classes {
            return Err(Error::config(format!(
                "{} has {} categories but model.num_classes is {}",
                config.data.coco_path.display(),
                dataset.num_categories(),
                config.model.num_classes
            )));
        }
        let model = build_detector(&config.model, &device)?;
        Self::new(config, Box::new(model), Arc::new(dataset))
    }

    /// Show per-pass progress bars
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Loss history so far
    pub fn history(&self) -> &LossHistory {
        &self.history
    }

    /// The detector being trained
    pub fn model(&self) -> &dyn Detector {
        self.model.as_ref()
    }

    /// The optimizer
    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// Artifact locations
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// First epoch the next call to [`Trainer::train`] runs
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Training and validation loaders
    pub fn loaders(&self) -> (&DataLoader, &DataLoader) {
        (&self.train_loader, &self.val_loader)
    }

    /// Run the remaining epochs
    #[instrument(skip(self))]
    pub fn train(&mut self) -> Result<TrainingResult> {
        let start = Instant::now();
        let num_epochs = self.config.training.num_epochs;
        info!(
            "Starting training for epochs {}..{} ({} training batches, {} validation batches per epoch)",
            self.start_epoch,
            num_epochs,
            self.train_loader.len(),
            self.val_loader.len()
        );
        self.checkpoints.write_config(&self.config.to_yaml()?)?;

        let mut best_checkpoint_path = None;
        let mut periodic_checkpoint_path = None;
        let mut model_path = None;
        let mut epochs_completed = 0;

        for epoch in self.start_epoch..num_epochs {
            info!(
                "epoch {} is training - learning rate = {}",
                epoch,
                self.optimizer.learning_rate()
            );
            let train = train_one_epoch(
                self.model.as_mut(),
                self.optimizer.as_mut(),
                &self.train_loader,
                &self.device,
                epoch,
                &self.config.warmup,
                self.show_progress,
            )?;

            self.scheduler.step(self.optimizer.as_mut());

            info!("epoch {} is validating", epoch);
            let validation = validate_one_epoch(
                self.model.as_mut(),
                &self.val_loader,
                &self.device,
                epoch,
                self.show_progress,
            )?;

            self.history.push_epoch(&train, &validation)?;
            if self.config.output.save_plot {
                self.checkpoints.write_plot(&metrics::render(&self.history)?)?;
            }

            let train_sum = self.history.latest(Phase::Train, LossKind::Sum).unwrap_or(f64::NAN);
            let val_sum = self
                .history
                .latest(Phase::Validation, LossKind::Sum)
                .unwrap_or(f64::NAN);
            info!("train loss sum = {}", train_sum);
            info!("valid loss sum = {}", val_sum);

            let decision = self.policy.evaluate(epoch, val_sum);
            if decision.save_best || decision.save_periodic {
                let checkpoint = self.checkpoint(epoch)?;
                if decision.save_best {
                    best_checkpoint_path = Some(self.checkpoints.save(CheckpointSlot::Best, &checkpoint)?);
                }
                if decision.save_periodic {
                    periodic_checkpoint_path =
                        Some(self.checkpoints.save(CheckpointSlot::Periodic, &checkpoint)?);
                }
            }

            model_path = Some(self.checkpoints.save_model(&ModelArtifact {
                config: self.model.config().clone(),
                model_state_dict: self.model.state_dict()?,
            })?);
            epochs_completed += 1;
        }

        self.start_epoch = self.start_epoch.max(num_epochs);
        let result = TrainingResult {
            epochs_completed,
            final_train_loss: self.history.latest(Phase::Train, LossKind::Sum),
            final_val_loss: self.history.latest(Phase::Validation, LossKind::Sum),
            best_val_loss: self.policy.min_loss(),
            history: self.history.clone(),
            best_checkpoint_path,
            periodic_checkpoint_path,
            model_path,
            training_duration: start.elapsed(),
        };
        info!("Training completed in {:?}", result.training_duration);
        Ok(result)
    }

    fn checkpoint(&self, epoch: usize) -> Result<Checkpoint> {
        Ok(Checkpoint {
            epoch,
            model_state_dict: self.model.state_dict()?,
            optimizer_state_dict: self.optimizer.state_dict()?,
            loss: self.history.clone(),
            saved_at: Utc::now(),
        })
    }
}
