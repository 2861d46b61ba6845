//! Training infrastructure for TreeSeg detectors
//!
//! Data loading, the epoch runners, optimization, loss bookkeeping and
//! checkpointing for training a Mask R-CNN style detector on a COCO dataset.
//!
//! # Main Components
//!
//! - **Data**: COCO dataset, seeded split, batching data loader
//! - **Trainer**: per-epoch training and validation passes plus the orchestrator
//! - **Optimizers**: SGD with momentum, linear warmup and step schedules
//! - **Metrics**: per-epoch loss history and loss-curve rendering
//! - **Checkpoints**: best, periodic and final model artifacts
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use treeseg::{Config, training::Trainer};
//!
//! let config = Config::load(None)?;
//! let mut trainer = Trainer::from_config(config)?.with_progress(true);
//! let result = trainer.train()?;
//! println!("best validation loss: {:?}", result.best_val_loss);
//! ```

pub mod checkpoints;
pub mod data;
pub mod metrics;
pub mod optimizers;
pub mod progress;
pub mod trainer;

#[cfg(test)]
mod tests;

pub use checkpoints::{
    load_checkpoint, load_model, Checkpoint, CheckpointDecision, CheckpointManager,
    CheckpointPolicy, CheckpointSlot, ModelArtifact,
};
pub use data::{
    collate, random_split, Batch, CocoDataset, DataError, DataLoader, DataLoaderConfig, Dataset,
    Sample, Target,
};
pub use metrics::{EpochLosses, LossHistory, LossKind, Phase};
pub use optimizers::{
    create_optimizer, LinearWarmup, Optimizer, OptimizerStateDict, Scheduler, SchedulerStateDict,
    SgdOptimizer, StepScheduler,
};
pub use trainer::{train_one_epoch, validate_one_epoch, Trainer, TrainingResult};
