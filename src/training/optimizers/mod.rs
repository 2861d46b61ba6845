//! Optimizers and learning rate schedulers
//!
//! Parameters are updated in place through their [`candle_core::Var`] handles
//! from the gradient store produced by `loss.backward()`. Schedulers own a base
//! learning rate and write the scheduled value into the optimizer.

pub mod schedulers;
pub mod sgd;

pub use schedulers::{LinearWarmup, StepScheduler};
pub use sgd::SgdOptimizer;

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::Var;
use serde::{Deserialize, Serialize};

use crate::config::OptimizerConfig;
use crate::error::Result;
use crate::model::TensorRecord;

/// Trait for optimizers
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from `gradients`
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Clear accumulated gradients.
    ///
    /// Every `backward()` builds a fresh [`GradStore`], so there is nothing to
    /// clear; kept so the training step reads in its conventional order.
    fn zero_grad(&mut self) -> Result<()> {
        Ok(())
    }

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Optimizer state for checkpointing
    fn state_dict(&self) -> Result<OptimizerStateDict>;

    /// Restore optimizer state from a checkpoint
    fn load_state_dict(&mut self, state: &OptimizerStateDict) -> Result<()>;

    /// Number of parameter tensors updated
    fn parameter_count(&self) -> usize;

    /// Updates applied so far
    fn step_count(&self) -> usize;
}

/// Trait for learning rate schedulers
pub trait Scheduler: Send {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Advance one step and write the new learning rate into `optimizer`
    fn step(&mut self, optimizer: &mut dyn Optimizer);

    /// Learning rate of the current step
    fn get_lr(&self) -> f64;

    /// Steps taken so far
    fn step_count(&self) -> usize;

    /// Scheduler state for checkpointing
    fn state_dict(&self) -> SchedulerStateDict;

    /// Restore scheduler state from a checkpoint
    fn load_state_dict(&mut self, state: &SchedulerStateDict);
}

/// Serializable optimizer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    /// Optimizer type
    pub optimizer_type: String,
    /// Updates applied so far
    pub step_count: usize,
    /// Learning rate at snapshot time
    pub learning_rate: f64,
    /// Per-parameter buffers (momentum) by parameter name
    pub state: BTreeMap<String, TensorRecord>,
    /// Hyperparameters
    pub hyperparameters: BTreeMap<String, f64>,
}

/// Serializable scheduler state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateDict {
    /// Scheduler type
    pub scheduler_type: String,
    /// Steps taken so far
    pub step_count: usize,
    /// Learning rate the schedule is relative to
    pub base_lr: f64,
}

/// Create the SGD optimizer over named parameters
pub fn create_optimizer(
    config: &OptimizerConfig,
    parameters: Vec<(String, Var)>,
) -> Result<SgdOptimizer> {
    SgdOptimizer::new(
        parameters,
        config.learning_rate,
        config.momentum,
        config.weight_decay,
    )
}
