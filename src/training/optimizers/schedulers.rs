//! Learning rate schedulers
//!
//! [`LinearWarmup`] ramps the learning rate during the first epoch and is
//! stepped once per batch; [`StepScheduler`] decays it by `gamma` every
//! `step_size` epochs and is stepped once per epoch.

use super::{Optimizer, Scheduler, SchedulerStateDict};

/// Linear warmup from `start_factor * base_lr` to `base_lr` over `total_iters` steps
#[derive(Debug, Clone)]
pub struct LinearWarmup {
    base_lr: f64,
    start_factor: f64,
    total_iters: usize,
    current_step: usize,
}

impl LinearWarmup {
    /// Create the warmup and immediately apply its first factor to `optimizer`
    pub fn new(optimizer: &mut dyn Optimizer, start_factor: f64, total_iters: usize) -> Self {
        let warmup = Self {
            base_lr: optimizer.learning_rate(),
            start_factor,
            total_iters,
            current_step: 0,
        };
        optimizer.set_learning_rate(warmup.get_lr());
        warmup
    }

    /// Multiplier applied to the base learning rate at the current step
    pub fn factor(&self) -> f64 {
        if self.total_iters == 0 {
            return 1.0;
        }
        let progress = self.current_step.min(self.total_iters) as f64 / self.total_iters as f64;
        self.start_factor + (1.0 - self.start_factor) * progress
    }

    /// Whether the ramp has reached the base learning rate
    pub fn is_done(&self) -> bool {
        self.current_step >= self.total_iters
    }
}

impl Scheduler for LinearWarmup {
    fn name(&self) -> &str {
        "linear_warmup"
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.current_step += 1;
        optimizer.set_learning_rate(self.get_lr());
    }

    fn get_lr(&self) -> f64 {
        self.base_lr * self.factor()
    }

    fn step_count(&self) -> usize {
        self.current_step
    }

    fn state_dict(&self) -> SchedulerStateDict {
        SchedulerStateDict {
            scheduler_type: self.name().to_string(),
            step_count: self.current_step,
            base_lr: self.base_lr,
        }
    }

    fn load_state_dict(&mut self, state: &SchedulerStateDict) {
        self.current_step = state.step_count;
        self.base_lr = state.base_lr;
    }
}

/// Multiply the learning rate by `gamma` every `step_size` epochs
#[derive(Debug, Clone)]
pub struct StepScheduler {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    current_step: usize,
}

impl StepScheduler {
    /// Create a step scheduler relative to the optimizer's current learning rate
    pub fn new(optimizer: &dyn Optimizer, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr: optimizer.learning_rate(),
            step_size: step_size.max(1),
            gamma,
            current_step: 0,
        }
    }

    /// Step size in epochs
    pub fn step_size(&self) -> usize {
        self.step_size
    }

    /// Decay factor
    pub fn gamma(&self) -> f64 {
        self.gamma
    }
}

impl Scheduler for StepScheduler {
    fn name(&self) -> &str {
        "step"
    }

    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.current_step += 1;
        optimizer.set_learning_rate(self.get_lr());
    }

    fn get_lr(&self) -> f64 {
        let decays = (self.current_step / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    fn step_count(&self) -> usize {
        self.current_step
    }

    fn state_dict(&self) -> SchedulerStateDict {
        SchedulerStateDict {
            scheduler_type: self.name().to_string(),
            step_count: self.current_step,
            base_lr: self.base_lr,
        }
    }

    fn load_state_dict(&mut self, state: &SchedulerStateDict) {
        self.current_step = state.step_count;
        self.base_lr = state.base_lr;
    }
}
