//! SGD optimizer with momentum and L2 weight decay
//!
//! Update rule per parameter `p` with gradient `g`:
//! `d = g + wd * p`, `buf = momentum * buf + d` (first step `buf = d`),
//! `p = p - lr * buf`.

use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tracing::debug;

use super::{Optimizer, OptimizerStateDict};
use crate::error::{Error, Result};
use crate::model::TensorRecord;

/// SGD optimizer with momentum
pub struct SgdOptimizer {
    /// Named parameters, updated in place
    parameters: Vec<(String, Var)>,

    learning_rate: f64,
    momentum: f64,
    weight_decay: f64,
    step_count: usize,

    /// Momentum buffers by parameter name
    momentum_buffers: HashMap<String, Tensor>,
}

impl SgdOptimizer {
    /// Create a new SGD optimizer
    pub fn new(
        parameters: Vec<(String, Var)>,
        learning_rate: f64,
        momentum: f64,
        weight_decay: f64,
    ) -> Result<Self> {
        if !(learning_rate >= 0.0) {
            return Err(Error::config(format!("invalid learning rate {learning_rate}")));
        }
        if momentum < 0.0 || weight_decay < 0.0 {
            return Err(Error::config("momentum and weight decay must be >= 0"));
        }
        Ok(Self {
            parameters,
            learning_rate,
            momentum,
            weight_decay,
            step_count: 0,
            momentum_buffers: HashMap::new(),
        })
    }

    /// Momentum coefficient
    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    /// Weight decay coefficient
    pub fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    fn update_parameter(&mut self, name: &str, var: &Var, grad: &Tensor) -> Result<()> {
        let param = var.as_tensor();
        let grad = grad.to_dtype(param.dtype())?;

        let effective_grad = if self.weight_decay > 0.0 {
            (&grad + (param * self.weight_decay)?)?
        } else {
            grad
        };

        let update = if self.momentum > 0.0 {
            let buf = match self.momentum_buffers.get(name) {
                Some(prev) => ((prev * self.momentum)? + &effective_grad)?,
                None => effective_grad.copy()?,
            };
            self.momentum_buffers.insert(name.to_string(), buf.clone());
            buf
        } else {
            effective_grad
        };

        let updated = (param - (update * self.learning_rate)?)?;
        var.set(&updated.detach())?;
        Ok(())
    }
}

impl Optimizer for SgdOptimizer {
    fn name(&self) -> &str {
        if self.momentum > 0.0 {
            "sgd_momentum"
        } else {
            "sgd"
        }
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;
        let parameters = self.parameters.clone();
        let mut updated = 0;
        for (name, var) in &parameters {
            if let Some(grad) = gradients.get(var.as_tensor()) {
                self.update_parameter(name, var, grad)?;
                updated += 1;
            }
        }
        debug!("sgd step {} updated {} parameters", self.step_count, updated);
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut state = BTreeMap::new();
        for (name, buf) in &self.momentum_buffers {
            state.insert(name.clone(), TensorRecord::from_tensor(buf)?);
        }

        let mut hyperparameters = BTreeMap::new();
        hyperparameters.insert("momentum".to_string(), self.momentum);
        hyperparameters.insert("weight_decay".to_string(), self.weight_decay);

        Ok(OptimizerStateDict {
            optimizer_type: self.name().to_string(),
            step_count: self.step_count,
            learning_rate: self.learning_rate,
            state,
            hyperparameters,
        })
    }

    fn load_state_dict(&mut self, state: &OptimizerStateDict) -> Result<()> {
        self.step_count = state.step_count;
        self.learning_rate = state.learning_rate;
        if let Some(&momentum) = state.hyperparameters.get("momentum") {
            self.momentum = momentum;
        }
        if let Some(&weight_decay) = state.hyperparameters.get("weight_decay") {
            self.weight_decay = weight_decay;
        }

        self.momentum_buffers.clear();
        for (name, var) in &self.parameters {
            if let Some(record) = state.state.get(name) {
                if record.shape != var.dims() {
                    return Err(Error::checkpoint(format!(
                        "momentum buffer shape mismatch for '{name}'"
                    )));
                }
                let buf = record.to_tensor(var.device())?.to_dtype(var.dtype())?;
                self.momentum_buffers.insert(name.clone(), buf);
            }
        }
        Ok(())
    }

    fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}
