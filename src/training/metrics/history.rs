//! Per-batch and per-epoch loss records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{LossKind, Phase};
use crate::error::{Error, Result};
use crate::model::LossDict;

/// Per-batch losses of one pass, five terms plus their sum
#[derive(Debug, Clone, PartialEq)]
pub struct EpochLosses {
    phase: Phase,
    series: [Vec<f64>; 6],
}

impl EpochLosses {
    /// Empty record for `phase`
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            series: Default::default(),
        }
    }

    /// Phase the losses were recorded in
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Record one batch; returns its `loss_sum`
    pub fn record(&mut self, losses: &LossDict) -> Result<f64> {
        Ok(self.record_values(losses.values()?))
    }

    /// Record one batch from host values in term order; returns its `loss_sum`
    pub fn record_values(&mut self, values: [f64; 5]) -> f64 {
        let sum: f64 = values.iter().sum();
        for (series, value) in self.series.iter_mut().zip(values) {
            series.push(value);
        }
        self.series[LossKind::Sum.index()].push(sum);
        sum
    }

    /// Batches recorded so far
    pub fn num_batches(&self) -> usize {
        self.series[LossKind::Sum.index()].len()
    }

    /// Per-batch values of one series
    pub fn get(&self, kind: LossKind) -> &[f64] {
        &self.series[kind.index()]
    }

    /// Arithmetic mean of every series, in [`LossKind::ALL`] order.
    ///
    /// Undefined for a pass without batches.
    pub fn means(&self) -> Result<[f64; 6]> {
        let n = self.num_batches();
        if n == 0 {
            return Err(Error::internal(format!(
                "no {} batches recorded, mean loss is undefined",
                self.phase
            )));
        }
        let mut out = [0.0; 6];
        for (slot, series) in out.iter_mut().zip(self.series.iter()) {
            *slot = series.iter().sum::<f64>() / n as f64;
        }
        Ok(out)
    }

    /// Per-batch values keyed by history key
    pub fn to_map(&self) -> BTreeMap<String, Vec<f64>> {
        LossKind::ALL
            .iter()
            .map(|kind| (kind.key(self.phase), self.get(*kind).to_vec()))
            .collect()
    }
}

/// Per-epoch mean losses: six training and six validation series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    series: BTreeMap<String, Vec<f64>>,
}

impl Default for LossHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl LossHistory {
    /// Twelve empty series
    pub fn new() -> Self {
        let series = Self::keys().into_iter().map(|k| (k, Vec::new())).collect();
        Self { series }
    }

    /// All twelve keys, training first, in reporting order
    pub fn keys() -> Vec<String> {
        [Phase::Train, Phase::Validation]
            .iter()
            .flat_map(|phase| LossKind::ALL.iter().map(move |kind| kind.key(*phase)))
            .collect()
    }

    /// Epochs recorded so far
    pub fn epochs(&self) -> usize {
        self.series.values().map(Vec::len).min().unwrap_or(0)
    }

    /// Append one epoch of means; every series grows by exactly one
    pub fn push_epoch(&mut self, train: &EpochLosses, validation: &EpochLosses) -> Result<()> {
        if train.phase() != Phase::Train || validation.phase() != Phase::Validation {
            return Err(Error::internal("epoch losses pushed with the wrong phases"));
        }
        let train_means = train.means()?;
        let val_means = validation.means()?;
        self.push_means(&train_means, &val_means)
    }

    /// Append one epoch from precomputed means in [`LossKind::ALL`] order
    pub fn push_means(&mut self, train: &[f64; 6], validation: &[f64; 6]) -> Result<()> {
        if !self.is_consistent() {
            return Err(Error::internal("loss history series have diverging lengths"));
        }
        for (phase, means) in [(Phase::Train, train), (Phase::Validation, validation)] {
            for kind in LossKind::ALL {
                self.series
                    .entry(kind.key(phase))
                    .or_default()
                    .push(means[kind.index()]);
            }
        }
        Ok(())
    }

    /// Whether all twelve series exist with equal length
    pub fn is_consistent(&self) -> bool {
        let keys = Self::keys();
        let first = self.series.get(&keys[0]).map(Vec::len);
        self.series.len() == keys.len()
            && keys.iter().all(|k| self.series.get(k).map(Vec::len) == first)
    }

    /// Per-epoch means of a series
    pub fn get(&self, phase: Phase, kind: LossKind) -> &[f64] {
        self.series
            .get(&kind.key(phase))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Per-epoch means by history key
    pub fn get_key(&self, key: &str) -> Option<&[f64]> {
        self.series.get(key).map(Vec::as_slice)
    }

    /// Most recent mean of a series
    pub fn latest(&self, phase: Phase, kind: LossKind) -> Option<f64> {
        self.get(phase, kind).last().copied()
    }

    /// All series keyed by history key
    pub fn as_map(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.series
    }
}
