//! Loss bookkeeping for training and validation
//!
//! Each pass records the five detector losses plus their sum for every batch
//! ([`EpochLosses`]); the orchestrator folds the per-epoch means into a
//! [`LossHistory`] of twelve series, which is also what the loss curve plots.

pub mod history;
pub mod plot;

pub use history::{EpochLosses, LossHistory};
pub use plot::render;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::LossTerm;

/// Which pass a loss was recorded in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Training pass
    Train,
    /// Validation pass
    Validation,
}

impl Phase {
    /// Key prefix of the phase's series
    pub fn prefix(self) -> &'static str {
        match self {
            Phase::Train => "",
            Phase::Validation => "val_",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => f.write_str("train"),
            Phase::Validation => f.write_str("validation"),
        }
    }
}

/// One recorded loss series: a detector loss term or their sum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LossKind {
    /// A single detector loss term
    Term(LossTerm),
    /// Sum of all terms
    Sum,
}

impl LossKind {
    /// Series in reporting order: the five terms, then the sum
    pub const ALL: [LossKind; 6] = [
        LossKind::Term(LossTerm::Classifier),
        LossKind::Term(LossTerm::BoxReg),
        LossKind::Term(LossTerm::Mask),
        LossKind::Term(LossTerm::Objectness),
        LossKind::Term(LossTerm::RpnBoxReg),
        LossKind::Sum,
    ];

    /// Unprefixed series name
    pub fn name(self) -> &'static str {
        match self {
            LossKind::Term(term) => term.name(),
            LossKind::Sum => "loss_sum",
        }
    }

    /// Position in [`LossKind::ALL`]
    pub fn index(self) -> usize {
        match self {
            LossKind::Term(term) => term.index(),
            LossKind::Sum => LossTerm::ALL.len(),
        }
    }

    /// History key of this series in `phase`, e.g. `val_loss_mask`
    pub fn key(self, phase: Phase) -> String {
        format!("{}{}", phase.prefix(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(LossKind::Sum.key(Phase::Train), "loss_sum");
        assert_eq!(LossKind::Sum.key(Phase::Validation), "val_loss_sum");
        assert_eq!(
            LossKind::Term(LossTerm::RpnBoxReg).key(Phase::Validation),
            "val_loss_rpn_box_reg"
        );
    }

    #[test]
    fn test_indices_follow_reporting_order() {
        for (i, kind) in LossKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
