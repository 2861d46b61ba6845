//! Which checkpoint slots to write after an epoch

use tracing::debug;

use crate::training::metrics::{LossHistory, LossKind, Phase};

/// Slots to write for one epoch; the final model is always written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointDecision {
    /// Validation loss improved on the best seen so far
    pub save_best: bool,
    /// The epoch completes a periodic interval
    pub save_periodic: bool,
}

/// Best-so-far and periodic checkpoint selection
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointPolicy {
    min_loss: Option<f64>,
    periodic_every: usize,
}

impl CheckpointPolicy {
    /// Policy with no best loss yet; `periodic_every == 0` disables periodic saves
    pub fn new(periodic_every: usize) -> Self {
        Self {
            min_loss: None,
            periodic_every,
        }
    }

    /// Policy whose best loss is the lowest finite `val_loss_sum` in `history`
    pub fn from_history(history: &LossHistory, periodic_every: usize) -> Self {
        let min_loss = history
            .get(Phase::Validation, LossKind::Sum)
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(None, |best: Option<f64>, v| match best {
                Some(b) if b <= v => Some(b),
                _ => Some(v),
            });
        Self {
            min_loss,
            periodic_every,
        }
    }

    /// Lowest validation loss seen so far
    pub fn min_loss(&self) -> Option<f64> {
        self.min_loss
    }

    /// Decide the slots for `epoch` (0-based) and update the best loss.
    ///
    /// While no best loss is set the best slot is always written, whatever the
    /// value. Only a finite loss becomes the best loss, so a non-finite one
    /// never blocks later improvements.
    pub fn evaluate(&mut self, epoch: usize, val_loss_sum: f64) -> CheckpointDecision {
        let save_best = match self.min_loss {
            None => true,
            Some(min) => val_loss_sum < min,
        };
        if save_best {
            debug!(
                "validation loss improved from {:?} to {}",
                self.min_loss, val_loss_sum
            );
            if val_loss_sum.is_finite() {
                self.min_loss = Some(val_loss_sum);
            }
        }
        let save_periodic = self.periodic_every > 0 && (epoch + 1) % self.periodic_every == 0;
        CheckpointDecision {
            save_best,
            save_periodic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::metrics::EpochLosses;
    use test_case::test_case;

    #[test]
    fn test_first_finite_loss_is_best() {
        let mut policy = CheckpointPolicy::new(5);
        assert!(policy.evaluate(0, 3.0).save_best);
        assert_eq!(policy.min_loss(), Some(3.0));
    }

    #[test]
    fn test_best_requires_strict_improvement() {
        let mut policy = CheckpointPolicy::new(5);
        let saves: Vec<bool> = [3.0, 2.0, 2.0, 2.5, 1.0]
            .iter()
            .enumerate()
            .map(|(e, &v)| policy.evaluate(e, v).save_best)
            .collect();
        assert_eq!(saves, vec![true, true, false, false, true]);
        assert_eq!(policy.min_loss(), Some(1.0));
    }

    #[test]
    fn test_zero_loss_is_a_valid_minimum() {
        let mut policy = CheckpointPolicy::new(5);
        assert!(policy.evaluate(0, 0.0).save_best);
        assert!(!policy.evaluate(1, 0.5).save_best);
    }

    #[test]
    fn test_first_epoch_is_best_even_when_non_finite() {
        let mut policy = CheckpointPolicy::new(5);
        assert!(policy.evaluate(0, f64::NAN).save_best);
        assert_eq!(policy.min_loss(), None);
        assert!(policy.evaluate(1, 4.0).save_best);
        assert_eq!(policy.min_loss(), Some(4.0));
        assert!(!policy.evaluate(2, f64::INFINITY).save_best);
        assert!(!policy.evaluate(3, f64::NAN).save_best);
        assert!(policy.evaluate(4, 3.5).save_best);
    }

    #[test_case(0, false ; "first epoch")]
    #[test_case(3, false ; "fourth epoch")]
    #[test_case(4, true ; "fifth epoch")]
    #[test_case(9, true ; "tenth epoch")]
    #[test_case(10, false ; "eleventh epoch")]
    fn test_periodic(epoch: usize, expected: bool) {
        let mut policy = CheckpointPolicy::new(5);
        assert_eq!(policy.evaluate(epoch, 1.0).save_periodic, expected);
    }

    #[test]
    fn test_periodic_disabled() {
        let mut policy = CheckpointPolicy::new(0);
        assert!(!policy.evaluate(4, 1.0).save_periodic);
    }

    #[test]
    fn test_from_history_restores_minimum() {
        let mut history = LossHistory::new();
        for v in [4.0, f64::NAN, 2.0, 3.0] {
            let mut train = EpochLosses::new(Phase::Train);
            let mut val = EpochLosses::new(Phase::Validation);
            train.record_values([1.0; 5]);
            val.record_values([v, 0.0, 0.0, 0.0, 0.0]);
            history.push_epoch(&train, &val).unwrap();
        }
        let policy = CheckpointPolicy::from_history(&history, 5);
        assert_eq!(policy.min_loss(), Some(2.0));
        assert_eq!(CheckpointPolicy::from_history(&LossHistory::new(), 5).min_loss(), None);
    }
}
