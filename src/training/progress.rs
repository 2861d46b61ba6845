//! Progress bars for training and validation passes

use indicatif::{ProgressBar, ProgressStyle};

use crate::training::metrics::Phase;

/// Progress of one pass over a loader
pub struct PassProgress {
    bar: ProgressBar,
    label: String,
}

impl PassProgress {
    /// Bar with `total` batches; hidden when `visible` is false
    pub fn new(phase: Phase, epoch: usize, total: usize, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        let style = ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▇▆▅▄▃▂▁  ");
        bar.set_style(style);
        let label = format!("epoch {epoch} {phase}");
        bar.set_message(label.clone());
        Self { bar, label }
    }

    /// Advance one batch, showing its summed loss
    pub fn advance(&self, loss_sum: f64) {
        self.bar.set_message(format!("{} loss_sum={loss_sum:.4}", self.label));
        self.bar.inc(1);
    }

    /// Batches completed
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Finish and clear the bar
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Drop for PassProgress {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.abandon();
        }
    }
}
