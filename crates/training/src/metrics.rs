//! Accuracy and timing bookkeeping for the training loop.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor};

/// Fraction of rows of `pred` whose argmax equals the label.
///
/// Returns 0.0 for an empty batch.
pub fn compute_acc<B: Backend>(pred: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> f32 {
    let [rows, _] = pred.dims();
    if rows == 0 {
        return 0.0;
    }
    let correct = pred
        .argmax(1)
        .reshape([rows])
        .equal(labels)
        .int()
        .sum()
        .into_scalar()
        .elem::<f32>();
    correct / rows as f32
}

/// Mean of the last `ceil(0.8 * n)` epoch times, skipping warm-up epochs.
pub fn trailing_epoch_mean(epoch_times: &[f64]) -> f64 {
    let keep = (epoch_times.len() as f64 * 0.8).ceil() as usize;
    mean(&epoch_times[epoch_times.len() - keep..])
}

/// Distinct non-NaN label values.
pub fn count_classes(labels: &[f32]) -> usize {
    // +0.0 folds -0.0 into 0.0 before comparing bit patterns.
    let mut bits: Vec<u32> = labels
        .iter()
        .filter(|l| !l.is_nan())
        .map(|l| (l + 0.0).to_bits())
        .collect();
    bits.sort_unstable();
    bits.dedup();
    bits.len()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Per-step throughput and timing.
///
/// Throughput accumulates over the whole run; step times are reset every
/// epoch.
#[derive(Debug, Default, Clone)]
pub struct StepStats {
    iter_tput: Vec<f64>,
    step_time: Vec<f64>,
}

impl StepStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_epoch(&mut self) {
        self.step_time.clear();
    }

    pub fn record(&mut self, num_seeds: usize, step_secs: f64) {
        self.step_time.push(step_secs);
        let tput = if step_secs > 0.0 {
            num_seeds as f64 / step_secs
        } else {
            0.0
        };
        self.iter_tput.push(tput);
    }

    /// Mean samples/sec, ignoring the first three steps of the run.
    pub fn mean_throughput(&self) -> f64 {
        mean(self.iter_tput.get(3..).unwrap_or(&[]))
    }

    /// Mean of the most recent `window` step times in this epoch.
    pub fn mean_recent_step_time(&self, window: usize) -> f64 {
        let start = self.step_time.len().saturating_sub(window);
        mean(&self.step_time[start..])
    }
}
