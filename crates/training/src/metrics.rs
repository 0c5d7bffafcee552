use std::time::Duration;

use candle_core::Tensor;

use crate::{error::to_runtime_error, TrainingError};

/// Weighted running average: `value = sum / count`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningMetric {
    sum: f64,
    count: u64,
}

impl RunningMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: u64) {
        self.sum += value * weight as f64;
        self.count += weight;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn value(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Top-k precision in percent for each requested `k`.
///
/// A sample counts as correct for `k` when fewer than `k` classes score
/// strictly higher than its true label.
pub fn topk_accuracy(
    logits: &Tensor,
    labels: &Tensor,
    ks: &[usize],
) -> Result<Vec<f64>, TrainingError> {
    let (batch, classes) = logits.dims2().map_err(to_runtime_error)?;
    if labels.dims() != [batch] {
        return Err(TrainingError::runtime(format!(
            "labels shape {:?} does not match logits batch {batch}",
            labels.dims()
        )));
    }
    if batch == 0 {
        return Err(TrainingError::runtime("top-k accuracy on an empty batch"));
    }

    let scores = logits
        .to_dtype(candle_core::DType::F32)
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(to_runtime_error)?;
    let labels = labels
        .to_dtype(candle_core::DType::U32)
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(to_runtime_error)?;

    let mut correct = vec![0usize; ks.len()];
    for (row, &label) in scores.iter().zip(labels.iter()) {
        let label = label as usize;
        if label >= classes {
            return Err(TrainingError::data(format!(
                "label {label} out of range for {classes} classes"
            )));
        }
        let target = row[label];
        let rank = row.iter().filter(|&&score| score > target).count();
        for (hits, &k) in correct.iter_mut().zip(ks) {
            if rank < k {
                *hits += 1;
            }
        }
    }

    Ok(correct
        .into_iter()
        .map(|hits| hits as f64 * 100.0 / batch as f64)
        .collect())
}

/// Display-window accumulator for the training loop.
#[derive(Debug, Default)]
pub struct ErrorWindow {
    loss: RunningMetric,
    top1_err: RunningMetric,
    top5_err: RunningMetric,
    data_time: Duration,
    train_time: Duration,
}

impl ErrorWindow {
    pub fn record(&mut self, sample: &StepSample) {
        self.loss.update(sample.loss, 1);
        self.top1_err.update(sample.top1_err, 1);
        self.top5_err.update(sample.top5_err, 1);
        self.data_time += sample.data_time;
        self.train_time += sample.train_time;
    }

    pub fn is_empty(&self) -> bool {
        self.loss.count() == 0
    }

    /// Averages the window and resets it.
    pub fn drain(&mut self) -> Option<WindowSummary> {
        let batches = self.loss.count();
        let summary = WindowSummary {
            loss: self.loss.value()?,
            top1_err: self.top1_err.value()?,
            top5_err: self.top5_err.value()?,
            data_time: self.data_time.as_secs_f64() / batches as f64,
            train_time: self.train_time.as_secs_f64() / batches as f64,
            batches,
        };
        *self = Self::default();
        Some(summary)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepSample {
    pub loss: f64,
    pub top1_err: f64,
    pub top5_err: f64,
    pub data_time: Duration,
    pub train_time: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowSummary {
    pub loss: f64,
    pub top1_err: f64,
    pub top5_err: f64,
    /// Mean seconds per batch.
    pub data_time: f64,
    pub train_time: f64,
    pub batches: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSummary {
    pub iteration: u64,
    pub loss: f64,
    pub top1_err: f64,
    pub top5_err: f64,
    pub duration: Duration,
}

/// Converts a precision in percent into an error rate in `[0, 1]`.
pub fn error_rate(precision_percent: f64) -> f64 {
    1.0 - precision_percent / 100.0
}
