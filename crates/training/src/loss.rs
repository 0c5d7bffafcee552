use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{error::to_runtime_error, TrainingError};

/// Cross entropy over `[batch, classes]` logits with optional label smoothing.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    label_smoothing: f64,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f64) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn label_smoothing(&self) -> f64 {
        self.label_smoothing
    }

    pub fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, classes) = logits.dims2().map_err(|_| {
            TrainingError::runtime(format!(
                "cross entropy expects [batch, classes] logits, got {:?}",
                logits.dims()
            ))
        })?;
        if batch == 0 || classes == 0 {
            return Err(TrainingError::runtime(
                "cross entropy requires a non-empty batch and class dimension",
            ));
        }
        if labels.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "labels shape {:?} does not match logits batch {batch}",
                labels.dims()
            )));
        }

        let labels = labels.to_device(logits.device()).map_err(to_runtime_error)?;
        let labels = match labels.dtype() {
            DType::U32 => labels,
            DType::I64 | DType::U8 => labels.to_dtype(DType::U32).map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported label dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let log_probs = ops::log_softmax(logits, D::Minus1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&labels.unsqueeze(1).map_err(to_runtime_error)?, 1)
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?;

        let per_sample = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing;
            let uniform = log_probs
                .mean(1)
                .map_err(to_runtime_error)?
                .neg()
                .map_err(to_runtime_error)?;
            let kept = nll.affine(1.0 - smoothing, 0.0).map_err(to_runtime_error)?;
            let spread = uniform.affine(smoothing, 0.0).map_err(to_runtime_error)?;
            (kept + spread).map_err(to_runtime_error)?
        } else {
            nll
        };

        let loss = per_sample.mean_all().map_err(to_runtime_error)?;
        let value = loss
            .to_dtype(DType::F64)
            .and_then(|t| t.to_vec0::<f64>())
            .map_err(to_runtime_error)?;

        Ok(LossOutput {
            loss,
            value,
            batch_size: batch,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar mean loss, still attached to the graph.
    pub loss: Tensor,
    pub value: f64,
    pub batch_size: usize,
}
