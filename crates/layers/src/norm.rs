//! Batch normalisation over `(batch, channels, height, width)` inputs.
//!
//! Training-mode forwards normalise with the statistics of the current batch
//! and fold them into running buffers:
//! `running = (1 - momentum) * running + momentum * batch_statistic`, where
//! the variance buffer receives the unbiased estimate. Inference-mode forwards
//! read the running buffers and never write them.
//!
//! The momentum is mutable so callers can anneal it. Setting `momentum = 1 / k`
//! before the k-th batch turns the buffers into a plain cumulative average of
//! every batch seen since `k = 1`.

use candle_core::{DType, Error, Result, Tensor, Var};
use candle_nn::{Init, VarBuilder};

use crate::checks;

/// Momentum used by freshly constructed layers.
pub const DEFAULT_MOMENTUM: f64 = 0.1;

/// Configuration for a [`BatchNorm2d`] layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormConfig {
    /// Number of channels being normalised.
    pub num_features: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Weight given to the current batch when updating running statistics.
    pub momentum: f64,
}

impl BatchNormConfig {
    /// Creates a configuration with the conventional `eps = 1e-5`, `momentum = 0.1`.
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            epsilon: 1e-5,
            momentum: DEFAULT_MOMENTUM,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.num_features == 0 {
            return Err(Error::Msg(
                "batch norm requires at least one feature".into(),
            ));
        }
        if self.epsilon <= 0.0 {
            return Err(Error::Msg("batch norm epsilon must be positive".into()));
        }
        validate_momentum(self.momentum)
    }
}

/// Per-channel batch normalisation with learnable affine parameters and
/// running statistics buffers.
#[derive(Debug)]
pub struct BatchNorm2d {
    config: BatchNormConfig,
    weight: Tensor,
    bias: Tensor,
    running_mean: Var,
    running_var: Var,
    momentum: f64,
    training: bool,
}

impl BatchNorm2d {
    /// Registers `weight` (ones) and `bias` (zeros) through `vb` so they are
    /// trained, and allocates running buffers outside of the var map.
    pub fn new(config: BatchNormConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let features = config.num_features;
        let weight = vb.get_with_hints(features, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(features, "bias", Init::Const(0.0))?;
        let running_mean = Var::zeros(features, DType::F32, vb.device())?;
        let running_var = Var::ones(features, DType::F32, vb.device())?;

        Ok(Self {
            momentum: config.momentum,
            config,
            weight,
            bias,
            running_mean,
            running_var,
            training: true,
        })
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    /// Replaces the running-statistics momentum. Must lie in `(0, 1]`.
    pub fn set_momentum(&mut self, momentum: f64) -> Result<()> {
        validate_momentum(momentum)?;
        self.momentum = momentum;
        Ok(())
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn running_mean(&self) -> &Var {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Var {
        &self.running_var
    }

    /// Non-trainable state, keyed by the suffix used in checkpoints.
    pub fn buffers(&self) -> [(&'static str, &Var); 2] {
        [
            ("running_mean", &self.running_mean),
            ("running_var", &self.running_var),
        ]
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (batch, channels, height, width) =
            checks::expect_nchw("batch_norm.input", input, self.config.num_features)?;
        checks::expect_dtype_in("batch_norm.input", input, &[DType::F32])?;
        let stat_shape = (1, channels, 1, 1);

        if self.training {
            let count = batch * height * width;
            if count < 2 {
                return Err(Error::Msg(format!(
                    "batch norm needs more than one value per channel in training mode, got input {:?}",
                    input.dims()
                )));
            }
            let mean = channel_mean(input)?;
            let centered = input.broadcast_sub(&mean)?;
            let variance = channel_mean(&centered.sqr()?)?;
            let denom = (variance.clone() + self.config.epsilon)?.sqrt()?;
            let normalized = centered.broadcast_div(&denom)?;
            self.update_running_stats(&mean, &variance, count)?;
            self.apply_affine(&normalized, stat_shape)
        } else {
            let mean = self.running_mean.as_tensor().reshape(stat_shape)?;
            let variance = self.running_var.as_tensor().reshape(stat_shape)?;
            let denom = (variance + self.config.epsilon)?.sqrt()?;
            let normalized = input.broadcast_sub(&mean)?.broadcast_div(&denom)?;
            self.apply_affine(&normalized, stat_shape)
        }
    }

    fn apply_affine(
        &self,
        normalized: &Tensor,
        stat_shape: (usize, usize, usize, usize),
    ) -> Result<Tensor> {
        let weight = self.weight.reshape(stat_shape)?;
        let bias = self.bias.reshape(stat_shape)?;
        normalized.broadcast_mul(&weight)?.broadcast_add(&bias)
    }

    fn update_running_stats(&self, mean: &Tensor, variance: &Tensor, count: usize) -> Result<()> {
        let momentum = self.momentum;
        let batch_mean = mean.flatten_all()?;
        let unbiased = variance
            .flatten_all()?
            .affine(count as f64 / (count - 1) as f64, 0.0)?;

        let next_mean = (self.running_mean.as_tensor().affine(1.0 - momentum, 0.0)?
            + batch_mean.affine(momentum, 0.0)?)?;
        let next_var = (self.running_var.as_tensor().affine(1.0 - momentum, 0.0)?
            + unbiased.affine(momentum, 0.0)?)?;

        self.running_mean.set(&next_mean)?;
        self.running_var.set(&next_var)
    }
}

// Reduces over batch and spatial axes, keeping a `(1, C, 1, 1)` layout.
fn channel_mean(tensor: &Tensor) -> Result<Tensor> {
    tensor.mean_keepdim(0)?.mean_keepdim(2)?.mean_keepdim(3)
}

fn validate_momentum(momentum: f64) -> Result<()> {
    if momentum > 0.0 && momentum <= 1.0 {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "batch norm momentum must be in (0, 1], got {momentum}"
        )))
    }
}
