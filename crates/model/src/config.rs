use candle_core::{Device, Error, Result};
use layers::norm::DEFAULT_MOMENTUM;

/// Names accepted by [`ModelConfig::from_name`].
pub const MODEL_NAMES: &[&str] = &["lite_tiny", "lite0", "lite1", "lite2"];

/// One stage of depthwise-separable blocks sharing an output width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageConfig {
    pub out_channels: usize,
    /// Stride of the first block in the stage; later blocks use stride 1.
    pub stride: usize,
    pub repeats: usize,
}

impl StageConfig {
    const fn new(out_channels: usize, stride: usize, repeats: usize) -> Self {
        Self {
            out_channels,
            stride,
            repeats,
        }
    }
}

/// High-level configuration for assembling the conv classifier.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub num_classes: usize,
    pub input_channels: usize,
    /// Nominal square input resolution the preset was designed for.
    pub input_size: usize,
    pub stem_channels: usize,
    pub stages: Vec<StageConfig>,
    pub head_channels: usize,
    pub bn_epsilon: f64,
    pub bn_momentum: f64,
    pub device: Device,
}

impl ModelConfig {
    /// Resolves a named preset. Unknown names are rejected.
    pub fn from_name(name: &str, num_classes: usize, device: Device) -> Result<Self> {
        let (input_size, stem_channels, stages, head_channels) = match name {
            "lite_tiny" => (
                8,
                4,
                vec![StageConfig::new(8, 1, 1), StageConfig::new(16, 2, 1)],
                16,
            ),
            "lite0" => (
                224,
                32,
                vec![
                    StageConfig::new(16, 1, 1),
                    StageConfig::new(24, 2, 2),
                    StageConfig::new(40, 2, 2),
                    StageConfig::new(80, 2, 3),
                    StageConfig::new(112, 1, 3),
                    StageConfig::new(192, 2, 4),
                    StageConfig::new(320, 1, 1),
                ],
                1280,
            ),
            "lite1" => (
                240,
                32,
                vec![
                    StageConfig::new(16, 1, 1),
                    StageConfig::new(24, 2, 2),
                    StageConfig::new(40, 2, 2),
                    StageConfig::new(80, 2, 4),
                    StageConfig::new(112, 1, 4),
                    StageConfig::new(192, 2, 5),
                    StageConfig::new(320, 1, 1),
                ],
                1280,
            ),
            "lite2" => (
                260,
                32,
                vec![
                    StageConfig::new(16, 1, 1),
                    StageConfig::new(24, 2, 3),
                    StageConfig::new(48, 2, 3),
                    StageConfig::new(88, 2, 4),
                    StageConfig::new(120, 1, 4),
                    StageConfig::new(208, 2, 5),
                    StageConfig::new(352, 1, 1),
                ],
                1280,
            ),
            other => {
                return Err(Error::Msg(format!(
                    "unknown model '{}' (expected one of {})",
                    other,
                    MODEL_NAMES.join(", ")
                )))
            }
        };

        let config = Self {
            name: name.to_string(),
            num_classes,
            input_channels: 3,
            input_size,
            stem_channels,
            stages,
            head_channels,
            bn_epsilon: 1e-5,
            bn_momentum: DEFAULT_MOMENTUM,
            device,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants before any weights are allocated.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Msg("num_classes must be greater than zero".into()));
        }
        if self.input_channels == 0 || self.stem_channels == 0 || self.head_channels == 0 {
            return Err(Error::Msg("channel counts must be greater than zero".into()));
        }
        if self.stages.is_empty() {
            return Err(Error::Msg("model requires at least one stage".into()));
        }
        let mut reduction = 2usize;
        for (idx, stage) in self.stages.iter().enumerate() {
            if stage.out_channels == 0 || stage.repeats == 0 {
                return Err(Error::Msg(format!(
                    "stage {} must have non-zero width and repeats",
                    idx
                )));
            }
            if !matches!(stage.stride, 1 | 2) {
                return Err(Error::Msg(format!(
                    "stage {} stride must be 1 or 2 (got {})",
                    idx, stage.stride
                )));
            }
            reduction *= stage.stride;
        }
        if reduction > self.input_size {
            return Err(Error::Msg(format!(
                "input size {} is smaller than the total downsampling factor {}",
                self.input_size, reduction
            )));
        }
        if self.bn_epsilon <= 0.0 {
            return Err(Error::Msg("bn_epsilon must be positive".into()));
        }
        if !(self.bn_momentum > 0.0 && self.bn_momentum <= 1.0) {
            return Err(Error::Msg("bn_momentum must be in (0, 1]".into()));
        }
        Ok(())
    }
}
