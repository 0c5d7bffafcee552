use candle_core::{Result, Tensor, Var};
use candle_nn::{conv2d_no_bias, Conv2d, Conv2dConfig, Module, VarBuilder};
use layers::{
    activations::ActivationKind,
    norm::{BatchNorm2d, BatchNormConfig},
};

use crate::config::ModelConfig;

/// Shape of a single convolution inside a [`ConvBnAct`] unit.
#[derive(Debug, Clone, Copy)]
pub struct ConvSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub groups: usize,
    pub activation: ActivationKind,
}

/// Convolution followed by batch norm and an activation.
#[derive(Debug)]
pub struct ConvBnAct {
    name: String,
    conv: Conv2d,
    norm: BatchNorm2d,
    activation: ActivationKind,
}

impl ConvBnAct {
    pub fn new(name: &str, spec: ConvSpec, model_cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: spec.kernel / 2,
            stride: spec.stride,
            groups: spec.groups,
            ..Default::default()
        };
        let conv = conv2d_no_bias(
            spec.in_channels,
            spec.out_channels,
            spec.kernel,
            conv_cfg,
            vb.pp("conv"),
        )?;

        let mut norm_cfg = BatchNormConfig::new(spec.out_channels);
        norm_cfg.epsilon = model_cfg.bn_epsilon;
        norm_cfg.momentum = model_cfg.bn_momentum;
        let norm = BatchNorm2d::new(norm_cfg, vb.pp("bn"))?;

        Ok(Self {
            name: name.to_string(),
            conv,
            norm,
            activation: spec.activation,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let hidden = self.conv.forward(input)?;
        let hidden = self.norm.forward(&hidden)?;
        self.activation.forward(&hidden)
    }

    pub fn norm(&self) -> &BatchNorm2d {
        &self.norm
    }

    pub fn norm_mut(&mut self) -> &mut BatchNorm2d {
        &mut self.norm
    }

    /// Running statistics keyed as `<unit>.bn.<buffer>`.
    pub fn named_buffers(&self) -> Vec<(String, Var)> {
        self.norm
            .buffers()
            .into_iter()
            .map(|(suffix, var)| (format!("{}.bn.{}", self.name, suffix), var.clone()))
            .collect()
    }
}

/// Depthwise 3x3 conv then pointwise 1x1 projection, with an identity
/// shortcut when the block preserves shape.
#[derive(Debug)]
pub struct SeparableBlock {
    depthwise: ConvBnAct,
    pointwise: ConvBnAct,
    residual: bool,
}

impl SeparableBlock {
    pub fn new(
        name: &str,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        model_cfg: &ModelConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let depthwise = ConvBnAct::new(
            &format!("{name}.depthwise"),
            ConvSpec {
                in_channels,
                out_channels: in_channels,
                kernel: 3,
                stride,
                groups: in_channels,
                activation: ActivationKind::Relu6,
            },
            model_cfg,
            vb.pp("depthwise"),
        )?;
        let pointwise = ConvBnAct::new(
            &format!("{name}.pointwise"),
            ConvSpec {
                in_channels,
                out_channels,
                kernel: 1,
                stride: 1,
                groups: 1,
                activation: ActivationKind::Identity,
            },
            model_cfg,
            vb.pp("pointwise"),
        )?;

        Ok(Self {
            depthwise,
            pointwise,
            residual: stride == 1 && in_channels == out_channels,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let hidden = self.depthwise.forward(input)?;
        let hidden = self.pointwise.forward(&hidden)?;
        if self.residual {
            input + hidden
        } else {
            Ok(hidden)
        }
    }

    pub fn units(&self) -> [&ConvBnAct; 2] {
        [&self.depthwise, &self.pointwise]
    }

    pub fn units_mut(&mut self) -> [&mut ConvBnAct; 2] {
        [&mut self.depthwise, &mut self.pointwise]
    }
}
