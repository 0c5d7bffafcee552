use candle_core::{DType, Error, Result, Tensor, Var};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use layers::{activations::ActivationKind, checks};

use crate::{
    block::{ConvBnAct, ConvSpec, SeparableBlock},
    config::ModelConfig,
};

/// Depthwise-separable image classifier assembled from the shared layers.
///
/// Trainable weights live in an owned [`VarMap`]; batch-norm running
/// statistics are buffers outside of it so optimizers never touch them.
pub struct Model {
    config: ModelConfig,
    varmap: VarMap,
    stem: ConvBnAct,
    blocks: Vec<SeparableBlock>,
    head: ConvBnAct,
    classifier: Linear,
    training: bool,
}

impl Model {
    /// Builds the model and its component blocks according to `config`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &config.device);

        let stem = ConvBnAct::new(
            "stem",
            ConvSpec {
                in_channels: config.input_channels,
                out_channels: config.stem_channels,
                kernel: 3,
                stride: 2,
                groups: 1,
                activation: ActivationKind::Relu6,
            },
            &config,
            vb.pp("stem"),
        )?;

        let mut blocks = Vec::new();
        let mut in_channels = config.stem_channels;
        for stage in &config.stages {
            for repeat in 0..stage.repeats {
                let index = blocks.len();
                let stride = if repeat == 0 { stage.stride } else { 1 };
                let name = format!("blocks.{index}");
                blocks.push(SeparableBlock::new(
                    &name,
                    in_channels,
                    stage.out_channels,
                    stride,
                    &config,
                    vb.pp("blocks").pp(index.to_string()),
                )?);
                in_channels = stage.out_channels;
            }
        }

        let head = ConvBnAct::new(
            "head",
            ConvSpec {
                in_channels,
                out_channels: config.head_channels,
                kernel: 1,
                stride: 1,
                groups: 1,
                activation: ActivationKind::Relu6,
            },
            &config,
            vb.pp("head"),
        )?;
        let classifier = linear(config.head_channels, config.num_classes, vb.pp("classifier"))?;

        log::debug!(
            "built model '{}' with {} blocks for {} classes",
            config.name,
            blocks.len(),
            config.num_classes
        );

        Ok(Self {
            config,
            varmap,
            stem,
            blocks,
            head,
            classifier,
            training: true,
        })
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Produces logits shaped `(batch, num_classes)` for `(batch, C, H, W)` images.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        checks::expect_nchw("model.input", images, self.config.input_channels)?;
        let mut hidden = self.stem.forward(images)?;
        for block in &self.blocks {
            hidden = block.forward(&hidden)?;
        }
        let hidden = self.head.forward(&hidden)?;
        let pooled = hidden.mean(3)?.mean(2)?;
        self.classifier.forward(&pooled)
    }

    /// Trainable parameters sorted by name.
    pub fn parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|err| Error::Msg(format!("model parameters unavailable: {err}")))?;
        let mut named = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect::<Vec<_>>();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    /// Batch-norm running statistics, in network order.
    pub fn buffers(&self) -> Vec<(String, Var)> {
        self.units()
            .into_iter()
            .flat_map(|unit| unit.named_buffers())
            .collect()
    }

    /// Everything a checkpoint must capture: parameters followed by buffers.
    pub fn state_vars(&self) -> Result<Vec<(String, Var)>> {
        let mut vars = self.parameters()?;
        vars.extend(self.buffers());
        Ok(vars)
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switches every batch-norm layer between batch and running statistics.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        for unit in self.units_mut() {
            unit.norm_mut().set_training(training);
        }
    }

    /// Applies one momentum to every batch-norm layer.
    pub fn set_norm_momentum(&mut self, momentum: f64) -> Result<()> {
        for unit in self.units_mut() {
            unit.norm_mut().set_momentum(momentum)?;
        }
        Ok(())
    }

    pub fn norm_momenta(&self) -> Vec<f64> {
        self.units()
            .into_iter()
            .map(|unit| unit.norm().momentum())
            .collect()
    }

    fn units(&self) -> Vec<&ConvBnAct> {
        let mut units = vec![&self.stem];
        for block in &self.blocks {
            units.extend(block.units());
        }
        units.push(&self.head);
        units
    }

    fn units_mut(&mut self) -> Vec<&mut ConvBnAct> {
        let mut units = vec![&mut self.stem];
        for block in &mut self.blocks {
            units.extend(block.units_mut());
        }
        units.push(&mut self.head);
        units
    }
}
