use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{Model, ModelConfig, MODEL_NAMES};

fn tiny_model(num_classes: usize) -> Result<Model> {
    let config = ModelConfig::from_name("lite_tiny", num_classes, Device::Cpu)?;
    Ok(Model::new(config)?)
}

fn images(batch: usize) -> Result<Tensor> {
    Ok(Tensor::randn(0f32, 1.0, (batch, 3, 8, 8), &Device::Cpu)?)
}

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = tiny_model(5)?;
    let logits = model.forward(&images(4)?)?;

    assert_eq!(logits.dims(), &[4, 5]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn presets_resolve_and_unknown_names_fail() -> Result<()> {
    for name in MODEL_NAMES {
        let config = ModelConfig::from_name(name, 1000, Device::Cpu)?;
        assert_eq!(config.name, *name);
    }
    assert!(ModelConfig::from_name("resnet50", 1000, Device::Cpu).is_err());
    assert!(ModelConfig::from_name("lite0", 0, Device::Cpu).is_err());
    Ok(())
}

#[test]
fn state_vars_cover_parameters_and_running_buffers() -> Result<()> {
    let model = tiny_model(2)?;
    let params = model.parameters()?;
    let names = params.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>();

    assert!(names.contains(&"stem.conv.weight"));
    assert!(names.contains(&"stem.bn.weight"));
    assert!(names.contains(&"classifier.weight"));
    assert!(names.contains(&"classifier.bias"));
    assert!(names.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(!names.iter().any(|name| name.contains("running")));

    let buffers = model.buffers();
    assert!(buffers
        .iter()
        .any(|(name, _)| name == "blocks.0.depthwise.bn.running_mean"));
    assert!(buffers.iter().any(|(name, _)| name == "head.bn.running_var"));

    let state = model.state_vars()?;
    assert_eq!(state.len(), params.len() + buffers.len());
    Ok(())
}

#[test]
fn inference_mode_keeps_running_statistics() -> Result<()> {
    let mut model = tiny_model(3)?;
    let batch = images(4)?;

    model.forward(&batch)?;
    let stem_mean = model.buffers()[0].1.clone();
    let after_train = stem_mean.as_tensor().to_vec1::<f32>()?;
    assert!(after_train.iter().any(|value| *value != 0.0));

    model.set_training(false);
    assert!(!model.is_training());
    model.forward(&batch)?;
    let after_eval = stem_mean.as_tensor().to_vec1::<f32>()?;
    assert_eq!(after_train, after_eval);
    Ok(())
}

#[test]
fn norm_momentum_applies_to_every_layer() -> Result<()> {
    let mut model = tiny_model(2)?;
    model.set_norm_momentum(0.25)?;
    let momenta = model.norm_momenta();
    assert!(!momenta.is_empty());
    assert!(momenta.iter().all(|momentum| *momentum == 0.25));
    assert!(model.set_norm_momentum(0.0).is_err());
    Ok(())
}
