#![allow(dead_code)]

use std::{collections::HashMap, path::Path};

use candle_core::{Device, Tensor};
use training::{
    config::{
        CheckpointConfig, DataConfig, DeviceChoice, LoggingConfig, ModelSelection,
        OptimizerConfig, RuntimeConfig, ScheduleConfig,
    },
    TensorDataset, TrainingConfig,
};

pub const CHANNELS: usize = 3;
pub const SIZE: usize = 8;

/// Deterministic images whose brightness depends on the label.
pub fn synthetic_tensors(samples: usize, classes: usize) -> anyhow::Result<(Tensor, Tensor)> {
    let per_sample = CHANNELS * SIZE * SIZE;
    let labels: Vec<u32> = (0..samples).map(|i| (i % classes) as u32).collect();
    let mut pixels = Vec::with_capacity(samples * per_sample);
    for (sample, label) in labels.iter().enumerate() {
        for offset in 0..per_sample {
            let noise = ((sample * 31 + offset * 17) % 97) as f32 / 97.0;
            pixels.push(noise + *label as f32 * 0.75);
        }
    }
    let device = Device::Cpu;
    let images = Tensor::from_vec(pixels, (samples, CHANNELS, SIZE, SIZE), &device)?;
    let labels = Tensor::from_vec(labels, samples, &device)?;
    Ok((images, labels))
}

pub fn synthetic_dataset(samples: usize, classes: usize) -> anyhow::Result<TensorDataset> {
    let (images, labels) = synthetic_tensors(samples, classes)?;
    Ok(TensorDataset::new(images, labels)?)
}

pub fn write_dataset(path: &Path, samples: usize, classes: usize) -> anyhow::Result<()> {
    let (images, labels) = synthetic_tensors(samples, classes)?;
    let tensors = HashMap::from([
        ("images".to_string(), images),
        ("labels".to_string(), labels),
    ]);
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Small CPU run over the `lite_tiny` preset, writing into `root`.
pub fn tiny_config(root: &Path, classes: usize, batch_size: usize) -> TrainingConfig {
    TrainingConfig {
        model: ModelSelection {
            name: "lite_tiny".to_string(),
            num_classes: classes,
        },
        data: DataConfig {
            train: root.join("train.safetensors"),
            validation: root.join("val.safetensors"),
            batch_size,
            shuffle: false,
        },
        optimizer: OptimizerConfig {
            learning_rate: 0.05,
            ..OptimizerConfig::default()
        },
        schedule: ScheduleConfig {
            total_iters: 4,
            display_interval: 2,
            val_interval: 4,
            save_interval: 2,
            val_batches: 1,
            reference_dataset_size: 8,
            stabilization_iters: None,
        },
        runtime: RuntimeConfig {
            seed: 7,
            device: DeviceChoice::Cpu,
            checkpoint: CheckpointConfig {
                directory: root.join("models"),
                auto_continue: false,
                max_keep: None,
            },
            logging: LoggingConfig {
                enable_stdout: false,
                log_file: Some(root.join("train.log")),
                ..LoggingConfig::default()
            },
        },
    }
}

pub fn lines_with_prefix(log: &str, prefix: &str) -> Vec<String> {
    log.lines()
        .filter(|line| line.starts_with(prefix))
        .map(str::to_string)
        .collect()
}
