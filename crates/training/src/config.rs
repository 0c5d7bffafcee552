use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::TrainingError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSelection,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.name.trim().is_empty() {
            errors.push("model.name must not be empty".to_string());
        }

        if self.model.num_classes == 0 {
            errors.push("model.num_classes must be greater than 0".to_string());
        }

        if self.data.train.as_os_str().is_empty() {
            errors.push("data.train must not be empty".to_string());
        }

        if self.data.validation.as_os_str().is_empty() {
            errors.push("data.validation must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if !(self.optimizer.learning_rate > 0.0) {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.label_smoothing) {
            errors.push("optimizer.label_smoothing must be in [0, 1)".to_string());
        }

        let schedule = &self.schedule;
        for (name, value) in [
            ("schedule.total_iters", schedule.total_iters),
            ("schedule.display_interval", schedule.display_interval),
            ("schedule.val_interval", schedule.val_interval),
            ("schedule.save_interval", schedule.save_interval),
            ("schedule.val_batches", schedule.val_batches),
            ("schedule.reference_dataset_size", schedule.reference_dataset_size),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        if let Some(0) = schedule.stabilization_iters {
            errors.push("schedule.stabilization_iters must be greater than 0".to_string());
        }

        if self.runtime.checkpoint.directory.as_os_str().is_empty() {
            errors.push("runtime.checkpoint.directory must not be empty".to_string());
        }

        if let Some(0) = self.runtime.checkpoint.max_keep {
            errors.push("runtime.checkpoint.max_keep must be greater than 0".to_string());
        }

        if let Some(path) = &self.runtime.logging.log_file {
            if path.as_os_str().is_empty() {
                errors.push("runtime.logging.log_file must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Phase-B length: the configured override, or enough batches to cover the
    /// reference dataset once.
    pub fn stabilization_iters(&self) -> u64 {
        self.schedule.stabilization_iters.unwrap_or_else(|| {
            let batch = self.data.batch_size.max(1) as u64;
            self.schedule.reference_dataset_size.div_ceil(batch)
        })
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSelection {
    #[serde(default = "default_model_name")]
    pub name: String,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

impl Default for ModelSelection {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            num_classes: default_num_classes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Safetensors file holding `images` and `labels` for training.
    pub train: PathBuf,
    pub validation: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train, base);
        absolutize_in_place(&mut self.validation, base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f64,
    /// Extra name patterns exempt from weight decay; rank <= 1 tensors always are.
    #[serde(default)]
    pub weight_decay_exclude: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            label_smoothing: default_label_smoothing(),
            weight_decay_exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_total_iters")]
    pub total_iters: u64,
    #[serde(default = "default_display_interval")]
    pub display_interval: u64,
    #[serde(default = "default_val_interval")]
    pub val_interval: u64,
    #[serde(default = "default_save_interval")]
    pub save_interval: u64,
    #[serde(default = "default_val_batches")]
    pub val_batches: u64,
    #[serde(default = "default_reference_dataset_size")]
    pub reference_dataset_size: u64,
    #[serde(default)]
    pub stabilization_iters: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            total_iters: default_total_iters(),
            display_interval: default_display_interval(),
            val_interval: default_val_interval(),
            save_interval: default_save_interval(),
            val_batches: default_val_batches(),
            reference_dataset_size: default_reference_dataset_size(),
            stabilization_iters: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Seeds the loader shuffles and, on CUDA and Metal, the device RNG.
    /// candle's CPU backend cannot be seeded, so CPU weight initialization
    /// differs between runs regardless of this value.
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub device: DeviceChoice,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            device: DeviceChoice::default(),
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.checkpoint.directory, base);
        if let Some(path) = self.logging.log_file.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceChoice {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub directory: PathBuf,
    /// Resume from the newest checkpoint in `directory` when one exists.
    #[serde(default)]
    pub auto_continue: bool,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            directory: default_checkpoint_dir(),
            auto_continue: false,
            max_keep: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            log_file: None,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_model_name() -> String {
    "lite0".to_string()
}

fn default_num_classes() -> usize {
    1000
}

fn default_batch_size() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_momentum() -> f64 {
    0.9
}

fn default_weight_decay() -> f64 {
    4e-5
}

fn default_label_smoothing() -> f64 {
    0.1
}

fn default_total_iters() -> u64 {
    10_000
}

fn default_display_interval() -> u64 {
    20
}

fn default_val_interval() -> u64 {
    10_000
}

fn default_save_interval() -> u64 {
    10_000
}

fn default_val_batches() -> u64 {
    5
}

fn default_reference_dataset_size() -> u64 {
    1_280_000
}

fn default_seed() -> u64 {
    42
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_tensorboard_flush() -> usize {
    20
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[data]
train = "data/train.safetensors"
validation = "data/val.safetensors"
"#;

    #[test]
    fn defaults_follow_reference_recipe() -> Result<(), TrainingError> {
        let config: TrainingConfig = toml::from_str(MINIMAL)?;
        config.validate()?;

        assert_eq!(config.model.name, "lite0");
        assert_eq!(config.model.num_classes, 1000);
        assert_eq!(config.data.batch_size, 64);
        assert_eq!(config.optimizer.learning_rate, 1e-4);
        assert_eq!(config.optimizer.momentum, 0.9);
        assert_eq!(config.optimizer.weight_decay, 4e-5);
        assert_eq!(config.optimizer.label_smoothing, 0.1);
        assert_eq!(config.schedule.total_iters, 10_000);
        assert_eq!(config.schedule.display_interval, 20);
        assert_eq!(config.schedule.val_batches, 5);
        assert!(!config.runtime.checkpoint.auto_continue);
        assert_eq!(config.runtime.device, DeviceChoice::Auto);
        Ok(())
    }

    #[test]
    fn stabilization_length_rounds_up() -> Result<(), TrainingError> {
        let mut config: TrainingConfig = toml::from_str(MINIMAL)?;
        assert_eq!(config.stabilization_iters(), 20_000);

        config.data.batch_size = 3;
        config.schedule.reference_dataset_size = 10;
        assert_eq!(config.stabilization_iters(), 4);

        config.schedule.stabilization_iters = Some(7);
        assert_eq!(config.stabilization_iters(), 7);
        Ok(())
    }

    #[test]
    fn validation_collects_every_problem() -> Result<(), TrainingError> {
        let mut config: TrainingConfig = toml::from_str(MINIMAL)?;
        config.data.batch_size = 0;
        config.schedule.save_interval = 0;
        config.optimizer.label_smoothing = 1.0;

        match config.validate() {
            Err(TrainingError::Validation(errors)) => {
                assert_eq!(errors.len(), 3, "{errors:?}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn relative_paths_resolve_against_config_directory() -> Result<(), TrainingError> {
        let mut config: TrainingConfig = toml::from_str(MINIMAL)?;
        config.apply_base_path(Path::new("/runs/exp"));
        assert_eq!(config.data.train, PathBuf::from("/runs/exp/data/train.safetensors"));
        assert_eq!(
            config.runtime.checkpoint.directory,
            PathBuf::from("/runs/exp/models")
        );
        Ok(())
    }
}
