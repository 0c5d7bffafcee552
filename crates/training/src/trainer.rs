use std::{
    path::Path,
    sync::Arc,
    time::Instant,
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Tensor,
};
use model::{Model, ModelConfig, MODEL_NAMES};

use crate::{
    checkpoint::{
        self, CheckpointDescriptor, CheckpointId, CheckpointSnapshot, CheckpointStore,
        DirectoryCheckpointStore, LoadedCheckpoint,
    },
    config::DeviceChoice,
    data::{CyclicBatchProvider, DataBatch, DataLoader, ShuffledBatchLoader, TensorDataset},
    error::to_runtime_error,
    logging::{Logger, LoggingSettings},
    loss::CrossEntropyLoss,
    metrics::{
        error_rate, topk_accuracy, ErrorWindow, ExponentialMovingAverage, RunningMetric,
        StepSample, ValidationSummary,
    },
    optimizer::{SgdConfig, TrainerOptimizer, TrainerOptimizerOptions},
    scheduler::{bn_momentum, LRScheduler, LinearDecay},
    TrainingConfig, TrainingError,
};

/// Tag of the checkpoint written after the stabilization phase.
pub const STABILIZED_TAG: &str = "bnps";
const MAX_TOP_K: usize = 5;

/// Number of optimizer steps applied to the current weights.
///
/// Only moves forward during training; a resume re-seeds it once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalIterationCounter(u64);

impl GlobalIterationCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn advance(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    pub fn resume_at(&mut self, iteration: u64) {
        self.0 = iteration;
    }
}

#[derive(Debug, Clone)]
pub struct MainPhaseReport {
    pub final_iteration: u64,
    pub validations: Vec<ValidationSummary>,
    pub checkpoints: Vec<CheckpointDescriptor>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub start_iteration: u64,
    pub main: MainPhaseReport,
    pub stabilized: CheckpointDescriptor,
    pub final_validation: ValidationSummary,
    pub final_iteration: u64,
}

type BoxedLoader = Box<dyn DataLoader>;

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    model: Model,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    loss: CrossEntropyLoss,
    train_data: CyclicBatchProvider<BoxedLoader>,
    val_data: CyclicBatchProvider<BoxedLoader>,
    store: Box<dyn CheckpointStore>,
    logger: Logger,
    counter: GlobalIterationCounter,
    window: ErrorWindow,
    loss_ema: ExponentialMovingAverage,
    top_k: usize,
    written: Vec<CheckpointDescriptor>,
}

impl Trainer {
    /// Builds a trainer whose datasets are read from the configured
    /// safetensors files.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        for (role, path) in [
            ("training", &config.data.train),
            ("validation", &config.data.validation),
        ] {
            if !path.is_file() {
                return Err(TrainingError::configuration(format!(
                    "{role} dataset '{}' does not exist",
                    path.display()
                )));
            }
        }

        let device = select_device(config.runtime.device, config.runtime.seed)?;
        let train = TensorDataset::from_safetensors(&config.data.train, &device)?;
        let validation = TensorDataset::from_safetensors(&config.data.validation, &device)?;
        log::info!(
            "datasets loaded: {} training and {} validation samples",
            train.len(),
            validation.len()
        );
        Self::assemble_from_datasets(config, device, train, validation)
    }

    /// Builds a trainer over in-memory datasets.
    pub fn with_datasets(
        config: TrainingConfig,
        train: TensorDataset,
        validation: TensorDataset,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.device, config.runtime.seed)?;
        Self::assemble_from_datasets(config, device, train, validation)
    }

    /// Builds a trainer over arbitrary pass-based loaders.
    pub fn with_loaders(
        config: TrainingConfig,
        train: BoxedLoader,
        validation: BoxedLoader,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.device, config.runtime.seed)?;
        Self::assemble(config, device, train, validation)
    }

    /// Replaces the directory store derived from the configuration.
    pub fn with_checkpoint_store(mut self, store: Box<dyn CheckpointStore>) -> Self {
        self.store = store;
        self
    }

    fn assemble_from_datasets(
        config: TrainingConfig,
        device: Device,
        train: TensorDataset,
        validation: TensorDataset,
    ) -> Result<Self, TrainingError> {
        for (role, dataset) in [("training", &train), ("validation", &validation)] {
            dataset.check_labels(config.model.num_classes).map_err(|err| {
                TrainingError::configuration(format!("{role} dataset: {err}"))
            })?;
        }

        let batch_size = config.data.batch_size;
        let seed = config.runtime.seed;
        let train: BoxedLoader = Box::new(ShuffledBatchLoader::new(
            Arc::new(train),
            batch_size,
            config.data.shuffle,
            seed,
        )?);
        let validation: BoxedLoader = Box::new(ShuffledBatchLoader::new(
            Arc::new(validation),
            batch_size,
            false,
            seed,
        )?);
        Self::assemble(config, device, train, validation)
    }

    fn assemble(
        config: TrainingConfig,
        device: Device,
        train: BoxedLoader,
        validation: BoxedLoader,
    ) -> Result<Self, TrainingError> {
        let name = config.model.name.as_str();
        if !MODEL_NAMES.contains(&name) {
            return Err(TrainingError::configuration(format!(
                "unknown model '{name}' (expected one of {})",
                MODEL_NAMES.join(", ")
            )));
        }
        let model_config = ModelConfig::from_name(name, config.model.num_classes, device.clone())
            .map_err(|err| TrainingError::configuration(err.to_string()))?;
        let model = Model::new(model_config).map_err(|err| {
            TrainingError::initialization(format!("failed to build model '{name}': {err}"))
        })?;

        let named_parameters = model.parameters().map_err(to_runtime_error)?;
        log::info!(
            "model '{}' ready with {} parameter tensors",
            name,
            named_parameters.len()
        );
        let optimizer = TrainerOptimizer::new(
            named_parameters,
            SgdConfig::from(&config.optimizer),
            TrainerOptimizerOptions {
                weight_decay_exclude: config.optimizer.weight_decay_exclude.clone(),
            },
        )?;
        let scheduler: Box<dyn LRScheduler> = Box::new(LinearDecay::from_config(&config)?);
        let loss = CrossEntropyLoss::new().with_label_smoothing(config.optimizer.label_smoothing)?;

        let store: Box<dyn CheckpointStore> = Box::new(DirectoryCheckpointStore::new(
            config.runtime.checkpoint.directory.clone(),
            config.runtime.checkpoint.max_keep,
        ));
        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;
        let top_k = config.model.num_classes.min(MAX_TOP_K);

        Ok(Self {
            config,
            device,
            model,
            optimizer,
            scheduler,
            loss,
            train_data: CyclicBatchProvider::new(train),
            val_data: CyclicBatchProvider::new(validation),
            store,
            logger,
            counter: GlobalIterationCounter::new(),
            window: ErrorWindow::default(),
            loss_ema: ExponentialMovingAverage::new(0.1),
            top_k,
            written: Vec::new(),
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn iteration(&self) -> u64 {
        self.counter.get()
    }

    /// Every checkpoint this trainer has written, oldest first.
    pub fn checkpoints_written(&self) -> &[CheckpointDescriptor] {
        &self.written
    }

    /// Restores the newest checkpoint when auto-continue is enabled and one
    /// exists; otherwise starts from iteration 0 with fresh weights.
    ///
    /// Once this trainer has taken a step the call is a no-op, so the counter
    /// never moves backwards.
    pub fn resume_or_init(&mut self) -> Result<u64, TrainingError> {
        let current = self.counter.get();
        if current > 0 {
            log::debug!("trainer already at iteration {current}; nothing to resume");
            return Ok(current);
        }
        if !self.config.runtime.checkpoint.auto_continue {
            log::info!("auto-continue disabled; training from scratch");
            return Ok(current);
        }

        let ids = self.store.list()?;
        let Some(id) = checkpoint::latest(&ids).cloned() else {
            log::info!("no checkpoint found; training from scratch");
            return Ok(self.counter.get());
        };

        let loaded = self.store.load(&id, &self.device)?;
        self.restore(loaded, true)?;
        Ok(self.counter.get())
    }

    /// Runs up to `budget` optimizer steps, never past `total_iters`.
    pub fn run_training_phase(&mut self, budget: u64) -> Result<u64, TrainingError> {
        let total_iters = self.config.schedule.total_iters;
        let save_interval = self.config.schedule.save_interval;
        self.model.set_training(true);

        let mut steps = 0;
        while steps < budget && self.counter.get() < total_iters {
            self.train_step()?;
            steps += 1;

            let iteration = self.counter.get();
            if iteration % save_interval == 0 {
                self.save_checkpoint(CheckpointId::untagged(iteration))?;
            }
        }
        Ok(self.counter.get())
    }

    /// Alternates training blocks and validation until `total_iters`, then
    /// checkpoints the end of the phase if no interval save landed on it.
    pub fn run_main_phase(&mut self) -> Result<MainPhaseReport, TrainingError> {
        let total_iters = self.config.schedule.total_iters;
        let val_interval = self.config.schedule.val_interval;
        let save_interval = self.config.schedule.save_interval;
        let first_checkpoint = self.written.len();
        let trained = self.counter.get() < total_iters;
        let mut validations = Vec::new();

        while self.counter.get() < total_iters {
            let current = self.counter.get();
            let boundary = (current / val_interval + 1) * val_interval;
            let target = boundary.min(total_iters);
            self.run_training_phase(target - current)?;
            validations.push(self.validate()?);
        }

        if trained && total_iters % save_interval != 0 {
            self.save_checkpoint(CheckpointId::untagged(total_iters))?;
        }

        Ok(MainPhaseReport {
            final_iteration: self.counter.get(),
            validations,
            checkpoints: self.written[first_checkpoint..].to_vec(),
        })
    }

    /// One pass with normalization momentum annealed to `1/k`, ending in the
    /// tagged final checkpoint.
    pub fn run_stabilization_phase(&mut self) -> Result<CheckpointDescriptor, TrainingError> {
        let iterations = self.config.stabilization_iters();
        let default_momentum = self.model.config().bn_momentum;
        self.logger.log_message(&format!(
            "stabilizing normalization statistics for {iterations} iterations"
        ))?;

        self.model.set_training(true);
        let outcome = self.stabilization_steps(iterations);
        let reset = self
            .model
            .set_norm_momentum(default_momentum)
            .map_err(to_runtime_error);
        outcome?;
        reset?;

        let id = CheckpointId::tagged(self.config.schedule.total_iters, STABILIZED_TAG);
        self.save_checkpoint(id)
    }

    fn stabilization_steps(&mut self, iterations: u64) -> Result<(), TrainingError> {
        for phase_step in 1..=iterations {
            self.model
                .set_norm_momentum(bn_momentum(phase_step))
                .map_err(to_runtime_error)?;
            self.train_step()?;
        }
        Ok(())
    }

    /// Evaluates `val_batches` batches in inference mode. Weights, running
    /// statistics, optimizer state and the counter are left untouched.
    pub fn validate(&mut self) -> Result<ValidationSummary, TrainingError> {
        let was_training = self.model.is_training();
        self.model.set_training(false);
        let outcome = self.evaluate_batches();
        self.model.set_training(was_training);

        let summary = outcome?;
        self.logger.log_validation(&summary)?;
        Ok(summary)
    }

    fn evaluate_batches(&mut self) -> Result<ValidationSummary, TrainingError> {
        let started = Instant::now();
        let mut loss = RunningMetric::new();
        let mut top1 = RunningMetric::new();
        let mut top5 = RunningMetric::new();

        for _ in 0..self.config.schedule.val_batches {
            let batch = self.val_data.next()?;
            let (images, labels) = self.batch_to_device(&batch)?;
            let logits = self
                .model
                .forward(&images)
                .map_err(to_runtime_error)?
                .detach();
            let output = self.loss.compute(&logits, &labels)?;
            let precision = topk_accuracy(&logits, &labels, &[1, self.top_k])?;

            let weight = output.batch_size as u64;
            loss.update(output.value, weight);
            top1.update(precision[0], weight);
            top5.update(precision[1], weight);
        }

        let empty = || TrainingError::runtime("validation processed no samples");
        Ok(ValidationSummary {
            iteration: self.counter.get(),
            loss: loss.value().ok_or_else(empty)?,
            top1_err: error_rate(top1.value().ok_or_else(empty)?),
            top5_err: error_rate(top5.value().ok_or_else(empty)?),
            duration: started.elapsed(),
        })
    }

    /// Full run: resume, main phase, stabilization, final validation.
    pub fn run(&mut self) -> Result<RunReport, TrainingError> {
        let start_iteration = self.resume_or_init()?;
        let main = self.run_main_phase()?;
        let stabilized = self.run_stabilization_phase()?;
        let final_validation = self.validate()?;
        self.logger.flush()?;
        Ok(RunReport {
            start_iteration,
            main,
            stabilized,
            final_validation,
            final_iteration: self.counter.get(),
        })
    }

    /// Loads a checkpoint directory strictly and validates it once.
    pub fn evaluate_checkpoint(
        &mut self,
        directory: impl AsRef<Path>,
    ) -> Result<ValidationSummary, TrainingError> {
        let loaded = checkpoint::load_directory(directory.as_ref(), &self.device)?;
        self.restore(loaded, false)?;
        let summary = self.validate()?;
        self.logger.flush()?;
        Ok(summary)
    }

    fn restore(
        &mut self,
        loaded: LoadedCheckpoint,
        with_optimizer: bool,
    ) -> Result<(), TrainingError> {
        checkpoint::apply_model_weights(&self.model, &loaded.tensors)?;
        if with_optimizer {
            if let Some(state) = loaded.optimizer {
                self.optimizer.load_state(state)?;
            }
        }

        let fingerprint = checkpoint::fingerprint_config(&self.config)?;
        if fingerprint != loaded.manifest.config_sha256 {
            log::warn!(
                "checkpoint {} was written with a different configuration",
                loaded.directory.display()
            );
        }

        let iteration = loaded.manifest.iteration;
        self.counter.resume_at(iteration);
        self.window = ErrorWindow::default();
        self.logger.log_message(&format!(
            "resumed from checkpoint {} at iteration {}",
            loaded.directory.display(),
            iteration
        ))
    }

    /// One optimizer step shared by both phases.
    fn train_step(&mut self) -> Result<(), TrainingError> {
        let fetch_started = Instant::now();
        let batch = self.train_data.next()?;
        let data_time = fetch_started.elapsed();

        let step_started = Instant::now();
        let (images, labels) = self.batch_to_device(&batch)?;
        let logits = self.model.forward(&images).map_err(to_runtime_error)?;
        let output = self.loss.compute(&logits, &labels)?;
        if !output.value.is_finite() {
            return Err(TrainingError::runtime(format!(
                "non-finite loss at iteration {}",
                self.counter.get()
            )));
        }

        let lr = self.scheduler.learning_rate(self.counter.get());
        let mut grads = output.loss.backward().map_err(to_runtime_error)?;
        self.optimizer.step(&mut grads, lr)?;
        let iteration = self.counter.advance();

        let precision = topk_accuracy(&logits.detach(), &labels, &[1, self.top_k])?;
        self.window.record(&StepSample {
            loss: output.value,
            top1_err: error_rate(precision[0]),
            top5_err: error_rate(precision[1]),
            data_time,
            train_time: step_started.elapsed(),
        });

        if iteration % self.config.schedule.display_interval == 0 {
            if let Some(summary) = self.window.drain() {
                let ema = self.loss_ema.update(summary.loss);
                self.logger
                    .log_training_window(iteration, lr, &summary, ema)?;
            }
        }
        Ok(())
    }

    fn batch_to_device(&self, batch: &DataBatch) -> Result<(Tensor, Tensor), TrainingError> {
        let images = batch
            .images
            .to_device(&self.device)
            .map_err(to_runtime_error)?;
        let labels = batch
            .labels
            .to_device(&self.device)
            .map_err(to_runtime_error)?;
        Ok((images, labels))
    }

    fn save_checkpoint(&mut self, id: CheckpointId) -> Result<CheckpointDescriptor, TrainingError> {
        let started = Instant::now();
        let snapshot = CheckpointSnapshot::capture(
            id,
            &self.config,
            &self.model,
            Some(self.optimizer.state()?),
        )?;
        let descriptor = self.store.save(&snapshot)?;
        log::info!(
            "saved checkpoint {} in {:.3}s",
            descriptor.directory.display(),
            started.elapsed().as_secs_f64()
        );
        self.written.push(descriptor.clone());
        Ok(descriptor)
    }
}

/// Resolves the configured backend, probing Metal then CUDA for `auto`.
pub fn select_device(choice: DeviceChoice, seed: u64) -> Result<Device, TrainingError> {
    let device = match choice {
        DeviceChoice::Cpu => Device::Cpu,
        DeviceChoice::Cuda => Device::new_cuda(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize CUDA device: {err}"))
        })?,
        DeviceChoice::Metal => Device::new_metal(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize Metal device: {err}"))
        })?,
        DeviceChoice::Auto => {
            let cuda_available = cuda_is_available();
            let metal_available = metal_is_available();
            log::debug!(
                "device detection: cuda_available={} metal_available={}",
                cuda_available,
                metal_available
            );
            if metal_available {
                match Device::new_metal(0) {
                    Ok(device) => device,
                    Err(err) => {
                        log::warn!("failed to initialize metal device, falling back to CPU: {err}");
                        Device::Cpu
                    }
                }
            } else if cuda_available {
                match Device::new_cuda(0) {
                    Ok(device) => device,
                    Err(err) => {
                        log::warn!("cuda reported available but initialization failed: {err}");
                        Device::Cpu
                    }
                }
            } else {
                Device::Cpu
            }
        }
    };

    log::info!(
        "device selected: is_cuda={} is_metal={} is_cpu={}",
        device.is_cuda(),
        device.is_metal(),
        device.is_cpu()
    );
    if let Err(err) = device.set_seed(seed) {
        log::warn!("failed to seed device RNG: {err}");
    }
    Ok(device)
}
