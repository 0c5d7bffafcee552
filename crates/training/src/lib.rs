//! Iteration-driven training orchestration for the image classifiers in the
//! `model` crate: data providers, schedules, SGD, checkpoints and logging.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{
    CheckpointDescriptor, CheckpointId, CheckpointSnapshot, CheckpointStore,
    DirectoryCheckpointStore, LoadedCheckpoint,
};
pub use config::TrainingConfig;
pub use data::{
    BlockingDataLoader, CyclicBatchProvider, DataBatch, DataLoader, ShuffledBatchLoader,
    TensorDataset,
};
pub use error::TrainingError;
pub use logging::{Logger, LoggingSettings};
pub use loss::{CrossEntropyLoss, LossOutput};
pub use metrics::{topk_accuracy, RunningMetric, ValidationSummary};
pub use optimizer::{OptimizerState, SgdConfig, TrainerOptimizer, TrainerOptimizerOptions};
pub use scheduler::{bn_momentum, learning_rate, LRScheduler, LinearDecay};
pub use trainer::{GlobalIterationCounter, MainPhaseReport, RunReport, Trainer};
