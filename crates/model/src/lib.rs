pub mod block;
pub mod config;
pub mod model;

pub use block::{ConvBnAct, SeparableBlock};
pub use config::{ModelConfig, StageConfig, MODEL_NAMES};
pub use model::Model;
