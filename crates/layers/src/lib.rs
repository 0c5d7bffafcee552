//! Building blocks for convolutional image classifiers.
//!
//! The crate hosts batch normalisation with running statistics, the
//! activation catalogue used by conv stacks, and small shape helpers shared by
//! constructors and forward passes. Everything is expressed with Candle
//! primitives and follows the `(batch, channels, height, width)` layout.

pub mod activations;
pub mod checks;
pub mod norm;

pub use activations::ActivationKind;
pub use norm::{BatchNorm2d, BatchNormConfig};
