use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, error::to_runtime_error, TrainingError};

/// Stochastic gradient descent with heavy-ball momentum and L2 weight decay.
#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub momentum: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for SgdConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            momentum: value.momentum,
            weight_decay: value.weight_decay,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainerOptimizerOptions {
    /// Name fragments exempt from weight decay, on top of every rank <= 1 tensor.
    pub weight_decay_exclude: Vec<String>,
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: SgdConfig,
    params: Vec<ParameterSlot>,
    step: u64,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    momentum_buffer: Option<Tensor>,
    apply_weight_decay: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: SgdConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if !(0.0..1.0).contains(&config.momentum) {
            return Err(TrainingError::initialization(
                "optimizer momentum must be in [0, 1)",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let apply_weight_decay =
                should_apply_weight_decay(&name, tensor.rank(), &options.weight_decay_exclude);
            params.push(ParameterSlot {
                name,
                param: var,
                momentum_buffer: None,
                apply_weight_decay,
            });
        }

        let decayed = params.iter().filter(|slot| slot.apply_weight_decay).count();
        log::debug!(
            "sgd over {} parameters ({} with weight decay)",
            params.len(),
            decayed
        );

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn config(&self) -> SgdConfig {
        self.config
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }

    /// Applies one update with learning rate `lr`, consuming the gradients of
    /// every tracked parameter. Parameters without a gradient are left alone.
    pub fn step(&mut self, grads: &mut GradStore, lr: f64) -> Result<(), TrainingError> {
        let cfg = self.config;
        for slot in &mut self.params {
            let grad = match grads.remove(slot.param.as_tensor()) {
                Some(grad) => grad,
                None => continue,
            };

            let param = slot.param.as_tensor().detach();
            let d_p = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                let decay = param.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                grad.add(&decay).map_err(to_runtime_error)?
            } else {
                grad
            };

            let direction = if cfg.momentum != 0.0 {
                let buffer = match slot.momentum_buffer.take() {
                    Some(previous) => previous
                        .affine(cfg.momentum, 0.0)
                        .and_then(|scaled| scaled.add(&d_p))
                        .map_err(to_runtime_error)?,
                    None => d_p.copy().map_err(to_runtime_error)?,
                };
                slot.momentum_buffer = Some(buffer.clone());
                buffer
            } else {
                d_p
            };

            let update = direction.affine(lr, 0.0).map_err(to_runtime_error)?;
            let next = param.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
        }

        self.step += 1;
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let momentum_buffer = match &slot.momentum_buffer {
                Some(buffer) => Some(flatten_to_vec(buffer, numel(&shape))?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                momentum_buffer,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    /// Restores momentum buffers; any disagreement with the live parameter
    /// set is a [`TrainingError::CheckpointMismatch`].
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::mismatch(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;

            let dims = slot.param.as_tensor().dims();
            if dims != state.shape.as_slice() {
                return Err(TrainingError::mismatch(format!(
                    "optimizer state shape mismatch for '{}': expected {:?}, found {:?}",
                    slot.name, dims, state.shape
                )));
            }

            let buffer = match state.momentum_buffer {
                Some(values) => {
                    if values.len() != numel(dims) {
                        return Err(TrainingError::mismatch(format!(
                            "optimizer state size mismatch for '{}'",
                            slot.name
                        )));
                    }
                    let device = slot.param.as_tensor().device();
                    Some(
                        Tensor::from_vec(values, dims, device).map_err(to_runtime_error)?,
                    )
                }
                None => None,
            };
            restored.push(buffer);
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::mismatch(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        for (slot, buffer) in self.params.iter_mut().zip(restored) {
            slot.momentum_buffer = buffer;
        }
        self.step = state.step;
        Ok(())
    }
}

fn should_apply_weight_decay(name: &str, rank: usize, exclusions: &[String]) -> bool {
    rank > 1
        && !exclusions
            .iter()
            .any(|pattern| matches_pattern(name, pattern))
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    name.contains(pattern)
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: u64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub momentum_buffer: Option<Vec<f32>>,
}
