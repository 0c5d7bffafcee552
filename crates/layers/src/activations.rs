//! Activation catalogue for convolutional stacks.
//!
//! Activations are element-wise and return tensors with the input layout.
//!
//! # Built-in formulas
//!
//! * **ReLU** zeroes negative values.
//! * **ReLU6** clamps to `[0, 6]`, the bounded variant used by mobile-style
//!   conv blocks so activations stay in a range that quantises well.

use candle_core::{Result, Tensor};

/// Identifies which non-linearity follows a conv/norm pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    /// Identity function, used for projection layers without a non-linearity.
    Identity,
    /// Standard rectifier.
    Relu,
    /// Rectifier clamped at 6.
    #[default]
    Relu6,
}

impl ActivationKind {
    /// Applies the activation to `input`.
    pub fn forward(self, input: &Tensor) -> Result<Tensor> {
        match self {
            ActivationKind::Identity => Ok(input.clone()),
            ActivationKind::Relu => input.relu(),
            ActivationKind::Relu6 => input.clamp(0f32, 6f32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn relu6_clamps_both_ends() -> Result<()> {
        let input = Tensor::from_vec(vec![-2.0f32, 0.5, 3.0, 9.0], 4, &Device::Cpu)?;
        let output = ActivationKind::Relu6.forward(&input)?.to_vec1::<f32>()?;
        assert_eq!(output, vec![0.0, 0.5, 3.0, 6.0]);

        let relu = ActivationKind::Relu.forward(&input)?.to_vec1::<f32>()?;
        assert_eq!(relu, vec![0.0, 0.5, 3.0, 9.0]);

        let identity = ActivationKind::Identity.forward(&input)?.to_vec1::<f32>()?;
        assert_eq!(identity, vec![-2.0, 0.5, 3.0, 9.0]);
        Ok(())
    }
}
