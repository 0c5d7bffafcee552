//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Validates the `(batch, channels, height, width)` convention with a known
/// channel count and returns the four dimensions.
pub fn expect_nchw(
    name: &str,
    tensor: &Tensor,
    channels: usize,
) -> Result<(usize, usize, usize, usize)> {
    match tensor.dims() {
        &[batch, actual, height, width] if actual == channels => {
            Ok((batch, actual, height, width))
        }
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, {channels}, height, width) layout, got {:?}",
            dims
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.iter().copied().any(|allowed| allowed == dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn nchw_check_reports_layout() -> Result<()> {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((2, 3, 4, 5), DType::F32, &device)?;
        assert_eq!(expect_nchw("input", &tensor, 3)?, (2, 3, 4, 5));
        assert!(expect_nchw("input", &tensor, 4).is_err());

        let flat = Tensor::zeros((2, 3), DType::F32, &device)?;
        assert!(expect_nchw("input", &flat, 3).is_err());
        Ok(())
    }

    #[test]
    fn shape_and_dtype_checks() -> Result<()> {
        let tensor = Tensor::zeros(4, DType::F32, &Device::Cpu)?;
        expect_shape("bias", &tensor, &[4])?;
        assert!(expect_shape("bias", &tensor, &[5]).is_err());
        expect_dtype_in("bias", &tensor, &[DType::F32, DType::F16])?;
        assert!(expect_dtype_in("bias", &tensor, &[DType::U32]).is_err());
        Ok(())
    }
}
