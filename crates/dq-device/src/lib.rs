#![forbid(unsafe_code)]

use std::fmt;

use dq_core::{DenseTensor, Device, TensorMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    Mismatch { expected: Device, actual: Device },
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { expected, actual } => {
                write!(f, "device mismatch: expected {expected:?}, got {actual:?}")
            }
        }
    }
}

impl std::error::Error for DeviceError {}

/// Pins the placement every operand of a call must share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    device: Device,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn ensure_meta_device(&self, meta: &TensorMeta) -> Result<(), DeviceError> {
        let actual = meta.device();
        if actual != self.device {
            return Err(DeviceError::Mismatch {
                expected: self.device,
                actual,
            });
        }
        Ok(())
    }

    pub fn ensure_tensor_device(&self, tensor: &DenseTensor) -> Result<(), DeviceError> {
        self.ensure_meta_device(tensor.meta())
    }

    /// Checks every operand in order; the first stray placement is reported.
    pub fn ensure_all(&self, tensors: &[&DenseTensor]) -> Result<(), DeviceError> {
        tensors
            .iter()
            .try_for_each(|tensor| self.ensure_tensor_device(tensor))
    }
}
