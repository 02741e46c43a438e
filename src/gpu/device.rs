// Location: src/gpu/device.rs

use std::fmt;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Coarse device label reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device weights and activations live on, with the precision used there.
#[derive(Debug, Clone)]
pub struct ComputeDevice {
    /// Candle device handle
    pub device: Device,
    /// Label for reporting
    pub kind: DeviceKind,
    /// Half precision on GPU, full precision on CPU
    pub dtype: DType,
}

impl ComputeDevice {
    pub fn cpu() -> Self {
        Self::from_device(Device::Cpu)
    }

    pub fn from_device(device: Device) -> Self {
        let kind = if device.is_cpu() {
            DeviceKind::Cpu
        } else {
            DeviceKind::Gpu
        };

        Self {
            dtype: dtype_for(kind),
            device,
            kind,
        }
    }
}

/// Pick the first GPU the build supports, falling back to CPU.
pub fn select_device() -> ComputeDevice {
    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => return ComputeDevice::from_device(device),
            Err(e) => tracing::debug!(error = %e, "CUDA device unavailable"),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => return ComputeDevice::from_device(device),
            Err(e) => tracing::debug!(error = %e, "Metal device unavailable"),
        }
    }

    ComputeDevice::cpu()
}

pub fn dtype_for(kind: DeviceKind) -> DType {
    match kind {
        DeviceKind::Gpu => DType::F16,
        DeviceKind::Cpu => DType::F32,
    }
}
