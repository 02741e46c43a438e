//! Compute device selection

mod device;

pub use device::{dtype_for, select_device, ComputeDevice, DeviceKind};
