//! Device selection and scoped device management

use std::cell::Cell;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Where a storage lives. Each device carries an integer index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(i32),
}

impl Device {
    pub fn index(&self) -> i32 {
        match self {
            Device::Cpu => 0,
            Device::Cuda(index) => *index,
        }
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Fails when the device cannot be used by this build (e.g. a CUDA
    /// device without the `cuda` feature, or no GPU present).
    pub fn validate(&self) -> Result<()> {
        match self {
            Device::Cpu => Ok(()),
            Device::Cuda(index) => {
                #[cfg(feature = "cuda")]
                {
                    if *index < 0 || *index as usize >= crate::cuda::gpu_count() {
                        return Err(Error::configuration(format!(
                            "CUDA device {} is not available",
                            index
                        )));
                    }
                    Ok(())
                }
                #[cfg(not(feature = "cuda"))]
                {
                    let _ = index;
                    Err(Error::configuration(
                        "this build does not support CUDA devices",
                    ))
                }
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            _ => Err(Error::configuration(format!("unsupported device: {}", s))),
        }
    }
}

thread_local! {
    static CURRENT_DEVICE: Cell<Device> = const { Cell::new(Device::Cpu) };
}

/// Sets the calling thread's current device.
pub fn set_device(device: Device) {
    CURRENT_DEVICE.with(|current| current.set(device));
}

/// Returns the calling thread's current device.
pub fn get_device() -> Device {
    CURRENT_DEVICE.with(|current| current.get())
}

/// Captures the current device and restores it on drop, whatever the exit
/// path of the region is.
pub struct ScopedDeviceSetter {
    previous: Device,
}

impl ScopedDeviceSetter {
    pub fn new(device: Device) -> Self {
        let previous = get_device();
        set_device(device);
        ScopedDeviceSetter { previous }
    }
}

impl Drop for ScopedDeviceSetter {
    fn drop(&mut self) {
        set_device(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_setter_restores_on_drop() {
        set_device(Device::Cpu);
        {
            let _setter = ScopedDeviceSetter::new(Device::Cuda(1));
            assert_eq!(get_device(), Device::Cuda(1));
        }
        assert_eq!(get_device(), Device::Cpu);
    }

    #[test]
    fn scoped_setter_restores_on_panic() {
        set_device(Device::Cpu);
        let result = std::panic::catch_unwind(|| {
            let _setter = ScopedDeviceSetter::new(Device::Cuda(0));
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(get_device(), Device::Cpu);
    }

    #[test]
    fn device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert!("tpu".parse::<Device>().is_err());
    }
}
