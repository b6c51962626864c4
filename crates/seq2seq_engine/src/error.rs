//! Engine error types

use crate::device::Device;
use crate::types::DataType;

/// Errors surfaced at the translate boundary. Nothing is retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape/dtype/rank violation, option conflict or out-of-range access.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Invalid environment value, unknown compute type, unsupported device
    /// or binary version.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Operation has no kernel for the (device, dtype) pair.
    #[error("unsupported operation: {op} is not implemented for {device} {dtype}")]
    Unsupported {
        op: &'static str,
        device: Device,
        dtype: DataType,
    },

    /// Backend library failure (allocation, kernel launch, GEMM).
    #[error("device error: {0}")]
    Device(String),

    /// Allocation failure when a pool cannot grow.
    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn unsupported(op: &'static str, device: Device, dtype: DataType) -> Self {
        Error::Unsupported { op, device, dtype }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
