use ash::vk;
use thiserror::Error;

use crate::allocators;

/// Errors returned by every fallible operation of the crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The caller broke a documented precondition. Detected before touching the device.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The device or a pool ran out of capacity.
    #[error("out of memory")]
    OutOfMemory,
    /// The native driver reported an error.
    #[error("driver failure: {0}")]
    Failure(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn failure(msg: impl Into<String>) -> Self {
        Error::Failure(msg.into())
    }
}

impl From<allocators::OutOfMemory> for Error {
    fn from(_: allocators::OutOfMemory) -> Self {
        Error::OutOfMemory
    }
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL
            | vk::Result::ERROR_FRAGMENTATION => Error::OutOfMemory,
            other => Error::Failure(format!("{other}")),
        }
    }
}

/// Returns `Err(Error::InvalidArgument)` with a formatted message when the condition is false.
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::InvalidArgument(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure;
