//! Error types for ubd.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;
use nbd::{NBD_EINVAL, NBD_EIO};

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("attach error: {0}")]
    Attach(#[from] AttachError),

    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reported by a storage backend for a single request.
///
/// The dispatcher sends [`code`](Self::code) back to the kernel in the reply's
/// error field and keeps serving.
#[derive(Debug, Error)]
pub enum BackendError {
    /// An errno-style code chosen by the backend, sent as-is.
    #[error("backend returned error code {0}")]
    Code(u32),

    #[error(
        "range out of bounds: offset {offset} + length {length} exceeds device size {device_size}"
    )]
    OutOfBounds {
        offset: u64,
        length: u64,
        device_size: u64,
    },

    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
}

impl BackendError {
    /// The value written to the reply's error field.
    pub fn code(&self) -> u32 {
        match self {
            Self::Code(code) => *code,
            Self::OutOfBounds { .. } => NBD_EINVAL,
            Self::Io(err) => err
                .raw_os_error()
                .and_then(|code| u32::try_from(code).ok())
                .unwrap_or(NBD_EIO),
        }
    }
}

/// Errors from registering a device with the kernel.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[source] ConfigError),

    #[error("failed to open {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to create transport: {0}")]
    Transport(#[source] io::Error),

    #[error("failed to spawn device thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
