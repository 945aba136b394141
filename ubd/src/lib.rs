//! ubd: expose a user-space storage backend as a Linux block device.
//!
//! The kernel `nbd` driver is bound to one end of a socketpair and a
//! [`Dispatcher`] serves its requests from the other end, calling into a
//! [`StorageBackend`].
//!
//! # Library Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use ubd::{DeviceConfig, DispatchConfig, MemoryBackend};
//!
//! let config = DeviceConfig::default();
//! let backend = Arc::new(MemoryBackend::new(config.size_bytes));
//! let device = ubd::attach(&config, DispatchConfig::default(), backend).await?;
//! let report = device.wait().await?;
//! ```

pub mod attach;
pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod transport;

pub use attach::{AttachedDevice, DeviceGeometry, attach, attach_with, detach, detach_with};
pub use backend::{BackendResult, FileBackend, MemoryBackend, StorageBackend};
pub use config::{BackendConfig, BackendKind, Config, DeviceConfig, DispatchConfig};
pub use dispatcher::{Dispatcher, SessionEnd, SessionReport, SessionStats};
pub use error::{AttachError, BackendError, ConfigError, Error, NbdError, Result};
pub use transport::Transport;

pub use nbd;
