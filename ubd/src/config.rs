//! Configuration for ubd.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nbd::{NBD_MAX_PAYLOAD_SIZE, ReadErrorPayload};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Smallest logical block size the kernel accepts.
pub const MIN_BLOCK_SIZE: u64 = 512;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;
        self.backend.validate()?;
        self.dispatch.validate()
    }
}

/// Kernel-facing geometry of the block device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device node, e.g. `/dev/nbd0`.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub block_size: u64,
    /// Kernel-side request timeout. Unset leaves the driver default.
    pub timeout_secs: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/nbd0"),
            size_bytes: 1024 * 1024 * 1024,
            block_size: 4096,
            timeout_secs: None,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "device.path",
                reason: "must not be empty",
            });
        }
        if self.size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "device.size_bytes",
                reason: "must be > 0",
            });
        }
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                field: "device.block_size",
                reason: "must be a power of two >= 512",
            });
        }
        if self.size_bytes < self.block_size {
            return Err(ConfigError::InvalidValue {
                field: "device.size_bytes",
                reason: "must hold at least one block",
            });
        }
        Ok(())
    }

    /// Whole blocks in the device; a trailing partial block is dropped.
    pub fn block_count(&self) -> u64 {
        self.size_bytes / self.block_size
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
}

/// Which reference backend the `ubd` binary serves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Backing file for `kind = "file"`.
    pub path: Option<PathBuf>,
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == BackendKind::File && self.path.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "backend.path",
                reason: "required for file backend",
            });
        }
        Ok(())
    }
}

/// Request dispatcher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Largest READ/WRITE the dispatcher will allocate for. Larger requests
    /// end the session.
    pub max_payload_bytes: u32,
    pub read_error_payload: ReadErrorPayload,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: NBD_MAX_PAYLOAD_SIZE,
            read_error_payload: ReadErrorPayload::ZeroFill,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "dispatch.max_payload_bytes",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
