//! Storage backend contract called by the request dispatcher.
//!
//! `read` and `write` are required. Flush and trim are optional capabilities:
//! a backend that does not report them is never asked, and the dispatcher
//! answers those commands with success. The kernel is only told about the
//! capabilities a backend reports (see [`StorageBackend::transmission_flags`]).
//!
//! # Example
//!
//! ```ignore
//! let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new(size_bytes));
//! let device = ubd::attach(&device_config, DispatchConfig::default(), backend).await?;
//! ```

mod file;
mod memory;

use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;
use nbd::{NBD_FLAG_HAS_FLAGS, NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_TRIM};

use crate::error::BackendError;

pub use file::FileBackend;
pub use memory::MemoryBackend;

/// Result of a backend operation.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Storage operations behind a block device.
///
/// Calls arrive one at a time, in the order the kernel sent them.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fill `buf` with the bytes at `offset`. Returns the number of bytes
    /// transferred, which the dispatcher does not inspect.
    async fn read(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize>;

    /// Write `data` at `offset`.
    async fn write(&self, data: Bytes, offset: u64) -> BackendResult<()>;

    fn supports_flush(&self) -> bool {
        false
    }

    /// Flush pending writes to stable storage.
    async fn flush(&self) -> BackendResult<()> {
        Ok(())
    }

    fn supports_trim(&self) -> bool {
        false
    }

    /// Discard a byte range.
    async fn trim(&self, _offset: u64, _length: u64) -> BackendResult<()> {
        Ok(())
    }

    /// The kernel asked to disconnect.
    async fn disconnect(&self) {}

    /// The session is over. Called exactly once per session.
    async fn cleanup(&self) {}

    /// `NBD_FLAG_*` bits advertising this backend's capabilities.
    fn transmission_flags(&self) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS;
        if self.supports_flush() {
            flags |= NBD_FLAG_SEND_FLUSH;
        }
        if self.supports_trim() {
            flags |= NBD_FLAG_SEND_TRIM;
        }
        flags
    }
}

/// Bounds-check `[offset, offset + length)` against a device of `device_size`
/// bytes and return it as an index range.
pub fn checked_range(offset: u64, length: u64, device_size: u64) -> BackendResult<Range<usize>> {
    let out_of_bounds = || BackendError::OutOfBounds {
        offset,
        length,
        device_size,
    };
    let end = offset.checked_add(length).ok_or_else(out_of_bounds)?;
    if end > device_size {
        return Err(out_of_bounds());
    }
    let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    let end = usize::try_from(end).map_err(|_| out_of_bounds())?;
    Ok(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadWriteOnly;

    #[async_trait]
    impl StorageBackend for ReadWriteOnly {
        async fn read(&self, buf: &mut [u8], _offset: u64) -> BackendResult<usize> {
            Ok(buf.len())
        }

        async fn write(&self, _data: Bytes, _offset: u64) -> BackendResult<()> {
            Ok(())
        }
    }

    #[test]
    fn flags_reflect_capabilities() {
        assert_eq!(ReadWriteOnly.transmission_flags(), NBD_FLAG_HAS_FLAGS);
        let memory = MemoryBackend::new(4096);
        assert_eq!(
            memory.transmission_flags(),
            NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_SEND_TRIM
        );
    }

    #[tokio::test]
    async fn optional_operations_default_to_success() {
        let backend = ReadWriteOnly;
        assert!(backend.flush().await.is_ok());
        assert!(backend.trim(0, 4096).await.is_ok());
        backend.disconnect().await;
        backend.cleanup().await;
    }

    #[test]
    fn checked_range_bounds() {
        assert_eq!(checked_range(0, 512, 4096).unwrap(), 0..512);
        assert_eq!(checked_range(3584, 512, 4096).unwrap(), 3584..4096);
        assert!(matches!(
            checked_range(3585, 512, 4096),
            Err(BackendError::OutOfBounds { offset: 3585, .. })
        ));
        assert!(checked_range(u64::MAX, 2, u64::MAX).is_err());
    }
}
