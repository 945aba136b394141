//! Fault-injecting backend wrapper.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use ubd::{BackendError, BackendResult, MemoryBackend, StorageBackend};

/// Wraps a [`MemoryBackend`] and fails the next data call when armed.
///
/// A failed call leaves the image untouched. Disconnect and cleanup calls are
/// counted so the harness can check each ran exactly once.
pub struct FaultyBackend {
    inner: MemoryBackend,
    armed: Mutex<Option<u32>>,
    disconnects: Mutex<u32>,
    cleanups: Mutex<u32>,
}

impl FaultyBackend {
    pub fn new(size_bytes: u64) -> Self {
        Self {
            inner: MemoryBackend::new(size_bytes),
            armed: Mutex::new(None),
            disconnects: Mutex::new(0),
            cleanups: Mutex::new(0),
        }
    }

    /// Fail the next read, write, flush or trim with `code`.
    pub fn arm(&self, code: u32) {
        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = Some(code);
    }

    /// Whether an armed fault is still waiting for a call.
    pub fn is_armed(&self) -> bool {
        self.armed.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn disconnects(&self) -> u32 {
        *self.disconnects.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cleanups(&self) -> u32 {
        *self.cleanups.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.inner.snapshot().await
    }

    fn take_fault(&self) -> BackendResult<()> {
        match self.armed.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(code) => Err(BackendError::Code(code)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageBackend for FaultyBackend {
    async fn read(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        self.take_fault()?;
        self.inner.read(buf, offset).await
    }

    async fn write(&self, data: Bytes, offset: u64) -> BackendResult<()> {
        self.take_fault()?;
        self.inner.write(data, offset).await
    }

    fn supports_flush(&self) -> bool {
        self.inner.supports_flush()
    }

    async fn flush(&self) -> BackendResult<()> {
        self.take_fault()?;
        self.inner.flush().await
    }

    fn supports_trim(&self) -> bool {
        self.inner.supports_trim()
    }

    async fn trim(&self, offset: u64, length: u64) -> BackendResult<()> {
        self.take_fault()?;
        self.inner.trim(offset, length).await
    }

    async fn disconnect(&self) {
        *self.disconnects.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    async fn cleanup(&self) {
        *self.cleanups.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbd::NBD_EIO;

    #[tokio::test]
    async fn armed_fault_fires_once() {
        let backend = FaultyBackend::new(1024);
        backend.arm(NBD_EIO);
        assert!(backend.is_armed());

        let err = backend.write(Bytes::from_static(&[1; 4]), 0).await.unwrap_err();
        assert_eq!(err.code(), NBD_EIO);
        assert!(!backend.is_armed());
        assert!(backend.snapshot().await.iter().all(|&b| b == 0));

        backend.write(Bytes::from_static(&[1; 4]), 0).await.unwrap();
        assert_eq!(&backend.snapshot().await[..4], &[1; 4]);
    }
}
