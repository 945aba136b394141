//! In-memory backend.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BackendResult, StorageBackend, checked_range};

/// A zero-initialised device held entirely in memory.
///
/// Contents are lost when the value is dropped. Trim zeroes the range.
pub struct MemoryBackend {
    data: RwLock<Vec<u8>>,
    size_bytes: u64,
}

impl MemoryBackend {
    pub fn new(size_bytes: u64) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size_bytes as usize]),
            size_bytes,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Copy of the current contents.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.data.read().await.clone()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        let range = checked_range(offset, buf.len() as u64, self.size_bytes)?;
        let guard = self.data.read().await;
        buf.copy_from_slice(&guard[range]);
        Ok(buf.len())
    }

    async fn write(&self, data: Bytes, offset: u64) -> BackendResult<()> {
        let range = checked_range(offset, data.len() as u64, self.size_bytes)?;
        let mut guard = self.data.write().await;
        guard[range].copy_from_slice(&data);
        Ok(())
    }

    fn supports_flush(&self) -> bool {
        true
    }

    async fn flush(&self) -> BackendResult<()> {
        Ok(())
    }

    fn supports_trim(&self) -> bool {
        true
    }

    async fn trim(&self, offset: u64, length: u64) -> BackendResult<()> {
        let range = checked_range(offset, length, self.size_bytes)?;
        let mut guard = self.data.write().await;
        guard[range].fill(0);
        Ok(())
    }
}
