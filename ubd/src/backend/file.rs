//! File-backed backend.
//!
//! Positional reads and writes against a regular file, run on tokio's blocking
//! pool. The file is created if missing and grown to the device size. Trim is
//! not supported, so the kernel is never told it may send it.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{BackendResult, StorageBackend, checked_range};

pub struct FileBackend {
    file: Arc<File>,
    path: PathBuf,
    size_bytes: u64,
}

impl FileBackend {
    pub fn open(path: impl AsRef<Path>, size_bytes: u64) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let current_len = file.metadata()?.len();
        if current_len < size_bytes {
            debug!(path = %path.display(), current_len, size_bytes, "growing backing file");
            file.set_len(size_bytes)?;
        }
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            size_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    async fn blocking<T, F>(&self, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| io::Error::other(format!("task join error: {e}")))?
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn read(&self, buf: &mut [u8], offset: u64) -> BackendResult<usize> {
        checked_range(offset, buf.len() as u64, self.size_bytes)?;
        let len = buf.len();
        let data = self
            .blocking(move |file| {
                let mut data = vec![0u8; len];
                file.read_exact_at(&mut data, offset)?;
                Ok(data)
            })
            .await?;
        buf.copy_from_slice(&data);
        Ok(len)
    }

    async fn write(&self, data: Bytes, offset: u64) -> BackendResult<()> {
        checked_range(offset, data.len() as u64, self.size_bytes)?;
        self.blocking(move |file| file.write_all_at(&data, offset))
            .await?;
        Ok(())
    }

    fn supports_flush(&self) -> bool {
        true
    }

    async fn flush(&self) -> BackendResult<()> {
        self.blocking(File::sync_data).await?;
        Ok(())
    }

    async fn cleanup(&self) {
        if let Err(e) = self.blocking(File::sync_all).await {
            warn!(path = %self.path.display(), error = %e, "failed to sync backing file");
        }
    }
}
