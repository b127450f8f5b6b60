use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::debug;

/// Positional sink for downloaded bytes. Shared by all workers of a transfer.
#[async_trait]
pub trait WriteAt: Send + Sync {
    async fn write_at(&self, buf: &[u8], offset: i64) -> io::Result<usize>;

    /// Drops whatever an earlier run left behind, so a fresh start begins empty.
    async fn truncate(&self) -> io::Result<()> {
        Ok(())
    }

    /// Reserves `size` bytes up front. Callers ignore failures.
    async fn preallocate(&self, _size: i64) -> io::Result<()> {
        Ok(())
    }

    /// Throws away whatever was written so far.
    async fn discard(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes into a local file behind one mutex.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileWriter {
    /// Opens or creates `path` without truncating, so earlier bytes survive a resume.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn sync_all(&self) -> io::Result<()> {
        let mut f = self.file.lock().await;
        f.flush().await?;
        f.sync_all().await
    }
}

#[async_trait]
impl WriteAt for FileWriter {
    async fn write_at(&self, buf: &[u8], offset: i64) -> io::Result<usize> {
        if offset < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("negative write offset {}", offset),
            ));
        }
        let mut f = self.file.lock().await;
        f.seek(SeekFrom::Start(offset as u64)).await?;
        f.write_all(buf).await?;
        Ok(buf.len())
    }

    async fn truncate(&self) -> io::Result<()> {
        let f = self.file.lock().await;
        f.set_len(0).await
    }

    async fn preallocate(&self, size: i64) -> io::Result<()> {
        let f = self.file.lock().await;
        if size > 0 && f.metadata().await?.len() < size as u64 {
            f.set_len(size as u64).await?;
        }
        Ok(())
    }

    async fn discard(&self) -> io::Result<()> {
        let _f = self.file.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed partial output");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory sink, growing as needed.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    data: parking_lot::Mutex<Vec<u8>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

#[async_trait]
impl WriteAt for MemoryWriter {
    async fn write_at(&self, buf: &[u8], offset: i64) -> io::Result<usize> {
        let offset = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "negative write offset"))?;
        let mut data = self.data.lock();
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    async fn truncate(&self) -> io::Result<()> {
        self.data.lock().clear();
        Ok(())
    }

    async fn preallocate(&self, size: i64) -> io::Result<()> {
        let mut data = self.data.lock();
        if size > 0 && data.len() < size as usize {
            data.resize(size as usize, 0);
        }
        Ok(())
    }

    async fn discard(&self) -> io::Result<()> {
        self.data.lock().clear();
        Ok(())
    }
}
