use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::transfer::range::{remaining_len, Range, RangeGenMode, RangeListGen};
use crate::transfer::status::TransferStatus;

pub const STATE_VERSION: u32 = 1;

/// Everything needed to rebuild a download's progress after a restart.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(rename = "rangeGenMode")]
    pub mode: RangeGenMode,
    pub total_size: i64,
    pub gen_begin: i64,
    pub block_size: i64,
    pub ranges: Vec<Range>,
}

impl InstanceState {
    /// Takes a snapshot of `status` plus the live worker ranges.
    pub fn capture(status: &TransferStatus, ranges: Vec<Range>) -> Self {
        let total_size = status.total_size();
        let (mode, gen_begin, block_size) = match status.range_gen() {
            Some(gen) => (gen.mode(), gen.begin(), gen.block_size()),
            None => (RangeGenMode::Default, total_size, 0),
        };
        Self {
            version: STATE_VERSION,
            saved_at: Some(Utc::now()),
            mode,
            total_size,
            gen_begin,
            block_size,
            ranges,
        }
    }

    /// Bytes already on disk.
    pub fn transferred(&self) -> i64 {
        self.gen_begin - remaining_len(&self.ranges)
    }

    /// Bytes still to fetch, counting what the generator has not minted.
    pub fn outstanding(&self) -> i64 {
        remaining_len(&self.ranges) + (self.total_size - self.gen_begin).max(0)
    }

    /// Generator picking up at the saved cursor.
    pub fn range_gen(&self) -> RangeListGen {
        match self.mode {
            RangeGenMode::BlockSize => {
                RangeListGen::new_block_size(self.total_size, self.gen_begin, self.block_size)
            }
            RangeGenMode::Default => RangeListGen::new_default(
                self.total_size,
                self.gen_begin,
                self.ranges.len(),
                self.ranges.len(),
            ),
        }
    }

    /// Rebuilds a status (with generator) and the outstanding ranges.
    pub fn into_status(self) -> (TransferStatus, Vec<Range>) {
        let mut status = TransferStatus::new(self.total_size);
        status.set_transferred(self.transferred());
        status.set_range_gen(self.range_gen());
        (status, self.ranges)
    }
}

/// A JSON side-car file rewritten in place on every save.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl StateFile {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
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

    /// Loads the saved value. An empty file means nothing was saved yet; a
    /// malformed one is logged and treated the same way.
    pub async fn get<T: DeserializeOwned + Versioned>(&self) -> Option<T> {
        let mut file = self.file.lock().await;
        let mut content = Vec::new();
        if let Err(e) = file.seek(SeekFrom::Start(0)).await {
            warn!(path = %self.path.display(), error = %e, "failed to rewind state file");
            return None;
        }
        if let Err(e) = file.read_to_end(&mut content).await {
            warn!(path = %self.path.display(), error = %e, "failed to read state file");
            return None;
        }
        if content.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice::<T>(&content) {
            Ok(value) if value.version() <= STATE_VERSION => Some(value),
            Ok(value) => {
                warn!(
                    path = %self.path.display(),
                    version = value.version(),
                    "state file written by a newer version, starting over"
                );
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "malformed state file, starting over");
                None
            }
        }
    }

    pub async fn put<T: Serialize>(&self, value: &T) -> io::Result<()> {
        let data = serde_json::to_vec(value)?;
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(0)).await?;
        file.write_all(&data).await?;
        file.set_len(data.len() as u64).await?;
        file.flush().await?;
        Ok(())
    }

    /// Deletes the file. Missing files are not an error.
    pub async fn remove(&self) -> io::Result<()> {
        // hold the lock so no save races the delete
        let _file = self.file.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed state file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// State documents carry a format version.
pub trait Versioned {
    fn version(&self) -> u32;
}

impl Versioned for InstanceState {
    fn version(&self) -> u32 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> InstanceState {
        InstanceState {
            version: STATE_VERSION,
            saved_at: None,
            mode: RangeGenMode::BlockSize,
            total_size: 10_000,
            gen_begin: 6_000,
            block_size: 2_000,
            ranges: vec![Range::new(1_500, 2_000), Range::new(5_000, 6_000)],
        }
    }

    #[test]
    fn block_mode_accounting() {
        let state = sample_state();
        assert_eq!(state.transferred(), 6_000 - 1_500);
        assert_eq!(state.outstanding(), 1_500 + 4_000);

        let gen = state.range_gen();
        assert_eq!(gen.gen_range(), Some((0, Range::new(6_000, 8_000))));
    }

    #[test]
    fn default_mode_generator_is_exhausted() {
        let state = InstanceState {
            mode: RangeGenMode::Default,
            gen_begin: 10_000,
            block_size: 0,
            ..sample_state()
        };
        assert_eq!(state.transferred(), 10_000 - 1_500);
        assert_eq!(state.outstanding(), 1_500);
        let (status, ranges) = state.into_status();
        assert_eq!(status.transferred(), 8_500);
        assert!(status.range_gen().unwrap().is_done());
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn default_mode_resumes_from_saved_cursor() {
        let state = InstanceState {
            mode: RangeGenMode::Default,
            gen_begin: 7_000,
            block_size: 0,
            ..sample_state()
        };
        assert_eq!(state.transferred(), 7_000 - 1_500);
        assert_eq!(state.outstanding(), 1_500 + 3_000);

        let (status, _) = state.into_status();
        let gen = status.range_gen().unwrap();
        assert_eq!(gen.gen_range(), Some((2, Range::new(7_000, 10_000))));
        assert!(gen.is_done());
    }

    #[test]
    fn serialized_field_names() {
        let json = serde_json::to_value(sample_state()).unwrap();
        assert_eq!(json["rangeGenMode"], "block_size");
        assert_eq!(json["totalSize"], 10_000);
        assert_eq!(json["genBegin"], 6_000);
        assert_eq!(json["ranges"][0]["begin"], 1_500);
    }

    #[tokio::test]
    async fn put_then_get_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.part.json");
        let store = StateFile::open(&path).await.unwrap();
        assert!(store.get::<InstanceState>().await.is_none());

        let mut state = sample_state();
        state.ranges.push(Range::new(9_000, 9_999));
        store.put(&state).await.unwrap();

        // a shorter document must not leave stale bytes behind
        let short = sample_state();
        store.put(&short).await.unwrap();
        assert_eq!(store.get::<InstanceState>().await, Some(short));

        let reopened = StateFile::open(&path).await.unwrap();
        assert_eq!(reopened.get::<InstanceState>().await, Some(sample_state()));
    }

    #[tokio::test]
    async fn malformed_state_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.part.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let store = StateFile::open(&path).await.unwrap();
        assert!(store.get::<InstanceState>().await.is_none());
    }

    #[tokio::test]
    async fn newer_version_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.part.json");
        let store = StateFile::open(&path).await.unwrap();
        let mut state = sample_state();
        state.version = STATE_VERSION + 1;
        store.put(&state).await.unwrap();
        assert!(store.get::<InstanceState>().await.is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.part.json");
        let store = StateFile::open(&path).await.unwrap();
        store.remove().await.unwrap();
        assert!(!path.exists());
        store.remove().await.unwrap();
    }
}
