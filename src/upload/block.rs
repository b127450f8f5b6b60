use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::remote::PartBody;
use crate::transfer::range::{Range, RangeListGen};
use crate::transfer::status::{SpeedStats, TransferStatus};
use crate::upload::state::BlockState;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Cuts a file of `file_size` bytes into upload parts of `block_size`.
pub fn split_block(file_size: i64, block_size: i64) -> Vec<BlockState> {
    let gen = RangeListGen::new_block_size(file_size, 0, block_size);
    let mut blocks = Vec::with_capacity(gen.range_count());
    while let Some((id, range)) = gen.gen_range() {
        blocks.push(BlockState {
            id,
            range,
            upload_done: false,
        });
    }
    blocks
}

/// Reads one part of a local file. Every call to `body` starts a fresh
/// read from the part's first byte, so a part can be sent again.
#[derive(Clone)]
pub struct PartSource {
    path: Arc<PathBuf>,
    range: Range,
    status: Arc<TransferStatus>,
    global_speeds: Option<Arc<SpeedStats>>,
    /// Set when the last body failed on the local side.
    read_error: Arc<Mutex<Option<String>>>,
}

struct ReadState {
    file: Option<File>,
    offset: i64,
    left: i64,
    source: PartSource,
}

impl PartSource {
    pub fn new(
        path: impl AsRef<Path>,
        range: Range,
        status: Arc<TransferStatus>,
        global_speeds: Option<Arc<SpeedStats>>,
    ) -> Self {
        Self {
            path: Arc::new(path.as_ref().to_path_buf()),
            range,
            status,
            global_speeds,
            read_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Why the last body stopped reading the local file, if it did.
    pub fn local_error(&self) -> Option<String> {
        self.read_error.lock().clone()
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn len(&self) -> i64 {
        self.range.len().max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rate-limited stream over the part's bytes. A local read failure ends
    /// the stream with an error and is kept for [`PartSource::local_error`].
    pub fn body(&self) -> PartBody {
        *self.read_error.lock() = None;
        let state = ReadState {
            file: None,
            offset: self.range.begin,
            left: self.len(),
            source: self.clone(),
        };
        stream::try_unfold(state, |state| async move {
            let read_error = state.source.read_error.clone();
            next_chunk(state).await.map_err(|e| {
                *read_error.lock() = Some(e.to_string());
                e
            })
        })
        .boxed()
    }
}

async fn next_chunk(mut state: ReadState) -> io::Result<Option<(Bytes, ReadState)>> {
    if state.left <= 0 {
        return Ok(None);
    }
    if state.file.is_none() {
        let mut file = File::open(state.source.path.as_ref()).await?;
        file.seek(SeekFrom::Start(state.offset as u64)).await?;
        state.file = Some(file);
    }
    let want = (state.left as usize).min(READ_CHUNK_SIZE);
    let mut buf = vec![0u8; want];
    let n = match state.file.as_mut() {
        Some(file) => file.read(&mut buf).await?,
        None => 0,
    };
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("local file ended {} bytes early", state.left),
        ));
    }
    buf.truncate(n);

    state.source.status.add_speeds(n).await;
    if let Some(global) = &state.source.global_speeds {
        global.add(n as u64);
    }
    state.offset += n as i64;
    state.left -= n as i64;
    Ok(Some((Bytes::from(buf), state)))
}
