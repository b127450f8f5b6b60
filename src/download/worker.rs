use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_CACHE_SIZE;
use crate::download::writer::WriteAt;
use crate::remote::{ByteStream, RemoteDownload, RemoteFile};
use crate::transfer::range::Range;
use crate::transfer::status::{SpeedStats, TransferStatus};
use crate::utils::{is_url_expired, parse_content_range_total};

const ERROR_BODY_LIMIT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    Init,
    Pending,
    Downloading,
    WaitToWrite,
    Succeeded,
    Failed,
    NetError,
    TooManyConnections,
    DownloadUrlExpired,
    InternalError,
    Canceled,
    Reset,
    Paused,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Init => "init",
            WorkerStatus::Pending => "pending",
            WorkerStatus::Downloading => "downloading",
            WorkerStatus::WaitToWrite => "wait to write",
            WorkerStatus::Succeeded => "succeeded",
            WorkerStatus::Failed => "failed",
            WorkerStatus::NetError => "network error",
            WorkerStatus::TooManyConnections => "too many connections",
            WorkerStatus::DownloadUrlExpired => "download url expired",
            WorkerStatus::InternalError => "internal error",
            WorkerStatus::Canceled => "canceled",
            WorkerStatus::Reset => "reset",
            WorkerStatus::Paused => "paused",
        }
    }

    /// Finished for good: nothing left to do on this range.
    pub fn is_completed(&self) -> bool {
        matches!(self, WorkerStatus::Succeeded | WorkerStatus::Canceled)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Failed
                | WorkerStatus::InternalError
                | WorkerStatus::TooManyConnections
                | WorkerStatus::NetError
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What every worker of one transfer shares.
pub struct WorkerContext {
    pub remote: Arc<dyn RemoteDownload>,
    pub writer: Arc<dyn WriteAt>,
    pub status: Arc<TransferStatus>,
    pub file: RemoteFile,
    pub cache_size: usize,
    pub concurrency_backoff: Duration,
    pub backoff_jitter: Duration,
    pub global_speeds: Option<Arc<SpeedStats>>,
    wake: Arc<Notify>,
}

impl WorkerContext {
    pub fn new(
        remote: Arc<dyn RemoteDownload>,
        writer: Arc<dyn WriteAt>,
        status: Arc<TransferStatus>,
        file: RemoteFile,
    ) -> Self {
        Self {
            remote,
            writer,
            status,
            file,
            cache_size: DEFAULT_CACHE_SIZE,
            concurrency_backoff: Duration::from_secs(10),
            backoff_jitter: Duration::ZERO,
            global_speeds: None,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration, jitter: Duration) -> Self {
        self.concurrency_backoff = backoff;
        self.backoff_jitter = jitter;
        self
    }

    pub fn with_global_speeds(mut self, speeds: Option<Arc<SpeedStats>>) -> Self {
        self.global_speeds = speeds;
        self
    }

    /// Notified whenever a worker stops executing.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    fn backoff(&self) -> Duration {
        if self.backoff_jitter.is_zero() {
            return self.concurrency_backoff;
        }
        let jitter = rand::thread_rng().gen_range(0..=self.backoff_jitter.as_millis() as u64);
        self.concurrency_backoff + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone)]
struct ExecControl {
    reset: CancellationToken,
    pause: CancellationToken,
}

impl ExecControl {
    fn new() -> Self {
        Self {
            reset: CancellationToken::new(),
            pause: CancellationToken::new(),
        }
    }
}

enum Interrupt {
    Canceled,
    Reset,
    Paused,
}

#[derive(Debug)]
struct WorkerState {
    status: WorkerStatus,
    err: Option<String>,
}

/// Moves one byte range (or, without range support, the whole file) over
/// one HTTP stream at a time.
pub struct Worker {
    id: usize,
    single: bool,
    ctx: Arc<WorkerContext>,
    range: Mutex<Range>,
    url: Mutex<String>,
    state: Mutex<WorkerState>,
    speeds: SpeedStats,
    /// Set while a read waits on the rate limiter.
    throttled: AtomicBool,
    cancel: CancellationToken,
    control: Mutex<Option<ExecControl>>,
    exec_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("range", &self.range())
            .field("status", &self.status())
            .finish()
    }
}

impl Worker {
    /// `range` of `None` selects single-stream mode.
    pub fn new(
        id: usize,
        ctx: Arc<WorkerContext>,
        url: String,
        range: Option<Range>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let single = range.is_none();
        let range = range.unwrap_or_else(|| Range::new(0, ctx.file.size.max(0)));
        Arc::new(Self {
            id,
            single,
            ctx,
            range: Mutex::new(range),
            url: Mutex::new(url),
            state: Mutex::new(WorkerState {
                status: WorkerStatus::Init,
                err: None,
            }),
            speeds: SpeedStats::new(),
            throttled: AtomicBool::new(false),
            cancel,
            control: Mutex::new(None),
            exec_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_single(&self) -> bool {
        self.single
    }

    pub fn status(&self) -> WorkerStatus {
        self.state.lock().status
    }

    pub fn err(&self) -> Option<String> {
        self.state.lock().err.clone()
    }

    pub fn range(&self) -> Range {
        *self.range.lock()
    }

    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    pub fn set_url(&self, url: String) {
        *self.url.lock() = url;
    }

    pub fn completed(&self) -> bool {
        self.status().is_completed()
    }

    pub fn failed(&self) -> bool {
        self.status().is_failed()
    }

    pub fn canceled(&self) -> bool {
        self.status() == WorkerStatus::Canceled
    }

    /// Rate measured at the last `sample_speed` call.
    pub fn speeds_per_second(&self) -> u64 {
        self.speeds.speed()
    }

    pub fn sample_speed(&self) -> u64 {
        self.speeds.sample()
    }

    /// Held back by the rate limiter rather than stalled.
    pub fn throttled(&self) -> bool {
        self.throttled.load(Ordering::Relaxed)
    }

    fn set_status(&self, status: WorkerStatus) {
        self.state.lock().status = status;
    }

    /// Records a stop and wakes the monitor.
    fn finish(&self, status: WorkerStatus, err: Option<String>) {
        {
            let mut state = self.state.lock();
            state.status = status;
            state.err = err;
        }
        self.throttled.store(false, Ordering::Relaxed);
        match status {
            WorkerStatus::Succeeded | WorkerStatus::Canceled | WorkerStatus::Paused => {
                debug!(worker = self.id, %status, "worker stopped")
            }
            _ => debug!(worker = self.id, %status, err = ?self.err(), "worker stopped"),
        }
        self.ctx.wake.notify_one();
    }

    /// Hands an idle worker a new range. Refused unless the worker is completed.
    pub fn assign(&self, range: Range) -> bool {
        let mut state = self.state.lock();
        if !state.status.is_completed() || self.single {
            return false;
        }
        *self.range.lock() = range;
        state.status = WorkerStatus::Init;
        state.err = None;
        true
    }

    /// Gives away the upper half of the remaining range, see [`Range::split_half`].
    pub fn split_off(&self, floor: i64) -> Option<Range> {
        if self.single {
            return None;
        }
        // the lower half must hold a full read buffer so in-flight bytes never cross the cut
        let floor = floor.max(self.ctx.cache_size as i64 + 1);
        self.range.lock().split_half(floor)
    }

    /// Undoes `split_off` when the split-off half found no taker.
    pub fn rejoin(&self, upper: Range) {
        let mut range = self.range.lock();
        if range.end == upper.begin {
            range.end = upper.end;
        }
    }

    /// Runs `execute` on a new task.
    pub fn spawn(self: &Arc<Self>) {
        // a previous execution still running finishes on its own; exec_lock orders the two
        let handle = tokio::spawn(self.clone().execute());
        *self.task.lock() = Some(handle);
    }

    /// Waits for the latest spawned execution to end.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Drops the current stream and starts over on the remaining range.
    pub fn reset(self: &Arc<Self>) {
        debug!(worker = self.id, "reset worker");
        if let Some(control) = self.control.lock().as_ref() {
            control.reset.cancel();
        }
        self.set_status(WorkerStatus::Init);
        self.spawn();
    }

    /// Stops a running worker, keeping its range. Idle and failed workers
    /// are left alone.
    pub fn pause(&self) {
        if self.single {
            warn!(worker = self.id, "worker does not support pause");
            return;
        }
        let mut state = self.state.lock();
        match state.status {
            WorkerStatus::Init
            | WorkerStatus::Pending
            | WorkerStatus::Downloading
            | WorkerStatus::WaitToWrite => {}
            _ => return,
        }
        if let Some(control) = self.control.lock().as_ref() {
            control.pause.cancel();
        }
        state.status = WorkerStatus::Paused;
    }

    pub fn resume(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status != WorkerStatus::Paused {
                return;
            }
            state.status = WorkerStatus::Init;
        }
        self.spawn();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Asks the remote for a fresh URL. On failure the worker is marked
    /// throttled and keeps its old URL.
    pub async fn refresh_url(&self) {
        debug!(worker = self.id, "refreshing download url");
        match self.ctx.remote.download_url(&self.ctx.file).await {
            Ok(url) => self.set_url(url),
            Err(e) => {
                warn!(worker = self.id, error = %e, "failed to refresh download url");
                self.finish(WorkerStatus::TooManyConnections, Some(e.to_string()));
            }
        }
    }

    async fn guard<F: Future>(&self, control: &ExecControl, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Canceled),
            _ = control.reset.cancelled() => Err(Interrupt::Reset),
            _ = control.pause.cancelled() => Err(Interrupt::Paused),
            out = fut => Ok(out),
        }
    }

    fn interrupted(&self, interrupt: Interrupt) {
        match interrupt {
            Interrupt::Canceled => self.finish(WorkerStatus::Canceled, None),
            Interrupt::Reset => self.finish(WorkerStatus::Reset, None),
            Interrupt::Paused => self.finish(WorkerStatus::Paused, None),
        }
    }

    pub async fn execute(self: Arc<Self>) {
        let _exec = self.exec_lock.lock().await;
        trace!(worker = self.id, range = %self.range(), "execute worker");

        // a pause that landed before this execution got the lock holds it back
        let control = {
            let state = self.state.lock();
            if state.status == WorkerStatus::Paused {
                return;
            }
            let control = ExecControl::new();
            *self.control.lock() = Some(control.clone());
            control
        };

        if !self.single {
            let len = self.range().len();
            if len <= 0 {
                self.finish(WorkerStatus::Succeeded, None);
                return;
            }
        }
        if self.cancel.is_cancelled() {
            self.finish(WorkerStatus::Canceled, None);
            return;
        }

        if self.single {
            self.rewind();
        }
        self.set_status(WorkerStatus::Pending);

        let url = self.url();
        if is_url_expired(&url) {
            self.finish(
                WorkerStatus::DownloadUrlExpired,
                Some("download url expired".into()),
            );
            return;
        }

        let requested = if self.single {
            None
        } else {
            let range = self.range();
            Some((range.begin, range.end - 1))
        };
        let response = match self
            .guard(&control, self.ctx.remote.download_range(&url, requested))
            .await
        {
            Err(interrupt) => return self.interrupted(interrupt),
            Ok(Err(e)) => {
                return self.finish(WorkerStatus::NetError, Some(e.to_string()));
            }
            Ok(Ok(resp)) => resp,
        };

        match response.status {
            200 | 206 => {}
            403 | 416 => {
                let status = response.status;
                let body = match self.guard(&control, response.text(ERROR_BODY_LIMIT)).await {
                    Ok(body) => body,
                    Err(interrupt) => return self.interrupted(interrupt),
                };
                if body.contains("expired") {
                    return self.finish(
                        WorkerStatus::DownloadUrlExpired,
                        Some(format!("http status {}", status)),
                    );
                }
                if body.contains("ExceedMaxConcurrency") {
                    let backoff = self.ctx.backoff();
                    debug!(worker = self.id, ?backoff, "remote concurrency exceeded, backing off");
                    if let Err(interrupt) = self.guard(&control, tokio::time::sleep(backoff)).await {
                        return self.interrupted(interrupt);
                    }
                    return self.finish(
                        WorkerStatus::NetError,
                        Some("exceeded remote max concurrency".into()),
                    );
                }
                return self.finish(
                    WorkerStatus::NetError,
                    Some(format!("http status {}", status)),
                );
            }
            406 => {
                return self.finish(WorkerStatus::NetError, Some("http status 406".into()));
            }
            404 | 429 | 503 | 509 => {
                return self.finish(
                    WorkerStatus::TooManyConnections,
                    Some(format!("http status {}", response.status)),
                );
            }
            other => {
                return self.finish(
                    WorkerStatus::NetError,
                    Some(format!("unexpected http status code {}", other)),
                );
            }
        }

        if !self.single {
            let expected = self.range().len();
            if let Some(length) = response.content_length {
                if length != expected {
                    return self.finish(
                        WorkerStatus::InternalError,
                        Some(format!(
                            "Content-Length is unexpected: {}, need {}",
                            length, expected
                        )),
                    );
                }
            }
            let total_size = self.ctx.file.size;
            if total_size > 0 {
                let total = response
                    .content_range
                    .as_deref()
                    .and_then(parse_content_range_total);
                if let Some(total) = total {
                    if total != total_size {
                        return self.finish(
                            WorkerStatus::InternalError,
                            Some(format!(
                                "Content-Range total length is unexpected: {}, need {}",
                                total, total_size
                            )),
                        );
                    }
                }
            }
        }

        self.read_body(response.body, &control).await;
    }

    /// A single stream cannot seek, so a new one starts over from byte 0
    /// and whatever the last one counted is taken back.
    fn rewind(&self) {
        let done = std::mem::replace(&mut self.range.lock().begin, 0);
        if done <= 0 {
            return;
        }
        debug!(worker = self.id, done, "restarting single stream from the first byte");
        self.ctx.status.add_transferred(-done);
        if self.ctx.file.size <= 0 {
            self.ctx.status.add_total_size(-done);
        }
    }

    async fn account(&self, n: usize) {
        // own speed includes bytes still waiting for admission
        self.speeds.add(n as u64);
        if let Some(global) = &self.ctx.global_speeds {
            global.add(n as u64);
        }
        self.throttled.store(true, Ordering::Relaxed);
        self.ctx.status.add_speeds(n).await;
        self.throttled.store(false, Ordering::Relaxed);
    }

    async fn read_body(&self, mut body: ByteStream, control: &ExecControl) {
        let cache_size = self.ctx.cache_size;
        let mut buf = BytesMut::with_capacity(cache_size);
        let mut carry = bytes::Bytes::new();

        loop {
            self.set_status(WorkerStatus::Downloading);
            let mut end_of_stream = false;
            let mut read_err: Option<String> = None;

            while buf.len() < cache_size {
                if !self.single && self.range().len() <= buf.len() as i64 {
                    break;
                }
                let chunk = if !carry.is_empty() {
                    std::mem::take(&mut carry)
                } else {
                    let chunk = match self.guard(control, body.next()).await {
                        Err(interrupt) => return self.interrupted(interrupt),
                        Ok(Some(Ok(chunk))) => chunk,
                        Ok(Some(Err(e))) => {
                            read_err = Some(e.to_string());
                            break;
                        }
                        Ok(None) => {
                            end_of_stream = true;
                            break;
                        }
                    };
                    // the rate limiter holds the read back here
                    if let Err(interrupt) = self.guard(control, self.account(chunk.len())).await {
                        return self.interrupted(interrupt);
                    }
                    chunk
                };
                let room = cache_size - buf.len();
                if chunk.len() > room {
                    buf.extend_from_slice(&chunk[..room]);
                    carry = chunk.slice(room..);
                } else {
                    buf.extend_from_slice(&chunk);
                }
            }

            let mut n = buf.len() as i64;
            if !self.single {
                let left = self.range().len();
                if left <= 0 {
                    // a split took the rest of the range
                    return self.finish(
                        WorkerStatus::Canceled,
                        Some("worker already complete".into()),
                    );
                }
                if n > left {
                    n = left;
                    end_of_stream = true;
                }
            }

            if n > 0 {
                self.set_status(WorkerStatus::WaitToWrite);
                let offset = self.range().begin;
                if let Err(e) = self.ctx.writer.write_at(&buf[..n as usize], offset).await {
                    return self.finish(
                        WorkerStatus::InternalError,
                        Some(format!("write failed at offset {}: {}", offset, e)),
                    );
                }
                self.range.lock().begin = offset + n;
                self.ctx.status.add_transferred(n);
                if self.single && self.ctx.file.size <= 0 {
                    self.ctx.status.add_total_size(n);
                }
                self.set_status(WorkerStatus::Downloading);
                buf.clear();
            }

            let left = self.range().len();
            if !self.single && left <= 0 {
                return self.finish(WorkerStatus::Succeeded, None);
            }
            if let Some(e) = read_err {
                return self.finish(WorkerStatus::Failed, Some(e));
            }
            if end_of_stream {
                if self.single {
                    return self.finish(WorkerStatus::Succeeded, None);
                }
                return self.finish(
                    WorkerStatus::Failed,
                    Some(format!("unexpected end of stream, {} bytes left", left)),
                );
            }
        }
    }
}
