use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::download::monitor::{Monitor, MonitorCommand};
use crate::download::worker::{Worker, WorkerContext};
use crate::download::writer::WriteAt;
use crate::error::{RemoteError, TransferError};
use crate::events::{EventSender, TransferEvent};
use crate::remote::{RemoteDownload, RemoteFile};
use crate::transfer::instance::{InstanceState, StateFile};
use crate::transfer::range::{remaining_len, Range, RangeGenMode, RangeListGen};
use crate::transfer::rate::RateLimiter;
use crate::transfer::status::{SpeedStats, TransferStatus};
use crate::utils::{is_illegal_download_url, to_http};

const STATUS_REPORT_PERIOD: Duration = Duration::from_secs(1);

/// Downloads one remote file with several workers.
pub struct Downloader {
    remote: Arc<dyn RemoteDownload>,
    file: RemoteFile,
    writer: Arc<dyn WriteAt>,
    config: TransferConfig,
    events: EventSender,
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<MonitorCommand>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<MonitorCommand>>>,
    global_speeds: Option<Arc<SpeedStats>>,
    status: Mutex<Option<Arc<TransferStatus>>>,
}

impl Downloader {
    pub fn new(
        remote: Arc<dyn RemoteDownload>,
        file: RemoteFile,
        writer: Arc<dyn WriteAt>,
        mut config: TransferConfig,
    ) -> Self {
        config.fix();
        let (commands, command_rx) = mpsc::unbounded_channel();
        Self {
            remote,
            file,
            writer,
            config,
            events: EventSender::new(),
            cancel: CancellationToken::new(),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            global_speeds: None,
            status: Mutex::new(None),
        }
    }

    /// Counts this transfer's bytes into a speed figure shared with others.
    pub fn with_global_speeds(mut self, speeds: Arc<SpeedStats>) -> Self {
        self.global_speeds = Some(speeds);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Progress of the running transfer, once it has started.
    pub fn status(&self) -> Option<Arc<TransferStatus>> {
        self.status.lock().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pause(&self) {
        self.events.emit(TransferEvent::Pause);
        let _ = self.commands.send(MonitorCommand::Pause);
    }

    pub fn resume(&self) {
        self.events.emit(TransferEvent::Resume);
        let _ = self.commands.send(MonitorCommand::Resume);
    }

    pub fn cancel(&self) {
        self.events.emit(TransferEvent::Cancel);
        self.cancel.cancel();
    }

    /// Number of workers: a forced value wins, then the length of a resumed
    /// range list, then `max_parallel` cut down for small files.
    pub fn select_parallel(
        pref_parallel: usize,
        max_parallel: usize,
        total_size: i64,
        min_parallel_size: i64,
        resumed: &[Range],
    ) -> usize {
        let parallel = if pref_parallel > 0 {
            pref_parallel
        } else if !resumed.is_empty() {
            resumed.len()
        } else {
            let by_size = total_size / min_parallel_size.max(1);
            if max_parallel as i64 > by_size {
                (by_size + 1) as usize
            } else {
                max_parallel
            }
        };
        parallel.max(1)
    }

    /// Picks the block size and installs a range generator on `status` when
    /// it has none. Returns -1 for a single whole-file range.
    pub fn select_block_size_and_init_gen(
        &self,
        status: &mut TransferStatus,
        parallel: usize,
    ) -> i64 {
        if parallel == 1 {
            return -1;
        }
        if let Some(gen) = status.range_gen() {
            return gen.block_size();
        }
        let total = status.total_size();
        let gen = match self.config.mode {
            RangeGenMode::Default => RangeListGen::new_default(total, 0, 0, parallel),
            RangeGenMode::BlockSize => {
                let block_size = (total / parallel as i64 + 1).min(self.config.block_size);
                RangeListGen::new_block_size(total, 0, block_size)
            }
        };
        let block_size = gen.block_size();
        status.set_range_gen(gen);
        block_size
    }

    pub fn select_cache_size(conf_cache_size: usize, block_size: i64) -> usize {
        if block_size > 0 && conf_cache_size as i64 > block_size {
            block_size as usize
        } else {
            conf_cache_size
        }
    }

    async fn open_state(&self) -> Option<Arc<StateFile>> {
        let path = self.config.instance_state_path.as_ref()?;
        match StateFile::open(path).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open instance state, resume disabled");
                None
            }
        }
    }

    async fn load_state(&self, store: Option<&Arc<StateFile>>) -> Option<InstanceState> {
        let state = store?.get::<InstanceState>().await?;
        if state.total_size != self.file.size {
            warn!(
                saved = state.total_size,
                remote = self.file.size,
                "remote file size changed, ignoring saved state"
            );
            return None;
        }
        Some(state)
    }

    async fn forbidden(&self, store: Option<&Arc<StateFile>>) -> TransferError {
        warn!(file = %self.file.file_ref, "download of file forbidden");
        if let Some(store) = store {
            if let Err(e) = store.remove().await {
                warn!(error = %e, "failed to remove instance state");
            }
        }
        if let Err(e) = self.writer.discard().await {
            warn!(error = %e, "failed to remove partial output");
        }
        TransferError::Forbidden
    }

    fn finish(&self, result: Result<(), TransferError>) -> Result<(), TransferError> {
        match &result {
            Ok(()) => self.events.emit(TransferEvent::Success),
            Err(TransferError::Canceled) => {}
            Err(e) => self.events.emit(TransferEvent::Failed(e.to_string())),
        }
        self.events.emit(TransferEvent::Finish);
        result
    }

    pub async fn execute(&self) -> Result<(), TransferError> {
        let result = self.run().await;
        self.finish(result)
    }

    async fn run(&self) -> Result<(), TransferError> {
        let total_size = self.file.size;
        let single = !self.file.accept_ranges;

        if total_size == 0 && !single {
            info!(file = %self.file.file_ref, "empty file, nothing to download");
            self.writer.truncate().await?;
            return Ok(());
        }

        let store = if single { None } else { self.open_state().await };
        let resumed = self.load_state(store.as_ref()).await;
        let is_resume = resumed.is_some();

        let (mut status, ranges) = match resumed {
            Some(state) => {
                let outstanding = state.outstanding();
                debug!(transferred = state.transferred(), outstanding, "resuming from saved state");
                if outstanding == 0 {
                    if let Some(store) = &store {
                        store.remove().await?;
                    }
                    return Ok(());
                }
                state.into_status()
            }
            None => (TransferStatus::new(total_size), Vec::new()),
        };
        status.set_rate_limiter(RateLimiter::new(self.config.max_rate).map(Arc::new));

        let parallel = if single {
            1
        } else {
            Self::select_parallel(
                self.config.slice_parallel,
                self.config.max_parallel,
                total_size,
                self.config.min_parallel_size,
                &ranges,
            )
        };
        let block_size = if single {
            -1
        } else {
            self.select_block_size_and_init_gen(&mut status, parallel)
        };
        let cache_size = Self::select_cache_size(self.config.cache_size, block_size);
        debug!(parallel, block_size, cache_size, single, "download plan");

        if !is_resume {
            self.writer.truncate().await?;
            if !single {
                if let Err(e) = self.writer.preallocate(total_size).await {
                    debug!(error = %e, "preallocation failed");
                }
            }
        }

        let mut ranges = ranges;
        if ranges.is_empty() && !single {
            match status.range_gen() {
                Some(gen) => {
                    for _ in 0..parallel {
                        match gen.gen_range() {
                            Some((_, range)) => ranges.push(range),
                            None => break,
                        }
                    }
                }
                None => ranges.push(Range::new(0, total_size)),
            }
        }

        let url = match self.remote.download_url(&self.file).await {
            Ok(url) => url,
            Err(RemoteError::Forbidden) => return Err(self.forbidden(store.as_ref()).await),
            Err(e) => return Err(e.into()),
        };
        if is_illegal_download_url(&url) {
            return Err(self.forbidden(store.as_ref()).await);
        }
        let url = if self.config.try_http { to_http(&url) } else { url };

        let status = Arc::new(status);
        *self.status.lock() = Some(status.clone());

        let ctx = WorkerContext::new(
            self.remote.clone(),
            self.writer.clone(),
            status.clone(),
            self.file.clone(),
        )
        .with_cache_size(cache_size)
        .with_backoff(self.config.concurrency_backoff, self.config.backoff_jitter)
        .with_global_speeds(self.global_speeds.clone());
        let wake = ctx.wake_handle();
        let ctx = Arc::new(ctx);

        let mut monitor = Monitor::new(status.clone(), wake, &self.config);
        if single {
            monitor.append(Worker::new(0, ctx, url, None, self.cancel.child_token()));
            monitor.set_reload_workers(false);
        } else {
            debug!(
                ranges = ranges.len(),
                remaining = remaining_len(&ranges),
                "starting workers"
            );
            for (id, range) in ranges.into_iter().enumerate() {
                monitor.append(Worker::new(
                    id,
                    ctx.clone(),
                    url.clone(),
                    Some(range),
                    self.cancel.child_token(),
                ));
            }
        }
        if let Some(store) = &store {
            monitor.set_instance_state(store.clone());
        }

        let command_rx = self.command_rx.lock().take();
        let commands = command_rx.unwrap_or_else(|| mpsc::unbounded_channel().1);

        self.events.emit(TransferEvent::Execute);
        let stop_reporter = CancellationToken::new();
        let reporter = self.events.spawn_status_reporter(
            status.clone(),
            STATUS_REPORT_PERIOD,
            stop_reporter.clone(),
        );

        let result = monitor.execute(self.cancel.clone(), commands).await;

        stop_reporter.cancel();
        let _ = reporter.await;
        self.events.emit(TransferEvent::Status(status.snapshot()));

        match &result {
            Ok(()) => {
                info!(file = %self.file.file_ref, bytes = status.transferred(), "download finished");
                if let Some(store) = &store {
                    if let Err(e) = store.remove().await {
                        warn!(error = %e, "failed to remove instance state");
                    }
                }
            }
            Err(e) => {
                info!(file = %self.file.file_ref, error = %e, "download stopped, state kept for resume");
            }
        }
        result
    }
}
