use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::{RemoteError, TransferError, UploadError, UploadErrorKind};
use crate::events::{EventSender, TransferEvent};
use crate::remote::{PutPartOutcome, RemoteUpload, UploadSession};
use crate::transfer::instance::StateFile;
use crate::transfer::range::Range;
use crate::transfer::rate::RateLimiter;
use crate::transfer::status::{SpeedStats, TransferStatus};
use crate::upload::block::{split_block, PartSource};
use crate::upload::state::{pending_parts, BlockState, UploadInstanceState};

const STATUS_REPORT_PERIOD: Duration = Duration::from_secs(1);
const SPEED_SAMPLE_PERIOD: Duration = Duration::from_secs(1);

/// One multipart upload as seen by [`MultiUploader`].
#[async_trait]
pub trait MultiUpload: Send + Sync {
    /// Opens the upload on the remote unless a session is already known.
    async fn precreate(&self, file_size: i64, part_count: usize) -> Result<(), UploadError>;

    /// Sends part `part`, covering `source.range()` of the local file.
    /// `Ok(true)` means the remote holds the part.
    async fn upload_part(&self, part: usize, source: PartSource) -> Result<bool, UploadError>;

    async fn commit(&self) -> Result<(), UploadError>;

    /// The session to persist, if one is open.
    fn session(&self) -> Option<UploadSession> {
        None
    }

    /// Reattaches a session saved by an earlier run.
    fn restore_session(&self, _session: UploadSession) {}
}

fn remote_error(e: RemoteError) -> UploadError {
    match e {
        RemoteError::Status { code, .. } if is_terminal_status(code) => {
            UploadError::terminate(UploadErrorKind::Http(code))
        }
        RemoteError::Status { code, .. } => UploadError::retryable(UploadErrorKind::Http(code)),
        RemoteError::Forbidden => UploadError::terminate(UploadErrorKind::Terminate),
        other => UploadError::retryable(UploadErrorKind::Network(other.to_string())),
    }
}

fn is_terminal_status(code: u16) -> bool {
    (400..500).contains(&code) || code == 600
}

/// [`MultiUpload`] over a [`RemoteUpload`] collaborator.
pub struct RemotePartUpload {
    remote: Arc<dyn RemoteUpload>,
    target: String,
    session: Mutex<Option<UploadSession>>,
}

impl RemotePartUpload {
    pub fn new(remote: Arc<dyn RemoteUpload>, target: impl Into<String>) -> Self {
        Self {
            remote,
            target: target.into(),
            session: Mutex::new(None),
        }
    }

    fn current_session(&self) -> Result<UploadSession, UploadError> {
        self.session
            .lock()
            .clone()
            .ok_or_else(|| UploadError::terminate(UploadErrorKind::NoSuchUpload))
    }

    async fn fresh_part_url(
        &self,
        session: &UploadSession,
        part: usize,
    ) -> Result<String, UploadError> {
        let url = self
            .remote
            .upload_part_url(session, part)
            .await
            .map_err(remote_error)?;
        if let Some(session) = self.session.lock().as_mut() {
            if let Some(slot) = session.part_urls.get_mut(part) {
                *slot = url.clone();
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl MultiUpload for RemotePartUpload {
    async fn precreate(&self, file_size: i64, part_count: usize) -> Result<(), UploadError> {
        if self.session.lock().is_some() {
            return Ok(());
        }
        let session = self
            .remote
            .create_upload(&self.target, file_size, part_count)
            .await
            .map_err(remote_error)?;
        debug!(upload_id = %session.upload_id, part_count, "created upload session");
        *self.session.lock() = Some(session);
        Ok(())
    }

    async fn upload_part(&self, part: usize, source: PartSource) -> Result<bool, UploadError> {
        let session = self.current_session()?;
        let mut url = match session.part_urls.get(part) {
            Some(url) if !url.is_empty() => url.clone(),
            _ => self.fresh_part_url(&session, part).await?,
        };

        let mut refreshed = false;
        loop {
            let sent = self.remote.put_part(&url, source.len(), source.body()).await;
            if let Some(e) = source.local_error() {
                return Err(UploadError::terminate(UploadErrorKind::LocalRead(e)));
            }
            let outcome = sent.map_err(remote_error)?;
            match outcome {
                PutPartOutcome::Done => return Ok(true),
                PutPartOutcome::PartAlreadyExists => {
                    debug!(part, "part already on remote");
                    return Ok(true);
                }
                PutPartOutcome::UrlExpired if !refreshed => {
                    debug!(part, "part url expired, fetching a new one");
                    refreshed = true;
                    url = self.fresh_part_url(&session, part).await?;
                }
                PutPartOutcome::UrlExpired => {
                    return Err(UploadError::retryable(UploadErrorKind::UrlExpired))
                }
                PutPartOutcome::PartNotSequential => {
                    return Err(UploadError::start_over(UploadErrorKind::PartNotSequential))
                }
                PutPartOutcome::NoSuchUpload => {
                    return Err(UploadError::terminate(UploadErrorKind::NoSuchUpload))
                }
                PutPartOutcome::Status(code) if is_terminal_status(code) => {
                    return Err(UploadError::terminate(UploadErrorKind::Http(code)))
                }
                PutPartOutcome::Status(code) => {
                    return Err(UploadError::retryable(UploadErrorKind::Http(code)))
                }
            }
        }
    }

    async fn commit(&self) -> Result<(), UploadError> {
        let session = self.current_session()?;
        self.remote
            .complete_upload(&session)
            .await
            .map_err(remote_error)
    }

    fn session(&self) -> Option<UploadSession> {
        self.session.lock().clone()
    }

    fn restore_session(&self, session: UploadSession) {
        *self.session.lock() = Some(session);
    }
}

/// Uploads a local file part by part, strictly in order.
pub struct MultiUploader {
    multi: Arc<dyn MultiUpload>,
    path: PathBuf,
    file_size: i64,
    config: TransferConfig,
    events: EventSender,
    cancel: CancellationToken,
    global_speeds: Option<Arc<SpeedStats>>,
    blocks: Mutex<Vec<BlockState>>,
    status: Mutex<Option<Arc<TransferStatus>>>,
}

impl MultiUploader {
    pub fn new(
        multi: Arc<dyn MultiUpload>,
        path: impl AsRef<Path>,
        file_size: i64,
        mut config: TransferConfig,
    ) -> Self {
        config.fix();
        Self {
            multi,
            path: path.as_ref().to_path_buf(),
            file_size,
            config,
            events: EventSender::new(),
            cancel: CancellationToken::new(),
            global_speeds: None,
            blocks: Mutex::new(Vec::new()),
            status: Mutex::new(None),
        }
    }

    pub fn with_global_speeds(mut self, speeds: Arc<SpeedStats>) -> Self {
        self.global_speeds = Some(speeds);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> Option<Arc<TransferStatus>> {
        self.status.lock().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.events.emit(TransferEvent::Cancel);
        self.cancel.cancel();
    }

    pub fn blocks(&self) -> Vec<BlockState> {
        self.blocks.lock().clone()
    }

    /// Ids of parts not yet on the remote, in upload order.
    pub fn pending_parts(&self) -> Vec<usize> {
        pending_parts(&self.blocks.lock())
    }

    async fn open_state(&self) -> Option<Arc<StateFile>> {
        let path = self.config.instance_state_path.as_ref()?;
        match StateFile::open(path).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open upload state, resume disabled");
                None
            }
        }
    }

    /// Blocks to work on: saved state first, then what an earlier call on
    /// this uploader left behind, else a fresh split.
    async fn load_blocks(&self, store: Option<&Arc<StateFile>>) -> Vec<BlockState> {
        let block_size = self.config.upload_block_size;
        if let Some(store) = store {
            if let Some(state) = store.get::<UploadInstanceState>().await {
                if state.file_size == self.file_size && state.block_size == block_size {
                    debug!(
                        uploaded = state.uploaded(),
                        pending = state.pending_parts().len(),
                        "resuming upload from saved state"
                    );
                    if let Some(session) = state.session {
                        self.multi.restore_session(session);
                    }
                    return state.blocks;
                }
                warn!("local file changed since the saved upload, starting over");
            }
        }
        let kept = self.blocks.lock().clone();
        if !kept.is_empty() {
            return kept;
        }
        split_block(self.file_size, block_size)
    }

    async fn persist(&self, store: Option<&Arc<StateFile>>) {
        let Some(store) = store else {
            return;
        };
        let state = UploadInstanceState::new(
            self.file_size,
            self.config.upload_block_size,
            self.multi.session(),
            self.blocks(),
        );
        if let Err(e) = store.put(&state).await {
            warn!(path = %store.path().display(), error = %e, "failed to save upload state");
        }
    }

    async fn remove_state(&self, store: Option<&Arc<StateFile>>) {
        if let Some(store) = store {
            if let Err(e) = store.remove().await {
                warn!(error = %e, "failed to remove upload state");
            }
        }
    }

    fn mark_done(&self, part: usize) -> i64 {
        let mut blocks = self.blocks.lock();
        match blocks.iter_mut().find(|b| b.id == part) {
            Some(block) => {
                block.upload_done = true;
                block.range.len()
            }
            None => 0,
        }
    }

    fn block_range(&self, part: usize) -> Option<Range> {
        self.blocks
            .lock()
            .iter()
            .find(|b| b.id == part)
            .map(|b| b.range)
    }

    pub async fn execute(&self) -> Result<(), TransferError> {
        let result = self.run().await;
        match &result {
            Ok(()) => self.events.emit(TransferEvent::Success),
            Err(TransferError::Canceled) => {}
            Err(e) => self.events.emit(TransferEvent::Failed(e.to_string())),
        }
        self.events.emit(TransferEvent::Finish);
        result
    }

    async fn run(&self) -> Result<(), TransferError> {
        let store = self.open_state().await;
        let blocks = self.load_blocks(store.as_ref()).await;
        *self.blocks.lock() = blocks;

        let part_count = self.blocks.lock().len();
        self.multi.precreate(self.file_size, part_count).await?;
        self.persist(store.as_ref()).await;

        let mut status = TransferStatus::new(self.file_size);
        status.set_rate_limiter(RateLimiter::new(self.config.max_rate).map(Arc::new));
        let uploaded: i64 = self
            .blocks
            .lock()
            .iter()
            .filter(|b| b.upload_done)
            .map(|b| b.range.len())
            .sum();
        status.set_transferred(uploaded);
        let status = Arc::new(status);
        *self.status.lock() = Some(status.clone());

        self.events.emit(TransferEvent::Execute);
        let stop_reporter = CancellationToken::new();
        let reporter = self.events.spawn_status_reporter(
            status.clone(),
            STATUS_REPORT_PERIOD,
            stop_reporter.clone(),
        );

        let result = self.upload_parts(&status, store.as_ref()).await;

        stop_reporter.cancel();
        let _ = reporter.await;
        self.events.emit(TransferEvent::Status(status.snapshot()));

        match result {
            Ok(()) => {}
            Err(TransferError::Upload(e)) if e.terminated => {
                warn!(error = %e, "upload terminated");
                self.remove_state(store.as_ref()).await;
                return Err(e.into());
            }
            Err(e) => {
                info!(error = %e, pending = self.pending_parts().len(), "upload stopped, state kept for resume");
                return Err(e);
            }
        }

        let pending = self.pending_parts();
        if !pending.is_empty() {
            return Err(TransferError::Incomplete(pending.len()));
        }

        self.multi.commit().await?;
        self.remove_state(store.as_ref()).await;
        info!(path = %self.path.display(), bytes = self.file_size, "upload finished");
        Ok(())
    }

    async fn upload_parts(
        &self,
        status: &Arc<TransferStatus>,
        store: Option<&Arc<StateFile>>,
    ) -> Result<(), TransferError> {
        let mut queue: VecDeque<usize> = self.pending_parts().into();
        let mut retries: HashMap<usize, u32> = HashMap::new();
        let mut sampler = interval_at(Instant::now() + SPEED_SAMPLE_PERIOD, SPEED_SAMPLE_PERIOD);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while let Some(part) = queue.pop_front() {
            let Some(range) = self.block_range(part) else {
                continue;
            };
            let source = PartSource::new(
                &self.path,
                range,
                status.clone(),
                self.global_speeds.clone(),
            );
            debug!(part, %range, "uploading part");

            let upload = self.multi.upload_part(part, source);
            tokio::pin!(upload);
            let result = loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        info!(part, "upload canceled");
                        self.persist(store).await;
                        return Err(TransferError::Canceled);
                    }
                    result = &mut upload => break result,
                    _ = sampler.tick() => {
                        status.update_speeds();
                    }
                }
            };

            match result {
                Ok(true) => {
                    let len = self.mark_done(part);
                    status.add_transferred(len);
                    self.persist(store).await;
                }
                Err(e) if e.terminated => return Err(e.into()),
                Err(e) if e.need_start_over => {
                    warn!(part, error = %e, "remote lost part order, clearing queue");
                    queue.clear();
                    self.persist(store).await;
                    return Err(e.into());
                }
                failed => {
                    let reason = match failed {
                        Err(e) => e.to_string(),
                        Ok(_) => "part not accepted".to_string(),
                    };
                    let attempts = retries.entry(part).or_insert(0);
                    *attempts += 1;
                    if *attempts > self.config.max_part_retries {
                        warn!(part, attempts = *attempts, %reason, "part retries exhausted");
                        queue.clear();
                        self.persist(store).await;
                        break;
                    }
                    debug!(part, attempt = *attempts, %reason, "retrying part");
                    queue.push_front(part);
                }
            }
        }
        Ok(())
    }
}
