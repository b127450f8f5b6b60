//! In-memory remote used by the engine tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pantransfer::error::RemoteError;
use pantransfer::remote::{
    PartBody, PutPartOutcome, RangeResponse, RemoteDownload, RemoteFile, RemoteUpload,
    UploadSession,
};
use pantransfer::TransferConfig;

pub const FILE_URL: &str = "https://cdn.example.com/files/data.bin";

pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Config tuned for tests: fast ticks, no throttling backoff.
pub fn fast_config() -> TransferConfig {
    TransferConfig {
        tick_interval: Duration::from_millis(20),
        concurrency_backoff: Duration::ZERO,
        ..TransferConfig::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub offset: i64,
    /// Exclusive.
    pub end: i64,
}

/// Serves a byte buffer over the download traits and records every request.
pub struct MockRemote {
    data: Bytes,
    accept_ranges: bool,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    requests: Mutex<Vec<Option<RangeRequest>>>,
    url_calls: AtomicUsize,
    urls: Mutex<VecDeque<String>>,
    /// One-shot stream failure: a request starting at `offset` breaks after `bytes`.
    fail_after: Mutex<HashMap<i64, usize>>,
    responses: Mutex<VecDeque<(u16, String)>>,
    wrong_content_length: AtomicBool,
    wrong_total: AtomicBool,
    /// Once this many bytes are served in total, bodies stop yielding.
    serve_budget: Option<u64>,
    served: Arc<AtomicU64>,
}

impl MockRemote {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
            accept_ranges: true,
            chunk_size: 16 * 1024,
            chunk_delay: None,
            requests: Mutex::new(Vec::new()),
            url_calls: AtomicUsize::new(0),
            urls: Mutex::new(VecDeque::new()),
            fail_after: Mutex::new(HashMap::new()),
            responses: Mutex::new(VecDeque::new()),
            wrong_content_length: AtomicBool::new(false),
            wrong_total: AtomicBool::new(false),
            serve_budget: None,
            served: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn without_ranges(mut self) -> Self {
        self.accept_ranges = false;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn with_serve_budget(mut self, bytes: u64) -> Self {
        self.serve_budget = Some(bytes);
        self
    }

    /// URLs handed out by successive `download_url` calls; the last one repeats.
    pub fn with_urls(self, urls: &[&str]) -> Self {
        self.urls.lock().extend(urls.iter().map(|u| u.to_string()));
        self
    }

    pub fn fail_request_at(&self, offset: i64, after_bytes: usize) {
        self.fail_after.lock().insert(offset, after_bytes);
    }

    /// The next request gets this status and body instead of data.
    pub fn push_response(&self, status: u16, body: &str) {
        self.responses.lock().push_back((status, body.to_string()));
    }

    pub fn send_wrong_content_length(&self) {
        self.wrong_content_length.store(true, Ordering::SeqCst);
    }

    /// Content-Range reports a total one byte larger than the file.
    pub fn send_wrong_total(&self) {
        self.wrong_total.store(true, Ordering::SeqCst);
    }

    pub fn file(&self) -> RemoteFile {
        RemoteFile {
            file_ref: FILE_URL.to_string(),
            name: "data.bin".to_string(),
            size: self.data.len() as i64,
            accept_ranges: self.accept_ranges,
            sha256: None,
        }
    }

    pub fn requests(&self) -> Vec<Option<RangeRequest>> {
        self.requests.lock().clone()
    }

    pub fn range_requests(&self) -> Vec<RangeRequest> {
        self.requests.lock().iter().flatten().copied().collect()
    }

    pub fn url_calls(&self) -> usize {
        self.url_calls.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    fn body(&self, offset: usize, end: usize, fail_after: Option<usize>) -> pantransfer::remote::ByteStream {
        let chunk_size = self.chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut pos = offset;
        while pos < end {
            let next = (pos + chunk_size).min(end);
            chunks.push(self.data.slice(pos..next));
            pos = next;
        }
        let delay = self.chunk_delay;
        let budget = self.serve_budget;
        let served = self.served.clone();
        let state = (chunks.into_iter(), 0usize, false);
        stream::unfold(state, move |(mut chunks, mut sent, failed)| {
            let served = served.clone();
            async move {
                if failed {
                    return None;
                }
                let mut chunk = chunks.next()?;
                if let Some(limit) = fail_after {
                    if sent >= limit {
                        let err = RemoteError::Decode("connection reset by peer".into());
                        return Some((Err(err), (chunks, sent, true)));
                    }
                    if sent + chunk.len() > limit {
                        chunk = chunk.slice(..limit - sent);
                    }
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if let Some(budget) = budget {
                    if served.load(Ordering::SeqCst) >= budget {
                        futures::future::pending::<()>().await;
                    }
                }
                served.fetch_add(chunk.len() as u64, Ordering::SeqCst);
                sent += chunk.len();
                Some((Ok(chunk), (chunks, sent, false)))
            }
        })
        .boxed()
    }
}

#[async_trait]
impl RemoteDownload for MockRemote {
    async fn file_info(&self, _file_ref: &str) -> Result<RemoteFile, RemoteError> {
        Ok(self.file())
    }

    async fn download_url(&self, _file: &RemoteFile) -> Result<String, RemoteError> {
        self.url_calls.fetch_add(1, Ordering::SeqCst);
        let mut urls = self.urls.lock();
        let url = if urls.len() > 1 {
            urls.pop_front()
        } else {
            urls.front().cloned()
        };
        Ok(url.unwrap_or_else(|| FILE_URL.to_string()))
    }

    async fn download_range(
        &self,
        _url: &str,
        range: Option<(i64, i64)>,
    ) -> Result<RangeResponse, RemoteError> {
        let request = range.map(|(offset, last)| RangeRequest {
            offset,
            end: last + 1,
        });
        self.requests.lock().push(request);

        if let Some((status, body)) = self.responses.lock().pop_front() {
            let body = Bytes::from(body.into_bytes());
            return Ok(RangeResponse {
                status,
                content_length: Some(body.len() as i64),
                content_range: None,
                body: stream::iter(vec![Ok(body)]).boxed(),
            });
        }

        let total = self.data.len();
        let (offset, end, status) = match request {
            Some(r) => (r.offset as usize, (r.end as usize).min(total), 206),
            None => (0, total, 200),
        };
        let fail_after = self.fail_after.lock().remove(&(offset as i64));
        let mut content_length = (end - offset) as i64;
        if self.wrong_content_length.load(Ordering::SeqCst) {
            content_length += 1;
        }
        let reported_total = if self.wrong_total.load(Ordering::SeqCst) {
            total + 1
        } else {
            total
        };
        Ok(RangeResponse {
            status,
            content_length: Some(content_length),
            content_range: request
                .map(|r| format!("bytes {}-{}/{}", r.offset, r.end - 1, reported_total)),
            body: self.body(offset, end, fail_after),
        })
    }
}

/// Records parts in arrival order and replays scripted outcomes.
#[derive(Default)]
pub struct MockUploadRemote {
    outcomes: Mutex<HashMap<usize, VecDeque<PutPartOutcome>>>,
    puts: Mutex<Vec<usize>>,
    parts: Mutex<HashMap<usize, Vec<u8>>>,
    part_url_calls: AtomicUsize,
    created: AtomicUsize,
    committed: AtomicBool,
}

impl MockUploadRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers of the next puts of `part`, before it falls back to `Done`.
    pub fn script(&self, part: usize, outcomes: &[PutPartOutcome]) {
        self.outcomes
            .lock()
            .entry(part)
            .or_default()
            .extend(outcomes.iter().copied());
    }

    pub fn puts(&self) -> Vec<usize> {
        self.puts.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn part_url_calls(&self) -> usize {
        self.part_url_calls.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Parts that the remote accepted, concatenated in part order.
    pub fn assembled(&self) -> Vec<u8> {
        let parts = self.parts.lock();
        let mut ids: Vec<_> = parts.keys().copied().collect();
        ids.sort_unstable();
        ids.iter().flat_map(|id| parts[id].clone()).collect()
    }
}

fn part_from_url(url: &str) -> usize {
    url.rsplit('/')
        .next()
        .and_then(|s| s.split('?').next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(usize::MAX)
}

#[async_trait]
impl RemoteUpload for MockUploadRemote {
    async fn create_upload(
        &self,
        target: &str,
        _size: i64,
        part_count: usize,
    ) -> Result<UploadSession, RemoteError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(UploadSession {
            upload_id: format!("upload-{}", n),
            file_id: target.to_string(),
            part_urls: (0..part_count)
                .map(|i| format!("mock://parts/{}", i))
                .collect(),
        })
    }

    async fn upload_part_url(
        &self,
        _session: &UploadSession,
        part: usize,
    ) -> Result<String, RemoteError> {
        let n = self.part_url_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("mock://parts/{}?fresh={}", part, n))
    }

    async fn put_part(
        &self,
        url: &str,
        _len: i64,
        body: PartBody,
    ) -> Result<PutPartOutcome, RemoteError> {
        let part = part_from_url(url);
        self.puts.lock().push(part);
        let chunks: Vec<Bytes> = body
            .try_collect()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        let outcome = self
            .outcomes
            .lock()
            .get_mut(&part)
            .and_then(|q| q.pop_front())
            .unwrap_or(PutPartOutcome::Done);
        if outcome == PutPartOutcome::Done {
            self.parts.lock().insert(part, chunks.concat());
        }
        Ok(outcome)
    }

    async fn complete_upload(&self, _session: &UploadSession) -> Result<(), RemoteError> {
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
