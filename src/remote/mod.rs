//! Narrow interfaces to the remote store. The engines only ever talk to the
//! network through these traits.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;

use crate::error::RemoteError;

pub mod http;

pub use http::HttpRemote;

pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;
pub type PartBody = BoxStream<'static, io::Result<Bytes>>;

/// Metadata of a remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub file_ref: String,
    pub name: String,
    pub size: i64,
    pub accept_ranges: bool,
    pub sha256: Option<String>,
}

pub struct RangeResponse {
    pub status: u16,
    pub content_length: Option<i64>,
    pub content_range: Option<String>,
    pub body: ByteStream,
}

impl RangeResponse {
    /// Drains up to `limit` bytes of the body as text, for error inspection.
    pub async fn text(mut self, limit: usize) -> String {
        let mut buf = Vec::new();
        while buf.len() < limit {
            match self.body.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                _ => break,
            }
        }
        buf.truncate(limit);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait RemoteDownload: Send + Sync {
    async fn file_info(&self, file_ref: &str) -> Result<RemoteFile, RemoteError>;

    /// A time-limited URL for the file's content.
    async fn download_url(&self, file: &RemoteFile) -> Result<String, RemoteError>;

    /// `range` is `(offset, end_inclusive)`; `None` requests the whole body.
    async fn download_range(
        &self,
        url: &str,
        range: Option<(i64, i64)>,
    ) -> Result<RangeResponse, RemoteError>;
}

/// An open multipart upload on the remote.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,
    pub file_id: String,
    pub part_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutPartOutcome {
    Done,
    UrlExpired,
    PartAlreadyExists,
    PartNotSequential,
    NoSuchUpload,
    Status(u16),
}

#[async_trait]
pub trait RemoteUpload: Send + Sync {
    async fn create_upload(
        &self,
        target: &str,
        size: i64,
        part_count: usize,
    ) -> Result<UploadSession, RemoteError>;

    async fn upload_part_url(
        &self,
        session: &UploadSession,
        part: usize,
    ) -> Result<String, RemoteError>;

    async fn put_part(
        &self,
        url: &str,
        len: i64,
        body: PartBody,
    ) -> Result<PutPartOutcome, RemoteError>;

    async fn complete_upload(&self, session: &UploadSession) -> Result<(), RemoteError>;
}
