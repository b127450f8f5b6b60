use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::{header, Body, Client, Response};
use serde::Deserialize;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::TransferConfig;
use crate::error::RemoteError;
use crate::remote::{
    PartBody, PutPartOutcome, RangeResponse, RemoteDownload, RemoteFile, RemoteUpload,
    UploadSession,
};
use crate::utils::get_filename_from_url;

const USER_AGENT: &str = concat!("pantransfer/", env!("CARGO_PKG_VERSION"));
const SHA256_HEADER: &str = "x-content-sha256";

/// Plain HTTP remote: file refs are URLs, uploads go through a small JSON API
/// rooted at `upload_base`.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    control: Client,
    data: Client,
    upload_base: Option<Url>,
}

#[derive(Deserialize)]
struct PartUrl {
    url: String,
}

impl HttpRemote {
    pub fn new(config: &TransferConfig) -> Result<Self, RemoteError> {
        let control = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.control_timeout)
            .build()?;
        let data = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.data_timeout)
            .build()?;
        Ok(Self {
            control,
            data,
            upload_base: None,
        })
    }

    pub fn with_upload_base(mut self, base: Url) -> Self {
        self.upload_base = Some(base);
        self
    }

    fn upload_endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        let base = self
            .upload_base
            .as_ref()
            .ok_or_else(|| RemoteError::Decode("no upload endpoint configured".into()))?;
        let mut base = base.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(path)
            .map_err(|e| RemoteError::Decode(format!("bad upload endpoint: {}", e)))
    }

    async fn post_json(&self, url: Url, body: serde_json::Value) -> Result<Response, RemoteError> {
        let resp = self.control.post(url).json(&body).send().await?;
        check_status(resp).await
    }
}

async fn check_status(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        code: status.as_u16(),
        body,
    })
}

fn header_i64(resp: &Response, name: header::HeaderName) -> Option<i64> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Pulls the error code out of an XML `<Code>` element or a JSON `code` field.
fn error_code(body: &str) -> Option<String> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        let code = map.get("code").or_else(|| map.get("Code"));
        if let Some(serde_json::Value::String(code)) = code {
            return Some(code.clone());
        }
    }
    let start = body.find("<Code>")? + "<Code>".len();
    let end = body[start..].find("</Code>")? + start;
    Some(body[start..end].trim().to_string())
}

fn part_outcome(status: u16, body: &str) -> PutPartOutcome {
    match error_code(body).as_deref() {
        Some("PartNotSequential") => PutPartOutcome::PartNotSequential,
        Some("NoSuchUpload") => PutPartOutcome::NoSuchUpload,
        Some("PartAlreadyExist") | Some("PartAlreadyExists") => PutPartOutcome::PartAlreadyExists,
        Some("AccessDenied") if body.contains("Request has expired") => PutPartOutcome::UrlExpired,
        _ => PutPartOutcome::Status(status),
    }
}

/// reqwest wants a `Sync` body stream; this hands out exclusive access
/// without ever locking.
struct SyncBody(Mutex<PartBody>);

impl Stream for SyncBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().0.get_mut().as_mut().poll_next(cx)
    }
}

#[async_trait]
impl RemoteDownload for HttpRemote {
    async fn file_info(&self, file_ref: &str) -> Result<RemoteFile, RemoteError> {
        let resp = self.control.head(file_ref).send().await?;
        if resp.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(RemoteError::Forbidden);
        }
        let resp = check_status(resp).await?;

        // HEAD responses have an empty body, so read the header itself
        let size = header_i64(&resp, header::CONTENT_LENGTH).unwrap_or(0);
        let accept_ranges = resp
            .headers()
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        let sha256 = resp
            .headers()
            .get(SHA256_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let name = get_filename_from_url(file_ref)
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        debug!(file_ref, size, accept_ranges, "fetched file info");
        Ok(RemoteFile {
            file_ref: file_ref.to_string(),
            name,
            size,
            accept_ranges: accept_ranges && size > 0,
            sha256,
        })
    }

    async fn download_url(&self, file: &RemoteFile) -> Result<String, RemoteError> {
        Ok(file.file_ref.clone())
    }

    async fn download_range(
        &self,
        url: &str,
        range: Option<(i64, i64)>,
    ) -> Result<RangeResponse, RemoteError> {
        let mut request = self.data.get(url);
        if let Some((offset, end)) = range {
            request = request.header(header::RANGE, format!("bytes={}-{}", offset, end));
        }
        let resp = request.send().await?;

        let status = resp.status().as_u16();
        let content_length = header_i64(&resp, header::CONTENT_LENGTH);
        let content_range = resp
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp
            .bytes_stream()
            .map(|item| item.map_err(RemoteError::from))
            .boxed();

        Ok(RangeResponse {
            status,
            content_length,
            content_range,
            body,
        })
    }
}

#[async_trait]
impl RemoteUpload for HttpRemote {
    async fn create_upload(
        &self,
        target: &str,
        size: i64,
        part_count: usize,
    ) -> Result<UploadSession, RemoteError> {
        let url = self.upload_endpoint("uploads")?;
        let resp = self
            .post_json(
                url,
                serde_json::json!({ "target": target, "size": size, "part_count": part_count }),
            )
            .await?;
        resp.json::<UploadSession>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn upload_part_url(
        &self,
        session: &UploadSession,
        part: usize,
    ) -> Result<String, RemoteError> {
        let url = self.upload_endpoint(&format!(
            "uploads/{}/parts/{}/url",
            session.upload_id,
            part + 1
        ))?;
        let resp = self.post_json(url, serde_json::json!({})).await?;
        let part_url = resp
            .json::<PartUrl>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(part_url.url)
    }

    async fn put_part(
        &self,
        url: &str,
        len: i64,
        body: PartBody,
    ) -> Result<PutPartOutcome, RemoteError> {
        let resp = self
            .data
            .put(url)
            .header(header::CONTENT_LENGTH, len)
            .body(Body::wrap_stream(SyncBody(Mutex::new(body))))
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(PutPartOutcome::Done);
        }
        let text = resp.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %text, "part upload rejected");
        Ok(part_outcome(status.as_u16(), &text))
    }

    async fn complete_upload(&self, session: &UploadSession) -> Result<(), RemoteError> {
        let url = self.upload_endpoint(&format!("uploads/{}/complete", session.upload_id))?;
        self.post_json(url, serde_json::json!({ "file_id": session.file_id }))
            .await?;
        Ok(())
    }
}
