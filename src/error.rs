use std::io;
use thiserror::Error;

/// Failures reported by the remote collaborators.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("file download forbidden")]
    Forbidden,
    #[error("invalid response: {0}")]
    Decode(String),
}

/// How a caller should react to a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Start the whole transfer again.
    Retry,
    /// Run it again with the saved state to continue.
    Resume,
    /// Retrying cannot help.
    Abort,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no workers to run")]
    NoWorkers,
    #[error("internal error: {0}")]
    Fatal(String),
    #[error("file download forbidden")]
    Forbidden,
    #[error("transfer canceled")]
    Canceled,
    #[error("gave up after repeated worker failures: {0}")]
    RetriesExhausted(String),
    #[error("{0} part(s) left unfinished")]
    Incomplete(usize),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("state encoding failed: {0}")]
    State(#[from] serde_json::Error),
}

impl TransferError {
    pub fn disposition(&self) -> Disposition {
        match self {
            TransferError::Fatal(_) | TransferError::Forbidden => Disposition::Abort,
            TransferError::Canceled
            | TransferError::RetriesExhausted(_)
            | TransferError::Incomplete(_) => Disposition::Resume,
            TransferError::Upload(e) => e.disposition(),
            TransferError::Remote(RemoteError::Forbidden) => Disposition::Abort,
            TransferError::NoWorkers
            | TransferError::Remote(_)
            | TransferError::Io(_)
            | TransferError::State(_) => Disposition::Retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadErrorKind {
    #[error("upload url expired")]
    UrlExpired,
    #[error("part not uploaded in sequence")]
    PartNotSequential,
    #[error("upload session not found")]
    NoSuchUpload,
    #[error("upload terminated")]
    Terminate,
    #[error("http status {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("local read failed: {0}")]
    LocalRead(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upload failed: {kind}")]
pub struct UploadError {
    pub kind: UploadErrorKind,
    /// The whole upload is dead and must not be retried.
    pub terminated: bool,
    /// The remote lost track of part order; restart from the first unfinished part.
    pub need_start_over: bool,
}

impl UploadError {
    pub fn retryable(kind: UploadErrorKind) -> Self {
        Self {
            kind,
            terminated: false,
            need_start_over: false,
        }
    }

    pub fn terminate(kind: UploadErrorKind) -> Self {
        Self {
            kind,
            terminated: true,
            need_start_over: false,
        }
    }

    pub fn start_over(kind: UploadErrorKind) -> Self {
        Self {
            kind,
            terminated: false,
            need_start_over: true,
        }
    }

    pub fn disposition(&self) -> Disposition {
        if self.terminated {
            Disposition::Abort
        } else if self.need_start_over {
            Disposition::Retry
        } else {
            Disposition::Resume
        }
    }
}
