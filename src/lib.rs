pub mod config;
pub mod download;
pub mod error;
pub mod events;
pub mod hashing;
pub mod remote;
pub mod transfer;
pub mod upload;
pub mod utils;

pub use config::TransferConfig;
pub use download::Downloader;
pub use error::{Disposition, RemoteError, TransferError, UploadError, UploadErrorKind};
pub use events::TransferEvent;
pub use upload::MultiUploader;
