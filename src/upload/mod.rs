//! Sequential multipart upload with per-part resume.

pub mod block;
pub mod state;
pub mod uploader;

pub use block::{split_block, PartSource};
pub use state::{BlockState, UploadInstanceState};
pub use uploader::{MultiUpload, MultiUploader, RemotePartUpload};
