pub mod downloader;
pub mod monitor;
pub mod reset;
pub mod worker;
pub mod writer;

pub use downloader::Downloader;
pub use monitor::{Monitor, MonitorCommand};
pub use reset::ResetController;
pub use worker::{Worker, WorkerContext, WorkerStatus};
pub use writer::{FileWriter, MemoryWriter, WriteAt};
