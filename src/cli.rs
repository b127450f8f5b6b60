use clap::{Args, Parser, Subcommand, ValueEnum};
use pantransfer::transfer::RangeGenMode;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log engine activity to stderr (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download one or more remote files
    Download {
        /// Remote file references (URLs)
        #[arg(required = true)]
        refs: Vec<String>,

        /// Directory to save downloaded files
        #[arg(short = 'o', long = "output", default_value = "downloads")]
        output: PathBuf,

        /// Maximum number of files downloaded at once (defaults to number of logical CPUs)
        #[arg(long = "files")]
        files: Option<usize>,

        /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
        #[arg(long = "verify-hash", value_enum, default_value = "auto")]
        verify_hash: VerifyMode,

        /// Fetch data over plain http
        #[arg(long = "try-http")]
        try_http: bool,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Upload a local file
    Upload {
        local: PathBuf,

        /// Destination path on the remote
        remote_path: String,

        /// Base URL of the upload API
        #[arg(long = "endpoint", env = "PANTRANSFER_UPLOAD_ENDPOINT")]
        endpoint: url::Url,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// List unfinished and completed downloads in a directory
    List {
        #[arg(default_value = "downloads")]
        dir: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Workers per file (0 picks from the file size)
    #[arg(short = 'p', long = "parallel", default_value_t = 0)]
    pub parallel: usize,

    /// Rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long = "rate-limit")]
    pub rate_limit: Option<u64>,

    /// Range size in block mode, or part size for uploads
    #[arg(short = 'b', long = "block-size")]
    pub block_size: Option<i64>,

    /// How a file is cut into ranges
    #[arg(short = 'm', long = "mode", value_enum, default_value = "default")]
    pub mode: RangeMode,
}

#[derive(ValueEnum, Clone, Debug)]
pub enum VerifyMode {
    Auto,
    On,
    Off,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum RangeMode {
    Default,
    Block,
}

impl From<RangeMode> for RangeGenMode {
    fn from(mode: RangeMode) -> Self {
        match mode {
            RangeMode::Default => RangeGenMode::Default,
            RangeMode::Block => RangeGenMode::BlockSize,
        }
    }
}
