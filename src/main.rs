mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "warn,pantransfer=debug",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Download {
                refs,
                output,
                files,
                verify_hash,
                try_http,
                engine,
            } => {
                let mut output = output;
                if output.is_relative() {
                    if let Ok(cwd) = std::env::current_dir() {
                        output = cwd.join(&output);
                    }
                }
                commands::run_downloads(refs, output, files, verify_hash, try_http, engine).await
            }
            Command::Upload {
                local,
                remote_path,
                endpoint,
                engine,
            } => commands::run_upload(local, remote_path, endpoint, engine).await,
            Command::List { dir } => commands::list_downloads(dir).await,
        }
    })
}
