use anyhow::{bail, Context, Result};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, Semaphore};
use tracing::warn;

use pantransfer::download::{Downloader, FileWriter};
use pantransfer::error::Disposition;
use pantransfer::events::TransferEvent;
use pantransfer::hashing::{calculate_hash, verify_hash};
use pantransfer::remote::{HttpRemote, RemoteDownload};
use pantransfer::transfer::{InstanceState, SpeedStats};
use pantransfer::upload::{MultiUploader, RemotePartUpload};
use pantransfer::utils::{get_filename_from_url, part_path, sanitize_filename, state_path};
use pantransfer::TransferConfig;

use crate::cli::{EngineArgs, VerifyMode};

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}";
const MAX_UPLOAD_RESTARTS: usize = 3;

fn engine_config(engine: &EngineArgs) -> TransferConfig {
    let mut config = TransferConfig {
        mode: engine.mode.into(),
        slice_parallel: engine.parallel,
        max_rate: engine.rate_limit.unwrap_or(0),
        ..TransferConfig::default()
    };
    if let Some(block_size) = engine.block_size {
        config.block_size = block_size;
        config.upload_block_size = block_size;
    }
    config.fix();
    config
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Mirrors transfer events onto a progress bar until the transfer finishes.
fn follow_events(mut events: broadcast::Receiver<TransferEvent>, pb: ProgressBar) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransferEvent::Status(snapshot)) => {
                    pb.set_length(snapshot.total_size.max(0) as u64);
                    pb.set_position(snapshot.transferred.max(0) as u64);
                }
                Ok(TransferEvent::Pause) => pb.set_message("Paused"),
                Ok(TransferEvent::Resume) => pb.set_message(""),
                Ok(TransferEvent::Finish) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub async fn run_downloads(
    refs: Vec<String>,
    output: PathBuf,
    files: Option<usize>,
    verify_mode: VerifyMode,
    try_http: bool,
    engine: EngineArgs,
) -> Result<()> {
    if !output.exists() {
        fs::create_dir_all(&output)
            .await
            .context("Failed to create output directory")?;
    }

    let mut config = engine_config(&engine);
    config.try_http = try_http;
    let remote: Arc<dyn RemoteDownload> =
        Arc::new(HttpRemote::new(&config).context("Failed to build http client")?);

    let multi_progress = MultiProgress::new();
    multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    let header_pb = multi_progress.add(ProgressBar::new(0));
    header_pb.set_style(ProgressStyle::default_bar().template("{msg}").unwrap_or_else(|_| ProgressStyle::default_bar()));

    let global_speeds = Arc::new(SpeedStats::new());
    let total_files = refs.len();
    let semaphore = Arc::new(Semaphore::new(files.unwrap_or_else(num_cpus::get).max(1)));
    let mut handles = vec![];

    for file_ref in refs {
        let job = DownloadJob {
            remote: remote.clone(),
            file_ref,
            output: output.clone(),
            config: config.clone(),
            verify_mode: verify_mode.clone(),
            multi_progress: multi_progress.clone(),
            global_speeds: global_speeds.clone(),
        };
        let semaphore = semaphore.clone();
        handles.push(tokio::spawn(async move {
            let file_ref = job.file_ref.clone();
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return Err(anyhow::Error::from(e)),
            };
            job.run().await.with_context(|| format!("Failed to download {}", file_ref))
        }));
    }

    let header_speeds = global_speeds.clone();
    let header = {
        let header_pb = header_pb.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let speed = header_speeds.sample();
                header_pb.set_message(format!(
                    "Files: {} | Downloaded: {} | Speed: {}/s",
                    total_files,
                    HumanBytes(header_speeds.total()),
                    HumanBytes(speed)
                ));
            }
        })
    };

    let mut failed = 0;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                eprintln!("{:#}", e);
            }
            Err(e) => {
                failed += 1;
                eprintln!("Download task panicked: {}", e);
            }
        }
    }
    header.abort();
    header_pb.finish_with_message(format!(
        "Done: {}/{} files, {} downloaded",
        total_files - failed,
        total_files,
        HumanBytes(global_speeds.total())
    ));

    if failed > 0 {
        bail!("{} of {} downloads failed", failed, total_files);
    }
    Ok(())
}

struct DownloadJob {
    remote: Arc<dyn RemoteDownload>,
    file_ref: String,
    output: PathBuf,
    config: TransferConfig,
    verify_mode: VerifyMode,
    multi_progress: MultiProgress,
    global_speeds: Arc<SpeedStats>,
}

impl DownloadJob {
    async fn run(self) -> Result<()> {
        let file = self.remote.file_info(&self.file_ref).await?;
        if matches!(self.verify_mode, VerifyMode::On) && file.sha256.is_none() {
            bail!("hash verification is on but the remote has no hash for {}", self.file_ref);
        }

        let name = if file.name.is_empty() {
            get_filename_from_url(&self.file_ref)?
        } else {
            file.name.clone()
        };
        let sanitized_filename = sanitize_filename(&name);
        let filepath = self.output.join(&sanitized_filename);
        let part_filepath = part_path(&filepath);

        let pb = self.multi_progress.add(ProgressBar::new(file.size.max(0) as u64));
        pb.set_style(bar_style());

        if filepath.exists() && !part_filepath.exists() {
            let len = fs::metadata(&filepath).await?.len();
            if len as i64 == file.size {
                pb.finish_with_message(format!("Skipped     {}", sanitized_filename));
                return Ok(());
            }
        }

        pb.set_message(format!("Downloading {}", sanitized_filename));
        let mut config = self.config.clone();
        config.instance_state_path = Some(state_path(&filepath));
        let writer = Arc::new(
            FileWriter::open(&part_filepath)
                .await
                .context("Failed to open partial file")?,
        );
        let downloader = Downloader::new(self.remote.clone(), file.clone(), writer.clone(), config)
            .with_global_speeds(self.global_speeds.clone());
        let follower = follow_events(downloader.subscribe(), pb.clone());

        let result = downloader.execute().await;
        let _ = follower.await;
        if let Err(e) = result {
            pb.abandon_with_message(format!("Failed      {}", sanitized_filename));
            if e.disposition() == Disposition::Resume {
                warn!(file = %self.file_ref, "run the same command again to resume");
            }
            return Err(e.into());
        }
        writer.sync_all().await?;
        drop(downloader);
        drop(writer);

        let expected = match self.verify_mode {
            VerifyMode::Off => None,
            VerifyMode::Auto | VerifyMode::On => file.sha256.clone(),
        };
        match expected {
            Some(expected) => {
                let hash = verify_hash(&part_filepath, &expected).await?;
                fs::rename(&part_filepath, &filepath)
                    .await
                    .context("Failed to rename partial file")?;
                pb.finish_with_message(format!("Verified    {} (SHA256: {})", sanitized_filename, hash));
            }
            None => {
                fs::rename(&part_filepath, &filepath)
                    .await
                    .context("Failed to rename partial file")?;
                pb.finish_with_message(format!("Completed   {}", sanitized_filename));
            }
        }
        Ok(())
    }
}

/// `name.ext` -> `name.ext.upload.json`
fn upload_state_path(local: &Path) -> PathBuf {
    let mut name = OsString::from(local.as_os_str());
    name.push(".upload.json");
    PathBuf::from(name)
}

pub async fn run_upload(
    local: PathBuf,
    remote_path: String,
    endpoint: url::Url,
    engine: EngineArgs,
) -> Result<()> {
    let metadata = fs::metadata(&local)
        .await
        .with_context(|| format!("Failed to read {:?}", local))?;
    if !metadata.is_file() {
        bail!("{:?} is not a file", local);
    }
    let file_size = metadata.len() as i64;

    let mut config = engine_config(&engine);
    config.instance_state_path = Some(upload_state_path(&local));
    let remote = HttpRemote::new(&config)
        .context("Failed to build http client")?
        .with_upload_base(endpoint);
    let multi = Arc::new(RemotePartUpload::new(Arc::new(remote), remote_path.clone()));
    let uploader = MultiUploader::new(multi, &local, file_size, config);

    let pb = ProgressBar::new(file_size.max(0) as u64);
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    pb.set_style(bar_style());
    pb.set_message(format!("Uploading   {}", remote_path));

    let mut restarts = 0;
    loop {
        let follower = follow_events(uploader.subscribe(), pb.clone());
        let result = uploader.execute().await;
        let _ = follower.await;
        match result {
            Ok(()) => break,
            Err(e) if e.disposition() == Disposition::Retry && restarts < MAX_UPLOAD_RESTARTS => {
                restarts += 1;
                warn!(error = %e, pending = uploader.pending_parts().len(), "restarting upload from first unfinished part");
            }
            Err(e) => {
                pb.abandon_with_message(format!("Failed      {}", remote_path));
                return Err(e).with_context(|| format!("Failed to upload {:?}", local));
            }
        }
    }

    let hash = calculate_hash(&local).await?;
    pb.finish_with_message(format!("Uploaded    {} (SHA256: {})", remote_path, hash));
    Ok(())
}

pub async fn list_downloads(output: PathBuf) -> Result<()> {
    if !output.exists() {
        println!("Output directory '{:?}' does not exist.", output);
        return Ok(());
    }

    let mut active = Vec::new();
    let mut completed = Vec::new();

    let mut entries = fs::read_dir(&output).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(filename) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if let Some(stem) = filename.strip_suffix(".part.json") {
            let Ok(content) = fs::read_to_string(&path).await else {
                continue;
            };
            if let Ok(state) = serde_json::from_str::<InstanceState>(&content) {
                active.push((stem.to_string(), state));
            }
        } else if !filename.ends_with(".part") && filename != ".DS_Store" {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                completed.push((filename, metadata.len()));
            }
        }
    }

    let downloaded: i64 = active.iter().map(|(_, s)| s.transferred()).sum::<i64>()
        + completed.iter().map(|(_, len)| *len as i64).sum::<i64>();
    let known: i64 = active.iter().map(|(_, s)| s.total_size).sum::<i64>()
        + completed.iter().map(|(_, len)| *len as i64).sum::<i64>();

    println!(
        "Summary: Completed: {} | Active: {} | Downloaded: {} / {}",
        completed.len(),
        active.len(),
        HumanBytes(downloaded.max(0) as u64),
        HumanBytes(known.max(0) as u64)
    );
    println!();
    println!("{:<50} {:<15} {:<15} {:<15}", "Filename", "Status", "Progress", "Size");
    println!("{:-<50} {:-<15} {:-<15} {:-<15}", "", "", "", "");

    active.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, state) in &active {
        let progress = if state.total_size > 0 {
            state.transferred() as f64 / state.total_size as f64 * 100.0
        } else {
            0.0
        };
        println!(
            "{:<50} {:<15} {:<15} {:<15}",
            name,
            "Downloading",
            format!("{:.2}%", progress),
            format!("{}", HumanBytes(state.total_size.max(0) as u64))
        );
    }
    completed.sort();
    for (name, len) in &completed {
        println!(
            "{:<50} {:<15} {:<15} {:<15}",
            name,
            "Completed",
            "100.00%",
            format!("{}", HumanBytes(*len))
        );
    }

    if active.is_empty() && completed.is_empty() {
        println!("No active or completed downloads found in '{:?}'.", output);
    }
    Ok(())
}
