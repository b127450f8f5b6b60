use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::transfer::range::{RangeGenMode, DEFAULT_BLOCK_SIZE};

pub const KB: i64 = 1024;
pub const MB: i64 = 1024 * KB;

/// Smallest share a worker is given when sizing parallelism automatically.
pub const MIN_PARALLEL_SIZE: i64 = 10 * MB;
pub const MAX_PARALLEL_WORKER_COUNT: usize = 3;
pub const DEFAULT_CACHE_SIZE: usize = 64 * 1024;
pub const MIN_CACHE_SIZE: usize = 1024;
pub const DEFAULT_UPLOAD_BLOCK_SIZE: i64 = 10 * MB;

/// Engine settings for one transfer. Cloned into each orchestrator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    pub mode: RangeGenMode,
    pub max_parallel: usize,
    /// Forced parallelism, 0 picks one from the file size.
    pub slice_parallel: usize,
    pub min_parallel_size: i64,
    pub cache_size: usize,
    pub block_size: i64,
    /// Bytes per second, 0 is unlimited.
    pub max_rate: u64,
    pub try_http: bool,
    pub instance_state_path: Option<PathBuf>,
    pub reload_workers: bool,
    pub tick_interval: Duration,
    pub max_resets: usize,
    pub reset_window: Duration,
    pub split_floor: i64,
    pub concurrency_backoff: Duration,
    pub backoff_jitter: Duration,
    pub control_timeout: Duration,
    pub data_timeout: Duration,
    pub upload_block_size: i64,
    pub max_part_retries: u32,
    pub stall_ticks_limit: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mode: RangeGenMode::Default,
            max_parallel: MAX_PARALLEL_WORKER_COUNT,
            slice_parallel: 0,
            min_parallel_size: MIN_PARALLEL_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            max_rate: 0,
            try_http: false,
            instance_state_path: None,
            reload_workers: true,
            tick_interval: Duration::from_millis(990),
            max_resets: 1000,
            reset_window: Duration::from_secs(9),
            split_floor: MIN_PARALLEL_SIZE / 5,
            concurrency_backoff: Duration::from_secs(10),
            backoff_jitter: Duration::ZERO,
            control_timeout: Duration::from_secs(30),
            data_timeout: Duration::from_secs(600),
            upload_block_size: DEFAULT_UPLOAD_BLOCK_SIZE,
            max_part_retries: 3,
            stall_ticks_limit: 300,
        }
    }
}

impl TransferConfig {
    /// Replaces out-of-range values with working ones.
    pub fn fix(&mut self) {
        if self.max_parallel < 1 {
            self.max_parallel = 1;
        }
        if self.min_parallel_size <= 0 {
            self.min_parallel_size = MIN_PARALLEL_SIZE;
        }
        if self.cache_size < MIN_CACHE_SIZE {
            self.cache_size = MIN_CACHE_SIZE;
        }
        if self.block_size <= 0 {
            self.block_size = DEFAULT_BLOCK_SIZE;
        }
        if self.tick_interval.is_zero() {
            self.tick_interval = Duration::from_millis(990);
        }
        if self.split_floor <= 0 {
            self.split_floor = self.min_parallel_size / 5;
        }
        if self.upload_block_size <= 0 {
            self.upload_block_size = DEFAULT_UPLOAD_BLOCK_SIZE;
        }
    }
}
