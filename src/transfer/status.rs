use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::transfer::range::RangeListGen;
use crate::transfer::rate::RateLimiter;

/// Byte counter that can be sampled into a bytes-per-second figure.
#[derive(Debug)]
pub struct SpeedStats {
    total: AtomicU64,
    current: AtomicU64,
    last: Mutex<(Instant, u64)>,
}

impl Default for SpeedStats {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedStats {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            current: AtomicU64::new(0),
            last: Mutex::new((Instant::now(), 0)),
        }
    }

    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Computes the rate since the previous sample and remembers it.
    pub fn sample(&self) -> u64 {
        let now = Instant::now();
        let total = self.total();
        let mut last = self.last.lock();
        let elapsed = now.duration_since(last.0).as_secs_f64();
        let speed = if elapsed > 0.0 {
            (total.saturating_sub(last.1) as f64 / elapsed) as u64
        } else {
            self.current.load(Ordering::Relaxed)
        };
        *last = (now, total);
        self.current.store(speed, Ordering::Relaxed);
        speed
    }

    /// Last sampled rate.
    pub fn speed(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Forgets history so the next sample measures from now.
    pub fn reset(&self) {
        *self.last.lock() = (Instant::now(), self.total());
        self.current.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    total_size: i64,
    downloaded: i64,
    speeds_per_second: i64,
    max_speeds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total_size: i64,
    pub transferred: i64,
    pub speeds_per_second: i64,
    pub elapsed: Duration,
    pub time_left: Option<Duration>,
}

/// Per-transfer progress. The counter group lives under one mutex so a
/// snapshot never mixes old and new values.
#[derive(Debug)]
pub struct TransferStatus {
    progress: Mutex<Progress>,
    speeds: SpeedStats,
    rate_limiter: Option<Arc<RateLimiter>>,
    gen: Option<Arc<RangeListGen>>,
    started_at: Instant,
}

impl TransferStatus {
    pub fn new(total_size: i64) -> Self {
        Self {
            progress: Mutex::new(Progress {
                total_size,
                ..Progress::default()
            }),
            speeds: SpeedStats::new(),
            rate_limiter: None,
            gen: None,
            started_at: Instant::now(),
        }
    }

    pub fn set_rate_limiter(&mut self, limiter: Option<Arc<RateLimiter>>) {
        self.rate_limiter = limiter;
    }

    pub fn set_range_gen(&mut self, gen: RangeListGen) {
        self.gen = Some(Arc::new(gen));
    }

    pub fn range_gen(&self) -> Option<&Arc<RangeListGen>> {
        self.gen.as_ref()
    }

    pub fn total_size(&self) -> i64 {
        self.progress.lock().total_size
    }

    pub fn set_total_size(&self, n: i64) {
        self.progress.lock().total_size = n;
    }

    /// Grows the total as bytes of an unknown-length stream arrive.
    pub fn add_total_size(&self, n: i64) {
        self.progress.lock().total_size += n;
    }

    pub fn transferred(&self) -> i64 {
        self.progress.lock().downloaded
    }

    pub fn set_transferred(&self, n: i64) {
        self.progress.lock().downloaded = n;
    }

    pub fn add_transferred(&self, n: i64) {
        self.progress.lock().downloaded += n;
    }

    /// Counts `n` bytes towards the speed figure after passing them through
    /// the rate limiter. Blocks while the limiter holds the bytes back.
    pub async fn add_speeds(&self, n: usize) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.admit(n).await;
        }
        self.speeds.add(n as u64);
    }

    pub fn update_speeds(&self) -> i64 {
        let speed = self.speeds.sample() as i64;
        self.progress.lock().speeds_per_second = speed;
        speed
    }

    pub fn speeds_per_second(&self) -> i64 {
        self.progress.lock().speeds_per_second
    }

    /// Records a new peak when `speeds` exceeds the current one.
    pub fn set_max_speeds(&self, speeds: i64) {
        let mut progress = self.progress.lock();
        if speeds > progress.max_speeds {
            progress.max_speeds = speeds;
        }
    }

    pub fn clear_max_speeds(&self) {
        self.progress.lock().max_speeds = 0;
    }

    pub fn max_speeds(&self) -> i64 {
        self.progress.lock().max_speeds
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let progress = *self.progress.lock();
        let time_left = if progress.speeds_per_second > 0 && progress.total_size > 0 {
            let left = (progress.total_size - progress.downloaded).max(0);
            Some(Duration::from_secs(
                (left / progress.speeds_per_second) as u64,
            ))
        } else {
            None
        };
        ProgressSnapshot {
            total_size: progress.total_size,
            transferred: progress.downloaded,
            speeds_per_second: progress.speeds_per_second,
            elapsed: self.elapsed(),
            time_left,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_speed_only_rises_until_cleared() {
        let status = TransferStatus::new(100);
        status.set_max_speeds(50);
        status.set_max_speeds(20);
        assert_eq!(status.max_speeds(), 50);
        status.clear_max_speeds();
        assert_eq!(status.max_speeds(), 0);
    }

    #[test]
    fn snapshot_reports_counters_together() {
        let status = TransferStatus::new(1000);
        status.add_transferred(400);
        let snap = status.snapshot();
        assert_eq!(snap.total_size, 1000);
        assert_eq!(snap.transferred, 400);
        assert_eq!(snap.time_left, None);
    }

    #[tokio::test]
    async fn speed_sampling_measures_since_last_sample() {
        let status = TransferStatus::new(0);
        status.update_speeds();
        status.add_speeds(4096).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let speed = status.update_speeds();
        assert!(speed > 0);
        assert_eq!(status.speeds_per_second(), speed);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(status.update_speeds(), 0);
    }

    #[test]
    fn reset_speed_stats_drops_history() {
        let stats = SpeedStats::new();
        stats.add(1 << 20);
        stats.reset();
        assert_eq!(stats.speed(), 0);
        assert_eq!(stats.total(), 1 << 20);
    }
}
