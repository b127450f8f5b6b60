use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use std::num::NonZeroU32;

/// Byte-rate admission shared by every stream of one transfer.
pub struct RateLimiter {
    limiter: Governor<NotKeyed, InMemoryState, DefaultClock>,
    burst: u64,
}

impl RateLimiter {
    /// Returns `None` for a zero rate, which means unlimited.
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        let rate = NonZeroU32::new(bytes_per_sec.min(u32::MAX as u64) as u32)?;
        Some(Self {
            limiter: Governor::direct(Quota::per_second(rate)),
            burst: rate.get() as u64,
        })
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.burst
    }

    /// Waits until `bytes` may pass. Requests larger than one second of
    /// budget are admitted in burst-sized pieces.
    pub async fn admit(&self, bytes: usize) {
        let mut left = bytes as u64;
        while left > 0 {
            let n = left.min(self.burst);
            if let Some(n) = NonZeroU32::new(n as u32) {
                if self.limiter.until_n_ready(n).await.is_err() {
                    // cannot happen with n <= burst
                    return;
                }
            }
            left -= n;
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("bytes_per_sec", &self.burst)
            .finish()
    }
}
