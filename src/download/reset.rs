use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Caps how many worker resets may happen inside a trailing window.
#[derive(Debug)]
pub struct ResetController {
    max_resets: usize,
    window: Duration,
    expiries: Mutex<VecDeque<Instant>>,
}

impl ResetController {
    pub fn new(max_resets: usize, window: Duration) -> Self {
        Self {
            max_resets,
            window,
            expiries: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(expiries: &mut VecDeque<Instant>, now: Instant) {
        while expiries.front().is_some_and(|at| *at <= now) {
            expiries.pop_front();
        }
    }

    pub fn can_reset(&self) -> bool {
        let mut expiries = self.expiries.lock();
        Self::prune(&mut expiries, Instant::now());
        expiries.len() < self.max_resets
    }

    pub fn add_reset(&self) {
        let now = Instant::now();
        let mut expiries = self.expiries.lock();
        Self::prune(&mut expiries, now);
        expiries.push_back(now + self.window);
    }

    pub fn outstanding(&self) -> usize {
        let mut expiries = self.expiries.lock();
        Self::prune(&mut expiries, Instant::now());
        expiries.len()
    }
}
