use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::download::reset::ResetController;
use crate::download::worker::{Worker, WorkerStatus};
use crate::error::TransferError;
use crate::transfer::instance::{InstanceState, StateFile};
use crate::transfer::range::Range;
use crate::transfer::status::TransferStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    Pause,
    Resume,
}

/// Supervises the workers of one download: detects completion, heals
/// failed workers, hands out new ranges and splits slow ones.
pub struct Monitor {
    workers: Vec<Arc<Worker>>,
    status: Arc<TransferStatus>,
    instance_state: Option<Arc<StateFile>>,
    reset_controller: ResetController,
    reload_workers: bool,
    tick_interval: Duration,
    split_floor: i64,
    stall_ticks_limit: u32,
    stalled_ticks: u32,
    last_transferred: i64,
    last_available_index: usize,
    paused: bool,
    wake: Arc<Notify>,
}

impl Monitor {
    pub fn new(status: Arc<TransferStatus>, wake: Arc<Notify>, config: &TransferConfig) -> Self {
        Self {
            workers: Vec::new(),
            status,
            instance_state: None,
            reset_controller: ResetController::new(config.max_resets, config.reset_window),
            reload_workers: config.reload_workers,
            tick_interval: config.tick_interval,
            split_floor: config.split_floor,
            stall_ticks_limit: config.stall_ticks_limit,
            stalled_ticks: 0,
            last_transferred: -1,
            last_available_index: 0,
            paused: false,
            wake,
        }
    }

    pub fn append(&mut self, worker: Arc<Worker>) {
        self.workers.push(worker);
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn set_instance_state(&mut self, store: Arc<StateFile>) {
        self.instance_state = Some(store);
    }

    pub fn set_reload_workers(&mut self, reload: bool) {
        self.reload_workers = reload;
    }

    pub fn all_worker_ranges(&self) -> Vec<Range> {
        self.workers.iter().map(|w| w.range()).collect()
    }

    pub fn num_left_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.completed()).count()
    }

    /// True when at least one worker is unfinished and every unfinished one failed.
    pub fn left_workers_all_failed(&self) -> bool {
        let mut left = 0;
        for worker in &self.workers {
            if worker.completed() {
                continue;
            }
            if !worker.failed() {
                return false;
            }
            left += 1;
        }
        left > 0
    }

    /// An idle worker, searched round-robin from the last one handed out.
    fn available_worker(&mut self) -> Option<Arc<Worker>> {
        let n = self.workers.len();
        for k in 0..n {
            let i = (self.last_available_index + k) % n;
            if self.workers[i].completed() {
                self.last_available_index = (i + 1) % n;
                return Some(self.workers[i].clone());
            }
        }
        None
    }

    /// `Some` once the transfer is over: every worker done and no ranges
    /// left to mint, or a worker hit an internal error.
    pub fn check_completed(&self) -> Option<Result<(), TransferError>> {
        let mut completed = 0;
        for worker in &self.workers {
            match worker.status() {
                WorkerStatus::InternalError => {
                    let err = worker
                        .err()
                        .unwrap_or_else(|| format!("worker {} failed", worker.id()));
                    return Some(Err(TransferError::Fatal(err)));
                }
                WorkerStatus::Succeeded | WorkerStatus::Canceled => completed += 1,
                _ => {}
            }
        }
        let gen_done = self.status.range_gen().map_or(true, |gen| gen.is_done());
        if completed == self.workers.len() && gen_done {
            Some(Ok(()))
        } else {
            None
        }
    }

    fn reset_failed_and_net_error_workers(&self) {
        for worker in &self.workers {
            if !self.reset_controller.can_reset() {
                return;
            }
            if matches!(worker.status(), WorkerStatus::NetError | WorkerStatus::Failed) {
                debug!(worker = worker.id(), err = ?worker.err(), "healing failed worker");
                self.reset_controller.add_reset();
                worker.reset();
            }
        }
    }

    /// Mints ranges for idle workers while the generator has any left.
    fn try_add_new_work(&mut self) {
        if self.paused {
            return;
        }
        let Some(gen) = self.status.range_gen().cloned() else {
            return;
        };
        while !gen.is_done() && self.reset_controller.can_reset() {
            let Some(worker) = self.available_worker() else {
                return;
            };
            let Some((index, range)) = gen.gen_range() else {
                return;
            };
            if !worker.assign(range) {
                warn!(worker = worker.id(), %range, "idle worker refused a new range");
                return;
            }
            debug!(worker = worker.id(), index, %range, "assigned new range");
            self.reset_controller.add_reset();
            worker.spawn();
        }
    }

    /// Moves the upper half of worker `idx`'s remaining range onto an idle
    /// worker. Returns the id of the worker that took it and the range.
    pub fn dynamic_split_worker(&mut self, idx: usize) -> Option<(usize, Range)> {
        if !self.reset_controller.can_reset() {
            return None;
        }
        let source = self.workers.get(idx)?.clone();
        match source.status() {
            WorkerStatus::Downloading | WorkerStatus::Failed | WorkerStatus::NetError => {}
            _ => return None,
        }
        let target = self.available_worker()?;
        if Arc::ptr_eq(&source, &target) {
            return None;
        }
        let upper = source.split_off(self.split_floor)?;
        if !target.assign(upper) {
            source.rejoin(upper);
            return None;
        }
        debug!(
            from = source.id(),
            to = target.id(),
            range = %upper,
            "split worker range"
        );
        self.reset_controller.add_reset();
        target.spawn();
        Some((target.id(), upper))
    }

    /// Restarts a stalled or expired worker, refreshing its URL first if needed.
    pub async fn reset_worker(&mut self, idx: usize) {
        if !self.reset_controller.can_reset() {
            return;
        }
        let Some(worker) = self.workers.get(idx).cloned() else {
            return;
        };
        if worker.completed() || worker.speeds_per_second() != 0 || worker.throttled() {
            return;
        }
        match worker.status() {
            WorkerStatus::Init
            | WorkerStatus::Pending
            | WorkerStatus::Reset
            | WorkerStatus::WaitToWrite
            | WorkerStatus::Paused
            | WorkerStatus::InternalError => return,
            WorkerStatus::DownloadUrlExpired => worker.refresh_url().await,
            _ => {}
        }
        debug!(worker = worker.id(), status = %worker.status(), "resetting worker");
        self.reset_controller.add_reset();
        worker.reset();
    }

    async fn persist(&self) {
        let Some(store) = &self.instance_state else {
            return;
        };
        let state = InstanceState::capture(&self.status, self.all_worker_ranges());
        if let Err(e) = store.put(&state).await {
            warn!(path = %store.path().display(), error = %e, "failed to save instance state");
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
        for worker in &self.workers {
            worker.pause();
        }
    }

    pub fn resume(&mut self) {
        self.paused = false;
        for worker in &self.workers {
            worker.resume();
        }
        self.try_add_new_work();
    }

    async fn tick(&mut self) {
        if self.paused {
            self.persist().await;
            return;
        }
        self.reset_failed_and_net_error_workers();

        let speeds = self.status.update_speeds();
        for worker in &self.workers {
            worker.sample_speed();
        }

        self.persist().await;
        self.try_add_new_work();

        for idx in 0..self.workers.len() {
            if self.workers[idx].status() == WorkerStatus::DownloadUrlExpired {
                self.reset_worker(idx).await;
            }
        }

        let transferred = self.status.transferred();
        if transferred == self.last_transferred {
            self.stalled_ticks += 1;
        } else {
            self.stalled_ticks = 0;
        }
        self.last_transferred = transferred;

        if !self.reload_workers {
            return;
        }

        let all_failed = self.left_workers_all_failed();
        self.status.set_max_speeds(speeds);
        if speeds < self.status.max_speeds() / 6 || all_failed {
            debug!(
                speeds,
                max = self.status.max_speeds(),
                all_failed,
                "throughput dropped, rebalancing workers"
            );
            self.status.clear_max_speeds();

            let mut order: Vec<usize> = (0..self.workers.len()).collect();
            order.sort_by_key(|&i| std::cmp::Reverse(self.workers[i].range().len()));
            for idx in order {
                self.dynamic_split_worker(idx);
            }
            for idx in 0..self.workers.len() {
                self.reset_worker(idx).await;
            }
        }
    }

    async fn teardown(&self) {
        for worker in &self.workers {
            worker.cancel();
        }
        for worker in &self.workers {
            worker.join().await;
        }
        self.persist().await;
    }

    /// Runs every worker and coordinates them until the transfer ends.
    pub async fn execute(
        mut self,
        cancel: CancellationToken,
        mut commands: mpsc::UnboundedReceiver<MonitorCommand>,
    ) -> Result<(), TransferError> {
        if self.workers.is_empty() {
            return Err(TransferError::NoWorkers);
        }

        for worker in &self.workers {
            worker.spawn();
        }

        let mut ticker = interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut commands_open = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("transfer canceled");
                    self.teardown().await;
                    return Err(TransferError::Canceled);
                }
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(MonitorCommand::Pause) => self.pause(),
                    Some(MonitorCommand::Resume) => self.resume(),
                    None => commands_open = false,
                },
                _ = self.wake.notified() => self.try_add_new_work(),
                _ = ticker.tick() => {
                    if self.check_completed().is_none() {
                        self.tick().await;
                    }
                }
            }

            if let Some(result) = self.check_completed() {
                if let Err(e) = &result {
                    warn!(error = %e, "stopping transfer on fatal worker error");
                    self.teardown().await;
                }
                return result;
            }

            if self.stall_ticks_limit > 0 && self.stalled_ticks >= self.stall_ticks_limit {
                let reason = self
                    .workers
                    .iter()
                    .find_map(|w| w.err())
                    .unwrap_or_else(|| "no bytes transferred".into());
                warn!(ticks = self.stalled_ticks, %reason, "giving up on stalled transfer");
                self.teardown().await;
                return Err(TransferError::RetriesExhausted(reason));
            }
        }
    }
}
