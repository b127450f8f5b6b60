use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::transfer::status::{ProgressSnapshot, TransferStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notifications of one transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Execute,
    Status(ProgressSnapshot),
    Pause,
    Resume,
    Cancel,
    Success,
    Failed(String),
    /// Always the last event, whatever the outcome.
    Finish,
}

/// Broadcast sender that never blocks; events without subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<TransferEvent>,
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSender {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    /// Publishes a status snapshot every `period` until `stop` fires.
    pub(crate) fn spawn_status_reporter(
        &self,
        status: Arc<TransferStatus>,
        period: Duration,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let events = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => events.emit(TransferEvent::Status(status.snapshot())),
                }
            }
        })
    }
}
