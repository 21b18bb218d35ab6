use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::repository::ReadingRepository;
use super::sync_throttle::SyncThrottle;
use crate::reading::{ReadingId, SensorReading};

/// Outcome of the most recent repository write, for the sync indicator.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum SyncStatus {
    #[default]
    Idle,
    Synced {
        id: ReadingId,
        at: DateTime<Utc>,
    },
    Failed {
        reason: String,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub received: u64,
    pub forwarded: u64,
    pub failed: u64,
}

/// Sits between the connection manager and the repository.
///
/// Every reading updates the live view; only readings the throttle lets
/// through are written. A failed write is reported and then forgotten.
pub struct SyncWorker<R> {
    repository: R,
    throttle: SyncThrottle,
    live_tx: watch::Sender<Option<SensorReading>>,
    status_tx: watch::Sender<SyncStatus>,
    counters: SyncCounters,
}

impl<R: ReadingRepository> SyncWorker<R> {
    pub fn new(repository: R, throttle: SyncThrottle) -> Self {
        let (live_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(SyncStatus::Idle);
        Self {
            repository,
            throttle,
            live_tx,
            status_tx,
            counters: SyncCounters::default(),
        }
    }

    /// Latest reading as received, persisted or not.
    pub fn live(&self) -> watch::Receiver<Option<SensorReading>> {
        self.live_tx.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn counters(&self) -> SyncCounters {
        self.counters
    }

    pub async fn handle(&mut self, reading: SensorReading, now: DateTime<Utc>) -> bool {
        self.counters.received += 1;
        self.live_tx.send_replace(Some(reading.clone()));

        if !self.throttle.maybe_forward(&reading, now) {
            debug!("reading kept live only, sync interval not elapsed");
            return false;
        }

        self.counters.forwarded += 1;
        match self.repository.create(reading).await {
            Ok(id) => {
                debug!(%id, "reading persisted");
                self.status_tx.send_replace(SyncStatus::Synced { id, at: now });
            }
            Err(e) => {
                self.counters.failed += 1;
                warn!("sync failed: {}", e);
                self.status_tx.send_replace(SyncStatus::Failed {
                    reason: e.to_string(),
                    at: now,
                });
            }
        }
        true
    }

    /// Processes readings until every sender is gone.
    pub async fn run(mut self, mut readings: mpsc::UnboundedReceiver<SensorReading>) -> SyncCounters {
        info!(policy = ?self.throttle.policy(), "sync worker running");
        while let Some(reading) = readings.recv().await {
            self.handle(reading, Utc::now()).await;
        }
        info!(
            received = self.counters.received,
            forwarded = self.counters.forwarded,
            failed = self.counters.failed,
            "sync worker finished"
        );
        self.counters
    }
}
