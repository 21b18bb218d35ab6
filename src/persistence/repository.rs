//! Reading repository: the document-store side of the dashboard.
//!
//! All queries return readings newest-first. `count` is answered by the store
//! itself, callers never have to download the collection to size it.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PersistenceError;
use crate::reading::{ReadingId, SensorReading};

pub trait ReadingRepository: Send + Sync + 'static {
    /// Persists `reading`, stamping it with a server timestamp if it has none.
    fn create(
        &self,
        reading: SensorReading,
    ) -> impl Future<Output = Result<ReadingId, PersistenceError>> + Send;

    fn recent(
        &self,
        n: usize,
    ) -> impl Future<Output = Result<Vec<SensorReading>, PersistenceError>> + Send;

    /// Every stored reading. Unbounded, use with care.
    fn all(&self) -> impl Future<Output = Result<Vec<SensorReading>, PersistenceError>> + Send;

    /// Readings with `timestamp >= cutoff`.
    fn since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<SensorReading>, PersistenceError>> + Send;

    fn count(&self) -> impl Future<Output = Result<u64, PersistenceError>> + Send;

    /// Pushes the latest `n` readings to `callback` now and after every change,
    /// until the returned subscription is cancelled.
    fn subscribe<F>(&self, n: usize, callback: F) -> Subscription
    where
        F: Fn(Vec<SensorReading>) + Send + 'static;
}

impl<R: ReadingRepository> ReadingRepository for Arc<R> {
    fn create(
        &self,
        reading: SensorReading,
    ) -> impl Future<Output = Result<ReadingId, PersistenceError>> + Send {
        (**self).create(reading)
    }

    fn recent(
        &self,
        n: usize,
    ) -> impl Future<Output = Result<Vec<SensorReading>, PersistenceError>> + Send {
        (**self).recent(n)
    }

    fn all(&self) -> impl Future<Output = Result<Vec<SensorReading>, PersistenceError>> + Send {
        (**self).all()
    }

    fn since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<SensorReading>, PersistenceError>> + Send {
        (**self).since(cutoff)
    }

    fn count(&self) -> impl Future<Output = Result<u64, PersistenceError>> + Send {
        (**self).count()
    }

    fn subscribe<F>(&self, n: usize, callback: F) -> Subscription
    where
        F: Fn(Vec<SensorReading>) + Send + 'static,
    {
        (**self).subscribe(n, callback)
    }
}

/// Handle returned by [`ReadingRepository::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn unsubscribe(self) {
        self.cancel.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
struct Store {
    /// Oldest first
    readings: RwLock<Vec<SensorReading>>,
    changes: watch::Sender<u64>,
}

/// In-process repository; also the index behind [`super::FileRepository`].
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    store: Arc<Store>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            store: Arc::new(Store {
                readings: RwLock::new(Vec::new()),
                changes,
            }),
        }
    }

    /// Inserts an already persisted reading, keeping timestamp order.
    pub(crate) async fn insert(&self, reading: SensorReading) {
        {
            let mut readings = self.store.readings.write().await;
            let at = reading.timestamp;
            let position = readings.partition_point(|r| r.timestamp <= at);
            readings.insert(position, reading);
        }
        self.store.changes.send_modify(|version| *version += 1);
    }

    /// Bulk load without change notifications, used when opening a backing file.
    pub(crate) async fn seed(&self, mut loaded: Vec<SensorReading>) {
        loaded.sort_by_key(|r| r.timestamp);
        *self.store.readings.write().await = loaded;
    }

    async fn latest(&self, n: usize) -> Vec<SensorReading> {
        let readings = self.store.readings.read().await;
        readings.iter().rev().take(n).cloned().collect()
    }
}

impl ReadingRepository for MemoryRepository {
    async fn create(&self, reading: SensorReading) -> Result<ReadingId, PersistenceError> {
        let id = ReadingId::generate();
        self.insert(reading.persisted(id, Utc::now())).await;
        Ok(id)
    }

    async fn recent(&self, n: usize) -> Result<Vec<SensorReading>, PersistenceError> {
        Ok(self.latest(n).await)
    }

    async fn all(&self) -> Result<Vec<SensorReading>, PersistenceError> {
        Ok(self.latest(usize::MAX).await)
    }

    async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<SensorReading>, PersistenceError> {
        let readings = self.store.readings.read().await;
        Ok(readings
            .iter()
            .rev()
            .take_while(|r| r.timestamp.is_some_and(|at| at >= cutoff))
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<u64, PersistenceError> {
        Ok(self.store.readings.read().await.len() as u64)
    }

    fn subscribe<F>(&self, n: usize, callback: F) -> Subscription
    where
        F: Fn(Vec<SensorReading>) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut changes = self.store.changes.subscribe();
        let repository = self.clone();

        tokio::spawn(async move {
            loop {
                let snapshot = repository.latest(n).await;
                if token.is_cancelled() {
                    break;
                }
                callback(snapshot);

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("repository subscription ended");
        });

        Subscription::new(cancel)
    }
}
