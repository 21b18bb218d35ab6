//! # Persistence Module
//!
//! Everything that outlives a single reading:
//!
//! - **Configuration store**: broker settings in a local key-value file, with
//!   fail-safe loading that degrades to defaults.
//! - **Reading repository**: the document collection of timestamped readings
//!   and its query surface (recent, since, count, subscribe).
//! - **Sync throttle / worker**: decides which live readings are written.
//!
//! ## Error Handling Strategy
//! Writes return their error to the caller ([`crate::error::StorageError`],
//! [`crate::error::PersistenceError`]). Nothing here retries on its own.

pub mod config_store;
pub mod file_repository;
pub mod persistence_worker;
pub mod repository;
pub mod sync_throttle;

pub use config_store::{ConfigStore, FileKvStore, KeyValueStore, MemoryKvStore};
pub use file_repository::FileRepository;
pub use persistence_worker::{SyncStatus, SyncWorker};
pub use repository::{MemoryRepository, ReadingRepository, Subscription};
pub use sync_throttle::{SyncPolicy, SyncThrottle};
