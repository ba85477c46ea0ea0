//! Durable key-value storage for the offline collections.
//!
//! - [`LocalStore`]: embedded redb database (default, fully offline)
//! - [`MemoryStore`]: in-process map, for tests and ephemeral sessions
//!
//! Each component owns exactly one key and stores its entire collection as
//! one serialized JSON blob; every mutation is a read-modify-write of that
//! snapshot. The blob is opaque to the store.

pub mod local;
pub mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use thiserror::Error;

/// Collection key for completed video downloads.
pub const DOWNLOADS_KEY: &str = "downloaded_videos";
/// Collection key for the workout history log.
pub const HISTORY_KEY: &str = "workout_history";
/// Collection key for favorited exercises.
pub const FAVORITES_KEY: &str = "favorite_exercises";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("snapshot serialization error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Durable key-value slot storage.
///
/// All methods are async to leave room for remote backends; the bundled
/// implementations just call through to synchronous storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the blob stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the blob stored under `key`.
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Delete the blob stored under `key`. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Lock a published snapshot for reading, recovering from poisoning.
///
/// Snapshot maps hold no invariants across a panic (a writer either finished
/// its insert or it didn't), so a poisoned lock is still readable.
pub(crate) fn lock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Lock a published snapshot for writing. See [`lock_read`].
pub(crate) fn lock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
