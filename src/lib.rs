//! Offline-first core for a workout-video app.
//!
//! - [`downloads::DownloadManager`]: caches catalog videos on disk, tracks
//!   in-flight transfer progress, and answers availability queries from
//!   memory
//! - [`history::WorkoutHistory`]: append-only log of completed sessions with
//!   derived weekly/monthly/streak statistics
//! - [`favorites::Favorites`]: durable set of starred exercises
//!
//! The three components are independent; each owns one collection key in a
//! [`storage::KvStore`] and persists its whole collection as a snapshot on
//! every mutation. Construct them once at startup and hand references to
//! whatever layer needs them; there is no ambient global state.

pub mod catalog;
pub mod config;
pub mod downloads;
pub mod favorites;
pub mod history;
pub mod storage;
pub mod transfer;

pub use catalog::{CatalogService, Exercise};
pub use config::Config;
pub use downloads::{
    format_bytes, DownloadError, DownloadEvent, DownloadManager, DownloadRecord, DownloadState,
    StartOutcome,
};
pub use favorites::{FavoriteRecord, Favorites};
pub use history::{DayStat, PeriodStats, WorkoutEvent, WorkoutHistory};
pub use storage::{KvStore, LocalStore, MemoryStore, StoreError};
pub use transfer::{CancelFlag, HttpTransfer, MediaTransfer, TransferError};
