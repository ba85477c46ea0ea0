//! Offline video cache: maps catalog entries to locally stored files,
//! tracks in-flight transfer progress, and answers availability queries
//! synchronously from memory.
//!
//! Only `Completed` records are persisted. An item that is mid-transfer when
//! the process dies is simply absent after restart and can be started again
//! from scratch; resumed downloads are not modeled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::warn;

use crate::catalog::Exercise;
use crate::config::DownloadsConfig;
use crate::storage::{lock_read, lock_write, KvStore, StoreError, DOWNLOADS_KEY};
use crate::transfer::{CancelFlag, MediaTransfer, TransferError};

const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Downloading,
    Completed,
    Failed,
}

/// One cache entry per video. Display metadata is copied out of the catalog
/// at download time so the entry stays renderable offline even if the remote
/// catalog row changes or disappears.
#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: String,
    pub title: String,
    pub category: String,
    pub duration: String,
    pub difficulty: String,
    pub thumbnail_url: Option<String>,
    pub source_url: String,
    pub local_path: PathBuf,
    pub state: DownloadState,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DownloadRecord {
    fn downloading(exercise: &Exercise, source_url: &str, dest: &Path) -> Self {
        Self {
            id: exercise.id.clone(),
            title: exercise.title.clone(),
            category: exercise.category.clone(),
            duration: exercise.duration.clone(),
            difficulty: exercise.difficulty.clone(),
            thumbnail_url: exercise.thumbnail_url.clone(),
            source_url: source_url.to_string(),
            local_path: dest.to_path_buf(),
            state: DownloadState::Downloading,
            downloaded_at: None,
            error: None,
        }
    }
}

/// Serialized form of a completed record, one entry per id in the
/// collection blob.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDownload {
    id: String,
    title: String,
    category: String,
    duration: String,
    difficulty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail_url: Option<String>,
    original_url: String,
    local_uri: String,
    downloaded_at: DateTime<Utc>,
}

impl StoredDownload {
    fn from_record(record: &DownloadRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            category: record.category.clone(),
            duration: record.duration.clone(),
            difficulty: record.difficulty.clone(),
            thumbnail_url: record.thumbnail_url.clone(),
            original_url: record.source_url.clone(),
            local_uri: record.local_path.to_string_lossy().into_owned(),
            downloaded_at: record.downloaded_at.unwrap_or_else(Utc::now),
        }
    }

    fn into_record(self) -> DownloadRecord {
        DownloadRecord {
            id: self.id,
            title: self.title,
            category: self.category,
            duration: self.duration,
            difficulty: self.difficulty,
            thumbnail_url: self.thumbnail_url,
            source_url: self.original_url,
            local_path: PathBuf::from(self.local_uri),
            state: DownloadState::Completed,
            downloaded_at: Some(self.downloaded_at),
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Started { id: String, title: String },
    Progress { id: String, fraction: f64 },
    Completed { id: String, path: PathBuf },
    Failed { id: String, error: String },
    Removed { id: String },
    Cleared,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no video URL for exercise {id}")]
    MissingSource { id: String },
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("file operation failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of [`DownloadManager::start_download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The transfer ran and the file is now on disk.
    Downloaded(PathBuf),
    /// The item was already cached; no transfer was performed.
    AlreadyDownloaded(PathBuf),
    /// A transfer for this id is still running; wait for it instead of
    /// starting another.
    InFlight,
}

pub struct DownloadManager {
    store: Arc<dyn KvStore>,
    transfer: Arc<dyn MediaTransfer>,
    download_dir: PathBuf,
    records: RwLock<HashMap<String, DownloadRecord>>,
    progress: RwLock<HashMap<String, f64>>,
    cancels: RwLock<HashMap<String, CancelFlag>>,
    /// Serializes every read-modify-write persistence cycle so two mutations
    /// can never interleave and lose an update.
    write_lock: Mutex<()>,
    slots: Semaphore,
    event_tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl DownloadManager {
    pub async fn new(
        store: Arc<dyn KvStore>,
        transfer: Arc<dyn MediaTransfer>,
        config: &DownloadsConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DownloadEvent>), DownloadError> {
        let download_dir = resolve_download_dir(config)?;
        std::fs::create_dir_all(&download_dir)?;

        let records = match Self::load_records(store.as_ref()).await {
            Ok(records) => records,
            Err(e) => {
                warn!("could not load download records, starting empty: {}", e);
                HashMap::new()
            }
        };

        let max_concurrent = if config.max_concurrent > 0 {
            config.max_concurrent
        } else {
            DEFAULT_MAX_CONCURRENT_DOWNLOADS
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Self {
            store,
            transfer,
            download_dir,
            records: RwLock::new(records),
            progress: RwLock::new(HashMap::new()),
            cancels: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            slots: Semaphore::new(max_concurrent),
            event_tx,
        };
        Ok((manager, event_rx))
    }

    async fn load_records(
        store: &dyn KvStore,
    ) -> Result<HashMap<String, DownloadRecord>, StoreError> {
        let Some(blob) = store.get(DOWNLOADS_KEY).await? else {
            return Ok(HashMap::new());
        };
        let stored: HashMap<String, StoredDownload> = serde_json::from_slice(&blob)?;
        Ok(stored
            .into_iter()
            .map(|(id, record)| (id, record.into_record()))
            .collect())
    }

    /// Download a video for offline playback.
    ///
    /// Idempotent per id: an already-cached item short-circuits without a
    /// transfer, an in-flight item reports [`StartOutcome::InFlight`], and a
    /// previously failed item is retried from scratch. Resolves only on the
    /// terminal transition.
    pub async fn start_download(
        &self,
        exercise: &Exercise,
    ) -> Result<StartOutcome, DownloadError> {
        let source_url = exercise
            .video_url
            .clone()
            .ok_or_else(|| DownloadError::MissingSource {
                id: exercise.id.clone(),
            })?;
        let dest = self.download_path(exercise, &source_url);
        let id = exercise.id.clone();
        let cancel = CancelFlag::new();

        {
            let _guard = self.write_lock.lock().await;
            let mut records = lock_write(&self.records);
            if let Some(existing) = records.get(&id) {
                match existing.state {
                    DownloadState::Completed => {
                        return Ok(StartOutcome::AlreadyDownloaded(existing.local_path.clone()));
                    }
                    DownloadState::Downloading => return Ok(StartOutcome::InFlight),
                    DownloadState::Failed => {} // retry from scratch
                }
            }
            records.insert(
                id.clone(),
                DownloadRecord::downloading(exercise, &source_url, &dest),
            );
            lock_write(&self.progress).insert(id.clone(), 0.0);
            lock_write(&self.cancels).insert(id.clone(), cancel.clone());
        }
        let _ = self.event_tx.send(DownloadEvent::Started {
            id: id.clone(),
            title: exercise.title.clone(),
        });

        let fetch_result = match self.slots.acquire().await {
            Ok(_permit) => {
                let on_progress = |written: u64, total: Option<u64>| {
                    let fraction = total
                        .filter(|t| *t > 0)
                        .map(|t| (written as f64 / t as f64).clamp(0.0, 1.0))
                        .unwrap_or(0.0);
                    lock_write(&self.progress).insert(id.clone(), fraction);
                    let _ = self.event_tx.send(DownloadEvent::Progress {
                        id: id.clone(),
                        fraction,
                    });
                };
                self.transfer
                    .fetch(&source_url, &dest, &cancel, &on_progress)
                    .await
            }
            // The semaphore is only closed when the manager is being torn down
            Err(_) => Err(TransferError::Cancelled),
        };

        match fetch_result {
            Ok(_) => {
                // The destination must exist before the record may complete
                if let Err(e) = tokio::fs::metadata(&dest).await {
                    self.finish_failed(&id, &format!("missing destination file: {e}"))
                        .await;
                    return Err(DownloadError::Io(e));
                }
                self.finish_completed(&id, &dest).await?;
                Ok(StartOutcome::Downloaded(dest))
            }
            Err(err) => {
                // Cancellation cleanup must not leave the partial file behind
                if let Err(e) = tokio::fs::remove_file(&dest).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("could not remove partial file {}: {}", dest.display(), e);
                    }
                }
                self.finish_failed(&id, &err.to_string()).await;
                Err(err.into())
            }
        }
    }

    async fn finish_completed(&self, id: &str, dest: &Path) -> Result<(), DownloadError> {
        let persist_result = {
            let _guard = self.write_lock.lock().await;
            let existing = lock_read(&self.records).get(id).cloned();
            match existing {
                None => {
                    // The collection was cleared while the transfer finished;
                    // drop the freshly written file instead of resurrecting it
                    if let Err(e) = tokio::fs::remove_file(dest).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("could not remove orphaned file {}: {}", dest.display(), e);
                        }
                    }
                    return Err(TransferError::Cancelled.into());
                }
                Some(mut record) => {
                    record.state = DownloadState::Completed;
                    record.downloaded_at = Some(Utc::now());
                    record.error = None;

                    // Durable snapshot first, then the in-memory publish
                    let write_result = match self.snapshot_with(&record) {
                        Ok(blob) => self.store.set(DOWNLOADS_KEY, &blob).await,
                        Err(e) => Err(e),
                    };

                    // Publish even if the durable write failed: the file is on
                    // disk and the record is real; the caller still sees the
                    // persistence gap through the returned error.
                    lock_write(&self.records).insert(id.to_string(), record);
                    lock_write(&self.progress).remove(id);
                    lock_write(&self.cancels).remove(id);
                    write_result
                }
            }
        };
        let _ = self.event_tx.send(DownloadEvent::Completed {
            id: id.to_string(),
            path: dest.to_path_buf(),
        });
        persist_result?;
        Ok(())
    }

    async fn finish_failed(&self, id: &str, reason: &str) {
        let _guard = self.write_lock.lock().await;
        {
            let mut records = lock_write(&self.records);
            if let Some(record) = records.get_mut(id) {
                record.state = DownloadState::Failed;
                record.error = Some(reason.to_string());
                record.downloaded_at = None;
            }
        }
        lock_write(&self.progress).remove(id);
        lock_write(&self.cancels).remove(id);
        let _ = self.event_tx.send(DownloadEvent::Failed {
            id: id.to_string(),
            error: reason.to_string(),
        });
    }

    /// Serialize the persisted (completed-only) view of the collection with
    /// `record` included.
    fn snapshot_with(&self, record: &DownloadRecord) -> Result<Vec<u8>, StoreError> {
        let records = lock_read(&self.records);
        let mut stored: HashMap<String, StoredDownload> = records
            .values()
            .filter(|r| r.state == DownloadState::Completed)
            .map(|r| (r.id.clone(), StoredDownload::from_record(r)))
            .collect();
        stored.insert(record.id.clone(), StoredDownload::from_record(record));
        Ok(serde_json::to_vec(&stored)?)
    }

    /// Serialize the persisted view of the collection with `id` excluded.
    fn snapshot_without(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let records = lock_read(&self.records);
        let stored: HashMap<String, StoredDownload> = records
            .values()
            .filter(|r| r.state == DownloadState::Completed && r.id != id)
            .map(|r| (r.id.clone(), StoredDownload::from_record(r)))
            .collect();
        Ok(serde_json::to_vec(&stored)?)
    }

    /// Signal an in-flight transfer to stop. Returns whether anything was
    /// actually in flight; the record transitions to `Failed` once the
    /// transfer observes the flag.
    pub fn cancel_download(&self, id: &str) -> bool {
        match lock_read(&self.cancels).get(id) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a cached video and its backing file.
    ///
    /// Deleting an unknown id, or a record whose file already vanished, is
    /// success. An in-flight item is cancelled instead; its transfer task
    /// cleans up the partial file.
    pub async fn delete_download(&self, id: &str) -> Result<(), DownloadError> {
        let _guard = self.write_lock.lock().await;
        let record = lock_read(&self.records).get(id).cloned();
        let Some(record) = record else {
            return Ok(());
        };

        match record.state {
            DownloadState::Downloading => {
                if let Some(flag) = lock_read(&self.cancels).get(id) {
                    flag.cancel();
                }
                return Ok(());
            }
            DownloadState::Completed => {
                if let Err(e) = tokio::fs::remove_file(&record.local_path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(DownloadError::Io(e));
                    }
                }
            }
            DownloadState::Failed => {}
        }

        let blob = self.snapshot_without(id)?;
        self.store.set(DOWNLOADS_KEY, &blob).await?;
        lock_write(&self.records).remove(id);
        lock_write(&self.progress).remove(id);
        let _ = self
            .event_tx
            .send(DownloadEvent::Removed { id: id.to_string() });
        Ok(())
    }

    /// Remove every cached video. File deletion is best-effort: individual
    /// failures are logged and skipped, never aborting the clear.
    pub async fn clear_all(&self) -> Result<(), DownloadError> {
        let _guard = self.write_lock.lock().await;

        for flag in lock_read(&self.cancels).values() {
            flag.cancel();
        }

        let paths: Vec<PathBuf> = lock_read(&self.records)
            .values()
            .filter(|r| r.state == DownloadState::Completed)
            .map(|r| r.local_path.clone())
            .collect();
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not delete {}: {}", path.display(), e);
                }
            }
        }

        self.store.remove(DOWNLOADS_KEY).await?;
        lock_write(&self.records).clear();
        lock_write(&self.progress).clear();
        let _ = self.event_tx.send(DownloadEvent::Cleared);
        Ok(())
    }

    pub fn is_downloaded(&self, id: &str) -> bool {
        lock_read(&self.records)
            .get(id)
            .map_or(false, |r| r.state == DownloadState::Completed)
    }

    pub fn is_downloading(&self, id: &str) -> bool {
        lock_read(&self.records)
            .get(id)
            .map_or(false, |r| r.state == DownloadState::Downloading)
    }

    /// Transfer progress in `[0.0, 1.0]`, present only while downloading.
    pub fn progress(&self, id: &str) -> Option<f64> {
        lock_read(&self.progress).get(id).copied()
    }

    /// Local playback path, available only once the download completed.
    pub fn local_uri(&self, id: &str) -> Option<PathBuf> {
        lock_read(&self.records)
            .get(id)
            .filter(|r| r.state == DownloadState::Completed)
            .map(|r| r.local_path.clone())
    }

    pub fn get(&self, id: &str) -> Option<DownloadRecord> {
        lock_read(&self.records).get(id).cloned()
    }

    /// Completed records in completion order.
    pub fn list_completed(&self) -> Vec<DownloadRecord> {
        let mut completed: Vec<DownloadRecord> = lock_read(&self.records)
            .values()
            .filter(|r| r.state == DownloadState::Completed)
            .cloned()
            .collect();
        completed.sort_by(|a, b| {
            a.downloaded_at
                .cmp(&b.downloaded_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        completed
    }

    /// Total on-disk size of the cache in bytes. A record whose file
    /// vanished externally contributes nothing.
    pub async fn total_size(&self) -> u64 {
        let paths: Vec<PathBuf> = lock_read(&self.records)
            .values()
            .filter(|r| r.state == DownloadState::Completed)
            .map(|r| r.local_path.clone())
            .collect();
        let mut total = 0u64;
        for path in paths {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                total += meta.len();
            }
        }
        total
    }

    fn download_path(&self, exercise: &Exercise, source_url: &str) -> PathBuf {
        let safe_title = sanitize_component(&exercise.title);
        let safe_id = sanitize_component(&exercise.id);
        let ext = file_extension(source_url);
        self.download_dir
            .join(format!("{}_{}.{}", safe_title, safe_id, ext))
    }
}

fn resolve_download_dir(config: &DownloadsConfig) -> Result<PathBuf, DownloadError> {
    match &config.download_dir {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => Ok(dirs::data_dir()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "could not determine data directory",
                )
            })?
            .join("stride")
            .join("videos")),
    }
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn file_extension(url: &str) -> String {
    let candidate = url
        .rsplit('.')
        .next()
        .unwrap_or("")
        .split('?')
        .next()
        .unwrap_or("");
    if candidate.is_empty()
        || candidate.len() > 5
        || !candidate.chars().all(|c| c.is_ascii_alphanumeric())
    {
        "mp4".to_string()
    } else {
        candidate.to_ascii_lowercase()
    }
}

// Format bytes for display
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} Bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transfer::ProgressFn;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn create_test_exercise(id: &str, title: &str) -> Exercise {
        Exercise {
            id: id.to_string(),
            title: title.to_string(),
            category: "Cardio".to_string(),
            duration: "15 min".to_string(),
            duration_minutes: Some(15),
            difficulty: "Beginner".to_string(),
            thumbnail_url: Some("https://cdn.example.com/thumb.jpg".to_string()),
            video_url: Some(format!("https://cdn.example.com/{}.mp4", id)),
            description: None,
        }
    }

    /// Transfer double: writes `bytes` zeroes to the destination, optionally
    /// failing the first `fail_times` calls or parking on a gate until the
    /// test releases it.
    struct ScriptedTransfer {
        bytes: usize,
        fail_times: usize,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedTransfer {
        fn new(bytes: usize) -> Arc<Self> {
            Arc::new(Self {
                bytes,
                fail_times: 0,
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn failing(bytes: usize, fail_times: usize) -> Arc<Self> {
            Arc::new(Self {
                bytes,
                fail_times,
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated(bytes: usize) -> (Arc<Self>, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            (
                Arc::new(Self {
                    bytes,
                    fail_times: 0,
                    calls: AtomicUsize::new(0),
                    gate: Some(gate.clone()),
                }),
                gate,
            )
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaTransfer for ScriptedTransfer {
        async fn fetch(
            &self,
            _source_url: &str,
            dest: &Path,
            cancel: &CancelFlag,
            on_progress: ProgressFn<'_>,
        ) -> Result<u64, TransferError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            if call <= self.fail_times {
                return Err(TransferError::Http { status: 503 });
            }
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            on_progress(self.bytes as u64 / 2, Some(self.bytes as u64));
            tokio::fs::write(dest, vec![0u8; self.bytes]).await?;
            on_progress(self.bytes as u64, Some(self.bytes as u64));
            Ok(self.bytes as u64)
        }
    }

    async fn test_manager(
        transfer: Arc<dyn MediaTransfer>,
        store: Arc<MemoryStore>,
        dir: &Path,
    ) -> (DownloadManager, mpsc::UnboundedReceiver<DownloadEvent>) {
        let config = DownloadsConfig {
            max_concurrent: 2,
            download_dir: Some(dir.to_string_lossy().into_owned()),
        };
        DownloadManager::new(store, transfer, &config).await.unwrap()
    }

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_download_completes() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = ScriptedTransfer::new(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer.clone(), store, dir.path()).await;

        let exercise = create_test_exercise("1", "Morning Stretch");
        let outcome = manager.start_download(&exercise).await.unwrap();

        let StartOutcome::Downloaded(path) = outcome else {
            panic!("expected a fresh download, got {:?}", outcome);
        };
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1000);
        assert!(manager.is_downloaded("1"));
        assert!(!manager.is_downloading("1"));
        assert_eq!(manager.local_uri("1"), Some(path));
        assert!(manager.progress("1").is_none());
        assert_eq!(manager.list_completed().len(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = ScriptedTransfer::new(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer.clone(), store, dir.path()).await;

        let exercise = create_test_exercise("1", "Morning Stretch");
        let first = manager.start_download(&exercise).await.unwrap();
        let second = manager.start_download(&exercise).await.unwrap();

        let StartOutcome::Downloaded(path) = first else {
            panic!("expected a fresh download");
        };
        assert_eq!(second, StartOutcome::AlreadyDownloaded(path));
        assert_eq!(transfer.calls(), 1);
        assert_eq!(manager.list_completed().len(), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let (transfer, gate) = ScriptedTransfer::gated(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer.clone(), store, dir.path()).await;
        let manager = Arc::new(manager);

        let exercise = create_test_exercise("1", "Morning Stretch");
        let task = {
            let manager = manager.clone();
            let exercise = exercise.clone();
            tokio::spawn(async move { manager.start_download(&exercise).await })
        };

        let probe = manager.clone();
        wait_for(move || probe.is_downloading("1")).await;

        let concurrent = manager.start_download(&exercise).await.unwrap();
        assert_eq!(concurrent, StartOutcome::InFlight);
        assert_eq!(transfer.calls(), 1);

        gate.notify_one();
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, StartOutcome::Downloaded(_)));
        assert!(manager.is_downloaded("1"));
        assert_eq!(transfer.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_download_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = ScriptedTransfer::failing(1000, 1);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer.clone(), store, dir.path()).await;

        let exercise = create_test_exercise("1", "Morning Stretch");
        let err = manager.start_download(&exercise).await.unwrap_err();
        assert!(matches!(err, DownloadError::Transfer(_)));

        let record = manager.get("1").unwrap();
        assert_eq!(record.state, DownloadState::Failed);
        assert!(record.error.as_ref().unwrap().contains("503"));
        assert!(!manager.is_downloaded("1"));
        assert!(!manager.is_downloading("1"));

        // A failed record retries from scratch
        let outcome = manager.start_download(&exercise).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Downloaded(_)));
        assert_eq!(transfer.calls(), 2);
        assert!(manager.is_downloaded("1"));
    }

    #[tokio::test]
    async fn test_delete_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = ScriptedTransfer::new(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer, store, dir.path()).await;

        let exercise = create_test_exercise("1", "Morning Stretch");
        manager.start_download(&exercise).await.unwrap();
        let path = manager.local_uri("1").unwrap();
        assert!(path.exists());

        manager.delete_download("1").await.unwrap();
        assert!(!manager.is_downloaded("1"));
        assert!(manager.local_uri("1").is_none());
        assert!(manager.get("1").is_none());
        assert!(!path.exists());

        // Deleting again, or deleting something never downloaded, is fine
        manager.delete_download("1").await.unwrap();
        manager.delete_download("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_tolerates_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = ScriptedTransfer::new(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer, store, dir.path()).await;

        let exercise = create_test_exercise("1", "Morning Stretch");
        manager.start_download(&exercise).await.unwrap();
        let path = manager.local_uri("1").unwrap();
        std::fs::remove_file(&path).unwrap();

        manager.delete_download("1").await.unwrap();
        assert!(!manager.is_downloaded("1"));
    }

    #[tokio::test]
    async fn test_total_size_tracks_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let (manager, _rx) =
            test_manager(ScriptedTransfer::new(1000), store.clone(), dir.path()).await;
        let first = create_test_exercise("1", "Morning Stretch");
        manager.start_download(&first).await.unwrap();
        assert_eq!(manager.total_size().await, 1000);

        let (manager, _rx) = test_manager(ScriptedTransfer::new(2048), store, dir.path()).await;
        let second = create_test_exercise("2", "HIIT Blast");
        manager.start_download(&second).await.unwrap();
        assert_eq!(manager.total_size().await, 1000 + 2048);

        // Deleting one record decreases the aggregate by exactly its size
        manager.delete_download("1").await.unwrap();
        assert_eq!(manager.total_size().await, 2048);

        // A vanished file contributes zero instead of failing the aggregate
        std::fs::remove_file(manager.local_uri("2").unwrap()).unwrap();
        assert_eq!(manager.total_size().await, 0);
    }

    #[tokio::test]
    async fn test_clear_all_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = ScriptedTransfer::new(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer, store.clone(), dir.path()).await;

        let first = create_test_exercise("1", "Morning Stretch");
        let second = create_test_exercise("2", "HIIT Blast");
        manager.start_download(&first).await.unwrap();
        manager.start_download(&second).await.unwrap();
        let paths = [
            manager.local_uri("1").unwrap(),
            manager.local_uri("2").unwrap(),
        ];

        manager.clear_all().await.unwrap();
        assert!(!manager.is_downloaded("1"));
        assert!(!manager.is_downloaded("2"));
        assert!(manager.list_completed().is_empty());
        for path in paths {
            assert!(!path.exists());
        }
        assert!(store.get(DOWNLOADS_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_completed_records_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let (manager, _rx) =
            test_manager(ScriptedTransfer::new(1000), store.clone(), dir.path()).await;
        let exercise = create_test_exercise("1", "Morning Stretch");
        manager.start_download(&exercise).await.unwrap();
        let path = manager.local_uri("1").unwrap();
        drop(manager);

        let (rebuilt, _rx) =
            test_manager(ScriptedTransfer::new(1000), store, dir.path()).await;
        assert!(rebuilt.is_downloaded("1"));
        assert_eq!(rebuilt.local_uri("1"), Some(path));
        let record = rebuilt.get("1").unwrap();
        assert_eq!(record.title, "Morning Stretch");
        assert_eq!(record.category, "Cardio");
    }

    #[tokio::test]
    async fn test_in_flight_download_is_absent_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (transfer, gate) = ScriptedTransfer::gated(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer, store.clone(), dir.path()).await;
        let manager = Arc::new(manager);

        let exercise = create_test_exercise("1", "Morning Stretch");
        let task = {
            let manager = manager.clone();
            let exercise = exercise.clone();
            tokio::spawn(async move { manager.start_download(&exercise).await })
        };
        let probe = manager.clone();
        wait_for(move || probe.is_downloading("1")).await;

        // Simulate a restart while the transfer is still running
        let (rebuilt, _rx) =
            test_manager(ScriptedTransfer::new(1000), store, dir.path()).await;
        assert!(rebuilt.get("1").is_none());
        assert!(!rebuilt.is_downloaded("1"));
        assert!(!rebuilt.is_downloading("1"));

        gate.notify_one();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_in_flight_download() {
        let dir = tempfile::tempdir().unwrap();
        let (transfer, gate) = ScriptedTransfer::gated(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer, store, dir.path()).await;
        let manager = Arc::new(manager);

        let exercise = create_test_exercise("1", "Morning Stretch");
        // Drop a stand-in partial file where the transfer would write
        let dest = manager.download_path(&exercise, "https://cdn.example.com/1.mp4");
        std::fs::write(&dest, b"partial").unwrap();

        let task = {
            let manager = manager.clone();
            let exercise = exercise.clone();
            tokio::spawn(async move { manager.start_download(&exercise).await })
        };
        let probe = manager.clone();
        wait_for(move || probe.is_downloading("1")).await;

        assert!(manager.cancel_download("1"));
        gate.notify_one();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Transfer(TransferError::Cancelled)
        ));
        let record = manager.get("1").unwrap();
        assert_eq!(record.state, DownloadState::Failed);
        assert!(record.error.as_ref().unwrap().contains("cancelled"));
        assert!(manager.progress("1").is_none());
        assert!(!dest.exists());

        // Nothing left to cancel
        assert!(!manager.cancel_download("1"));
    }

    #[tokio::test]
    async fn test_missing_source_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = ScriptedTransfer::new(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer, store, dir.path()).await;

        let mut exercise = create_test_exercise("1", "Morning Stretch");
        exercise.video_url = None;

        let err = manager.start_download(&exercise).await.unwrap_err();
        assert!(matches!(err, DownloadError::MissingSource { .. }));
        assert!(manager.get("1").is_none());
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = ScriptedTransfer::new(1000);
        let store = Arc::new(MemoryStore::new());
        let (manager, mut rx) = test_manager(transfer, store, dir.path()).await;

        let exercise = create_test_exercise("1", "Morning Stretch");
        manager.start_download(&exercise).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(DownloadEvent::Started { .. })));
        assert!(matches!(events.last(), Some(DownloadEvent::Completed { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, DownloadEvent::Progress { .. })));
    }

    #[tokio::test]
    async fn test_download_path_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = ScriptedTransfer::new(10);
        let store = Arc::new(MemoryStore::new());
        let (manager, _rx) = test_manager(transfer, store, dir.path()).await;

        let exercise = create_test_exercise("a-1", "Morning Stretch!");
        let first = manager.download_path(&exercise, "https://cdn.example.com/v.MP4?sig=abc");
        let second = manager.download_path(&exercise, "https://cdn.example.com/v.MP4?sig=abc");
        assert_eq!(first, second);
        assert_eq!(
            first.file_name().unwrap().to_str().unwrap(),
            "morning_stretch__a_1.mp4"
        );
    }

    #[test]
    fn test_file_extension_fallback() {
        assert_eq!(file_extension("https://cdn.example.com/clip.mov"), "mov");
        assert_eq!(file_extension("https://cdn.example.com/clip.MP4?x=1"), "mp4");
        assert_eq!(file_extension("https://cdn.example.com/clip"), "mp4");
        assert_eq!(file_extension(""), "mp4");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 Bytes");
        assert_eq!(format_bytes(512), "512 Bytes");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
