//! The file-transfer primitive consumed by the download manager.
//!
//! [`HttpTransfer`] streams a remote file to disk with reqwest, reporting
//! byte counts through a progress callback. The download manager only reacts
//! to the callbacks and the terminal result; retries and resumption are out
//! of scope here.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Report progress at most once per this many bytes written.
const PROGRESS_STEP_BYTES: u64 = 256 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP error: {status}")]
    Http { status: u16 },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer cancelled")]
    Cancelled,
}

/// Cooperative cancellation signal shared between the caller and an
/// in-flight transfer. Checked once per chunk.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Progress callback: `(bytes_written, bytes_total_if_known)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

#[async_trait]
pub trait MediaTransfer: Send + Sync {
    /// Stream `source_url` into `dest`, resolving with the byte count on
    /// success. On any error the partially written file is left behind for
    /// the caller to clean up.
    async fn fetch(
        &self,
        source_url: &str,
        dest: &Path,
        cancel: &CancelFlag,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, TransferError>;
}

pub struct HttpTransfer {
    client: reqwest::Client,
}

impl HttpTransfer {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransfer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaTransfer for HttpTransfer {
    async fn fetch(
        &self,
        source_url: &str,
        dest: &Path,
        cancel: &CancelFlag,
        on_progress: ProgressFn<'_>,
    ) -> Result<u64, TransferError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.client.get(source_url).send().await?;
        if !response.status().is_success() {
            return Err(TransferError::Http {
                status: response.status().as_u16(),
            });
        }

        let total = response.content_length();
        on_progress(0, total);

        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut last_reported: u64 = 0;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;

            if written - last_reported >= PROGRESS_STEP_BYTES {
                on_progress(written, total);
                last_reported = written;
            }
        }

        file.flush().await?;
        on_progress(written, total);
        Ok(written)
    }
}
