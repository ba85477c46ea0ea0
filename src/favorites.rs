//! Favorites ledger: a durable set of starred exercises keyed by id.
//! Same snapshot persistence as the download cache and history log, but no
//! state machine, just membership.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::catalog::Exercise;
use crate::storage::{lock_read, lock_write, KvStore, StoreError, FAVORITES_KEY};

/// A starred exercise. Carries the full display surface so favorites remain
/// renderable if the catalog row changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavoriteRecord {
    pub id: String,
    pub title: String,
    pub category: String,
    pub duration: String,
    pub difficulty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl FavoriteRecord {
    fn from_exercise(exercise: &Exercise, added_at: DateTime<Utc>) -> Self {
        Self {
            id: exercise.id.clone(),
            title: exercise.title.clone(),
            category: exercise.category.clone(),
            duration: exercise.duration.clone(),
            difficulty: exercise.difficulty.clone(),
            thumbnail_url: exercise.thumbnail_url.clone(),
            video_url: exercise.video_url.clone(),
            description: exercise.description.clone(),
            added_at,
        }
    }
}

pub struct Favorites {
    store: Arc<dyn KvStore>,
    list: RwLock<Vec<FavoriteRecord>>,
    write_lock: Mutex<()>,
}

impl Favorites {
    /// Load the ledger, falling back to empty if the stored snapshot is
    /// missing or unreadable.
    pub async fn new(store: Arc<dyn KvStore>) -> Self {
        let list = match Self::load_list(store.as_ref()).await {
            Ok(list) => list,
            Err(e) => {
                warn!("could not load favorites, starting empty: {}", e);
                Vec::new()
            }
        };
        Self {
            store,
            list: RwLock::new(list),
            write_lock: Mutex::new(()),
        }
    }

    async fn load_list(store: &dyn KvStore) -> Result<Vec<FavoriteRecord>, StoreError> {
        let Some(blob) = store.get(FAVORITES_KEY).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_slice(&blob)?)
    }

    /// Star an exercise if it isn't starred, unstar it if it is. Returns the
    /// new membership state.
    pub async fn toggle(&self, exercise: &Exercise) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut next: Vec<FavoriteRecord> = lock_read(&self.list).clone();
        let was_favorite = next.iter().any(|f| f.id == exercise.id);
        if was_favorite {
            next.retain(|f| f.id != exercise.id);
        } else {
            next.push(FavoriteRecord::from_exercise(exercise, Utc::now()));
        }

        // Durable snapshot first, then the in-memory publish
        let blob = serde_json::to_vec(&next)?;
        self.store.set(FAVORITES_KEY, &blob).await?;
        *lock_write(&self.list) = next;
        Ok(!was_favorite)
    }

    /// Drop the entire ledger.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(FAVORITES_KEY).await?;
        lock_write(&self.list).clear();
        Ok(())
    }

    pub fn is_favorite(&self, id: &str) -> bool {
        lock_read(&self.list).iter().any(|f| f.id == id)
    }

    /// All starred exercises in the order they were added.
    pub fn list(&self) -> Vec<FavoriteRecord> {
        lock_read(&self.list).clone()
    }

    pub fn len(&self) -> usize {
        lock_read(&self.list).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_read(&self.list).is_empty()
    }
}
