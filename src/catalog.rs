use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A catalog entry for one workout video.
///
/// `duration` is the display label served by the catalog (e.g. "15 min",
/// "1 hour"). `duration_minutes` is the structured form; older catalog rows
/// only carry the label, so consumers fall back to parsing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub id: String,
    pub title: String,
    pub category: String,
    pub duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    pub difficulty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The remote catalog boundary.
///
/// The offline components only need an [`Exercise`]'s denormalized fields at
/// download/favorite/watch time and never re-contact the backend afterwards,
/// so this is the whole surface the UI layer has to provide.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Fetch the current video catalog.
    async fn get_exercises(&self) -> Result<Vec<Exercise>>;

    /// Bump the view counter for a video.
    async fn increment_views(&self, exercise_id: &str) -> Result<()>;
}
