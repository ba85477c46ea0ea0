//! Workout history: an append-only log of completed sessions plus the
//! rolling statistics derived from it (weekly/monthly totals, streak,
//! per-category counts).
//!
//! The log is small (one user, one device) so every query is a plain scan of
//! the in-memory snapshot; durable storage is only touched on mutation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::catalog::Exercise;
use crate::config::HistoryConfig;
use crate::storage::{lock_read, lock_write, KvStore, StoreError, HISTORY_KEY};

/// One completed viewing session. Display metadata is copied from the
/// catalog at completion time so history entries outlive catalog edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkoutEvent {
    pub id: String,
    pub exercise_id: String,
    pub title: String,
    pub category: String,
    pub duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    pub difficulty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub watched_seconds: u32,
    pub completed_at: DateTime<Utc>,
}

/// Per-day slice of the trailing week.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayStat {
    pub date: NaiveDate,
    pub workouts: usize,
    pub minutes: u64,
}

/// Aggregate over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodStats {
    pub workouts: usize,
    pub minutes: u64,
}

pub struct WorkoutHistory {
    store: Arc<dyn KvStore>,
    /// Newest-first; appended at the front, never edited in place.
    log: RwLock<Vec<WorkoutEvent>>,
    write_lock: Mutex<()>,
    count_open_day: bool,
}

impl WorkoutHistory {
    /// Load the history log, falling back to an empty one if the stored
    /// snapshot is missing or unreadable.
    pub async fn new(store: Arc<dyn KvStore>, config: &HistoryConfig) -> Self {
        let log = match Self::load_log(store.as_ref()).await {
            Ok(log) => log,
            Err(e) => {
                warn!("could not load workout history, starting empty: {}", e);
                Vec::new()
            }
        };
        Self {
            store,
            log: RwLock::new(log),
            write_lock: Mutex::new(()),
            count_open_day: config.count_open_day,
        }
    }

    async fn load_log(store: &dyn KvStore) -> Result<Vec<WorkoutEvent>, StoreError> {
        let Some(blob) = store.get(HISTORY_KEY).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_slice(&blob)?)
    }

    /// Record a completed session, stamped with the current time.
    pub async fn add_workout(
        &self,
        exercise: &Exercise,
        watched_seconds: u32,
    ) -> Result<WorkoutEvent, StoreError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let event = WorkoutEvent {
            id: now.timestamp_millis().to_string(),
            exercise_id: exercise.id.clone(),
            title: exercise.title.clone(),
            category: exercise.category.clone(),
            duration: exercise.duration.clone(),
            duration_minutes: exercise.duration_minutes,
            difficulty: exercise.difficulty.clone(),
            thumbnail_url: exercise.thumbnail_url.clone(),
            watched_seconds,
            completed_at: now,
        };

        // Durable snapshot first, then the in-memory publish
        let blob = {
            let log = lock_read(&self.log);
            let mut snapshot: Vec<&WorkoutEvent> = Vec::with_capacity(log.len() + 1);
            snapshot.push(&event);
            snapshot.extend(log.iter());
            serde_json::to_vec(&snapshot)?
        };
        self.store.set(HISTORY_KEY, &blob).await?;
        lock_write(&self.log).insert(0, event.clone());
        Ok(event)
    }

    /// Drop the entire log.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(HISTORY_KEY).await?;
        lock_write(&self.log).clear();
        Ok(())
    }

    /// Full log, newest first.
    pub fn history(&self) -> Vec<WorkoutEvent> {
        lock_read(&self.log).clone()
    }

    pub fn is_empty(&self) -> bool {
        lock_read(&self.log).is_empty()
    }

    /// Minutes and workout counts for each of the trailing 7 calendar days
    /// ending today, oldest day first.
    pub fn weekly_stats(&self) -> Vec<DayStat> {
        self.weekly_stats_at(Utc::now())
    }

    pub fn weekly_stats_at(&self, now: DateTime<Utc>) -> Vec<DayStat> {
        let log = lock_read(&self.log);
        let today = now.date_naive();
        (0..7)
            .rev()
            .map(|offset| {
                let date = today - Days::new(offset);
                let mut workouts = 0;
                let mut minutes = 0u64;
                for event in log.iter().filter(|e| e.completed_at.date_naive() == date) {
                    workouts += 1;
                    minutes += u64::from(event_minutes(event));
                }
                DayStat {
                    date,
                    workouts,
                    minutes,
                }
            })
            .collect()
    }

    /// Totals over the trailing 30 calendar days ending today.
    pub fn monthly_stats(&self) -> PeriodStats {
        self.monthly_stats_at(Utc::now())
    }

    pub fn monthly_stats_at(&self, now: DateTime<Utc>) -> PeriodStats {
        let log = lock_read(&self.log);
        let today = now.date_naive();
        let cutoff = today - Days::new(29);
        let mut stats = PeriodStats::default();
        for event in log.iter() {
            let date = event.completed_at.date_naive();
            if date >= cutoff && date <= today {
                stats.workouts += 1;
                stats.minutes += u64::from(event_minutes(event));
            }
        }
        stats
    }

    /// Consecutive calendar days with at least one workout, walking backward
    /// from today.
    ///
    /// With `count_open_day` set (the default), a today with no workout yet
    /// does not break the streak; the walk continues from yesterday, so the
    /// streak reads as "still alive" until the day actually ends. Any earlier
    /// missing day ends the walk.
    pub fn streak(&self) -> u32 {
        self.streak_at(Utc::now())
    }

    pub fn streak_at(&self, now: DateTime<Utc>) -> u32 {
        let days: HashSet<NaiveDate> = lock_read(&self.log)
            .iter()
            .map(|e| e.completed_at.date_naive())
            .collect();
        if days.is_empty() {
            return 0;
        }

        let today = now.date_naive();
        let mut streak = 0;
        let mut day = today;
        loop {
            if days.contains(&day) {
                streak += 1;
            } else if day == today && self.count_open_day {
                // today is still open; keep walking
            } else {
                break;
            }
            match day.pred_opt() {
                Some(previous) => day = previous,
                None => break,
            }
        }
        streak
    }

    /// Total minutes across the entire log.
    pub fn total_minutes(&self) -> u64 {
        lock_read(&self.log)
            .iter()
            .map(|e| u64::from(event_minutes(e)))
            .sum()
    }

    /// Workout count per category across the entire log.
    pub fn category_stats(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in lock_read(&self.log).iter() {
            *counts.entry(event.category.clone()).or_insert(0) += 1;
        }
        counts
    }
}

fn event_minutes(event: &WorkoutEvent) -> u32 {
    match event.duration_minutes {
        Some(minutes) => minutes,
        None => parse_duration_minutes(&event.duration),
    }
}

/// Lenient parser for legacy duration labels ("15 min", "1 hour").
///
/// Takes the leading integer and scales by unit; anything unparseable
/// contributes zero rather than failing, since this only feeds display
/// aggregates.
pub fn parse_duration_minutes(label: &str) -> u32 {
    let trimmed = label.trim();
    let digits: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let Ok(value) = digits.parse::<u32>() else {
        if !trimmed.is_empty() {
            debug!("unparseable duration label: {:?}", trimmed);
        }
        return 0;
    };
    if trimmed.to_ascii_lowercase().contains("hour") {
        value.saturating_mul(60)
    } else {
        value
    }
}
