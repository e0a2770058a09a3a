//! Job history - capped, TTL-bounded record of jobs that did not fully succeed
//!
//! Entries keep the outcome and a snapshot of the task so that failed items
//! can be inspected and retried after the task itself changed or finished.
//! It provides:
//! - Size limit enforcement with FIFO eviction
//! - TTL-based expiration
//! - Persistence to disk

use std::collections::VecDeque;
use std::path::Path;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tiersync_core::{CoreError, CoreResult, JobId, SchedulerConfig, SyncTask};

use crate::job::{ItemReport, JobOutcome};
use crate::state::write_json;

/// History configuration
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum number of entries (default: 1,000)
    pub max_entries: usize,
    /// Time-to-live in seconds (default: 604,800 = 7 days)
    pub ttl_seconds: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_seconds: 604_800, // 7 days
        }
    }
}

impl From<&SchedulerConfig> for HistoryConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_entries: config.history_max_entries,
            ttl_seconds: config.history_ttl_secs,
        }
    }
}

/// Recorded job with the task definition it ran under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: JobId,
    pub task: SyncTask,
    pub outcome: JobOutcome,
    pub recorded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl HistoryEntry {
    #[must_use]
    pub fn new(task: SyncTask, outcome: JobOutcome, recorded_at: DateTime<Utc>, ttl_seconds: i64) -> Self {
        Self {
            job_id: outcome.job_id,
            task,
            outcome,
            recorded_at,
            expires_at: recorded_at + ChronoDuration::seconds(ttl_seconds),
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// History counters for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryMetrics {
    pub size: usize,
    /// Entries evicted due to the size limit
    pub total_evictions: u64,
    /// Expired entries removed
    pub total_expired: u64,
}

/// Capped history of job outcomes
pub struct JobHistory {
    entries: RwLock<VecDeque<HistoryEntry>>,
    config: HistoryConfig,
    metrics: RwLock<HistoryMetrics>,
}

impl JobHistory {
    #[must_use]
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            config,
            metrics: RwLock::new(HistoryMetrics::default()),
        }
    }

    /// Record an outcome; evicts the oldest entry at capacity.
    pub fn add(&self, task: SyncTask, outcome: JobOutcome, now: DateTime<Utc>) {
        let entry = HistoryEntry::new(task, outcome, now, self.config.ttl_seconds);
        let mut entries = self.entries.write();
        let mut metrics = self.metrics.write();

        while entries.len() >= self.config.max_entries.max(1) {
            entries.pop_front();
            metrics.total_evictions += 1;
            tracing::debug!("Job history full, evicted oldest entry");
        }

        entries.push_back(entry);
        metrics.size = entries.len();
    }

    #[must_use]
    pub fn get(&self, job_id: JobId) -> Option<HistoryEntry> {
        self.entries
            .read()
            .iter()
            .find(|entry| entry.job_id == job_id)
            .cloned()
    }

    pub fn remove(&self, job_id: JobId) -> Option<HistoryEntry> {
        let mut entries = self.entries.write();
        let removed = entries
            .iter()
            .position(|entry| entry.job_id == job_id)
            .and_then(|pos| entries.remove(pos));
        self.metrics.write().size = entries.len();
        removed
    }

    /// Failed items of a recorded job.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the job is not (or no longer) recorded.
    pub fn failed_items(&self, job_id: JobId) -> CoreResult<Vec<ItemReport>> {
        let entries = self.entries.read();
        let entry = entries
            .iter()
            .find(|entry| entry.job_id == job_id)
            .ok_or_else(|| CoreError::not_found("job", job_id.to_string()))?;
        Ok(entry.outcome.failed_items().into_iter().cloned().collect())
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let initial_size = entries.len();
        entries.retain(|entry| !entry.is_expired(now));
        let expired = initial_size - entries.len();

        let mut metrics = self.metrics.write();
        metrics.size = entries.len();
        metrics.total_expired += expired as u64;

        if expired > 0 {
            tracing::info!(expired, "Job history cleanup removed expired entries");
        }
        expired
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[must_use]
    pub fn all_entries(&self) -> Vec<HistoryEntry> {
        self.entries.read().iter().cloned().collect()
    }

    #[must_use]
    pub fn metrics(&self) -> HistoryMetrics {
        let mut metrics = self.metrics.read().clone();
        metrics.size = self.entries.read().len();
        metrics
    }

    /// Write the history to `path` as JSON, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file I/O fails
    pub async fn persist(&self, path: &Path) -> CoreResult<()> {
        // Clone entries to avoid holding lock across await
        let entries: Vec<HistoryEntry> = self.all_entries();
        write_json(path, &entries).await?;

        tracing::debug!(entries = entries.len(), path = %path.display(), "Job history persisted");
        Ok(())
    }

    /// Replace the history with the unexpired entries stored at `path`.
    ///
    /// A missing file leaves the history empty.
    ///
    /// # Errors
    ///
    /// Returns an error if file I/O or deserialization fails
    pub async fn load(&self, path: &Path, now: DateTime<Utc>) -> CoreResult<usize> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::debug!(path = %path.display(), "No job history file, starting empty");
            return Ok(0);
        }

        let json = tokio::fs::read_to_string(path).await?;
        let loaded: Vec<HistoryEntry> = serde_json::from_str(&json)?;

        let mut valid: VecDeque<HistoryEntry> = loaded
            .into_iter()
            .filter(|entry| !entry.is_expired(now))
            .collect();
        while valid.len() > self.config.max_entries.max(1) {
            valid.pop_front();
        }

        let count = valid.len();
        *self.entries.write() = valid;
        self.metrics.write().size = count;

        tracing::info!(entries = count, "Job history loaded from disk");
        Ok(count)
    }
}

impl Default for JobHistory {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ItemResult, JobItem, JobStatus};
    use tempfile::TempDir;
    use tiersync_core::{Asset, CollectionId, Direction, SourceScope, TargetId};

    fn task() -> SyncTask {
        SyncTask::new(
            "promo",
            SourceScope::Collection(CollectionId::new()),
            vec![TargetId::new()],
            Direction::Push,
        )
    }

    fn failed_outcome(task: &SyncTask) -> JobOutcome {
        let asset = Asset::new(CollectionId::new(), "a.mov", 1, "aa", Utc::now());
        let report = ItemReport {
            result: ItemResult::Failed,
            ..ItemReport::skipped(JobItem::sync(&asset, task.targets[0]))
        };
        JobOutcome {
            job_id: JobId::new(),
            task_id: task.task_id,
            status: JobStatus::PartiallyFailed,
            items: vec![report],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_history_add_and_failed_items() {
        let history = JobHistory::default();
        let task = task();
        let outcome = failed_outcome(&task);
        let job_id = outcome.job_id;

        history.add(task, outcome, Utc::now());

        assert_eq!(history.len(), 1);
        assert_eq!(history.failed_items(job_id).unwrap().len(), 1);
        assert!(matches!(
            history.failed_items(JobId::new()),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_history_size_limit() {
        let history = JobHistory::new(HistoryConfig {
            max_entries: 3,
            ..Default::default()
        });
        let task = task();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let outcome = failed_outcome(&task);
            ids.push(outcome.job_id);
            history.add(task.clone(), outcome, Utc::now());
        }

        assert_eq!(history.len(), 3);
        assert!(history.get(ids[0]).is_none());
        assert!(history.get(ids[4]).is_some());
        assert_eq!(history.metrics().total_evictions, 2);
    }

    #[test]
    fn test_history_ttl() {
        let history = JobHistory::new(HistoryConfig {
            ttl_seconds: 60,
            ..Default::default()
        });
        let task = task();
        let now = Utc::now();
        history.add(task.clone(), failed_outcome(&task), now);

        assert_eq!(history.cleanup_expired(now + ChronoDuration::seconds(30)), 0);
        assert_eq!(history.cleanup_expired(now + ChronoDuration::seconds(61)), 1);
        assert!(history.is_empty());
        assert_eq!(history.metrics().total_expired, 1);
    }

    #[tokio::test]
    async fn test_history_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("history/jobs.json");
        let task = task();
        let now = Utc::now();

        let history = JobHistory::default();
        history.add(task.clone(), failed_outcome(&task), now);
        history.add(task.clone(), failed_outcome(&task), now);
        history.persist(&path).await.unwrap();

        let restored = JobHistory::default();
        assert_eq!(restored.load(&path, now).await.unwrap(), 2);
        assert_eq!(restored.all_entries()[0].task.task_id, task.task_id);

        let missing = JobHistory::default();
        let count = missing
            .load(&temp_dir.path().join("missing.json"), now)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
