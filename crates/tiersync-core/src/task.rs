use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::filter::FilterRule;
use crate::ids::{AssetId, CollectionId, TargetId, TaskId};
use crate::schedule::Schedule;

/// Transfer direction relative to the local archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local archive → targets.
    Push,
    /// Targets → local archive.
    Pull,
    /// Reconcile both sides, resolving conflicts by policy.
    Bidirectional,
}

/// Listing strategy used when planning a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every asset in scope becomes a job item.
    Full,
    /// Only assets added, modified or removed since the last recorded manifest.
    Incremental,
}

/// Resolution rule when both sides changed since the last sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Local copy wins.
    #[default]
    PreferLocal,
    /// Remote copy wins.
    PreferRemote,
    /// Newer modification time wins; ties go to local.
    PreferNewer,
    /// Item is suspended for an operator decision.
    ManualReview,
}

/// Lifecycle state of a sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered, not yet due.
    Idle,
    /// Due and waiting for admission.
    Queued,
    /// Job in flight.
    Running,
    /// Every item succeeded.
    Succeeded,
    /// The job could not start (fatal admission error).
    Failed,
    /// At least one item failed.
    PartiallyFailed,
    /// Operator cancelled the job before all items were admitted.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task is queued or running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Whether the last run reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::PartiallyFailed | Self::Cancelled
        )
    }

    /// Lowercase label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::PartiallyFailed => "partially_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who created the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Administration surface.
    #[default]
    User,
    /// Synthetic upload/evict/restore task from the tiering evaluator.
    Evaluator,
    /// Manual retry of a failed job's items.
    Retry,
}

impl TaskOrigin {
    /// Lowercase label for metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Evaluator => "evaluator",
            Self::Retry => "retry",
        }
    }
}

/// Action run on an item after its transfer is verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostTransfer {
    #[default]
    None,
    /// Delete the local copy once the remote checksum is confirmed.
    EvictLocal,
}

/// Assets a task operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceScope {
    /// Explicit asset set.
    Assets(BTreeSet<AssetId>),
    /// Every asset of a collection.
    Collection(CollectionId),
}

impl SourceScope {
    /// Scope covering a single asset.
    #[must_use]
    pub fn asset(asset_id: AssetId) -> Self {
        Self::Assets(BTreeSet::from([asset_id]))
    }

    /// Whether the scope could include `asset_id` owned by `collection_id`.
    #[must_use]
    pub fn contains(&self, asset_id: AssetId, collection_id: CollectionId) -> bool {
        match self {
            Self::Assets(ids) => ids.contains(&asset_id),
            Self::Collection(id) => *id == collection_id,
        }
    }

    /// Whether two scopes share at least one asset.
    ///
    /// `collection_of` resolves an asset to its owning collection; unknown
    /// assets cannot overlap a collection scope.
    pub fn overlaps<F>(&self, other: &Self, collection_of: F) -> bool
    where
        F: Fn(AssetId) -> Option<CollectionId>,
    {
        match (self, other) {
            (Self::Assets(a), Self::Assets(b)) => a.intersection(b).next().is_some(),
            (Self::Collection(a), Self::Collection(b)) => a == b,
            (Self::Assets(ids), Self::Collection(c)) | (Self::Collection(c), Self::Assets(ids)) => {
                ids.iter().any(|id| collection_of(*id) == Some(*c))
            }
        }
    }
}

/// Optional per-direction bandwidth ceilings in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BandwidthLimit {
    #[serde(default)]
    pub upload_bytes_per_sec: Option<u64>,
    #[serde(default)]
    pub download_bytes_per_sec: Option<u64>,
}

impl BandwidthLimit {
    /// Same ceiling in both directions.
    #[must_use]
    pub fn symmetric(bytes_per_sec: u64) -> Self {
        Self {
            upload_bytes_per_sec: Some(bytes_per_sec),
            download_bytes_per_sec: Some(bytes_per_sec),
        }
    }
}

/// User-defined or synthetic synchronization task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    pub task_id: TaskId,
    pub name: String,
    pub scope: SourceScope,
    pub targets: Vec<TargetId>,
    pub direction: Direction,
    pub mode: SyncMode,
    pub schedule: Schedule,
    #[serde(default)]
    pub bandwidth: BandwidthLimit,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub filter: FilterRule,
    #[serde(default)]
    pub origin: TaskOrigin,
    #[serde(default)]
    pub post_transfer: PostTransfer,
}

impl SyncTask {
    /// Creates an incremental, manually scheduled task.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        scope: SourceScope,
        targets: Vec<TargetId>,
        direction: Direction,
    ) -> Self {
        Self {
            task_id: TaskId::new(),
            name: name.into(),
            scope,
            targets,
            direction,
            mode: SyncMode::Incremental,
            schedule: Schedule::Manual,
            bandwidth: BandwidthLimit::default(),
            conflict_policy: ConflictPolicy::default(),
            filter: FilterRule::any(),
            origin: TaskOrigin::User,
            post_transfer: PostTransfer::None,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    #[must_use]
    pub fn with_bandwidth(mut self, bandwidth: BandwidthLimit) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    #[must_use]
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: FilterRule) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    #[must_use]
    pub fn with_post_transfer(mut self, post: PostTransfer) -> Self {
        self.post_transfer = post;
        self
    }

    /// Validate task definition
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` for an empty name, no targets,
    /// duplicate targets, an empty asset scope, zero bandwidth ceilings, an
    /// invalid filter, or eviction on a task that does not push.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::validation("task name cannot be empty"));
        }
        if self.targets.is_empty() {
            return Err(CoreError::validation(format!(
                "task `{}` has no targets",
                self.name
            )));
        }
        let unique: BTreeSet<_> = self.targets.iter().collect();
        if unique.len() != self.targets.len() {
            return Err(CoreError::validation(format!(
                "task `{}` lists a target more than once",
                self.name
            )));
        }
        if let SourceScope::Assets(ids) = &self.scope {
            if ids.is_empty() {
                return Err(CoreError::validation(format!(
                    "task `{}` has an empty asset scope",
                    self.name
                )));
            }
        }
        if self.bandwidth.upload_bytes_per_sec == Some(0)
            || self.bandwidth.download_bytes_per_sec == Some(0)
        {
            return Err(CoreError::validation("bandwidth ceiling must be > 0"));
        }
        if self.post_transfer == PostTransfer::EvictLocal && self.direction != Direction::Push {
            return Err(CoreError::validation(
                "local eviction requires a push task",
            ));
        }
        // The first verified target would drop the copy the others still need
        if self.post_transfer == PostTransfer::EvictLocal && self.targets.len() > 1 {
            return Err(CoreError::validation(format!(
                "task `{}` evicts local copies and must have exactly one target",
                self.name
            )));
        }
        self.filter.validate()
    }
}
