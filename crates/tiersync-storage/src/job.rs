//! Transfer jobs: a task fanned out into per-asset, per-target items.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tiersync_core::{
    Asset, AssetId, BandwidthLimit, ConflictPolicy, Direction, ErrorClass, JobId, PostTransfer,
    SyncMode, SyncTask, TargetId, TaskId, TaskOrigin, TaskStatus,
};

use crate::manifest::{Manifest, ManifestEntry};

/// What an item does on its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOperation {
    /// Bring local and remote copies in line according to the direction.
    Sync,
    /// The asset left the catalog; delete the remote object.
    PropagateDelete,
}

/// One asset on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobItem {
    pub asset_id: AssetId,
    pub key: String,
    pub target_id: TargetId,
    pub operation: ItemOperation,
    /// Ledger checksum at planning time; `None` for deletes.
    pub expected_checksum: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub bytes_transferred: u64,
}

impl JobItem {
    #[must_use]
    pub fn sync(asset: &Asset, target_id: TargetId) -> Self {
        Self {
            asset_id: asset.asset_id,
            key: asset.key.clone(),
            target_id,
            operation: ItemOperation::Sync,
            expected_checksum: Some(asset.checksum.clone()),
            attempts: 0,
            last_error: None,
            bytes_transferred: 0,
        }
    }

    #[must_use]
    pub fn delete(asset_id: AssetId, key: impl Into<String>, target_id: TargetId) -> Self {
        Self {
            asset_id,
            key: key.into(),
            target_id,
            operation: ItemOperation::PropagateDelete,
            expected_checksum: None,
            attempts: 0,
            last_error: None,
            bytes_transferred: 0,
        }
    }
}

/// Planned execution of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferJob {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task_name: String,
    pub direction: Direction,
    pub conflict_policy: ConflictPolicy,
    pub bandwidth: BandwidthLimit,
    pub post_transfer: PostTransfer,
    pub origin: TaskOrigin,
    pub items: Vec<JobItem>,
    pub created_at: DateTime<Utc>,
}

impl TransferJob {
    /// Distinct targets touched by the job's items.
    #[must_use]
    pub fn targets(&self) -> Vec<TargetId> {
        let targets: BTreeSet<TargetId> = self.items.iter().map(|item| item.target_id).collect();
        targets.into_iter().collect()
    }
}

/// Plan the job for `task` from a ledger snapshot and the task's manifests.
///
/// `Full` considers every in-scope asset. `Incremental` push jobs skip
/// assets whose checksum, size and mtime match the manifest; pull and
/// bidirectional jobs still list every in-scope asset because the remote
/// side may have changed. Manifest entries whose asset left the ledger become
/// propagate-delete items, except for pull jobs and except when a live asset
/// owns the same key again.
#[must_use]
pub fn plan_job(
    task: &SyncTask,
    job_id: JobId,
    assets: &[Asset],
    manifests: &HashMap<TargetId, Manifest>,
    now: DateTime<Utc>,
) -> TransferJob {
    let in_scope: Vec<&Asset> = assets
        .iter()
        .filter(|asset| task.scope.contains(asset.asset_id, asset.collection_id))
        .filter(|asset| task.filter.matches(asset))
        .collect();
    let live: BTreeSet<AssetId> = assets.iter().map(|asset| asset.asset_id).collect();
    let live_keys: BTreeSet<&str> = assets.iter().map(|asset| asset.key.as_str()).collect();
    let empty = Manifest::new();

    let mut items = Vec::new();
    for &target_id in &task.targets {
        let manifest = manifests.get(&target_id).unwrap_or(&empty);

        for asset in &in_scope {
            if task.direction == Direction::Push {
                if !asset.presence.has_local() {
                    tracing::debug!(
                        task_id = %task.task_id,
                        asset_id = %asset.asset_id,
                        "Skipping push of asset without local copy"
                    );
                    continue;
                }
                if task.mode == SyncMode::Incremental
                    && manifest
                        .get(&asset.asset_id)
                        .is_some_and(|entry| entry.matches(asset))
                {
                    continue;
                }
            }
            items.push(JobItem::sync(asset, target_id));
        }

        if task.direction != Direction::Pull {
            for (asset_id, entry) in manifest {
                if live.contains(asset_id) {
                    continue;
                }
                if live_keys.contains(entry.key.as_str()) {
                    tracing::debug!(
                        task_id = %task.task_id,
                        key = %entry.key,
                        "Key was re-ingested, remote copy kept"
                    );
                    continue;
                }
                items.push(JobItem::delete(*asset_id, entry.key.clone(), target_id));
            }
        }
    }

    items.sort_by(|a, b| (&a.key, a.target_id).cmp(&(&b.key, b.target_id)));

    TransferJob {
        job_id,
        task_id: task.task_id,
        task_name: task.name.clone(),
        direction: task.direction,
        conflict_policy: task.conflict_policy,
        bandwidth: task.bandwidth,
        post_transfer: task.post_transfer,
        origin: task.origin,
        items,
        created_at: now,
    }
}

/// Result of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemResult {
    Uploaded,
    Downloaded,
    Deleted,
    UpToDate,
    /// Both sides changed under `ManualReview`; nothing was transferred.
    NeedsReview,
    Failed,
    /// Never started because the job was cancelled.
    Skipped,
}

impl ItemResult {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Downloaded => "downloaded",
            Self::Deleted => "deleted",
            Self::UpToDate => "up_to_date",
            Self::NeedsReview => "needs_review",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Uploaded | Self::Downloaded | Self::Deleted | Self::UpToDate
        )
    }
}

/// Final state of one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    /// The item with its attempt count, last error and byte count filled in.
    pub item: JobItem,
    pub result: ItemResult,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "error_class_serde")]
    pub error_class: Option<ErrorClass>,
    /// The local copy was deleted after verification.
    #[serde(default)]
    pub evicted: bool,
    /// New manifest base for successful sync items.
    #[serde(default)]
    pub manifest_entry: Option<ManifestEntry>,
}

impl ItemReport {
    #[must_use]
    pub fn skipped(item: JobItem) -> Self {
        Self {
            item,
            result: ItemResult::Skipped,
            error_class: None,
            evicted: false,
            manifest_entry: None,
        }
    }
}

/// Aggregate result of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    PartiallyFailed,
    Cancelled,
}

impl JobStatus {
    /// Derive the status from item results.
    #[must_use]
    pub fn from_reports(reports: &[ItemReport], cancelled: bool) -> Self {
        if cancelled {
            Self::Cancelled
        } else if reports.iter().any(|r| r.result == ItemResult::Failed) {
            Self::PartiallyFailed
        } else {
            Self::Succeeded
        }
    }

    #[must_use]
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Self::Succeeded => TaskStatus::Succeeded,
            Self::PartiallyFailed => TaskStatus::PartiallyFailed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Outcome of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub status: JobStatus,
    pub items: Vec<ItemReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    #[must_use]
    pub fn failed_items(&self) -> Vec<&ItemReport> {
        self.items
            .iter()
            .filter(|r| r.result == ItemResult::Failed)
            .collect()
    }

    #[must_use]
    pub fn needs_review(&self) -> Vec<&ItemReport> {
        self.items
            .iter()
            .filter(|r| r.result == ItemResult::NeedsReview)
            .collect()
    }

    #[must_use]
    pub fn count(&self, result: ItemResult) -> usize {
        self.items.iter().filter(|r| r.result == result).count()
    }

    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.items.iter().map(|r| r.item.bytes_transferred).sum()
    }
}

mod error_class_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use tiersync_core::ErrorClass;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(class: &Option<ErrorClass>, s: S) -> Result<S::Ok, S::Error> {
        match class {
            Some(class) => s.serialize_some(class.as_str()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ErrorClass>, D::Error> {
        let label = Option::<String>::deserialize(d)?;
        Ok(label.and_then(|label| match label.as_str() {
            "transient" => Some(ErrorClass::Transient),
            "permanent" => Some(ErrorClass::Permanent),
            "auth_failure" => Some(ErrorClass::AuthFailure),
            _ => None,
        }))
    }
}
