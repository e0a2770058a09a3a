//! Per-(task, target) record of the last transferred state of each asset.
//!
//! Incremental planning diffs the ledger against the manifest, and
//! bidirectional jobs use it as the base state to tell which side changed.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tiersync_core::{Asset, AssetId, TargetId, TaskId};

use crate::job::{ItemResult, JobOutcome};

/// State of one asset as of its last successful transfer or verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

impl ManifestEntry {
    #[must_use]
    pub fn from_asset(asset: &Asset) -> Self {
        Self {
            key: asset.key.clone(),
            checksum: asset.checksum.clone(),
            size_bytes: asset.size_bytes,
            modified_at: asset.modified_at,
        }
    }

    /// Whether `asset` is unchanged since this entry was recorded.
    #[must_use]
    pub fn matches(&self, asset: &Asset) -> bool {
        self.checksum == asset.checksum
            && self.size_bytes == asset.size_bytes
            && self.modified_at == asset.modified_at
    }
}

/// Manifest of one (task, target) pair.
pub type Manifest = BTreeMap<AssetId, ManifestEntry>;

/// All manifests, keyed by task and target.
#[derive(Default)]
pub struct ManifestStore {
    manifests: RwLock<HashMap<(TaskId, TargetId), Manifest>>,
}

impl ManifestStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of one manifest; empty if the pair never completed an item.
    #[must_use]
    pub fn get(&self, task_id: TaskId, target_id: TargetId) -> Manifest {
        self.manifests
            .read()
            .get(&(task_id, target_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Manifests of every target of a task.
    #[must_use]
    pub fn for_task(&self, task_id: TaskId, targets: &[TargetId]) -> HashMap<TargetId, Manifest> {
        let manifests = self.manifests.read();
        targets
            .iter()
            .map(|&target_id| {
                let manifest = manifests
                    .get(&(task_id, target_id))
                    .cloned()
                    .unwrap_or_default();
                (target_id, manifest)
            })
            .collect()
    }

    /// Fold a finished job into the manifests.
    ///
    /// Transferred and up-to-date items record their entry, propagated
    /// deletes drop it, and failed, skipped or review items leave the
    /// previous base untouched. Returns the number of entries changed.
    pub fn merge(&self, outcome: &JobOutcome) -> usize {
        let mut manifests = self.manifests.write();
        let mut changed = 0;

        for report in &outcome.items {
            let manifest = manifests
                .entry((outcome.task_id, report.item.target_id))
                .or_default();
            match (&report.result, &report.manifest_entry) {
                (ItemResult::Deleted, _) => {
                    if manifest.remove(&report.item.asset_id).is_some() {
                        changed += 1;
                    }
                }
                (
                    ItemResult::Uploaded | ItemResult::Downloaded | ItemResult::UpToDate,
                    Some(entry),
                ) => {
                    // A re-ingested asset takes over the key of the entry it replaced
                    let before = manifest.len();
                    manifest.retain(|asset_id, existing| {
                        *asset_id == report.item.asset_id || existing.key != entry.key
                    });
                    changed += before - manifest.len();

                    if manifest.get(&report.item.asset_id) != Some(entry) {
                        manifest.insert(report.item.asset_id, entry.clone());
                        changed += 1;
                    }
                }
                _ => {}
            }
        }

        changed
    }

    /// Forget every manifest of a removed task.
    pub fn remove_task(&self, task_id: TaskId) {
        self.manifests.write().retain(|(task, _), _| *task != task_id);
    }

    /// Every non-empty manifest, ordered by task and target.
    #[must_use]
    pub fn records(&self) -> Vec<ManifestRecord> {
        let mut records: Vec<ManifestRecord> = self
            .manifests
            .read()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(&(task_id, target_id), entries)| ManifestRecord {
                task_id,
                target_id,
                entries: entries.clone(),
            })
            .collect();
        records.sort_by_key(|record| (record.task_id, record.target_id));
        records
    }

    /// Replace every manifest with persisted records.
    pub fn restore(&self, records: Vec<ManifestRecord>) -> usize {
        let restored: HashMap<(TaskId, TargetId), Manifest> = records
            .into_iter()
            .map(|record| ((record.task_id, record.target_id), record.entries))
            .collect();
        let count = restored.len();
        *self.manifests.write() = restored;
        count
    }
}

/// Persisted form of one (task, target) manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub task_id: TaskId,
    pub target_id: TargetId,
    pub entries: Manifest,
}
