//! Inventory file: targets, tier policies and sync tasks loaded at startup.
//!
//! Everything is referenced by name; collections are the top-level
//! directories of the local archive. Target and task ids derive from their
//! names, so manifests and verified uploads saved before a restart still
//! point at the same target and task.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tiersync_core::{
    AdapterKind, BandwidthLimit, ConflictPolicy, Direction, FilterRule, PostTransfer, Schedule,
    SourceScope, StorageTarget, SyncMode, SyncTask, TargetId, TaskId, TierPolicy,
};
use tiersync_storage::Orchestrator;
use uuid::Uuid;

use crate::archive::collection_id;

const TARGET_NAMESPACE: Uuid = Uuid::from_u128(0x8d41_26a0_b3f5_47c9_a1e2_6c0f_93b7_54d8);
const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x2e97_f1c4_05ab_4d38_8f6e_b1d9_7a24_c053);

/// Target id for a target name without an explicit id.
pub fn target_id(name: &str) -> TargetId {
    TargetId::from_uuid(Uuid::new_v5(&TARGET_NAMESPACE, name.as_bytes()))
}

/// Task id for an inventory task name.
pub fn task_id(name: &str) -> TaskId {
    TaskId::from_uuid(Uuid::new_v5(&TASK_NAMESPACE, name.as_bytes()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub targets: Vec<TargetSpec>,

    /// Target used for evaluator uploads when a policy names none
    #[serde(default)]
    pub default_target: Option<String>,

    #[serde(default)]
    pub default_policy: Option<PolicySpec>,

    /// Policies keyed by collection name
    #[serde(default)]
    pub policies: BTreeMap<String, PolicySpec>,

    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Stable id, needed when `bandwidth.target_defaults` refers to the target
    #[serde(default)]
    pub id: Option<TargetId>,
    pub name: String,
    pub kind: AdapterKind,
    pub endpoint: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub credential_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySpec {
    pub hot_to_warm_days: i64,
    pub warm_to_cold_days: i64,
    pub keep_local_hot: bool,
    pub keep_local_warm: bool,
    pub keep_local_cold: bool,
    pub archive_target: Option<String>,
}

impl Default for PolicySpec {
    fn default() -> Self {
        let policy = TierPolicy::default();
        Self {
            hot_to_warm_days: policy.hot_to_warm_days,
            warm_to_cold_days: policy.warm_to_cold_days,
            keep_local_hot: policy.keep_local_hot,
            keep_local_warm: policy.keep_local_warm,
            keep_local_cold: policy.keep_local_cold,
            archive_target: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub collection: String,
    pub targets: Vec<String>,
    pub direction: Direction,
    #[serde(default = "default_mode")]
    pub mode: SyncMode,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub bandwidth: BandwidthLimit,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Textual filter such as `*.mov;min:1MB`
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub post_transfer: PostTransfer,
}

fn default_mode() -> SyncMode {
    SyncMode::Incremental
}

fn default_schedule() -> String {
    "manual".to_string()
}

/// Counts of what an inventory registered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub targets: usize,
    pub policies: usize,
    pub tasks: usize,
}

impl Inventory {
    /// Read an inventory JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read inventory {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse inventory {}", path.display()))
    }

    /// Check every definition and cross-reference without registering anything
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for entry in &self.targets {
            entry.to_target().validate()?;
            if !names.insert(entry.name.as_str()) {
                bail!("duplicate target name `{}`", entry.name);
            }
        }

        let known = |name: &str| -> Result<()> {
            if names.contains(name) {
                Ok(())
            } else {
                Err(anyhow!("unknown target `{name}`"))
            }
        };

        if let Some(name) = &self.default_target {
            known(name.as_str()).context("default_target")?;
        }
        for (collection, entry) in self.policy_specs() {
            if let Some(name) = &entry.archive_target {
                known(name.as_str()).with_context(|| format!("policy for `{collection}`"))?;
            }
            entry.to_policy(None).validate()?;
        }
        for task in &self.tasks {
            if task.targets.is_empty() {
                bail!("task `{}` has no targets", task.name);
            }
            for name in &task.targets {
                known(name.as_str()).with_context(|| format!("task `{}`", task.name))?;
            }
            Schedule::parse(&task.schedule).with_context(|| format!("task `{}`", task.name))?;
            if let Some(filter) = &task.filter {
                FilterRule::parse(filter).with_context(|| format!("task `{}`", task.name))?;
            }
            let targets = task.targets.iter().map(|name| target_id(name)).collect();
            task.to_task(targets)?
                .validate()
                .with_context(|| format!("task `{}`", task.name))?;
        }

        Ok(())
    }

    /// Register targets, policies and tasks with the orchestrator
    pub fn apply(&self, orchestrator: &Orchestrator, now: DateTime<Utc>) -> Result<Applied> {
        self.validate()?;

        let mut targets: HashMap<&str, TargetId> = HashMap::new();
        for entry in &self.targets {
            let target_id = orchestrator.add_target(entry.to_target())?;
            if orchestrator.registry().resolve(target_id).is_err() {
                tracing::warn!(
                    target = %entry.name,
                    kind = %entry.kind,
                    "No adapter for target kind; tasks using it will fail admission"
                );
            }
            targets.insert(entry.name.as_str(), target_id);
        }
        let resolve = |name: &str| -> Result<TargetId> {
            targets
                .get(name)
                .copied()
                .ok_or_else(|| anyhow!("unknown target `{name}`"))
        };

        if let Some(name) = &self.default_target {
            orchestrator.set_default_target(resolve(name.as_str())?)?;
        }

        let mut applied = Applied {
            targets: targets.len(),
            ..Applied::default()
        };

        if let Some(entry) = &self.default_policy {
            let archive = entry.archive_target.as_deref().map(resolve).transpose()?;
            orchestrator.set_default_policy(entry.to_policy(archive))?;
            applied.policies += 1;
        }
        for (collection, entry) in &self.policies {
            let archive = entry.archive_target.as_deref().map(resolve).transpose()?;
            orchestrator.set_policy(collection_id(collection), entry.to_policy(archive))?;
            applied.policies += 1;
        }

        for entry in &self.tasks {
            let task_targets = entry
                .targets
                .iter()
                .map(|name| resolve(name.as_str()))
                .collect::<Result<Vec<_>>>()?;
            let task_id = orchestrator.create_task(entry.to_task(task_targets)?, now)?;
            tracing::info!(task_id = %task_id, name = %entry.name, "Task registered");
            applied.tasks += 1;
        }

        Ok(applied)
    }

    fn policy_specs(&self) -> impl Iterator<Item = (&str, &PolicySpec)> {
        self.default_policy
            .iter()
            .map(|entry| ("default", entry))
            .chain(self.policies.iter().map(|(name, entry)| (name.as_str(), entry)))
    }
}

impl TargetSpec {
    fn to_target(&self) -> StorageTarget {
        let mut target = StorageTarget::new(self.name.clone(), self.kind, self.endpoint.clone());
        target.target_id = self.id.unwrap_or_else(|| target_id(&self.name));
        target.bucket = self.bucket.clone();
        target.credential_ref = self.credential_ref.clone();
        target
    }
}

impl PolicySpec {
    fn to_policy(&self, archive_target: Option<TargetId>) -> TierPolicy {
        TierPolicy {
            hot_to_warm_days: self.hot_to_warm_days,
            warm_to_cold_days: self.warm_to_cold_days,
            keep_local_hot: self.keep_local_hot,
            keep_local_warm: self.keep_local_warm,
            keep_local_cold: self.keep_local_cold,
            archive_target,
        }
    }
}

impl TaskSpec {
    fn to_task(&self, targets: Vec<TargetId>) -> Result<SyncTask> {
        let mut task = SyncTask::new(
            self.name.clone(),
            SourceScope::Collection(collection_id(&self.collection)),
            targets,
            self.direction,
        )
        .with_mode(self.mode)
        .with_schedule(Schedule::parse(&self.schedule)?)
        .with_bandwidth(self.bandwidth)
        .with_conflict_policy(self.conflict_policy)
        .with_post_transfer(self.post_transfer);
        task.task_id = task_id(&self.name);
        if let Some(filter) = &self.filter {
            task = task.with_filter(FilterRule::parse(filter)?);
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tiersync_core::{TaskStatus, TiersyncConfig};
    use tiersync_storage::{AdapterRegistry, MockCloudAdapter};

    const INVENTORY: &str = r#"{
        "targets": [
            { "name": "nas", "kind": "network_share", "endpoint": "file:///mnt/nas" },
            { "name": "oss", "kind": "object_storage", "endpoint": "https://oss.example.com", "bucket": "studio" }
        ],
        "default_target": "nas",
        "policies": {
            "promo": { "hot_to_warm_days": 3, "warm_to_cold_days": 30, "archive_target": "oss" }
        },
        "tasks": [
            {
                "name": "promo nightly",
                "collection": "promo",
                "targets": ["nas"],
                "direction": "push",
                "schedule": "daily 02:00",
                "filter": "*.mov;min:1KB",
                "bandwidth": { "upload_bytes_per_sec": 1048576 }
            }
        ]
    }"#;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            TiersyncConfig::default(),
            Arc::new(AdapterRegistry::with_builtin_factories()),
            Arc::new(MockCloudAdapter::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_validate() {
        let inventory: Inventory = serde_json::from_str(INVENTORY).unwrap();
        assert_eq!(inventory.targets.len(), 2);
        assert_eq!(inventory.tasks[0].mode, SyncMode::Incremental);
        assert!(inventory.policies["promo"].keep_local_warm);
        inventory.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unknown_target() {
        let mut inventory: Inventory = serde_json::from_str(INVENTORY).unwrap();
        inventory.tasks[0].targets = vec!["glacier".to_string()];
        let err = inventory.validate().unwrap_err();
        assert!(format!("{err:#}").contains("unknown target `glacier`"));
    }

    #[test]
    fn test_validate_rejects_duplicate_names_and_bad_schedule() {
        let mut inventory: Inventory = serde_json::from_str(INVENTORY).unwrap();
        inventory.targets.push(inventory.targets[0].clone());
        assert!(inventory.validate().is_err());

        let mut inventory: Inventory = serde_json::from_str(INVENTORY).unwrap();
        inventory.tasks[0].schedule = "fortnightly".to_string();
        assert!(inventory.validate().is_err());
    }

    #[test]
    fn test_apply_registers_everything() {
        let inventory: Inventory = serde_json::from_str(INVENTORY).unwrap();
        let orchestrator = orchestrator();

        let applied = inventory.apply(&orchestrator, Utc::now()).unwrap();

        assert_eq!(
            applied,
            Applied {
                targets: 2,
                policies: 1,
                tasks: 1
            }
        );
        let nas = orchestrator.registry().find_by_name("nas").unwrap();
        let oss = orchestrator.registry().find_by_name("oss").unwrap();
        assert_eq!(orchestrator.registry().default_target(), Some(nas.target_id));

        let policy = orchestrator.policies().policy_for(collection_id("promo"));
        assert_eq!(policy.hot_to_warm_days, 3);
        assert_eq!(policy.archive_target, Some(oss.target_id));

        let tasks = orchestrator.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Idle);
        assert_eq!(tasks[0].task.scope, SourceScope::Collection(collection_id("promo")));
        assert_eq!(tasks[0].task.targets, vec![nas.target_id]);
        assert_eq!(tasks[0].task.bandwidth.upload_bytes_per_sec, Some(1_048_576));
        assert!(tasks[0].next_due.is_some());
    }

    #[test]
    fn test_validate_rejects_multi_target_eviction() {
        let mut inventory: Inventory = serde_json::from_str(INVENTORY).unwrap();
        inventory.tasks[0].post_transfer = PostTransfer::EvictLocal;
        inventory.validate().unwrap();

        inventory.tasks[0].targets = vec!["nas".to_string(), "oss".to_string()];
        let err = inventory.validate().unwrap_err();
        assert!(format!("{err:#}").contains("exactly one target"));
        assert!(inventory.apply(&orchestrator(), Utc::now()).is_err());
    }

    #[test]
    fn test_ids_are_stable_across_applies() {
        let inventory: Inventory = serde_json::from_str(INVENTORY).unwrap();
        let first = orchestrator();
        let second = orchestrator();
        inventory.apply(&first, Utc::now()).unwrap();
        inventory.apply(&second, Utc::now()).unwrap();

        assert_eq!(first.tasks()[0].task.task_id, task_id("promo nightly"));
        assert_eq!(
            first.tasks()[0].task.task_id,
            second.tasks()[0].task.task_id
        );
        assert_eq!(
            first.registry().find_by_name("oss").unwrap().target_id,
            target_id("oss")
        );
    }

    #[test]
    fn test_stable_target_id() {
        let id = TargetId::new();
        let inventory = Inventory {
            targets: vec![TargetSpec {
                id: Some(id),
                name: "nas".to_string(),
                kind: AdapterKind::NetworkShare,
                endpoint: "file:///mnt/nas".to_string(),
                bucket: None,
                credential_ref: None,
            }],
            ..Inventory::default()
        };
        let orchestrator = orchestrator();
        inventory.apply(&orchestrator, Utc::now()).unwrap();
        assert!(orchestrator.registry().contains(id));
    }
}
