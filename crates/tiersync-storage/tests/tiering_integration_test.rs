//! Integration tests for hot/warm/cold tiering against filesystem adapters
//!
//! Tests cover:
//! 1. Age-based demotion without eviction
//! 2. Upload-then-evict path to a network share
//! 3. Access-driven restore of an evicted asset
//! 4. Policy change back to keep-local-cold
//! 5. Local writes invalidating the verified cloud copy

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use tempfile::TempDir;
use tiersync_core::{
    AdapterKind, Asset, CollectionId, Presence, StorageTarget, TargetId, TaskId, TaskStatus, Tier,
    TierPolicy, TiersyncConfig,
};
use tiersync_storage::{
    sha256_hex, AdapterRegistry, CloudAdapter, LocalFsAdapter, Orchestrator, TransitionIntent,
};

struct Archive {
    _local_dir: TempDir,
    _share_dir: TempDir,
    local: LocalFsAdapter,
    share: LocalFsAdapter,
    orchestrator: Orchestrator,
    target: TargetId,
}

/// Helper: local archive and a network share, both on temp directories
async fn archive() -> Archive {
    let local_dir = TempDir::new().unwrap();
    let share_dir = TempDir::new().unwrap();
    let local = LocalFsAdapter::new(local_dir.path()).await.unwrap();
    let share = LocalFsAdapter::new(share_dir.path()).await.unwrap();

    let orchestrator = Orchestrator::new(
        TiersyncConfig::default(),
        Arc::new(AdapterRegistry::with_builtin_factories()),
        Arc::new(local.clone()),
    )
    .unwrap();
    let target = orchestrator
        .add_target(StorageTarget::new(
            "nas",
            AdapterKind::NetworkShare,
            format!("file://{}", share_dir.path().display()),
        ))
        .unwrap();
    orchestrator.set_default_target(target).unwrap();

    Archive {
        _local_dir: local_dir,
        _share_dir: share_dir,
        local,
        share,
        orchestrator,
        target,
    }
}

impl Archive {
    /// Write a file into the local archive and ingest it, idle for `idle_days`
    async fn ingest(&self, collection: CollectionId, key: &str, tier: Tier, idle_days: i64) -> Asset {
        let data = Bytes::from(format!("footage for {key}"));
        self.local.put(key, data.clone(), &sha256_hex(&data)).await.unwrap();
        let asset = self.orchestrator.ingest_asset(collection, key).await.unwrap();
        self.age(&asset, tier, idle_days)
    }

    fn age(&self, asset: &Asset, tier: Tier, idle_days: i64) -> Asset {
        self.orchestrator
            .ledger()
            .update(asset.asset_id, "test", |a| {
                a.tier = tier;
                a.last_access = Utc::now() - Duration::days(idle_days);
                Ok(())
            })
            .unwrap()
    }

    async fn run(&self, task_ids: &[TaskId]) {
        self.orchestrator.tick(Utc::now());
        for &task_id in task_ids {
            let status = self.orchestrator.wait_for_completion(task_id).await.unwrap();
            assert_eq!(status, TaskStatus::Succeeded, "task {task_id} should succeed");
        }
    }

    /// Sweep and run whatever the sweep submitted
    async fn settle(&self) -> usize {
        let outcome = self.orchestrator.sweep(Utc::now());
        self.run(&outcome.submitted).await;
        outcome.submitted.len()
    }

    fn asset(&self, asset: &Asset) -> Asset {
        self.orchestrator.ledger().get(asset.asset_id).unwrap()
    }
}

#[tokio::test]
async fn test_ten_day_old_asset_demotes_without_eviction() {
    let archive = archive().await;
    let collection = CollectionId::new();
    archive
        .orchestrator
        .set_policy(collection, TierPolicy::new(7, 30))
        .unwrap();
    let asset = archive.ingest(collection, "promo/A001.mov", Tier::Hot, 10).await;

    let outcome = archive.orchestrator.sweep(Utc::now());

    assert_eq!(outcome.report.demoted, 1);
    assert!(outcome.report.intents.is_empty());
    let asset = archive.asset(&asset);
    assert_eq!(asset.tier, Tier::Warm);
    assert_eq!(asset.presence, Presence::LocalOnly);
    assert!(archive.local.head("promo/A001.mov").await.unwrap().is_some());
}

#[tokio::test]
async fn test_cold_lifecycle_uploads_then_evicts() {
    let archive = archive().await;
    let asset = archive
        .ingest(CollectionId::new(), "promo/A001.mov", Tier::Warm, 200)
        .await;

    // First pass only archives
    assert_eq!(archive.settle().await, 1);
    let archived = archive.asset(&asset);
    assert_eq!(archived.tier, Tier::Warm);
    assert_eq!(archived.presence, Presence::LocalAndCloud);
    assert_eq!(
        archived.last_verified_upload.as_ref().map(|u| u.target_id),
        Some(archive.target)
    );

    // Second pass demotes and evicts
    assert_eq!(archive.settle().await, 1);
    let evicted = archive.asset(&asset);
    assert_eq!(evicted.tier, Tier::Cold);
    assert_eq!(evicted.presence, Presence::CloudOnly);
    assert!(archive.local.head("promo/A001.mov").await.unwrap().is_none());

    let remote = archive.share.head("promo/A001.mov").await.unwrap().unwrap();
    assert_eq!(remote.checksum, asset.checksum);

    // Nothing left to do
    assert_eq!(archive.settle().await, 0);
}

#[tokio::test]
async fn test_access_restores_evicted_asset() {
    let archive = archive().await;
    let asset = archive
        .ingest(CollectionId::new(), "promo/A001.mov", Tier::Warm, 200)
        .await;
    archive.settle().await;
    archive.settle().await;
    assert_eq!(archive.asset(&asset).presence, Presence::CloudOnly);

    let restore = archive
        .orchestrator
        .record_access(asset.asset_id, Utc::now())
        .unwrap()
        .expect("evicted asset needs a restore");
    assert_eq!(archive.asset(&asset).tier, Tier::Hot);

    archive.run(&[restore]).await;

    let restored = archive.asset(&asset);
    assert_eq!(restored.presence, Presence::LocalAndCloud);
    let local = archive.local.head("promo/A001.mov").await.unwrap().unwrap();
    assert_eq!(local.checksum, asset.checksum);
}

#[tokio::test]
async fn test_keep_local_cold_policy_restores() {
    let archive = archive().await;
    let collection = CollectionId::new();
    let asset = archive.ingest(collection, "promo/A001.mov", Tier::Warm, 200).await;
    archive.settle().await;
    archive.settle().await;
    assert_eq!(archive.asset(&asset).presence, Presence::CloudOnly);

    archive
        .orchestrator
        .set_policy(collection, TierPolicy::default().with_keep_local_cold(true))
        .unwrap();
    let outcome = archive.orchestrator.sweep(Utc::now());
    assert!(matches!(
        outcome.report.intents.as_slice(),
        [TransitionIntent::RestoreLocal { .. }]
    ));
    archive.run(&outcome.submitted).await;

    let restored = archive.asset(&asset);
    assert_eq!(restored.tier, Tier::Cold);
    assert_eq!(restored.presence, Presence::LocalAndCloud);
}

#[tokio::test]
async fn test_local_write_blocks_eviction_until_reupload() {
    let archive = archive().await;
    let asset = archive
        .ingest(CollectionId::new(), "promo/A001.mov", Tier::Warm, 200)
        .await;
    archive.settle().await;
    assert_eq!(archive.asset(&asset).presence, Presence::LocalAndCloud);

    // Re-edit locally; the verified copy no longer matches
    let edited = Bytes::from_static(b"re-graded footage");
    archive
        .local
        .put("promo/A001.mov", edited.clone(), &sha256_hex(&edited))
        .await
        .unwrap();
    archive
        .orchestrator
        .record_write(asset.asset_id, Utc::now())
        .await
        .unwrap();
    let written = archive.age(&archive.asset(&asset), Tier::Warm, 200);
    assert!(!written.has_verified_cloud_copy());

    let outcome = archive.orchestrator.sweep(Utc::now());
    assert_eq!(outcome.report.demoted, 0);
    assert!(matches!(
        outcome.report.intents.as_slice(),
        [TransitionIntent::EnsureCloudCopy { .. }]
    ));
    archive.run(&outcome.submitted).await;

    let remote = archive.share.head("promo/A001.mov").await.unwrap().unwrap();
    assert_eq!(remote.checksum, sha256_hex(&edited));
    assert!(archive.asset(&asset).has_verified_cloud_copy());
}
