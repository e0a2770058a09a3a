//! E2E tests: concurrency between tasks, jobs and access events
//!
//! 1. Overlapping scopes never run at the same time
//! 2. Concurrent jobs on one target share the tightest bandwidth ceiling
//! 3. Incremental runs transfer only what changed, and a re-ingested key is
//!    uploaded rather than deleted
//! 4. Access events racing a sweep always win

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use tiersync_core::{
    AdapterKind, Asset, AssetId, BandwidthLimit, CollectionId, Direction, Presence, SourceScope,
    StorageTarget, SyncMode, SyncTask, TargetId, TaskId, TaskStatus, Tier, TiersyncConfig,
    VerifiedUpload,
};
use tiersync_storage::{
    sha256_hex, AdapterRegistry, Admission, CloudAdapter, DeferReason, ItemResult, JobOutcome,
    MockCloudAdapter, Orchestrator, Signal, TransferDirection,
};

struct Harness {
    orchestrator: Orchestrator,
    local: MockCloudAdapter,
    remote: MockCloudAdapter,
    target: TargetId,
}

fn harness() -> Harness {
    let local = MockCloudAdapter::new();
    let remote = MockCloudAdapter::new();
    let orchestrator = Orchestrator::new(
        TiersyncConfig::default(),
        Arc::new(AdapterRegistry::new()),
        Arc::new(local.clone()),
    )
    .unwrap();
    let target = orchestrator
        .add_target(StorageTarget::new(
            "oss",
            AdapterKind::ObjectStorage,
            "https://oss.example.com",
        ))
        .unwrap();
    orchestrator.register_adapter(target, Arc::new(remote.clone()));
    orchestrator.set_default_target(target).unwrap();

    Harness {
        orchestrator,
        local,
        remote,
        target,
    }
}

impl Harness {
    async fn write_local(&self, key: &str, data: Bytes) {
        self.local.put(key, data.clone(), &sha256_hex(&data)).await.unwrap();
    }

    async fn ingest(&self, collection: CollectionId, key: &str, size: usize) -> Asset {
        self.write_local(key, Bytes::from(vec![b'x'; size])).await;
        self.orchestrator.ingest_asset(collection, key).await.unwrap()
    }

    fn push(&self, name: &str, scope: SourceScope) -> SyncTask {
        SyncTask::new(name, scope, vec![self.target], Direction::Push)
    }
}

#[tokio::test]
async fn test_overlapping_scopes_run_one_at_a_time() {
    let h = harness();
    let collection = CollectionId::new();
    let first = h.ingest(collection, "promo/a.mov", 64).await;
    h.ingest(collection, "promo/b.mov", 64).await;
    let mut rx = h.orchestrator.subscribe();

    let whole = h
        .orchestrator
        .create_task(h.push("whole", SourceScope::Collection(collection)), Utc::now())
        .unwrap();
    let single = h
        .orchestrator
        .create_task(h.push("single", SourceScope::asset(first.asset_id)), Utc::now())
        .unwrap();

    h.orchestrator.run_now(whole, Utc::now()).unwrap();
    let deferred = h.orchestrator.run_now(single, Utc::now()).unwrap();
    assert_eq!(
        deferred,
        Admission::Deferred {
            reason: DeferReason::ScopeBusy { running: whole }
        }
    );
    assert_eq!(h.orchestrator.scheduler().running_jobs().len(), 1);

    h.orchestrator.wait_for_completion(whole).await.unwrap();
    h.orchestrator.tick(Utc::now());
    assert_eq!(
        h.orchestrator.wait_for_completion(single).await.unwrap(),
        TaskStatus::Succeeded
    );

    // `single` starts only after `whole` finished
    let mut transitions = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        if let Signal::TaskStatusChanged { task_id, status, .. } = signal {
            transitions.push((task_id, status));
        }
    }
    let whole_done = transitions
        .iter()
        .position(|t| *t == (whole, TaskStatus::Succeeded))
        .unwrap();
    let single_started = transitions
        .iter()
        .position(|t| *t == (single, TaskStatus::Running))
        .unwrap();
    assert!(whole_done < single_started);
}

#[tokio::test(start_paused = true)]
async fn test_bandwidth_ceiling_spans_concurrent_jobs() {
    let h = harness();
    let (slow, fast) = (CollectionId::new(), CollectionId::new());
    for i in 0..4 {
        h.ingest(slow, &format!("slow/{i}.mov"), 1000).await;
        h.ingest(fast, &format!("fast/{i}.mov"), 1000).await;
    }

    let slow_task = h
        .orchestrator
        .create_task(
            h.push("slow", SourceScope::Collection(slow))
                .with_bandwidth(BandwidthLimit::symmetric(1000)),
            Utc::now(),
        )
        .unwrap();
    let fast_task = h
        .orchestrator
        .create_task(
            h.push("fast", SourceScope::Collection(fast))
                .with_bandwidth(BandwidthLimit::symmetric(4000)),
            Utc::now(),
        )
        .unwrap();

    let start = tokio::time::Instant::now();
    assert!(matches!(
        h.orchestrator.run_now(slow_task, Utc::now()).unwrap(),
        Admission::Admitted { .. }
    ));
    assert!(matches!(
        h.orchestrator.run_now(fast_task, Utc::now()).unwrap(),
        Admission::Admitted { .. }
    ));

    let upload = h
        .orchestrator
        .bandwidth_utilization()
        .into_iter()
        .find(|b| b.target_id == h.target && b.direction == TransferDirection::Upload)
        .unwrap();
    assert_eq!(upload.rate_bytes_per_sec, Some(1000));
    assert_eq!(upload.active_jobs, 2);

    h.orchestrator.wait_for_completion(slow_task).await.unwrap();
    h.orchestrator.wait_for_completion(fast_task).await.unwrap();

    // 8000 bytes at 1000 B/s with a one-second burst
    assert!(start.elapsed() >= std::time::Duration::from_secs(6));
    assert_eq!(h.remote.storage_size(), 8);

    let upload = h
        .orchestrator
        .bandwidth_utilization()
        .into_iter()
        .find(|b| b.target_id == h.target && b.direction == TransferDirection::Upload)
        .unwrap();
    assert_eq!(upload.rate_bytes_per_sec, None);
    assert_eq!(upload.active_jobs, 0);
    assert_eq!(upload.bytes_total, 8000);
}

async fn run(h: &Harness, task_id: TaskId, expected_items: usize) -> JobOutcome {
    h.orchestrator.run_now(task_id, Utc::now()).unwrap();
    assert_eq!(
        h.orchestrator.wait_for_completion(task_id).await.unwrap(),
        TaskStatus::Succeeded
    );
    let outcome = h.orchestrator.scheduler().last_outcome(task_id).unwrap();
    assert_eq!(outcome.items.len(), expected_items);
    outcome
}

#[tokio::test]
async fn test_incremental_runs_are_idempotent() {
    let h = harness();
    let collection = CollectionId::new();
    let assets = ingest_many(&h, collection, 3).await;
    let task_id = h
        .orchestrator
        .create_task(
            h.push("promo", SourceScope::Collection(collection)).with_mode(SyncMode::Incremental),
            Utc::now(),
        )
        .unwrap();

    let first = run(&h, task_id, 3).await;
    assert_eq!(first.count(ItemResult::Uploaded), 3);

    // Unchanged: nothing planned, nothing transferred
    run(&h, task_id, 0).await;
    assert_eq!(h.remote.successful_puts(), 3);

    // One edit
    let edited = Bytes::from_static(b"new cut");
    h.write_local(&assets[1].key, edited).await;
    h.orchestrator
        .record_write(assets[1].asset_id, Utc::now())
        .await
        .unwrap();
    let second = run(&h, task_id, 1).await;
    assert_eq!(second.count(ItemResult::Uploaded), 1);
    assert_eq!(h.remote.successful_puts(), 4);

    // One removal propagates as a delete
    h.orchestrator.remove_asset(assets[0].asset_id).unwrap();
    let third = run(&h, task_id, 1).await;
    assert_eq!(third.count(ItemResult::Deleted), 1);
    assert!(!h.remote.contains_key(&assets[0].key));
    assert_eq!(h.remote.storage_size(), 2);

    run(&h, task_id, 0).await;
}

#[tokio::test]
async fn test_reingested_key_keeps_its_remote_copy() {
    let h = harness();
    let collection = CollectionId::new();
    let original = h.ingest(collection, "promo/a.mov", 64).await;
    let task_id = h
        .orchestrator
        .create_task(
            h.push("promo", SourceScope::Collection(collection)).with_mode(SyncMode::Incremental),
            Utc::now(),
        )
        .unwrap();
    run(&h, task_id, 1).await;

    // The catalog replaces the file under the same key
    h.orchestrator.remove_asset(original.asset_id).unwrap();
    let replacement = Bytes::from_static(b"replacement cut");
    h.write_local("promo/a.mov", replacement.clone()).await;
    let reingested = h
        .orchestrator
        .ingest_asset(collection, "promo/a.mov")
        .await
        .unwrap();
    assert_ne!(reingested.asset_id, original.asset_id);

    let outcome = run(&h, task_id, 1).await;
    assert_eq!(outcome.count(ItemResult::Uploaded), 1);
    assert_eq!(outcome.count(ItemResult::Deleted), 0);
    assert_eq!(h.remote.object("promo/a.mov"), Some(replacement));

    // The manifest now tracks only the replacement
    run(&h, task_id, 0).await;
    let manifest = h.orchestrator.scheduler().manifests().get(task_id, h.target);
    assert_eq!(manifest.len(), 1);
    assert!(manifest.contains_key(&reingested.asset_id));
}

async fn ingest_many(h: &Harness, collection: CollectionId, count: usize) -> Vec<Asset> {
    let mut assets = Vec::with_capacity(count);
    for i in 0..count {
        assets.push(h.ingest(collection, &format!("promo/{i}.mov"), 128).await);
    }
    assets
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_access_events_win_over_sweeps() {
    let h = harness();
    let collection = CollectionId::new();

    // Archived warm assets idle long enough to be demoted and evicted
    let mut ids: Vec<AssetId> = Vec::new();
    for i in 0..20 {
        let key = format!("promo/{i}.mov");
        let asset = h.ingest(collection, &key, 32).await;
        let data = h.local.object(&key).unwrap();
        h.remote.insert_object(&key, data, Utc::now());
        let target = h.target;
        h.orchestrator
            .ledger()
            .update(asset.asset_id, "test", |asset| {
                asset.tier = Tier::Warm;
                asset.last_access = Utc::now() - Duration::days(200);
                asset.presence = Presence::LocalAndCloud;
                asset.last_verified_upload = Some(VerifiedUpload {
                    checksum: asset.checksum.clone(),
                    target_id: target,
                    verified_at: Utc::now(),
                });
                Ok(())
            })
            .unwrap();
        ids.push(asset.asset_id);
    }
    let local = h.local.clone();
    let orchestrator = Arc::new(h.orchestrator);

    let sweeper = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            for _ in 0..20 {
                orchestrator.sweep(Utc::now());
                tokio::task::yield_now().await;
            }
        })
    };
    let accessor = {
        let orchestrator = Arc::clone(&orchestrator);
        let ids = ids.clone();
        tokio::spawn(async move {
            for asset_id in ids {
                orchestrator.record_access(asset_id, Utc::now()).unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    sweeper.await.unwrap();
    accessor.await.unwrap();

    // Run every eviction the sweeps managed to submit
    for _ in 0..100 {
        let open = orchestrator.tasks();
        if open.is_empty() {
            break;
        }
        orchestrator.tick(Utc::now());
        for state in open {
            let task_id = state.task.task_id;
            if orchestrator.scheduler().status(task_id).ok() == Some(TaskStatus::Running) {
                orchestrator.wait_for_completion(task_id).await.unwrap();
            }
        }
    }
    assert!(orchestrator.tasks().is_empty());

    for asset_id in ids {
        let asset = orchestrator.ledger().get(asset_id).unwrap();
        assert_eq!(asset.tier, Tier::Hot, "accessed asset must end hot");
        assert!(asset.presence.has_local(), "{} lost its local copy", asset.key);
        assert!(local.contains_key(&asset.key));
    }
}
