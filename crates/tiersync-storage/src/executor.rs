//! Transfer executor: runs one job end-to-end.
//!
//! Items run concurrently up to `max_concurrent_items`. Each item diffs the
//! remote object against the ledger (and, for bidirectional jobs, the
//! manifest base), transfers in bandwidth-throttled chunks, verifies the
//! checksum on the far side and records the result in the ledger. Transient
//! failures and per-attempt timeouts are retried with exponential backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tiersync_core::metrics::{
    BYTES_TRANSFERRED, ITEMS_PROCESSED, TRANSFER_DURATION, TRANSFER_RETRIES,
};
use tiersync_core::{
    Asset, AssetId, ConflictPolicy, CoreError, CoreResult, Direction, ErrorClass, ExecutorConfig,
    JobId, PostTransfer, Presence, TargetId, TaskId, TaskOrigin, VerifiedUpload,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::adapter::{sha256_hex, CloudAdapter, ObjectMeta};
use crate::bandwidth::{BandwidthManager, TransferDirection};
use crate::job::{ItemOperation, ItemReport, ItemResult, JobItem, JobOutcome, JobStatus, TransferJob};
use crate::ledger::AssetLedger;
use crate::manifest::{Manifest, ManifestEntry};
use crate::policy_store::PolicyStore;
use crate::signals::{Signal, SignalHub};

/// Per-job inputs resolved by the scheduler at admission.
pub struct JobContext {
    pub adapters: HashMap<TargetId, Arc<dyn CloudAdapter>>,
    /// Manifest base per target.
    pub manifests: HashMap<TargetId, Manifest>,
    pub cancel: Arc<AtomicBool>,
}

/// What a sync item has to do after diffing both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Nothing to transfer; `verified` when the remote holds the ledger content.
    UpToDate { verified: bool },
    Upload,
    Download,
}

/// Decide the transfer for one item.
///
/// # Errors
///
/// - `CoreError::ConflictNeedsReview` when both sides changed under `ManualReview`
/// - `CoreError::PermanentTransfer` when neither side holds the content
pub fn decide(
    direction: Direction,
    conflict_policy: ConflictPolicy,
    asset: &Asset,
    remote: Option<&ObjectMeta>,
    base: Option<&ManifestEntry>,
) -> CoreResult<SyncAction> {
    let has_local = asset.presence.has_local();
    let same = remote.is_some_and(|meta| meta.checksum == asset.checksum);

    match direction {
        Direction::Push => {
            if same {
                Ok(SyncAction::UpToDate { verified: true })
            } else if has_local {
                Ok(SyncAction::Upload)
            } else {
                Err(missing_both(asset, remote))
            }
        }
        Direction::Pull => match remote {
            Some(_) if same && has_local => Ok(SyncAction::UpToDate { verified: true }),
            Some(_) => Ok(SyncAction::Download),
            None if has_local => Ok(SyncAction::UpToDate { verified: false }),
            None => Err(missing_both(asset, None)),
        },
        Direction::Bidirectional => {
            let Some(remote) = remote else {
                return if has_local {
                    Ok(SyncAction::Upload)
                } else {
                    Err(missing_both(asset, None))
                };
            };
            if same {
                return Ok(SyncAction::UpToDate { verified: true });
            }
            if !has_local {
                return Ok(SyncAction::Download);
            }

            let local_changed = base.map_or(true, |b| b.checksum != asset.checksum);
            let remote_changed = base.map_or(true, |b| b.checksum != remote.checksum);
            match (local_changed, remote_changed) {
                (true, false) => Ok(SyncAction::Upload),
                (false, true) => Ok(SyncAction::Download),
                _ => resolve_conflict(conflict_policy, asset, remote),
            }
        }
    }
}

fn resolve_conflict(
    policy: ConflictPolicy,
    asset: &Asset,
    remote: &ObjectMeta,
) -> CoreResult<SyncAction> {
    match policy {
        ConflictPolicy::PreferLocal => Ok(SyncAction::Upload),
        ConflictPolicy::PreferRemote => Ok(SyncAction::Download),
        // Ties go to the local copy
        ConflictPolicy::PreferNewer if asset.modified_at >= remote.modified_at => {
            Ok(SyncAction::Upload)
        }
        ConflictPolicy::PreferNewer => Ok(SyncAction::Download),
        ConflictPolicy::ManualReview => Err(CoreError::ConflictNeedsReview {
            key: asset.key.clone(),
        }),
    }
}

fn missing_both(asset: &Asset, remote: Option<&ObjectMeta>) -> CoreError {
    let message = match remote {
        Some(meta) => format!(
            "`{}` has no local copy to push and the remote holds different content ({} instead of {})",
            asset.key, meta.checksum, asset.checksum
        ),
        None => format!(
            "`{}` has neither a local copy nor a remote object",
            asset.key
        ),
    };
    CoreError::PermanentTransfer(message)
}

/// Job-wide settings shared by every item task.
struct JobInfo {
    job_id: JobId,
    task_id: TaskId,
    direction: Direction,
    conflict_policy: ConflictPolicy,
    post_transfer: PostTransfer,
    origin: TaskOrigin,
}

/// Successful result of one attempt.
struct Applied {
    result: ItemResult,
    bytes: u64,
    evicted: bool,
    manifest_entry: Option<ManifestEntry>,
}

impl Applied {
    fn new(result: ItemResult, bytes: u64, manifest_entry: Option<ManifestEntry>) -> Self {
        Self {
            result,
            bytes,
            evicted: false,
            manifest_entry,
        }
    }
}

/// Runs transfer jobs against the local archive and the job's targets.
#[derive(Clone)]
pub struct TransferExecutor {
    ledger: Arc<AssetLedger>,
    policies: Arc<PolicyStore>,
    local: Arc<dyn CloudAdapter>,
    bandwidth: Arc<BandwidthManager>,
    signals: SignalHub,
    config: ExecutorConfig,
}

impl TransferExecutor {
    #[must_use]
    pub fn new(
        ledger: Arc<AssetLedger>,
        policies: Arc<PolicyStore>,
        local: Arc<dyn CloudAdapter>,
        bandwidth: Arc<BandwidthManager>,
        signals: SignalHub,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            ledger,
            policies,
            local,
            bandwidth,
            signals,
            config,
        }
    }

    /// Run every item of `job`.
    ///
    /// Cancellation stops admission of further items; items already running
    /// finish normally and the rest are reported as skipped.
    pub async fn run(&self, job: TransferJob, ctx: JobContext) -> JobOutcome {
        let started_at = Utc::now();
        let info = Arc::new(JobInfo {
            job_id: job.job_id,
            task_id: job.task_id,
            direction: job.direction,
            conflict_policy: job.conflict_policy,
            post_transfer: job.post_transfer,
            origin: job.origin,
        });
        tracing::info!(
            job_id = %job.job_id,
            task_id = %job.task_id,
            task = %job.task_name,
            items = job.items.len(),
            "Starting transfer job"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_items.max(1)));
        let mut join_set = JoinSet::new();
        let mut pending: HashMap<usize, JobItem> = HashMap::new();
        let mut reports = Vec::with_capacity(job.items.len());
        let mut cancelled = false;

        for (index, item) in job.items.into_iter().enumerate() {
            if ctx.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                reports.push(ItemReport::skipped(item));
                continue;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                reports.push(ItemReport::skipped(item));
                continue;
            };
            // Cancellation may have arrived while waiting for a slot
            if ctx.cancel.load(Ordering::SeqCst) {
                cancelled = true;
                reports.push(ItemReport::skipped(item));
                continue;
            }

            let executor = self.clone();
            let info = Arc::clone(&info);
            let adapter = ctx.adapters.get(&item.target_id).cloned();
            let base = ctx
                .manifests
                .get(&item.target_id)
                .and_then(|manifest| manifest.get(&item.asset_id))
                .cloned();
            pending.insert(index, item.clone());

            join_set.spawn(async move {
                let _permit = permit;
                (index, executor.run_item(&info, item, adapter, base).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, report)) => {
                    pending.remove(&index);
                    reports.push(report);
                }
                Err(e) => tracing::error!(job_id = %info.job_id, error = %e, "Item task failed"),
            }
        }

        // Items whose task panicked or was aborted
        for (_, mut item) in pending {
            item.last_error = Some("item task aborted".to_string());
            reports.push(ItemReport {
                item,
                result: ItemResult::Failed,
                error_class: Some(ErrorClass::Permanent),
                evicted: false,
                manifest_entry: None,
            });
        }

        reports.sort_by(|a, b| {
            (&a.item.key, a.item.target_id).cmp(&(&b.item.key, b.item.target_id))
        });
        let status = JobStatus::from_reports(&reports, cancelled);
        let outcome = JobOutcome {
            job_id: info.job_id,
            task_id: info.task_id,
            status,
            items: reports,
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            job_id = %outcome.job_id,
            task_id = %outcome.task_id,
            status = ?outcome.status,
            failed = outcome.count(ItemResult::Failed),
            needs_review = outcome.count(ItemResult::NeedsReview),
            bytes = outcome.bytes_transferred(),
            "Transfer job complete"
        );
        outcome
    }

    async fn run_item(
        &self,
        info: &JobInfo,
        mut item: JobItem,
        adapter: Option<Arc<dyn CloudAdapter>>,
        base: Option<ManifestEntry>,
    ) -> ItemReport {
        let Some(adapter) = adapter else {
            let err = CoreError::AdapterMissing {
                kind: format!("target {}", item.target_id),
            };
            return self.fail(info, item, &err);
        };
        let timeout = self.config.item_timeout();
        let retry = &self.config.retry;
        let start = std::time::Instant::now();

        loop {
            item.attempts += 1;
            let attempt = tokio::time::timeout(
                timeout,
                self.attempt(info, &item, adapter.as_ref(), base.as_ref()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(CoreError::TransientTransfer(format!(
                    "`{}` timed out after {}s",
                    item.key,
                    timeout.as_secs()
                )))
            });

            match attempt {
                Ok(applied) => {
                    item.bytes_transferred = applied.bytes;
                    let action = operation_label(&item);
                    ITEMS_PROCESSED
                        .with_label_values(&[action, applied.result.as_str()])
                        .inc();
                    TRANSFER_DURATION
                        .with_label_values(&[action])
                        .observe(start.elapsed().as_secs_f64());
                    tracing::debug!(
                        job_id = %info.job_id,
                        asset_id = %item.asset_id,
                        target_id = %item.target_id,
                        result = applied.result.as_str(),
                        attempts = item.attempts,
                        "Item complete"
                    );
                    return ItemReport {
                        item,
                        result: applied.result,
                        error_class: None,
                        evicted: applied.evicted,
                        manifest_entry: applied.manifest_entry,
                    };
                }
                Err(CoreError::ConflictNeedsReview { key }) => {
                    ITEMS_PROCESSED
                        .with_label_values(&[operation_label(&item), ItemResult::NeedsReview.as_str()])
                        .inc();
                    tracing::warn!(
                        job_id = %info.job_id,
                        key = %key,
                        "Both sides changed, item needs review"
                    );
                    item.last_error = Some(format!("`{key}` changed on both sides"));
                    return ItemReport {
                        item,
                        result: ItemResult::NeedsReview,
                        error_class: None,
                        evicted: false,
                        manifest_entry: None,
                    };
                }
                Err(err) if err.is_retryable() && item.attempts < retry.max_attempts => {
                    let backoff = retry.backoff_for_attempt(item.attempts - 1);
                    TRANSFER_RETRIES
                        .with_label_values(&[err.class().as_str()])
                        .inc();
                    tracing::warn!(
                        job_id = %info.job_id,
                        key = %item.key,
                        attempt = item.attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient transfer failure, retrying"
                    );
                    item.last_error = Some(err.to_string());
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return self.fail(info, item, &err),
            }
        }
    }

    fn fail(&self, info: &JobInfo, mut item: JobItem, err: &CoreError) -> ItemReport {
        let class = err.class();
        item.last_error = Some(err.to_string());
        ITEMS_PROCESSED
            .with_label_values(&[operation_label(&item), ItemResult::Failed.as_str()])
            .inc();
        tracing::error!(
            job_id = %info.job_id,
            asset_id = %item.asset_id,
            target_id = %item.target_id,
            class = class.as_str(),
            attempts = item.attempts,
            error = %err,
            "Item failed"
        );
        self.signals.emit(Signal::item_failed(
            info.job_id,
            info.task_id,
            item.asset_id,
            item.target_id,
            class,
            err.to_string(),
        ));

        ItemReport {
            item,
            result: ItemResult::Failed,
            error_class: Some(class),
            evicted: false,
            manifest_entry: None,
        }
    }

    async fn attempt(
        &self,
        info: &JobInfo,
        item: &JobItem,
        adapter: &dyn CloudAdapter,
        base: Option<&ManifestEntry>,
    ) -> CoreResult<Applied> {
        if item.operation == ItemOperation::PropagateDelete {
            adapter.delete(&item.key).await?;
            return Ok(Applied::new(ItemResult::Deleted, 0, None));
        }

        let asset = self.ledger.get(item.asset_id)?;
        let remote = adapter.head(&item.key).await?;
        let action = decide(
            info.direction,
            info.conflict_policy,
            &asset,
            remote.as_ref(),
            base,
        )?;
        tracing::debug!(
            job_id = %info.job_id,
            key = %item.key,
            action = ?action,
            "Item diffed"
        );

        let mut applied = match action {
            SyncAction::UpToDate { verified: true } => {
                if !asset.has_verified_cloud_copy() {
                    self.record_verified_upload(item.asset_id, &asset.checksum, item.target_id)?;
                }
                Applied::new(
                    ItemResult::UpToDate,
                    0,
                    Some(ManifestEntry::from_asset(&asset)),
                )
            }
            SyncAction::UpToDate { verified: false } => Applied::new(ItemResult::UpToDate, 0, None),
            SyncAction::Upload => self.upload(&asset, item.target_id, adapter).await?,
            SyncAction::Download => self.download(&asset, item.target_id, adapter).await?,
        };

        let verified_remote = matches!(
            action,
            SyncAction::Upload | SyncAction::UpToDate { verified: true }
        );
        if info.post_transfer == PostTransfer::EvictLocal && verified_remote {
            applied.evicted = self.evict_local(info, item, adapter).await?;
        }
        Ok(applied)
    }

    async fn upload(
        &self,
        asset: &Asset,
        target_id: TargetId,
        adapter: &dyn CloudAdapter,
    ) -> CoreResult<Applied> {
        let (data, local_meta) = self.local.get(&asset.key).await?;
        if local_meta.checksum != asset.checksum {
            return Err(CoreError::PermanentTransfer(format!(
                "local content of `{}` no longer matches the ledger",
                asset.key
            )));
        }

        let size = data.len() as u64;
        let parts = self.chunk(data);
        for part in &parts {
            self.bandwidth
                .acquire(target_id, TransferDirection::Upload, part.len() as u64)
                .await;
        }
        adapter
            .put_multipart(&asset.key, parts, &asset.checksum)
            .await?;

        // Verify against what the target lists, not what put returned
        let listed = adapter.head(&asset.key).await?.ok_or_else(|| {
            CoreError::TransientTransfer(format!("`{}` not listed after upload", asset.key))
        })?;
        if listed.checksum != asset.checksum {
            return Err(CoreError::TransientTransfer(format!(
                "remote checksum mismatch for `{}`: expected {}, got {}",
                asset.key, asset.checksum, listed.checksum
            )));
        }

        self.record_verified_upload(asset.asset_id, &asset.checksum, target_id)?;
        BYTES_TRANSFERRED.with_label_values(&["upload"]).inc_by(size);

        Ok(Applied::new(
            ItemResult::Uploaded,
            size,
            Some(ManifestEntry::from_asset(asset)),
        ))
    }

    async fn download(
        &self,
        asset: &Asset,
        target_id: TargetId,
        adapter: &dyn CloudAdapter,
    ) -> CoreResult<Applied> {
        let (data, meta) = adapter.get(&asset.key).await?;
        for part in self.chunk(data.clone()) {
            self.bandwidth
                .acquire(target_id, TransferDirection::Download, part.len() as u64)
                .await;
        }

        let checksum = sha256_hex(&data);
        if checksum != meta.checksum {
            return Err(CoreError::TransientTransfer(format!(
                "downloaded `{}` does not match remote checksum",
                asset.key
            )));
        }

        let size = data.len() as u64;
        self.local.put(&asset.key, data, &checksum).await?;

        let now = Utc::now();
        let updated = self.ledger.update(asset.asset_id, "executor", |current| {
            current.checksum = checksum.clone();
            current.size_bytes = size;
            current.modified_at = meta.modified_at;
            current.presence = Presence::LocalAndCloud;
            current.last_verified_upload = Some(VerifiedUpload {
                checksum: checksum.clone(),
                target_id,
                verified_at: now,
            });
            Ok(())
        })?;
        BYTES_TRANSFERRED.with_label_values(&["download"]).inc_by(size);

        Ok(Applied::new(
            ItemResult::Downloaded,
            size,
            Some(ManifestEntry::from_asset(&updated)),
        ))
    }

    /// Record that `target_id` holds exactly `checksum`.
    fn record_verified_upload(
        &self,
        asset_id: AssetId,
        checksum: &str,
        target_id: TargetId,
    ) -> CoreResult<()> {
        let now = Utc::now();
        self.ledger.update(asset_id, "executor", |asset| {
            if asset.checksum != checksum {
                return Err(CoreError::PermanentTransfer(format!(
                    "`{}` changed during transfer",
                    asset.key
                )));
            }
            asset.last_verified_upload = Some(VerifiedUpload {
                checksum: checksum.to_string(),
                target_id,
                verified_at: now,
            });
            asset.presence = asset.presence.with_cloud();
            Ok(())
        })?;
        Ok(())
    }

    /// Delete the local copy once the remote checksum is re-verified.
    ///
    /// The ledger moves to `CloudOnly` before the file is removed, so a failed
    /// delete leaves a stray file rather than a ledger claiming a missing copy.
    /// Tiering jobs only evict while the asset's current tier drops local
    /// copies; an access or write since planning keeps the file.
    async fn evict_local(
        &self,
        info: &JobInfo,
        item: &JobItem,
        adapter: &dyn CloudAdapter,
    ) -> CoreResult<bool> {
        let asset = self.ledger.get(item.asset_id)?;
        if !asset.presence.has_local() {
            return Ok(false);
        }

        let remote = adapter.head(&item.key).await?.ok_or_else(|| {
            CoreError::TransientTransfer(format!("`{}` vanished before eviction", item.key))
        })?;
        let remote_checksum = remote.checksum;
        let policy = self.policies.policy_for(asset.collection_id);
        let follows_policy = info.origin != TaskOrigin::User;

        let mut retained = None;
        let evicted = self.ledger.update(item.asset_id, "executor", |current| {
            retained = None;
            if follows_policy && policy.keeps_local(current.tier) {
                retained = Some(current.tier);
                return Err(CoreError::invalid_state(format!(
                    "`{}` is {} and keeps its local copy",
                    current.key,
                    current.tier.as_str()
                )));
            }
            let verified = current
                .last_verified_upload
                .as_ref()
                .is_some_and(|upload| upload.checksum == current.checksum);
            if !verified || remote_checksum != current.checksum {
                return Err(CoreError::PermanentTransfer(format!(
                    "`{}` has no verified remote copy of its current content",
                    current.key
                )));
            }
            current.presence = Presence::CloudOnly;
            Ok(())
        });
        if let Some(tier) = retained {
            tracing::info!(
                job_id = %info.job_id,
                asset_id = %item.asset_id,
                tier = tier.as_str(),
                "Eviction withdrawn, tier keeps local copies"
            );
            return Ok(false);
        }
        evicted?;

        self.local.delete(&item.key).await?;
        tracing::info!(asset_id = %item.asset_id, key = %item.key, "Local copy evicted");
        Ok(true)
    }

    fn chunk(&self, data: Bytes) -> Vec<Bytes> {
        let chunk_size = usize::try_from(self.config.chunk_size_bytes)
            .unwrap_or(usize::MAX)
            .max(1);
        if data.is_empty() {
            return vec![data];
        }
        (0..data.len())
            .step_by(chunk_size)
            .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
            .collect()
    }
}

fn operation_label(item: &JobItem) -> &'static str {
    match item.operation {
        ItemOperation::Sync => "sync",
        ItemOperation::PropagateDelete => "delete",
    }
}
