//! Orchestrator: wires the ledger, policies, evaluator and scheduler.
//!
//! Evaluator intents become synthetic one-shot tasks:
//! - `EnsureCloudCopy` → push to the archive target
//! - `EvictLocal` → push with a local eviction post-step
//! - `RestoreLocal` → pull from the target holding the verified copy
//!
//! Demotions are applied by the sweep itself. An intent is not submitted again
//! while the task created for the same asset and intent kind is unfinished.
//! A read or write withdraws the asset's pending eviction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tiersync_core::{
    Asset, AssetId, CollectionId, CoreError, CoreResult, Direction, JobId, PostTransfer, Schedule,
    SourceScope, StorageTarget, SyncMode, SyncTask, TargetId, TaskId, TaskOrigin, TaskStatus,
    TierPolicy, TiersyncConfig,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::adapter::{AdapterRegistry, CloudAdapter};
use crate::bandwidth::{BandwidthManager, BucketSnapshot};
use crate::evaluator::{SweepReport, TieringEvaluator, TransitionIntent};
use crate::executor::TransferExecutor;
use crate::job::ItemReport;
use crate::ledger::AssetLedger;
use crate::policy_store::PolicyStore;
use crate::scheduler::{Admission, SyncScheduler, TaskState, TickReport};
use crate::signals::{Signal, SignalHub};
use crate::state::{StateReport, StateStore};

const EVICT_KIND: &str = "evict_local";

/// Result of a sweep plus the tasks created from its intents.
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub report: SweepReport,
    pub submitted: Vec<TaskId>,
}

/// Tiering and sync orchestrator
pub struct Orchestrator {
    config: TiersyncConfig,
    ledger: Arc<AssetLedger>,
    policies: Arc<PolicyStore>,
    registry: Arc<AdapterRegistry>,
    bandwidth: Arc<BandwidthManager>,
    evaluator: Arc<TieringEvaluator>,
    scheduler: SyncScheduler,
    local: Arc<dyn CloudAdapter>,
    signals: SignalHub,
    state: Option<StateStore>,
    /// (asset, intent kind) → synthetic task
    pending: Arc<Mutex<HashMap<(AssetId, &'static str), TaskId>>>,
    sweeper: Option<JoinHandle<()>>,
}

impl Orchestrator {
    /// Build every component from configuration.
    ///
    /// `local` is the local archive store; `registry` serves the cloud targets.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` if the configuration is invalid or
    /// a bandwidth default names a malformed target id.
    pub fn new(
        config: TiersyncConfig,
        registry: Arc<AdapterRegistry>,
        local: Arc<dyn CloudAdapter>,
    ) -> CoreResult<Self> {
        config
            .validate()
            .map_err(|e| CoreError::validation(e.to_string()))?;

        let mut defaults = HashMap::new();
        for (target, limit) in &config.bandwidth.target_defaults {
            let target_id = target.parse::<TargetId>().map_err(|e| {
                CoreError::validation(format!("bandwidth default for `{target}`: {e}"))
            })?;
            defaults.insert(target_id, *limit);
        }

        let signals = SignalHub::default();
        let ledger = Arc::new(AssetLedger::with_max_attempts(
            signals.clone(),
            config.evaluator.cas_max_attempts,
        ));
        let policies = Arc::new(PolicyStore::new(TierPolicy::default())?);
        let bandwidth = Arc::new(BandwidthManager::with_defaults(defaults));
        let evaluator = Arc::new(
            TieringEvaluator::new(Arc::clone(&ledger), Arc::clone(&policies), signals.clone())
                .with_cas_max_attempts(config.evaluator.cas_max_attempts),
        );
        let executor = TransferExecutor::new(
            Arc::clone(&ledger),
            Arc::clone(&policies),
            Arc::clone(&local),
            Arc::clone(&bandwidth),
            signals.clone(),
            config.executor.clone(),
        );
        let scheduler = SyncScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&ledger),
            Arc::clone(&registry),
            Arc::clone(&bandwidth),
            executor,
            signals.clone(),
        );

        let state = config.state.dir.clone().map(StateStore::new);

        Ok(Self {
            config,
            state,
            ledger,
            policies,
            registry,
            bandwidth,
            evaluator,
            scheduler,
            local,
            signals,
            pending: Arc::new(Mutex::new(HashMap::new())),
            sweeper: None,
        })
    }

    // Targets

    /// # Errors
    ///
    /// See [`AdapterRegistry::add_target`].
    pub fn add_target(&self, target: StorageTarget) -> CoreResult<TargetId> {
        let target_id = target.target_id;
        self.registry.add_target(target)?;
        Ok(target_id)
    }

    /// # Errors
    ///
    /// See [`AdapterRegistry::update_target`].
    pub fn update_target(&self, target: StorageTarget) -> CoreResult<()> {
        self.registry.update_target(target)
    }

    /// Remove a target nobody references.
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidState` if a task or policy uses the target, or it
    ///   is the default archive target
    /// - `CoreError::NotFound` if the target does not exist
    pub fn remove_target(&self, target_id: TargetId) -> CoreResult<StorageTarget> {
        let tasks = self.scheduler.tasks_referencing(target_id);
        if !tasks.is_empty() {
            return Err(CoreError::invalid_state(format!(
                "target {target_id} is used by {} task(s)",
                tasks.len()
            )));
        }
        if self.policies.references_target(target_id) {
            return Err(CoreError::invalid_state(format!(
                "target {target_id} is the archive target of a policy"
            )));
        }
        if self.registry.default_target() == Some(target_id) {
            return Err(CoreError::invalid_state(format!(
                "target {target_id} is the default archive target"
            )));
        }
        self.registry.remove_target(target_id)
    }

    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the target does not exist.
    pub fn set_default_target(&self, target_id: TargetId) -> CoreResult<()> {
        self.registry.set_default_target(target_id)
    }

    /// Bind a ready adapter instance to a target.
    pub fn register_adapter(&self, target_id: TargetId, adapter: Arc<dyn CloudAdapter>) {
        self.registry.register_instance(target_id, adapter);
    }

    // Policies

    /// # Errors
    ///
    /// - `CoreError::ValidationError` if the policy is invalid
    /// - `CoreError::NotFound` if its archive target does not exist
    pub fn set_policy(&self, collection_id: CollectionId, policy: TierPolicy) -> CoreResult<()> {
        self.check_archive_target(&policy)?;
        self.policies.set_policy(collection_id, policy)
    }

    /// # Errors
    ///
    /// Same as [`Orchestrator::set_policy`].
    pub fn set_default_policy(&self, policy: TierPolicy) -> CoreResult<()> {
        self.check_archive_target(&policy)?;
        self.policies.set_default_policy(policy)
    }

    pub fn remove_policy(&self, collection_id: CollectionId) -> Option<TierPolicy> {
        self.policies.remove_policy(collection_id)
    }

    fn check_archive_target(&self, policy: &TierPolicy) -> CoreResult<()> {
        match policy.archive_target {
            Some(target_id) if !self.registry.contains(target_id) => {
                Err(CoreError::not_found("target", target_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    // Tasks

    /// # Errors
    ///
    /// See [`SyncScheduler::register`].
    pub fn create_task(&self, task: SyncTask, now: DateTime<Utc>) -> CoreResult<TaskId> {
        self.scheduler.register(task, now)
    }

    /// # Errors
    ///
    /// See [`SyncScheduler::update`].
    pub fn update_task(&self, task: SyncTask, now: DateTime<Utc>) -> CoreResult<()> {
        self.scheduler.update(task, now)
    }

    /// # Errors
    ///
    /// See [`SyncScheduler::remove`].
    pub fn remove_task(&self, task_id: TaskId) -> CoreResult<SyncTask> {
        self.scheduler.remove(task_id)
    }

    /// # Errors
    ///
    /// See [`SyncScheduler::run_now`].
    pub fn run_now(&self, task_id: TaskId, now: DateTime<Utc>) -> CoreResult<Admission> {
        self.scheduler.run_now(task_id, now)
    }

    /// # Errors
    ///
    /// See [`SyncScheduler::cancel`].
    pub fn cancel(&self, task_id: TaskId, now: DateTime<Utc>) -> CoreResult<bool> {
        self.scheduler.cancel(task_id, now)
    }

    /// # Errors
    ///
    /// See [`SyncScheduler::retry_failed`].
    pub fn retry_failed(&self, job_id: JobId, now: DateTime<Utc>) -> CoreResult<TaskId> {
        self.scheduler.retry_failed(job_id, now)
    }

    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the task does not exist.
    pub fn task(&self, task_id: TaskId) -> CoreResult<TaskState> {
        self.scheduler.get(task_id)
    }

    #[must_use]
    pub fn tasks(&self) -> Vec<TaskState> {
        self.scheduler.tasks()
    }

    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the task does not exist.
    pub async fn wait_for_completion(&self, task_id: TaskId) -> CoreResult<TaskStatus> {
        self.scheduler.wait_for_completion(task_id).await
    }

    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.scheduler.tick(now)
    }

    // Catalog

    /// Track an asset already present in the local archive under `key`.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the local archive has no such key
    /// - `CoreError::AlreadyExists` if an asset already uses the key
    pub async fn ingest_asset(&self, collection_id: CollectionId, key: &str) -> CoreResult<Asset> {
        if self.ledger.find_by_key(key).is_some() {
            return Err(CoreError::already_exists("asset", key));
        }
        let meta = self
            .local
            .head(key)
            .await?
            .ok_or_else(|| CoreError::not_found("local object", key))?;
        let asset = self.ledger.insert(Asset::new(
            collection_id,
            key,
            meta.size_bytes,
            meta.checksum,
            meta.modified_at,
        ))?;
        tracing::info!(asset_id = %asset.asset_id, key = %key, "Asset ingested");
        Ok(asset)
    }

    /// Stop tracking an asset. Remote copies are removed by the next run of
    /// tasks whose manifests include it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the asset does not exist.
    pub fn remove_asset(&self, asset_id: AssetId) -> CoreResult<Asset> {
        self.pending.lock().retain(|(id, _), _| *id != asset_id);
        self.ledger.remove(asset_id)
    }

    // Access events

    /// Record a read; a cloud-only asset gets a restore task.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the asset does not exist, or the
    /// restore submission error.
    pub fn record_access(
        &self,
        asset_id: AssetId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<TaskId>> {
        let intent = self.evaluator.record_access(asset_id, now)?;
        self.withdraw_eviction(asset_id, now);
        match intent {
            Some(intent) => self.submit_intent(&intent, now),
            None => Ok(None),
        }
    }

    /// Record a local write, re-reading size and checksum from the archive.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the asset or its local object does not exist
    pub async fn record_write(
        &self,
        asset_id: AssetId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<TaskId>> {
        let asset = self.ledger.get(asset_id)?;
        let meta = self
            .local
            .head(&asset.key)
            .await?
            .ok_or_else(|| CoreError::not_found("local object", asset.key.clone()))?;
        let intent = self.evaluator.record_write(
            asset_id,
            meta.size_bytes,
            &meta.checksum,
            meta.modified_at,
            now,
        )?;
        self.withdraw_eviction(asset_id, now);
        match intent {
            Some(intent) => self.submit_intent(&intent, now),
            None => Ok(None),
        }
    }

    /// Drop the unfinished eviction task of a promoted asset.
    ///
    /// A job already running is cancelled; the executor re-checks the tier
    /// before deleting, so items it already admitted keep the local copy.
    fn withdraw_eviction(&self, asset_id: AssetId, now: DateTime<Utc>) {
        let Some(task_id) = self.pending.lock().remove(&(asset_id, EVICT_KIND)) else {
            return;
        };
        let withdrawn = match self.scheduler.status(task_id) {
            Ok(TaskStatus::Running) => self.scheduler.cancel(task_id, now).map(|_| ()),
            Ok(status) if !status.is_finished() => self.scheduler.remove(task_id).map(|_| ()),
            _ => return,
        };
        match withdrawn {
            Ok(()) => tracing::info!(
                asset_id = %asset_id,
                task_id = %task_id,
                "Pending eviction withdrawn"
            ),
            Err(err) => tracing::warn!(
                asset_id = %asset_id,
                task_id = %task_id,
                error = %err,
                "Pending eviction not withdrawn"
            ),
        }
    }

    /// User-requested restore of a cloud-only asset.
    ///
    /// Returns `None` when the asset already has a local copy.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the asset does not exist.
    pub fn restore(&self, asset_id: AssetId, now: DateTime<Utc>) -> CoreResult<Option<TaskId>> {
        let asset = self.ledger.get(asset_id)?;
        if asset.presence.has_local() {
            return Ok(None);
        }
        self.submit_intent(
            &TransitionIntent::RestoreLocal {
                asset_id,
                collection_id: asset.collection_id,
            },
            now,
        )
    }

    // Evaluation

    /// Run one sweep and submit its intents as one-shot tasks.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let report = self.evaluator.sweep(now);
        let mut submitted = Vec::new();
        for intent in &report.intents {
            match self.submit_intent(intent, now) {
                Ok(Some(task_id)) => submitted.push(task_id),
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    asset_id = %intent.asset_id(),
                    kind = intent.kind(),
                    error = %err,
                    "Intent not submitted"
                ),
            }
        }
        SweepOutcome { report, submitted }
    }

    /// Turn an intent into a registered one-shot task.
    ///
    /// Returns `None` for demotions and for intents already in flight.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the asset does not exist
    /// - `CoreError::InvalidState` if no target can serve the intent
    pub fn submit_intent(
        &self,
        intent: &TransitionIntent,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<TaskId>> {
        if matches!(intent, TransitionIntent::Demote { .. }) {
            return Ok(None);
        }

        let asset_id = intent.asset_id();
        let key = (asset_id, intent.kind());
        let mut pending = self.pending.lock();
        if let Some(&task_id) = pending.get(&key) {
            let in_flight = self
                .scheduler
                .status(task_id)
                .is_ok_and(|status| !status.is_finished());
            if in_flight {
                tracing::debug!(
                    asset_id = %asset_id,
                    task_id = %task_id,
                    "Intent already in flight"
                );
                return Ok(None);
            }
        }

        let asset = self.ledger.get(asset_id)?;
        let (direction, post_transfer, verb) = match intent {
            TransitionIntent::EnsureCloudCopy { .. } => {
                (Direction::Push, PostTransfer::None, "archive")
            }
            TransitionIntent::EvictLocal { .. } => {
                (Direction::Push, PostTransfer::EvictLocal, "evict")
            }
            TransitionIntent::RestoreLocal { .. } => {
                (Direction::Pull, PostTransfer::None, "restore")
            }
            TransitionIntent::Demote { .. } => return Ok(None),
        };
        let target_id = match intent {
            TransitionIntent::RestoreLocal { .. } => asset
                .last_verified_upload
                .as_ref()
                .map(|upload| upload.target_id)
                .or_else(|| self.archive_target(asset.collection_id)),
            _ => self.archive_target(asset.collection_id),
        }
        .ok_or_else(|| {
            CoreError::invalid_state(format!(
                "no archive target for collection {}",
                asset.collection_id
            ))
        })?;

        let task = SyncTask::new(
            format!("{verb} {}", asset.key),
            SourceScope::asset(asset_id),
            vec![target_id],
            direction,
        )
        .with_mode(SyncMode::Full)
        .with_schedule(Schedule::Once)
        .with_post_transfer(post_transfer)
        .with_origin(TaskOrigin::Evaluator);

        let task_id = self.scheduler.register(task, now)?;
        pending.insert(key, task_id);
        tracing::info!(
            asset_id = %asset_id,
            task_id = %task_id,
            kind = intent.kind(),
            target_id = %target_id,
            "Intent submitted"
        );
        Ok(Some(task_id))
    }

    fn archive_target(&self, collection_id: CollectionId) -> Option<TargetId> {
        self.policies
            .policy_for(collection_id)
            .archive_target
            .or_else(|| self.registry.default_target())
    }

    // Durable state

    /// Write the ledger, manifests and history to the state directory.
    ///
    /// Returns `None` when no state directory is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file I/O fails.
    pub async fn save_state(&self) -> CoreResult<Option<StateReport>> {
        let Some(store) = &self.state else {
            return Ok(None);
        };
        store
            .save(
                &self.ledger,
                self.scheduler.manifests(),
                self.scheduler.history(),
            )
            .await
            .map(Some)
    }

    /// Replace the ledger, manifests and history with the saved state.
    ///
    /// Returns `None` when no state directory is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the state files cannot be read or the stored
    /// ledger breaks an asset invariant.
    pub async fn load_state(&self, now: DateTime<Utc>) -> CoreResult<Option<StateReport>> {
        let Some(store) = &self.state else {
            return Ok(None);
        };
        store
            .load(
                &self.ledger,
                self.scheduler.manifests(),
                self.scheduler.history(),
                now,
            )
            .await
            .map(Some)
    }

    // Queries

    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the job is not in the history.
    pub fn job_failures(&self, job_id: JobId) -> CoreResult<Vec<ItemReport>> {
        self.scheduler.history().failed_items(job_id)
    }

    #[must_use]
    pub fn bandwidth_utilization(&self) -> Vec<BucketSnapshot> {
        self.bandwidth.snapshots()
    }

    #[must_use]
    pub fn last_sweep(&self) -> Option<DateTime<Utc>> {
        self.evaluator.last_sweep()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<AssetLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn evaluator(&self) -> &TieringEvaluator {
        &self.evaluator
    }

    // Background loops

    /// Start the periodic sweep and tick loops
    pub fn start(&mut self) {
        self.scheduler.start_worker();
        if self.sweeper.is_some() {
            tracing::warn!("Sweep worker already running");
            return;
        }

        let orchestrator = self.clone_for_worker();
        let interval = self.config.evaluator.sweep_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                orchestrator.sweep(Utc::now());
                if let Err(err) = orchestrator.save_state().await {
                    tracing::warn!(error = %err, "State not saved after sweep");
                }
            }
        });

        self.sweeper = Some(handle);
        tracing::info!("Sweep worker started (interval: {:?})", interval);
    }

    /// Stop both loops and cancel running jobs
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
            tracing::info!("Sweep worker shut down");
        }
        self.scheduler.shutdown();
    }

    /// Clone for worker (without JoinHandle)
    fn clone_for_worker(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: self.state.clone(),
            ledger: Arc::clone(&self.ledger),
            policies: Arc::clone(&self.policies),
            registry: Arc::clone(&self.registry),
            bandwidth: Arc::clone(&self.bandwidth),
            evaluator: Arc::clone(&self.evaluator),
            scheduler: self.scheduler.clone_for_worker(),
            local: Arc::clone(&self.local),
            signals: self.signals.clone(),
            pending: Arc::clone(&self.pending),
            sweeper: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{sha256_hex, MockCloudAdapter};
    use bytes::Bytes;
    use chrono::Duration;
    use tiersync_core::{AdapterKind, Presence, Tier};

    struct Fixture {
        orchestrator: Orchestrator,
        local: MockCloudAdapter,
        remote: MockCloudAdapter,
        target: TargetId,
    }

    fn fixture() -> Fixture {
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

        Fixture {
            orchestrator,
            local,
            remote,
            target,
        }
    }

    impl Fixture {
        async fn ingest(&self, key: &str, idle_days: i64, tier: Tier) -> Asset {
            let data = Bytes::from(format!("content of {key}"));
            let checksum = sha256_hex(&data);
            let meta = self.local.put(key, data, &checksum).await.unwrap();
            let asset = Asset::new(
                CollectionId::new(),
                key,
                meta.size_bytes,
                checksum,
                meta.modified_at,
            )
            .with_last_access(Utc::now() - Duration::days(idle_days))
            .with_tier(tier);
            self.orchestrator.ledger().insert(asset).unwrap()
        }

        async fn run_all(&self, task_ids: &[TaskId]) {
            self.orchestrator.tick(Utc::now());
            for &task_id in task_ids {
                assert_eq!(
                    self.orchestrator.wait_for_completion(task_id).await.unwrap(),
                    TaskStatus::Succeeded
                );
            }
        }
    }

    #[tokio::test]
    async fn test_ingest_from_local_archive() {
        let f = fixture();
        let data = Bytes::from_static(b"frames");
        f.local.put("promo/a.mov", data.clone(), &sha256_hex(&data)).await.unwrap();
        let collection = CollectionId::new();

        let asset = f.orchestrator.ingest_asset(collection, "promo/a.mov").await.unwrap();
        assert_eq!(asset.checksum, sha256_hex(&data));
        assert_eq!(asset.presence, Presence::LocalOnly);
        assert!(matches!(
            f.orchestrator.ingest_asset(collection, "promo/a.mov").await,
            Err(CoreError::AlreadyExists { .. })
        ));
        assert!(matches!(
            f.orchestrator.ingest_asset(collection, "promo/missing.mov").await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cold_path_uploads_before_evicting() {
        let f = fixture();
        let asset = f.ingest("promo/a.mov", 200, Tier::Warm).await;

        // Warm → Cold is held back until a verified copy exists
        let first = f.orchestrator.sweep(Utc::now());
        assert_eq!(first.report.demoted, 0);
        assert_eq!(first.submitted.len(), 1);
        f.run_all(&first.submitted).await;

        let archived = f.orchestrator.ledger().get(asset.asset_id).unwrap();
        assert_eq!(archived.tier, Tier::Warm);
        assert_eq!(archived.presence, Presence::LocalAndCloud);
        assert!(f.remote.contains_key("promo/a.mov"));

        let second = f.orchestrator.sweep(Utc::now());
        assert_eq!(second.report.demoted, 1);
        assert_eq!(second.submitted.len(), 1);
        f.run_all(&second.submitted).await;

        let evicted = f.orchestrator.ledger().get(asset.asset_id).unwrap();
        assert_eq!(evicted.tier, Tier::Cold);
        assert_eq!(evicted.presence, Presence::CloudOnly);
        assert!(!f.local.contains_key("promo/a.mov"));
        assert!(f.orchestrator.last_sweep().is_some());
    }

    #[tokio::test]
    async fn test_in_flight_intent_is_not_duplicated() {
        let f = fixture();
        f.ingest("promo/a.mov", 200, Tier::Warm).await;

        let first = f.orchestrator.sweep(Utc::now());
        assert_eq!(first.submitted.len(), 1);
        let second = f.orchestrator.sweep(Utc::now());
        assert!(second.submitted.is_empty());
        assert_eq!(f.orchestrator.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_access_restores_cloud_only_asset() {
        let f = fixture();
        let asset = f.ingest("promo/a.mov", 200, Tier::Warm).await;
        let first = f.orchestrator.sweep(Utc::now());
        f.run_all(&first.submitted).await;
        let second = f.orchestrator.sweep(Utc::now());
        f.run_all(&second.submitted).await;
        assert_eq!(
            f.orchestrator.ledger().get(asset.asset_id).unwrap().presence,
            Presence::CloudOnly
        );

        let restore = f
            .orchestrator
            .record_access(asset.asset_id, Utc::now())
            .unwrap()
            .expect("cloud-only asset needs a restore");
        let promoted = f.orchestrator.ledger().get(asset.asset_id).unwrap();
        assert_eq!(promoted.tier, Tier::Hot);

        let task = f.orchestrator.task(restore).unwrap().task;
        assert_eq!(task.direction, Direction::Pull);
        assert_eq!(task.origin, TaskOrigin::Evaluator);
        assert_eq!(task.targets, vec![f.target]);

        f.run_all(&[restore]).await;
        let restored = f.orchestrator.ledger().get(asset.asset_id).unwrap();
        assert_eq!(restored.presence, Presence::LocalAndCloud);
        assert!(f.local.contains_key("promo/a.mov"));
        assert_eq!(f.orchestrator.restore(asset.asset_id, Utc::now()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_access_withdraws_pending_eviction() {
        let f = fixture();
        let asset = f.ingest("promo/a.mov", 200, Tier::Warm).await;
        let first = f.orchestrator.sweep(Utc::now());
        f.run_all(&first.submitted).await;
        let second = f.orchestrator.sweep(Utc::now());
        assert_eq!(second.submitted.len(), 1);
        let evict = second.submitted[0];

        // Read arrives before the eviction task is admitted
        assert_eq!(
            f.orchestrator.record_access(asset.asset_id, Utc::now()).unwrap(),
            None
        );
        assert!(matches!(
            f.orchestrator.task(evict),
            Err(CoreError::NotFound { .. })
        ));

        let report = f.orchestrator.tick(Utc::now());
        assert!(report.admitted.is_empty());
        let kept = f.orchestrator.ledger().get(asset.asset_id).unwrap();
        assert_eq!(kept.tier, Tier::Hot);
        assert_eq!(kept.presence, Presence::LocalAndCloud);
        assert!(f.local.contains_key("promo/a.mov"));
        assert!(f.orchestrator.sweep(Utc::now()).submitted.is_empty());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = TiersyncConfig::default();
        config.state.dir = Some(temp_dir.path().to_path_buf());

        let local = MockCloudAdapter::new();
        let data = Bytes::from_static(b"frames");
        local.put("promo/a.mov", data.clone(), &sha256_hex(&data)).await.unwrap();
        let first = Orchestrator::new(
            config.clone(),
            Arc::new(AdapterRegistry::new()),
            Arc::new(local.clone()),
        )
        .unwrap();
        let asset = first
            .ingest_asset(CollectionId::new(), "promo/a.mov")
            .await
            .unwrap();
        let saved = first.save_state().await.unwrap().unwrap();
        assert_eq!(saved.assets, 1);

        let second = Orchestrator::new(
            config,
            Arc::new(AdapterRegistry::new()),
            Arc::new(local),
        )
        .unwrap();
        let loaded = second.load_state(Utc::now()).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(second.ledger().get(asset.asset_id).unwrap(), asset);

        let memory_only = fixture();
        assert_eq!(memory_only.orchestrator.save_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_target_in_use_is_rejected() {
        let f = fixture();
        assert!(matches!(
            f.orchestrator.remove_target(f.target),
            Err(CoreError::InvalidState { .. })
        ));

        let spare = f
            .orchestrator
            .add_target(StorageTarget::new(
                "spare",
                AdapterKind::ObjectStorage,
                "https://spare.example.com",
            ))
            .unwrap();
        let task = SyncTask::new(
            "mirror",
            SourceScope::Collection(CollectionId::new()),
            vec![spare],
            Direction::Push,
        );
        let task_id = f.orchestrator.create_task(task, Utc::now()).unwrap();
        assert!(f.orchestrator.remove_target(spare).is_err());

        f.orchestrator.remove_task(task_id).unwrap();
        let removed = f.orchestrator.remove_target(spare).unwrap();
        assert_eq!(removed.name, "spare");
    }

    #[tokio::test]
    async fn test_intent_without_archive_target_is_skipped() {
        let local = MockCloudAdapter::new();
        let orchestrator = Orchestrator::new(
            TiersyncConfig::default(),
            Arc::new(AdapterRegistry::new()),
            Arc::new(local),
        )
        .unwrap();
        let asset = Asset::new(CollectionId::new(), "promo/a.mov", 1, "aa", Utc::now())
            .with_last_access(Utc::now() - Duration::days(200))
            .with_tier(Tier::Warm);
        orchestrator.ledger().insert(asset).unwrap();

        let outcome = orchestrator.sweep(Utc::now());
        assert_eq!(outcome.report.intents.len(), 1);
        assert!(outcome.submitted.is_empty());
    }

    #[test]
    fn test_invalid_bandwidth_default_is_rejected() {
        let mut config = TiersyncConfig::default();
        config
            .bandwidth
            .target_defaults
            .insert("not-a-uuid".to_string(), 1024);
        let result = Orchestrator::new(
            config,
            Arc::new(AdapterRegistry::new()),
            Arc::new(MockCloudAdapter::new()),
        );
        assert!(matches!(result, Err(CoreError::ValidationError(_))));
    }
}
