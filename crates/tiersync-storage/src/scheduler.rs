//! Sync scheduler: task queue, admission and job lifecycle.
//!
//! `tick` marks due tasks as queued and admits them (forced runs first, then
//! by due time) up to `max_concurrent_tasks`. Admission enforces scope
//! exclusivity against running tasks, resolves an adapter for every target,
//! plans the job, registers bandwidth ceilings and spawns the job. State lives
//! behind a `parking_lot` mutex that is never held across an `.await`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tiersync_core::metrics::{QUEUED_TASKS, RUNNING_TASKS, TASKS_ADMITTED, TASK_OUTCOMES};
use tiersync_core::{
    CoreError, CoreResult, JobId, Schedule, SchedulerConfig, SourceScope, SyncMode, SyncTask,
    TargetId, TaskId, TaskOrigin, TaskStatus,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::adapter::{AdapterRegistry, CloudAdapter};
use crate::bandwidth::BandwidthManager;
use crate::executor::{JobContext, TransferExecutor};
use crate::history::{HistoryConfig, JobHistory};
use crate::job::{plan_job, ItemOperation, JobOutcome, JobStatus};
use crate::ledger::AssetLedger;
use crate::manifest::ManifestStore;
use crate::signals::{Signal, SignalHub};

/// Finished one-shot tasks kept for status queries.
const RETIRED_CAPACITY: usize = 256;

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "admission", rename_all = "snake_case")]
pub enum Admission {
    Admitted { job_id: JobId },
    Deferred { reason: DeferReason },
}

/// Why a queued task was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeferReason {
    AlreadyRunning,
    AtCapacity,
    /// A running task covers an overlapping scope.
    ScopeBusy { running: TaskId },
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskState {
    pub task: SyncTask,
    pub status: TaskStatus,
    pub next_due: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_job: Option<JobId>,
    pub last_result: Option<JobStatus>,
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks that became due during this tick.
    pub queued: usize,
    pub admitted: Vec<JobId>,
    pub deferred: usize,
    /// Tasks whose admission failed fatally.
    pub failed: usize,
}

struct TaskEntry {
    task: SyncTask,
    status: TaskStatus,
    next_due: Option<DateTime<Utc>>,
    queued_at: Option<DateTime<Utc>>,
    forced: bool,
    last_run: Option<DateTime<Utc>>,
    last_job: Option<JobId>,
    last_outcome: Option<JobOutcome>,
}

impl TaskEntry {
    fn new(task: SyncTask, now: DateTime<Utc>) -> Self {
        let next_due = task.schedule.first_due(now);
        Self {
            task,
            status: TaskStatus::Idle,
            next_due,
            queued_at: None,
            forced: false,
            last_run: None,
            last_job: None,
            last_outcome: None,
        }
    }

    fn state(&self) -> TaskState {
        TaskState {
            task: self.task.clone(),
            status: self.status,
            next_due: self.next_due,
            last_run: self.last_run,
            last_job: self.last_job,
            last_result: self.last_outcome.as_ref().map(|outcome| outcome.status),
        }
    }
}

struct RunningJob {
    job_id: JobId,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<TaskId, TaskEntry>,
    running: HashMap<TaskId, RunningJob>,
    retired: HashMap<TaskId, TaskEntry>,
    retired_order: VecDeque<TaskId>,
}

impl SchedulerState {
    fn entry(&self, task_id: TaskId) -> CoreResult<&TaskEntry> {
        self.tasks
            .get(&task_id)
            .or_else(|| self.retired.get(&task_id))
            .ok_or_else(|| CoreError::not_found("task", task_id.to_string()))
    }

    fn entry_mut(&mut self, task_id: TaskId) -> CoreResult<&mut TaskEntry> {
        self.tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::not_found("task", task_id.to_string()))
    }

    /// Move a finished one-shot task out of the queue.
    fn retire(&mut self, task_id: TaskId) {
        if let Some(entry) = self.tasks.remove(&task_id) {
            self.retired.insert(task_id, entry);
            self.retired_order.push_back(task_id);
            while self.retired_order.len() > RETIRED_CAPACITY {
                if let Some(oldest) = self.retired_order.pop_front() {
                    self.retired.remove(&oldest);
                }
            }
        }
    }

    fn queued_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|entry| entry.status == TaskStatus::Queued)
            .count()
    }
}

struct SchedulerShared {
    config: SchedulerConfig,
    ledger: Arc<AssetLedger>,
    registry: Arc<AdapterRegistry>,
    bandwidth: Arc<BandwidthManager>,
    executor: TransferExecutor,
    manifests: ManifestStore,
    history: JobHistory,
    signals: SignalHub,
    state: Mutex<SchedulerState>,
    completed: Notify,
}

impl SchedulerShared {
    fn emit_status(&self, task_id: TaskId, job_id: Option<JobId>, status: TaskStatus) {
        self.signals.emit(Signal::TaskStatusChanged {
            task_id,
            job_id,
            status,
        });
    }

    /// Admit one queued task if capacity and scope allow.
    fn try_admit(self: &Arc<Self>, task_id: TaskId, now: DateTime<Utc>) -> CoreResult<Admission> {
        let mut state = self.state.lock();

        // Retired one-shot tasks cannot be admitted again
        let entry = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| CoreError::not_found("task", task_id.to_string()))?;
        if entry.status == TaskStatus::Running {
            return Ok(Admission::Deferred {
                reason: DeferReason::AlreadyRunning,
            });
        }
        if state.running.len() >= self.config.max_concurrent_tasks {
            return Ok(Admission::Deferred {
                reason: DeferReason::AtCapacity,
            });
        }

        let task = entry.task.clone();
        let busy = state.running.keys().copied().find(|running_id| {
            state.tasks.get(running_id).is_some_and(|running| {
                running
                    .task
                    .scope
                    .overlaps(&task.scope, |asset_id| self.ledger.collection_of(asset_id))
            })
        });
        if let Some(running) = busy {
            tracing::warn!(
                task_id = %task_id,
                running_task = %running,
                "Admission deferred, scope busy"
            );
            return Ok(Admission::Deferred {
                reason: DeferReason::ScopeBusy { running },
            });
        }

        let mut adapters: HashMap<TargetId, Arc<dyn CloudAdapter>> = HashMap::new();
        for &target_id in &task.targets {
            match self.registry.resolve(target_id) {
                Ok(adapter) => {
                    adapters.insert(target_id, adapter);
                }
                Err(err) => {
                    tracing::error!(
                        task_id = %task_id,
                        target_id = %target_id,
                        error = %err,
                        "Admission failed, no transfer started"
                    );
                    let entry = state.entry_mut(task_id)?;
                    entry.status = TaskStatus::Failed;
                    entry.forced = false;
                    entry.queued_at = None;
                    entry.next_due = entry.task.schedule.next_after(now);
                    if entry.task.schedule.is_one_shot() {
                        state.retire(task_id);
                    }
                    drop(state);

                    TASK_OUTCOMES.with_label_values(&[TaskStatus::Failed.as_str()]).inc();
                    self.emit_status(task_id, None, TaskStatus::Failed);
                    self.completed.notify_waiters();
                    return Err(err);
                }
            }
        }

        let job_id = JobId::new();
        let manifests = self.manifests.for_task(task_id, &task.targets);
        let job = plan_job(&task, job_id, &self.ledger.snapshot(), &manifests, now);
        self.bandwidth.register(job_id, &task.targets, task.bandwidth);

        let cancel = Arc::new(AtomicBool::new(false));
        let entry = state.entry_mut(task_id)?;
        entry.status = TaskStatus::Running;
        entry.forced = false;
        entry.queued_at = None;
        entry.last_run = Some(now);
        entry.last_job = Some(job_id);
        state.running.insert(
            task_id,
            RunningJob {
                job_id,
                cancel: Arc::clone(&cancel),
            },
        );
        RUNNING_TASKS.set(state.running.len() as i64);
        drop(state);

        TASKS_ADMITTED.with_label_values(&[task.origin.as_str()]).inc();
        tracing::info!(
            task_id = %task_id,
            job_id = %job_id,
            task = %task.name,
            items = job.items.len(),
            "Task admitted"
        );
        self.emit_status(task_id, Some(job_id), TaskStatus::Running);

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let ctx = JobContext {
                adapters,
                manifests,
                cancel,
            };
            let outcome = shared.executor.run(job, ctx).await;
            let finished_at = outcome.finished_at;
            shared.complete(task_id, outcome, finished_at);
        });

        Ok(Admission::Admitted { job_id })
    }

    /// Record a finished job and compute the task's next due time.
    fn complete(&self, task_id: TaskId, outcome: JobOutcome, now: DateTime<Utc>) {
        self.bandwidth.release(outcome.job_id);
        self.manifests.merge(&outcome);

        let status = outcome.status.task_status();
        let job_id = outcome.job_id;
        let keep_in_history =
            outcome.status != JobStatus::Succeeded || !outcome.needs_review().is_empty();

        let mut state = self.state.lock();
        state.running.remove(&task_id);
        RUNNING_TASKS.set(state.running.len() as i64);

        let Some(entry) = state.tasks.get_mut(&task_id) else {
            tracing::warn!(task_id = %task_id, "Completed job for unknown task");
            return;
        };
        entry.status = status;
        let base = entry.last_run.unwrap_or(now);
        entry.next_due = entry.task.schedule.next_after(base);
        if keep_in_history {
            self.history.add(entry.task.clone(), outcome.clone(), now);
        }
        entry.last_outcome = Some(outcome);
        if entry.task.schedule.is_one_shot() {
            state.retire(task_id);
        }
        drop(state);

        TASK_OUTCOMES.with_label_values(&[status.as_str()]).inc();
        self.emit_status(task_id, Some(job_id), status);
        self.completed.notify_waiters();
    }
}

/// Sync scheduler
///
/// # Example
///
/// ```no_run
/// # use tiersync_storage::scheduler::SyncScheduler;
/// # use chrono::Utc;
/// # fn example(mut scheduler: SyncScheduler, task: tiersync_core::SyncTask) -> tiersync_core::CoreResult<()> {
/// let task_id = scheduler.register(task, Utc::now())?;
/// scheduler.run_now(task_id, Utc::now())?;
///
/// // Periodic ticks from now on
/// scheduler.start_worker();
/// # Ok(())
/// # }
/// ```
pub struct SyncScheduler {
    shared: Arc<SchedulerShared>,
    worker: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    #[must_use]
    pub fn new(
        config: SchedulerConfig,
        ledger: Arc<AssetLedger>,
        registry: Arc<AdapterRegistry>,
        bandwidth: Arc<BandwidthManager>,
        executor: TransferExecutor,
        signals: SignalHub,
    ) -> Self {
        let history = JobHistory::new(HistoryConfig::from(&config));
        Self {
            shared: Arc::new(SchedulerShared {
                config,
                ledger,
                registry,
                bandwidth,
                executor,
                manifests: ManifestStore::new(),
                history,
                signals,
                state: Mutex::new(SchedulerState::default()),
                completed: Notify::new(),
            }),
            worker: None,
        }
    }

    fn check_targets(&self, task: &SyncTask) -> CoreResult<()> {
        for &target_id in &task.targets {
            if !self.shared.registry.contains(target_id) {
                return Err(CoreError::not_found("target", target_id.to_string()));
            }
        }
        Ok(())
    }

    /// Register a task; it becomes due per its schedule.
    ///
    /// # Errors
    ///
    /// - `CoreError::ValidationError` if the task is invalid
    /// - `CoreError::NotFound` if a target is not registered
    /// - `CoreError::AlreadyExists` if the task id is taken
    pub fn register(&self, task: SyncTask, now: DateTime<Utc>) -> CoreResult<TaskId> {
        task.validate()?;
        self.check_targets(&task)?;

        let task_id = task.task_id;
        let mut state = self.shared.state.lock();
        if state.tasks.contains_key(&task_id) {
            return Err(CoreError::already_exists("task", task_id.to_string()));
        }
        tracing::info!(
            task_id = %task_id,
            task = %task.name,
            schedule = %task.schedule,
            origin = task.origin.as_str(),
            "Task registered"
        );
        state.tasks.insert(task_id, TaskEntry::new(task, now));
        Ok(task_id)
    }

    /// Replace a task definition and recompute its next due time.
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidState` while the task is running
    /// - `CoreError::NotFound` if the task or a target does not exist
    pub fn update(&self, task: SyncTask, now: DateTime<Utc>) -> CoreResult<()> {
        task.validate()?;
        self.check_targets(&task)?;

        let mut state = self.shared.state.lock();
        let entry = state.entry_mut(task.task_id)?;
        if entry.status == TaskStatus::Running {
            return Err(CoreError::invalid_state(format!(
                "task `{}` cannot be updated while running",
                entry.task.name
            )));
        }
        entry.next_due = task.schedule.first_due(now);
        entry.task = task;
        Ok(())
    }

    /// Remove a task and its manifests.
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidState` while the task is running
    /// - `CoreError::NotFound` if the task does not exist
    pub fn remove(&self, task_id: TaskId) -> CoreResult<SyncTask> {
        let mut state = self.shared.state.lock();
        let entry = state.entry_mut(task_id)?;
        if entry.status == TaskStatus::Running {
            return Err(CoreError::invalid_state(format!(
                "task `{}` cannot be removed while running",
                entry.task.name
            )));
        }
        let removed = state
            .tasks
            .remove(&task_id)
            .ok_or_else(|| CoreError::not_found("task", task_id.to_string()))?;
        drop(state);

        self.shared.manifests.remove_task(task_id);
        tracing::info!(task_id = %task_id, "Task removed");
        Ok(removed.task)
    }

    /// Queue due tasks and admit as many queued tasks as allowed.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let candidates = {
            let mut state = self.shared.state.lock();
            let mut newly_queued = Vec::new();
            for (task_id, entry) in &mut state.tasks {
                let due = entry.next_due.is_some_and(|due| due <= now);
                if due && !entry.status.is_active() {
                    entry.status = TaskStatus::Queued;
                    entry.queued_at = Some(now);
                    newly_queued.push(*task_id);
                }
            }
            report.queued = newly_queued.len();
            for task_id in newly_queued {
                self.shared.emit_status(task_id, None, TaskStatus::Queued);
            }

            let mut queued: Vec<(bool, DateTime<Utc>, TaskId)> = state
                .tasks
                .iter()
                .filter(|(_, entry)| entry.status == TaskStatus::Queued)
                .map(|(task_id, entry)| {
                    let due = entry.next_due.or(entry.queued_at).unwrap_or(now);
                    (!entry.forced, due, *task_id)
                })
                .collect();
            queued.sort();
            queued
        };

        for (_, _, task_id) in candidates {
            match self.shared.try_admit(task_id, now) {
                Ok(Admission::Admitted { job_id }) => report.admitted.push(job_id),
                Ok(Admission::Deferred { reason }) => {
                    tracing::debug!(task_id = %task_id, reason = ?reason, "Task stays queued");
                    report.deferred += 1;
                }
                Err(_) => report.failed += 1,
            }
        }

        QUEUED_TASKS.set(self.shared.state.lock().queued_count() as i64);
        self.shared.history.cleanup_expired(now);
        report
    }

    /// Queue a task immediately, ahead of scheduled ones, and try to admit it.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the task does not exist
    /// - any fatal admission error (the task is then `Failed`)
    pub fn run_now(&self, task_id: TaskId, now: DateTime<Utc>) -> CoreResult<Admission> {
        {
            let mut state = self.shared.state.lock();
            let entry = state.entry_mut(task_id)?;
            if entry.status == TaskStatus::Running {
                return Ok(Admission::Deferred {
                    reason: DeferReason::AlreadyRunning,
                });
            }
            entry.status = TaskStatus::Queued;
            entry.forced = true;
            entry.queued_at = Some(now);
        }
        self.shared.emit_status(task_id, None, TaskStatus::Queued);
        self.shared.try_admit(task_id, now)
    }

    /// Cancel a queued or running task.
    ///
    /// A running job stops admitting items; in-flight items finish. Returns
    /// whether anything was cancelled.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the task does not exist.
    pub fn cancel(&self, task_id: TaskId, now: DateTime<Utc>) -> CoreResult<bool> {
        let mut state = self.shared.state.lock();
        if let Some(running) = state.running.get(&task_id) {
            running.cancel.store(true, Ordering::SeqCst);
            tracing::info!(task_id = %task_id, job_id = %running.job_id, "Cancelling running job");
            return Ok(true);
        }

        let entry = state.entry_mut(task_id)?;
        if entry.status != TaskStatus::Queued {
            return Ok(false);
        }
        entry.status = TaskStatus::Cancelled;
        entry.forced = false;
        entry.queued_at = None;
        entry.next_due = entry.task.schedule.next_after(now);
        if entry.task.schedule.is_one_shot() {
            state.retire(task_id);
        }
        drop(state);

        tracing::info!(task_id = %task_id, "Queued task cancelled");
        self.shared.emit_status(task_id, None, TaskStatus::Cancelled);
        self.shared.completed.notify_waiters();
        Ok(true)
    }

    /// Register a one-shot task over the failed sync items of a recorded job.
    ///
    /// Failed deletes are not carried over; they stay in the original task's
    /// manifest and are planned again on its next run.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the job is not in the history
    /// - `CoreError::InvalidState` if the job has no failed sync items
    pub fn retry_failed(&self, job_id: JobId, now: DateTime<Utc>) -> CoreResult<TaskId> {
        let entry = self
            .shared
            .history
            .get(job_id)
            .ok_or_else(|| CoreError::not_found("job", job_id.to_string()))?;

        let failed: Vec<_> = entry
            .outcome
            .failed_items()
            .into_iter()
            .filter(|report| report.item.operation == ItemOperation::Sync)
            .map(|report| (report.item.asset_id, report.item.target_id))
            .collect();
        if failed.is_empty() {
            return Err(CoreError::invalid_state(format!(
                "job {job_id} has no failed items to retry"
            )));
        }

        let assets: BTreeSet<_> = failed.iter().map(|(asset_id, _)| *asset_id).collect();
        let targets: BTreeSet<_> = failed.iter().map(|(_, target_id)| *target_id).collect();
        let original = entry.task;
        let task = SyncTask::new(
            format!("retry of {}", original.name),
            SourceScope::Assets(assets),
            targets.into_iter().collect(),
            original.direction,
        )
        .with_mode(SyncMode::Full)
        .with_schedule(Schedule::Once)
        .with_bandwidth(original.bandwidth)
        .with_conflict_policy(original.conflict_policy)
        .with_post_transfer(original.post_transfer)
        .with_origin(TaskOrigin::Retry);

        let task_id = self.register(task, now)?;
        tracing::info!(job_id = %job_id, task_id = %task_id, items = failed.len(), "Retry task created");
        Ok(task_id)
    }

    /// Wait until the task is neither queued nor running.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the task does not exist.
    pub async fn wait_for_completion(&self, task_id: TaskId) -> CoreResult<TaskStatus> {
        loop {
            let notified = self.shared.completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.status(task_id)?;
            if !status.is_active() {
                return Ok(status);
            }
            notified.await;
        }
    }

    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the task does not exist.
    pub fn status(&self, task_id: TaskId) -> CoreResult<TaskStatus> {
        Ok(self.shared.state.lock().entry(task_id)?.status)
    }

    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the task does not exist.
    pub fn get(&self, task_id: TaskId) -> CoreResult<TaskState> {
        Ok(self.shared.state.lock().entry(task_id)?.state())
    }

    /// Registered tasks (finished one-shots excluded), by name.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskState> {
        let state = self.shared.state.lock();
        let mut tasks: Vec<TaskState> = state.tasks.values().map(TaskEntry::state).collect();
        tasks.sort_by(|a, b| a.task.name.cmp(&b.task.name));
        tasks
    }

    /// Registered tasks that use `target_id`.
    #[must_use]
    pub fn tasks_referencing(&self, target_id: TargetId) -> Vec<TaskId> {
        self.shared
            .state
            .lock()
            .tasks
            .values()
            .filter(|entry| entry.task.targets.contains(&target_id))
            .map(|entry| entry.task.task_id)
            .collect()
    }

    #[must_use]
    pub fn last_outcome(&self, task_id: TaskId) -> Option<JobOutcome> {
        self.shared
            .state
            .lock()
            .entry(task_id)
            .ok()
            .and_then(|entry| entry.last_outcome.clone())
    }

    /// Running tasks with their job ids.
    #[must_use]
    pub fn running_jobs(&self) -> Vec<(TaskId, JobId)> {
        self.shared
            .state
            .lock()
            .running
            .iter()
            .map(|(task_id, running)| (*task_id, running.job_id))
            .collect()
    }

    #[must_use]
    pub fn history(&self) -> &JobHistory {
        &self.shared.history
    }

    #[must_use]
    pub fn manifests(&self) -> &ManifestStore {
        &self.shared.manifests
    }

    /// Start the periodic tick loop
    pub fn start_worker(&mut self) {
        if self.worker.is_some() {
            tracing::warn!("Scheduler worker already running");
            return;
        }

        let scheduler = self.clone_for_worker();
        let interval = self.shared.config.tick_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let report = scheduler.tick(Utc::now());
                if !report.admitted.is_empty() || report.failed > 0 {
                    tracing::debug!(
                        admitted = report.admitted.len(),
                        deferred = report.deferred,
                        failed = report.failed,
                        "Scheduler tick"
                    );
                }
            }
        });

        self.worker = Some(handle);
        tracing::info!("Scheduler worker started (interval: {:?})", interval);
    }

    /// Stop the tick loop and stop running jobs from admitting more items
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            handle.abort();
            tracing::info!("Scheduler worker shut down");
        }
        for running in self.shared.state.lock().running.values() {
            running.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Clone for worker (without JoinHandle)
    pub(crate) fn clone_for_worker(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            worker: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{sha256_hex, MockCloudAdapter, MockFailure};
    use crate::policy_store::PolicyStore;
    use bytes::Bytes;
    use chrono::Duration;
    use tiersync_core::{
        AdapterKind, Asset, CollectionId, Direction, ExecutorConfig, Presence, StorageTarget,
        TierPolicy,
    };

    struct Fixture {
        ledger: Arc<AssetLedger>,
        local: MockCloudAdapter,
        remote: MockCloudAdapter,
        registry: Arc<AdapterRegistry>,
        target: TargetId,
        signals: SignalHub,
        scheduler: SyncScheduler,
    }

    fn fixture(max_concurrent_tasks: usize) -> Fixture {
        let signals = SignalHub::default();
        let ledger = Arc::new(AssetLedger::new(signals.clone()));
        let local = MockCloudAdapter::new();
        let remote = MockCloudAdapter::new();
        let registry = Arc::new(AdapterRegistry::new());
        let target = StorageTarget::new("oss", AdapterKind::ObjectStorage, "https://oss.example.com");
        let target_id = target.target_id;
        registry.add_target(target).unwrap();
        registry.register_instance(target_id, Arc::new(remote.clone()));

        let bandwidth = Arc::new(BandwidthManager::new());
        let policies = Arc::new(PolicyStore::new(TierPolicy::default()).unwrap());
        let executor = TransferExecutor::new(
            Arc::clone(&ledger),
            policies,
            Arc::new(local.clone()),
            Arc::clone(&bandwidth),
            signals.clone(),
            ExecutorConfig::default(),
        );
        let config = SchedulerConfig {
            max_concurrent_tasks,
            ..SchedulerConfig::default()
        };
        let scheduler = SyncScheduler::new(
            config,
            Arc::clone(&ledger),
            Arc::clone(&registry),
            bandwidth,
            executor,
            signals.clone(),
        );

        Fixture {
            ledger,
            local,
            remote,
            registry,
            target: target_id,
            signals,
            scheduler,
        }
    }

    impl Fixture {
        async fn ingest(&self, collection: CollectionId, key: &str) -> Asset {
            let data = Bytes::from(format!("content of {key}"));
            let checksum = sha256_hex(&data);
            let meta = self.local.put(key, data, &checksum).await.unwrap();
            self.ledger
                .insert(Asset::new(collection, key, meta.size_bytes, checksum, meta.modified_at))
                .unwrap()
        }

        fn push(&self, collection: CollectionId) -> SyncTask {
            SyncTask::new(
                "push",
                SourceScope::Collection(collection),
                vec![self.target],
                Direction::Push,
            )
        }
    }

    #[tokio::test]
    async fn test_register_rejects_unknown_target() {
        let f = fixture(4);
        let task = SyncTask::new(
            "orphan",
            SourceScope::Collection(CollectionId::new()),
            vec![TargetId::new()],
            Direction::Push,
        );
        assert!(matches!(
            f.scheduler.register(task, Utc::now()),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_once_task_runs_and_retires() {
        let f = fixture(4);
        let collection = CollectionId::new();
        f.ingest(collection, "promo/a.mov").await;
        let task_id = f
            .scheduler
            .register(f.push(collection).with_schedule(Schedule::Once), Utc::now())
            .unwrap();

        let report = f.scheduler.tick(Utc::now());
        assert_eq!(report.queued, 1);
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(f.scheduler.status(task_id).unwrap(), TaskStatus::Running);

        let status = f.scheduler.wait_for_completion(task_id).await.unwrap();
        assert_eq!(status, TaskStatus::Succeeded);
        assert!(f.remote.contains_key("promo/a.mov"));
        assert!(f.scheduler.tasks().is_empty());
        assert_eq!(
            f.scheduler.last_outcome(task_id).unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_manual_task_is_never_due() {
        let f = fixture(4);
        let task_id = f
            .scheduler
            .register(f.push(CollectionId::new()), Utc::now())
            .unwrap();

        let report = f.scheduler.tick(Utc::now() + Duration::days(365));
        assert_eq!(report, TickReport::default());
        assert_eq!(f.scheduler.status(task_id).unwrap(), TaskStatus::Idle);
    }

    #[tokio::test]
    async fn test_capacity_defers_admission() {
        let f = fixture(1);
        let first = f.scheduler.register(f.push(CollectionId::new()), Utc::now()).unwrap();
        let second = f.scheduler.register(f.push(CollectionId::new()), Utc::now()).unwrap();

        assert!(matches!(
            f.scheduler.run_now(first, Utc::now()).unwrap(),
            Admission::Admitted { .. }
        ));
        assert_eq!(
            f.scheduler.run_now(second, Utc::now()).unwrap(),
            Admission::Deferred {
                reason: DeferReason::AtCapacity
            }
        );
        assert_eq!(f.scheduler.status(second).unwrap(), TaskStatus::Queued);

        f.scheduler.wait_for_completion(first).await.unwrap();
        let report = f.scheduler.tick(Utc::now());
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(
            f.scheduler.wait_for_completion(second).await.unwrap(),
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_overlapping_scope_is_deferred() {
        let f = fixture(4);
        let collection = CollectionId::new();
        let asset = f.ingest(collection, "promo/a.mov").await;
        let by_collection = f.scheduler.register(f.push(collection), Utc::now()).unwrap();
        let by_asset = f
            .scheduler
            .register(
                SyncTask::new(
                    "single",
                    SourceScope::asset(asset.asset_id),
                    vec![f.target],
                    Direction::Push,
                ),
                Utc::now(),
            )
            .unwrap();

        f.scheduler.run_now(by_collection, Utc::now()).unwrap();
        assert_eq!(
            f.scheduler.run_now(by_asset, Utc::now()).unwrap(),
            Admission::Deferred {
                reason: DeferReason::ScopeBusy {
                    running: by_collection
                }
            }
        );
        let running_task = f.scheduler.get(by_collection).unwrap().task;
        assert!(matches!(
            f.scheduler.update(running_task, Utc::now()),
            Err(CoreError::InvalidState { .. })
        ));
        assert!(matches!(
            f.scheduler.remove(by_collection),
            Err(CoreError::InvalidState { .. })
        ));

        f.scheduler.wait_for_completion(by_collection).await.unwrap();
        f.scheduler.tick(Utc::now());
        assert_eq!(
            f.scheduler.wait_for_completion(by_asset).await.unwrap(),
            TaskStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_missing_adapter_fails_admission() {
        let f = fixture(4);
        let share = StorageTarget::new("dav", AdapterKind::WebDav, "https://dav.example.com");
        let share_id = share.target_id;
        f.registry.add_target(share).unwrap();
        let collection = CollectionId::new();
        f.ingest(collection, "promo/a.mov").await;

        let task = SyncTask::new(
            "dav",
            SourceScope::Collection(collection),
            vec![share_id],
            Direction::Push,
        );
        let task_id = f.scheduler.register(task, Utc::now()).unwrap();

        let result = f.scheduler.run_now(task_id, Utc::now());
        assert!(matches!(result, Err(CoreError::AdapterMissing { .. })));
        assert_eq!(f.scheduler.status(task_id).unwrap(), TaskStatus::Failed);
        assert!(f.scheduler.running_jobs().is_empty());
        assert_eq!(f.remote.storage_size(), 0);
    }

    #[tokio::test]
    async fn test_interval_task_reschedules() {
        let f = fixture(4);
        let now = Utc::now();
        let task_id = f
            .scheduler
            .register(
                f.push(CollectionId::new()).with_schedule(Schedule::parse("every 1h").unwrap()),
                now,
            )
            .unwrap();
        assert_eq!(f.scheduler.tick(now).admitted.len(), 0);

        let later = now + Duration::hours(1);
        assert_eq!(f.scheduler.tick(later).admitted.len(), 1);
        f.scheduler.wait_for_completion(task_id).await.unwrap();

        let state = f.scheduler.get(task_id).unwrap();
        assert_eq!(state.next_due, Some(later + Duration::hours(1)));
        assert_eq!(state.last_result, Some(JobStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let f = fixture(1);
        let first = f.scheduler.register(f.push(CollectionId::new()), Utc::now()).unwrap();
        let second = f.scheduler.register(f.push(CollectionId::new()), Utc::now()).unwrap();
        f.scheduler.run_now(first, Utc::now()).unwrap();
        f.scheduler.run_now(second, Utc::now()).unwrap();

        assert!(f.scheduler.cancel(second, Utc::now()).unwrap());
        assert_eq!(f.scheduler.status(second).unwrap(), TaskStatus::Cancelled);
        assert!(!f.scheduler.cancel(second, Utc::now()).unwrap());
    }

    #[tokio::test]
    async fn test_retry_failed_items() {
        let f = fixture(4);
        let collection = CollectionId::new();
        let asset = f.ingest(collection, "promo/a.mov").await;
        f.remote.push_failures([MockFailure::Auth("403 Forbidden")]);
        let mut rx = f.signals.subscribe();

        let task_id = f.scheduler.register(f.push(collection), Utc::now()).unwrap();
        let Admission::Admitted { job_id } = f.scheduler.run_now(task_id, Utc::now()).unwrap() else {
            panic!("task should be admitted");
        };
        assert_eq!(
            f.scheduler.wait_for_completion(task_id).await.unwrap(),
            TaskStatus::PartiallyFailed
        );
        assert_eq!(f.scheduler.history().failed_items(job_id).unwrap().len(), 1);

        let retry_id = f.scheduler.retry_failed(job_id, Utc::now()).unwrap();
        let retry = f.scheduler.get(retry_id).unwrap();
        assert_eq!(retry.task.origin, TaskOrigin::Retry);
        assert_eq!(retry.task.scope, SourceScope::asset(asset.asset_id));

        f.scheduler.tick(Utc::now());
        assert_eq!(
            f.scheduler.wait_for_completion(retry_id).await.unwrap(),
            TaskStatus::Succeeded
        );
        assert_eq!(
            f.ledger.get(asset.asset_id).unwrap().presence,
            Presence::LocalAndCloud
        );

        let mut statuses = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            if let Signal::TaskStatusChanged { task_id: id, status, .. } = signal {
                if id == task_id {
                    statuses.push(status);
                }
            }
        }
        assert_eq!(
            statuses,
            vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::PartiallyFailed]
        );
    }

    #[tokio::test]
    async fn test_completion_uses_supplied_clock() {
        let f = fixture(4);
        let registered_at = DateTime::parse_from_rfc3339("2024-06-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let finished_at = registered_at + Duration::minutes(42);
        let task = f
            .push(CollectionId::new())
            .with_schedule(Schedule::Interval(std::time::Duration::from_secs(3600)));
        let task_id = f.scheduler.register(task, registered_at).unwrap();

        let outcome = JobOutcome {
            job_id: JobId::new(),
            task_id,
            status: JobStatus::PartiallyFailed,
            items: Vec::new(),
            started_at: registered_at,
            finished_at,
        };
        let job_id = outcome.job_id;
        f.scheduler.shared.complete(task_id, outcome, finished_at);

        let state = f.scheduler.get(task_id).unwrap();
        assert_eq!(state.status, TaskStatus::PartiallyFailed);
        assert_eq!(state.next_due, Some(finished_at + Duration::hours(1)));
        let recorded = f.scheduler.history().get(job_id).unwrap();
        assert_eq!(recorded.recorded_at, finished_at);
    }
}
