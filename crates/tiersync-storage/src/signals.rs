//! Operational signals broadcast to the catalog, dashboard and tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tiersync_core::{AssetId, ErrorClass, JobId, Presence, TargetId, TaskId, TaskStatus, Tier};
use tokio::sync::broadcast;

/// Default channel capacity; slow subscribers observe `Lagged` instead of
/// blocking producers.
pub const DEFAULT_SIGNAL_CAPACITY: usize = 1024;

/// Event emitted by the ledger, evaluator, scheduler or executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// A task moved between lifecycle states.
    TaskStatusChanged {
        task_id: TaskId,
        job_id: Option<JobId>,
        status: TaskStatus,
    },
    /// An item exhausted its attempts or failed permanently.
    ItemFailed {
        job_id: JobId,
        task_id: TaskId,
        asset_id: AssetId,
        target_id: TargetId,
        class: String,
        message: String,
    },
    /// A ledger write was accepted.
    AssetChanged {
        asset_id: AssetId,
        tier: Tier,
        presence: Presence,
        version: u64,
    },
    /// The catalog removed an asset from the ledger.
    AssetRemoved { asset_id: AssetId, key: String },
    /// A tiering sweep finished.
    SweepCompleted {
        at: DateTime<Utc>,
        evaluated: usize,
        demoted: usize,
        intents: usize,
    },
}

impl Signal {
    pub(crate) fn item_failed(
        job_id: JobId,
        task_id: TaskId,
        asset_id: AssetId,
        target_id: TargetId,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        Self::ItemFailed {
            job_id,
            task_id,
            asset_id,
            target_id,
            class: class.as_str().to_string(),
            message: message.into(),
        }
    }
}

/// Cloneable handle over a broadcast channel of [`Signal`]s.
#[derive(Debug, Clone)]
pub struct SignalHub {
    sender: broadcast::Sender<Signal>,
}

impl SignalHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to signals emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.sender.subscribe()
    }

    /// Emit a signal; dropped silently when nobody listens.
    pub fn emit(&self, signal: Signal) {
        let _ = self.sender.send(signal);
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNAL_CAPACITY)
    }
}
