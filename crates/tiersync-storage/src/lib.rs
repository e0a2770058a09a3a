pub mod adapter;
pub mod bandwidth;
pub mod evaluator;
pub mod executor;
pub mod history;
pub mod job;
pub mod ledger;
pub mod manifest;
pub mod orchestrator;
pub mod policy_store;
pub mod scheduler;
pub mod signals;
pub mod state;

pub use adapter::{
    sha256_hex, AdapterFactory, AdapterRegistry, CloudAdapter, LocalFsAdapter, LocalFsFactory,
    MockCloudAdapter, MockFailure, ObjectMeta,
};
pub use bandwidth::{BandwidthManager, BucketSnapshot, TransferDirection};
pub use evaluator::{evaluate_asset, evaluate_assets, SweepReport, TieringEvaluator, TransitionIntent};
pub use executor::{decide, JobContext, SyncAction, TransferExecutor};
pub use history::{HistoryConfig, HistoryEntry, HistoryMetrics, JobHistory};
pub use job::{
    plan_job, ItemOperation, ItemReport, ItemResult, JobItem, JobOutcome, JobStatus, TransferJob,
};
pub use ledger::{AssetLedger, DEFAULT_CAS_ATTEMPTS};
pub use manifest::{Manifest, ManifestEntry, ManifestRecord, ManifestStore};
pub use orchestrator::{Orchestrator, SweepOutcome};
pub use policy_store::{PolicySnapshot, PolicyStore};
pub use scheduler::{Admission, DeferReason, SyncScheduler, TaskState, TickReport};
pub use signals::{Signal, SignalHub, DEFAULT_SIGNAL_CAPACITY};
pub use state::{StateReport, StateStore};
