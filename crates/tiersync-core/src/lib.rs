//! Core domain types for TierSync tiering and sync orchestration.

pub mod asset;
pub mod config;
pub mod error;
pub mod filter;
pub mod ids;
pub mod metrics;
pub mod policy;
pub mod schedule;
pub mod target;
pub mod task;

pub use asset::{Asset, Presence, Tier, VerifiedUpload};
pub use config::{
    BandwidthConfig, EvaluatorConfig, ExecutorConfig, RetryConfig, SchedulerConfig, StateConfig,
    TiersyncConfig,
};
pub use error::{classify_io_error, CoreError, CoreResult, ErrorClass};
pub use filter::FilterRule;
pub use ids::{AssetId, CollectionId, JobId, TargetId, TaskId};
pub use policy::{TierPolicy, DAYS_PER_MONTH};
pub use schedule::{CronExpr, Schedule};
pub use target::{AdapterKind, StorageTarget};
pub use task::{
    BandwidthLimit, ConflictPolicy, Direction, PostTransfer, SourceScope, SyncMode, SyncTask,
    TaskOrigin, TaskStatus,
};
