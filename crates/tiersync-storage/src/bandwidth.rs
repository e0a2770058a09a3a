//! Token-bucket bandwidth sharing per (target, direction).
//!
//! A bucket's rate is the smallest ceiling among the jobs registered on it
//! (and the target's configured default), so concurrent jobs against one
//! target are throttled jointly and no job's ceiling is exceeded. Buckets
//! hold at most one second of tokens.
//!
//! Acquisition reserves tokens up front and sleeps off any deficit, so
//! concurrent callers are served in arrival order without holding the lock
//! across the wait.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tiersync_core::metrics::BANDWIDTH_RATE;
use tiersync_core::{BandwidthLimit, JobId, TargetId};
use tokio::time::{Duration, Instant};

/// Direction of bytes relative to the local archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Bucket {
    /// Available tokens; negative while callers sleep off a reservation.
    tokens: f64,
    last_refill: Instant,
    /// Bytes per second, `None` when unlimited.
    rate: Option<f64>,
    default_ceiling: Option<u64>,
    registrations: HashMap<JobId, Option<u64>>,
    bytes_total: u64,
}

impl Bucket {
    fn new(default_ceiling: Option<u64>) -> Self {
        let mut bucket = Self {
            tokens: 0.0,
            last_refill: Instant::now(),
            rate: None,
            default_ceiling,
            registrations: HashMap::new(),
            bytes_total: 0,
        };
        bucket.recompute_rate();
        bucket.tokens = bucket.capacity();
        bucket
    }

    fn capacity(&self) -> f64 {
        self.rate.unwrap_or(0.0)
    }

    fn recompute_rate(&mut self) {
        let ceiling = self
            .registrations
            .values()
            .flatten()
            .copied()
            .chain(self.default_ceiling)
            .min();
        self.rate = ceiling.map(|c| c as f64);
        if let Some(rate) = self.rate {
            self.tokens = self.tokens.min(rate);
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        if let Some(rate) = self.rate {
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * rate).min(rate);
        }
        self.last_refill = now;
    }

    /// Reserve `bytes`; returns how long the caller must wait.
    fn reserve(&mut self, bytes: u64) -> Duration {
        self.bytes_total += bytes;
        self.refill();
        let Some(rate) = self.rate else {
            return Duration::ZERO;
        };

        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / rate)
        }
    }
}

/// Utilization of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub target_id: TargetId,
    pub direction: TransferDirection,
    /// Effective ceiling in bytes/sec, `None` when unlimited.
    pub rate_bytes_per_sec: Option<u64>,
    /// Tokens available now; negative while reservations are outstanding.
    pub available_bytes: f64,
    pub active_jobs: usize,
    pub bytes_total: u64,
}

/// Shared bandwidth buckets for every target.
pub struct BandwidthManager {
    buckets: Mutex<HashMap<(TargetId, TransferDirection), Bucket>>,
    defaults: HashMap<TargetId, u64>,
}

impl BandwidthManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_defaults(HashMap::new())
    }

    /// Manager applying a default ceiling to the listed targets.
    #[must_use]
    pub fn with_defaults(defaults: HashMap<TargetId, u64>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            defaults,
        }
    }

    /// Register a job's ceilings on every target it uses.
    pub fn register(&self, job_id: JobId, targets: &[TargetId], limit: BandwidthLimit) {
        let mut buckets = self.buckets.lock();
        for &target_id in targets {
            for (direction, ceiling) in [
                (TransferDirection::Upload, limit.upload_bytes_per_sec),
                (TransferDirection::Download, limit.download_bytes_per_sec),
            ] {
                let bucket = buckets
                    .entry((target_id, direction))
                    .or_insert_with(|| Bucket::new(self.defaults.get(&target_id).copied()));
                bucket.refill();
                bucket.registrations.insert(job_id, ceiling);
                bucket.recompute_rate();
                publish_rate(target_id, direction, bucket.rate);
            }
        }
    }

    /// Drop a finished job's registrations and relax the affected rates.
    pub fn release(&self, job_id: JobId) {
        let mut buckets = self.buckets.lock();
        for ((target_id, direction), bucket) in buckets.iter_mut() {
            if bucket.registrations.remove(&job_id).is_some() {
                bucket.refill();
                bucket.recompute_rate();
                publish_rate(*target_id, *direction, bucket.rate);
            }
        }
    }

    /// Wait until `bytes` may be transferred to or from `target_id`.
    pub async fn acquire(&self, target_id: TargetId, direction: TransferDirection, bytes: u64) {
        let wait = {
            let mut buckets = self.buckets.lock();
            let bucket = buckets
                .entry((target_id, direction))
                .or_insert_with(|| Bucket::new(self.defaults.get(&target_id).copied()));
            bucket.reserve(bytes)
        };

        if !wait.is_zero() {
            tracing::trace!(
                target_id = %target_id,
                direction = %direction,
                wait_ms = wait.as_millis() as u64,
                "Throttling transfer"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Current effective ceiling of one bucket.
    #[must_use]
    pub fn rate(&self, target_id: TargetId, direction: TransferDirection) -> Option<u64> {
        self.buckets
            .lock()
            .get(&(target_id, direction))
            .and_then(|bucket| bucket.rate)
            .map(|rate| rate as u64)
    }

    /// Utilization of every bucket.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BucketSnapshot> {
        let mut buckets = self.buckets.lock();
        let mut snapshots: Vec<BucketSnapshot> = buckets
            .iter_mut()
            .map(|(&(target_id, direction), bucket)| {
                bucket.refill();
                BucketSnapshot {
                    target_id,
                    direction,
                    rate_bytes_per_sec: bucket.rate.map(|rate| rate as u64),
                    available_bytes: bucket.tokens,
                    active_jobs: bucket.registrations.len(),
                    bytes_total: bucket.bytes_total,
                }
            })
            .collect();
        snapshots.sort_by_key(|s| (s.target_id, s.direction.as_str()));
        snapshots
    }
}

impl Default for BandwidthManager {
    fn default() -> Self {
        Self::new()
    }
}

fn publish_rate(target_id: TargetId, direction: TransferDirection, rate: Option<f64>) {
    BANDWIDTH_RATE
        .with_label_values(&[&target_id.to_string(), direction.as_str()])
        .set(rate.map_or(0, |rate| rate as i64));
}
