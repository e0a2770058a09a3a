use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::asset::Tier;
use crate::error::{CoreError, CoreResult};
use crate::ids::TargetId;

/// Days per month used when a policy is expressed in months.
pub const DAYS_PER_MONTH: i64 = 30;

/// Per-collection tiering thresholds and local-retention flags.
///
/// Both thresholds are measured against the age since last access, so
/// `warm_to_cold_days` must not be shorter than `hot_to_warm_days`.
///
/// # Example
///
/// ```
/// use tiersync_core::TierPolicy;
///
/// let policy = TierPolicy::default();
/// assert_eq!(policy.hot_to_warm_days, 7);
/// assert_eq!(policy.warm_to_cold_days, 90);
/// assert!(!policy.keep_local_cold);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Days without access before demoting hot → warm (default: 7)
    pub hot_to_warm_days: i64,

    /// Days without access before demoting warm → cold (default: 90)
    pub warm_to_cold_days: i64,

    /// Keep a local copy while hot (default: true)
    pub keep_local_hot: bool,

    /// Keep a local copy while warm (default: true)
    pub keep_local_warm: bool,

    /// Keep a local copy while cold (default: false)
    pub keep_local_cold: bool,

    /// Target for synthetic uploads; falls back to the store default.
    #[serde(default)]
    pub archive_target: Option<TargetId>,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            hot_to_warm_days: 7,
            warm_to_cold_days: 3 * DAYS_PER_MONTH,
            keep_local_hot: true,
            keep_local_warm: true,
            keep_local_cold: false,
            archive_target: None,
        }
    }
}

impl TierPolicy {
    /// Creates a policy from day thresholds with default retention flags.
    #[must_use]
    pub fn new(hot_to_warm_days: i64, warm_to_cold_days: i64) -> Self {
        Self {
            hot_to_warm_days,
            warm_to_cold_days,
            ..Self::default()
        }
    }

    /// Sets the warm → cold threshold from a month count.
    #[must_use]
    pub fn with_warm_to_cold_months(mut self, months: i64) -> Self {
        self.warm_to_cold_days = months.saturating_mul(DAYS_PER_MONTH);
        self
    }

    /// Sets the keep-local-cold flag.
    #[must_use]
    pub fn with_keep_local_cold(mut self, keep: bool) -> Self {
        self.keep_local_cold = keep;
        self
    }

    /// Sets the archive target for synthetic uploads.
    #[must_use]
    pub fn with_archive_target(mut self, target_id: TargetId) -> Self {
        self.archive_target = Some(target_id);
        self
    }

    /// Validate policy thresholds
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` for negative thresholds or a
    /// warm → cold threshold shorter than hot → warm.
    pub fn validate(&self) -> CoreResult<()> {
        if self.hot_to_warm_days < 0 {
            return Err(CoreError::validation("hot_to_warm_days must be >= 0"));
        }
        if self.warm_to_cold_days < 0 {
            return Err(CoreError::validation("warm_to_cold_days must be >= 0"));
        }
        if self.warm_to_cold_days < self.hot_to_warm_days {
            return Err(CoreError::validation(
                "warm_to_cold_days must be >= hot_to_warm_days",
            ));
        }
        Ok(())
    }

    /// Idle age at which an asset in `tier` is demoted, `None` for cold.
    #[must_use]
    pub fn demotion_age(&self, tier: Tier) -> Option<Duration> {
        match tier {
            Tier::Hot => Some(Duration::days(self.hot_to_warm_days)),
            Tier::Warm => Some(Duration::days(self.warm_to_cold_days)),
            Tier::Cold => None,
        }
    }

    /// Whether the local copy is retained while in `tier`.
    #[must_use]
    pub fn keeps_local(&self, tier: Tier) -> bool {
        match tier {
            Tier::Hot => self.keep_local_hot,
            Tier::Warm => self.keep_local_warm,
            Tier::Cold => self.keep_local_cold,
        }
    }
}
