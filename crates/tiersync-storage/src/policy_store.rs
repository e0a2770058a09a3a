//! Per-collection tiering policies.

use std::collections::HashMap;

use parking_lot::RwLock;
use tiersync_core::{CollectionId, CoreResult, TargetId, TierPolicy};

/// Immutable view of every policy, taken once per sweep.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    default_policy: TierPolicy,
    policies: HashMap<CollectionId, TierPolicy>,
}

impl PolicySnapshot {
    /// Policy in force for a collection.
    #[must_use]
    pub fn policy_for(&self, collection_id: CollectionId) -> &TierPolicy {
        self.policies
            .get(&collection_id)
            .unwrap_or(&self.default_policy)
    }
}

/// Policy store keyed by collection, with a fallback policy.
pub struct PolicyStore {
    default_policy: RwLock<TierPolicy>,
    policies: RwLock<HashMap<CollectionId, TierPolicy>>,
}

impl PolicyStore {
    /// Create a store whose fallback is `default_policy`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` if the fallback is invalid.
    pub fn new(default_policy: TierPolicy) -> CoreResult<Self> {
        default_policy.validate()?;
        Ok(Self {
            default_policy: RwLock::new(default_policy),
            policies: RwLock::new(HashMap::new()),
        })
    }

    /// Set the policy of one collection. Takes effect on the next sweep.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` if the policy is invalid.
    pub fn set_policy(&self, collection_id: CollectionId, policy: TierPolicy) -> CoreResult<()> {
        policy.validate()?;
        tracing::info!(
            collection_id = %collection_id,
            hot_to_warm_days = policy.hot_to_warm_days,
            warm_to_cold_days = policy.warm_to_cold_days,
            "Tier policy updated"
        );
        self.policies.write().insert(collection_id, policy);
        Ok(())
    }

    /// Replace the fallback policy.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` if the policy is invalid.
    pub fn set_default_policy(&self, policy: TierPolicy) -> CoreResult<()> {
        policy.validate()?;
        *self.default_policy.write() = policy;
        Ok(())
    }

    /// Drop a collection override; the collection falls back to the default.
    pub fn remove_policy(&self, collection_id: CollectionId) -> Option<TierPolicy> {
        self.policies.write().remove(&collection_id)
    }

    /// Policy in force for a collection.
    #[must_use]
    pub fn policy_for(&self, collection_id: CollectionId) -> TierPolicy {
        self.policies
            .read()
            .get(&collection_id)
            .cloned()
            .unwrap_or_else(|| self.default_policy.read().clone())
    }

    #[must_use]
    pub fn snapshot(&self) -> PolicySnapshot {
        PolicySnapshot {
            default_policy: self.default_policy.read().clone(),
            policies: self.policies.read().clone(),
        }
    }

    /// Whether any policy names `target_id` as its archive target.
    #[must_use]
    pub fn references_target(&self, target_id: TargetId) -> bool {
        self.default_policy.read().archive_target == Some(target_id)
            || self
                .policies
                .read()
                .values()
                .any(|policy| policy.archive_target == Some(target_id))
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self {
            default_policy: RwLock::new(TierPolicy::default()),
            policies: RwLock::new(HashMap::new()),
        }
    }
}
