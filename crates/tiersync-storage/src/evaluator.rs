use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tiersync_core::metrics::{LEDGER_CONFLICTS, SWEEPS, TIERING_INTENTS};
use tiersync_core::{
    Asset, AssetId, CollectionId, CoreError, CoreResult, Presence, Tier, TierPolicy,
};

use crate::ledger::{AssetLedger, DEFAULT_CAS_ATTEMPTS};
use crate::policy_store::{PolicySnapshot, PolicyStore};
use crate::signals::{Signal, SignalHub};

/// Tier or presence change decided for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionIntent {
    /// Move one tier colder. Applied by the sweep itself.
    Demote {
        asset_id: AssetId,
        observed_version: u64,
        from: Tier,
        to: Tier,
    },
    /// Drop the local copy; a verified cloud copy of the content exists.
    EvictLocal {
        asset_id: AssetId,
        collection_id: CollectionId,
    },
    /// Upload the current content before the local copy may go.
    EnsureCloudCopy {
        asset_id: AssetId,
        collection_id: CollectionId,
    },
    /// Download the asset back into the local archive.
    RestoreLocal {
        asset_id: AssetId,
        collection_id: CollectionId,
    },
}

impl TransitionIntent {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Demote { .. } => "demote",
            Self::EvictLocal { .. } => "evict_local",
            Self::EnsureCloudCopy { .. } => "ensure_cloud_copy",
            Self::RestoreLocal { .. } => "restore_local",
        }
    }

    #[must_use]
    pub fn asset_id(&self) -> AssetId {
        match self {
            Self::Demote { asset_id, .. }
            | Self::EvictLocal { asset_id, .. }
            | Self::EnsureCloudCopy { asset_id, .. }
            | Self::RestoreLocal { asset_id, .. } => *asset_id,
        }
    }
}

/// Decide the transitions of one asset under `policy`.
///
/// Demotes at most one tier, with idle age compared using `>=`. A
/// demotion into a tier that drops local copies waits until a verified
/// cloud copy of the current content exists, so cold assets never end up
/// local-only. Never promotes.
#[must_use]
pub fn evaluate_asset(asset: &Asset, policy: &TierPolicy, now: DateTime<Utc>) -> Vec<TransitionIntent> {
    let mut intents = Vec::new();
    let mut landing = asset.tier;

    if let (Some(threshold), Some(colder)) = (policy.demotion_age(asset.tier), asset.tier.colder()) {
        let age = now - asset.last_access;
        if age >= threshold {
            let needs_upload = !policy.keeps_local(colder)
                && asset.presence.has_local()
                && !asset.has_verified_cloud_copy();
            if needs_upload {
                intents.push(TransitionIntent::EnsureCloudCopy {
                    asset_id: asset.asset_id,
                    collection_id: asset.collection_id,
                });
            } else {
                intents.push(TransitionIntent::Demote {
                    asset_id: asset.asset_id,
                    observed_version: asset.version,
                    from: asset.tier,
                    to: colder,
                });
                landing = colder;
            }
        }
    }

    let keeps_local = policy.keeps_local(landing);
    if !keeps_local && asset.presence.has_local() {
        let intent = if asset.has_verified_cloud_copy() {
            TransitionIntent::EvictLocal {
                asset_id: asset.asset_id,
                collection_id: asset.collection_id,
            }
        } else {
            TransitionIntent::EnsureCloudCopy {
                asset_id: asset.asset_id,
                collection_id: asset.collection_id,
            }
        };
        if !intents.contains(&intent) {
            intents.push(intent);
        }
    } else if keeps_local && asset.presence == Presence::CloudOnly {
        intents.push(TransitionIntent::RestoreLocal {
            asset_id: asset.asset_id,
            collection_id: asset.collection_id,
        });
    }

    intents
}

/// Evaluate every asset against a policy snapshot.
#[must_use]
pub fn evaluate_assets(
    assets: &[Asset],
    policies: &PolicySnapshot,
    now: DateTime<Utc>,
) -> Vec<TransitionIntent> {
    assets
        .iter()
        .flat_map(|asset| evaluate_asset(asset, policies.policy_for(asset.collection_id), now))
        .collect()
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub demoted: usize,
    /// Presence intents left for the orchestrator to act on.
    pub intents: Vec<TransitionIntent>,
}

/// Tiering evaluator
///
/// Sweeps the ledger against the policy store:
/// - Hot → Warm: idle for `hot_to_warm_days`
/// - Warm → Cold: idle for `warm_to_cold_days`, once a verified cloud copy
///   exists when cold assets are not kept locally
/// - Access and write events promote straight back to Hot
///
/// Demotions are written with compare-and-set against the version the sweep
/// observed; a concurrent writer makes the sweep re-read and re-evaluate.
pub struct TieringEvaluator {
    ledger: Arc<AssetLedger>,
    policies: Arc<PolicyStore>,
    signals: SignalHub,
    cas_max_attempts: u32,
    last_sweep: RwLock<Option<DateTime<Utc>>>,
}

impl TieringEvaluator {
    #[must_use]
    pub fn new(ledger: Arc<AssetLedger>, policies: Arc<PolicyStore>, signals: SignalHub) -> Self {
        Self {
            ledger,
            policies,
            signals,
            cas_max_attempts: DEFAULT_CAS_ATTEMPTS,
            last_sweep: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_cas_max_attempts(mut self, attempts: u32) -> Self {
        self.cas_max_attempts = attempts.max(1);
        self
    }

    /// Intents for the current ledger, without applying anything.
    #[must_use]
    pub fn evaluate(&self, now: DateTime<Utc>) -> Vec<TransitionIntent> {
        evaluate_assets(&self.ledger.snapshot(), &self.policies.snapshot(), now)
    }

    /// Run one sweep: apply demotions and return the presence intents.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        tracing::info!("Starting tiering sweep");
        let start = std::time::Instant::now();

        // Policy changes take effect on the next sweep, never mid-sweep
        let policies = self.policies.snapshot();
        let assets = self.ledger.snapshot();
        let mut report = SweepReport {
            evaluated: assets.len(),
            ..SweepReport::default()
        };

        for asset in assets {
            let (demoted, intents) = self.settle_asset(asset, &policies, now);
            if demoted {
                report.demoted += 1;
            }
            report.intents.extend(intents);
        }

        for intent in &report.intents {
            TIERING_INTENTS.with_label_values(&[intent.kind()]).inc();
        }
        SWEEPS.with_label_values(&["completed"]).inc();
        *self.last_sweep.write() = Some(now);

        self.signals.emit(Signal::SweepCompleted {
            at: now,
            evaluated: report.evaluated,
            demoted: report.demoted,
            intents: report.intents.len(),
        });
        tracing::info!(
            evaluated = report.evaluated,
            demoted = report.demoted,
            intents = report.intents.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Tiering sweep complete"
        );

        report
    }

    /// Evaluate one asset, applying its demotion with bounded CAS retries.
    fn settle_asset(
        &self,
        mut observed: Asset,
        policies: &PolicySnapshot,
        now: DateTime<Utc>,
    ) -> (bool, Vec<TransitionIntent>) {
        for _ in 0..self.cas_max_attempts {
            let mut intents = evaluate_asset(&observed, policies.policy_for(observed.collection_id), now);
            let demotion = intents.iter().position(|i| matches!(i, TransitionIntent::Demote { .. }));
            let Some(index) = demotion else {
                return (false, intents);
            };

            let TransitionIntent::Demote { asset_id, observed_version, from, to } = intents.remove(index)
            else {
                return (false, intents);
            };

            match self
                .ledger
                .compare_and_set(asset_id, observed_version, |asset| asset.tier = to)
            {
                Ok(_) => {
                    TIERING_INTENTS.with_label_values(&["demote"]).inc();
                    tracing::info!(
                        asset_id = %asset_id,
                        from = %from,
                        to = %to,
                        "Asset demoted"
                    );
                    return (true, intents);
                }
                Err(err) if err.is_conflict() => {
                    LEDGER_CONFLICTS.with_label_values(&["evaluator"]).inc();
                    tracing::debug!(asset_id = %asset_id, "Stale observation, re-evaluating");
                    match self.ledger.get(asset_id) {
                        Ok(fresh) => observed = fresh,
                        // Removed by the catalog mid-sweep
                        Err(CoreError::NotFound { .. }) => return (false, Vec::new()),
                        Err(err) => {
                            tracing::error!(asset_id = %asset_id, error = %err, "Failed to re-read asset");
                            return (false, Vec::new());
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(asset_id = %asset_id, error = %err, "Failed to demote asset");
                    return (false, Vec::new());
                }
            }
        }

        tracing::warn!(
            asset_id = %observed.asset_id,
            attempts = self.cas_max_attempts,
            "Demotion abandoned after repeated conflicts"
        );
        (false, Vec::new())
    }

    /// Access event: promote to Hot now.
    ///
    /// Returns a `RestoreLocal` intent when the asset has no local copy.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the asset does not exist, or the
    /// ledger conflict if every write attempt lost the race.
    pub fn record_access(
        &self,
        asset_id: AssetId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<TransitionIntent>> {
        let asset = self.ledger.update(asset_id, "access", |asset| {
            asset.tier = Tier::Hot;
            asset.last_access = now;
            Ok(())
        })?;
        tracing::debug!(asset_id = %asset_id, "Access recorded, asset promoted to hot");
        Ok(restore_intent(&asset))
    }

    /// Local write event: record the new content and promote to Hot.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the asset does not exist, or the
    /// ledger conflict if every write attempt lost the race.
    pub fn record_write(
        &self,
        asset_id: AssetId,
        size_bytes: u64,
        checksum: &str,
        modified_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<TransitionIntent>> {
        let asset = self.ledger.update(asset_id, "write", |asset| {
            asset.size_bytes = size_bytes;
            asset.checksum = checksum.to_string();
            asset.modified_at = modified_at;
            asset.presence = asset.presence.with_local();
            asset.tier = Tier::Hot;
            asset.last_access = now;
            Ok(())
        })?;
        tracing::debug!(asset_id = %asset_id, "Write recorded, asset promoted to hot");
        Ok(restore_intent(&asset))
    }

    #[must_use]
    pub fn last_sweep(&self) -> Option<DateTime<Utc>> {
        *self.last_sweep.read()
    }
}

fn restore_intent(asset: &Asset) -> Option<TransitionIntent> {
    (!asset.presence.has_local()).then(|| TransitionIntent::RestoreLocal {
        asset_id: asset.asset_id,
        collection_id: asset.collection_id,
    })
}
