//! Asset ledger: authoritative tier/presence record with compare-and-set writes.
//!
//! Every accepted write bumps the asset version, checks the presence
//! invariants and emits [`Signal::AssetChanged`]. Concurrent writers use
//! [`AssetLedger::compare_and_set`] with the version they read, or
//! [`AssetLedger::update`] which retries the read-modify-write loop.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tiersync_core::metrics::LEDGER_CONFLICTS;
use tiersync_core::{Asset, AssetId, CollectionId, CoreError, CoreResult, Presence};

use crate::signals::{Signal, SignalHub};

/// Default number of read-modify-write attempts in [`AssetLedger::update`].
pub const DEFAULT_CAS_ATTEMPTS: u32 = 5;

/// In-memory asset ledger.
pub struct AssetLedger {
    assets: RwLock<HashMap<AssetId, Asset>>,
    signals: SignalHub,
    max_attempts: u32,
}

impl AssetLedger {
    #[must_use]
    pub fn new(signals: SignalHub) -> Self {
        Self::with_max_attempts(signals, DEFAULT_CAS_ATTEMPTS)
    }

    #[must_use]
    pub fn with_max_attempts(signals: SignalHub, max_attempts: u32) -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
            signals,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Ingest an asset from the catalog.
    ///
    /// # Errors
    ///
    /// - `CoreError::AlreadyExists` if the id or key is already present
    /// - `CoreError::InvalidState` if the asset violates presence invariants
    pub fn insert(&self, asset: Asset) -> CoreResult<Asset> {
        check_invariants(None, &asset)?;

        let mut assets = self.assets.write();
        if assets.contains_key(&asset.asset_id) {
            return Err(CoreError::already_exists(
                "asset",
                asset.asset_id.to_string(),
            ));
        }
        if assets.values().any(|existing| existing.key == asset.key) {
            return Err(CoreError::already_exists("asset key", asset.key.clone()));
        }
        assets.insert(asset.asset_id, asset.clone());
        drop(assets);

        tracing::debug!(asset_id = %asset.asset_id, key = %asset.key, "Asset ingested");
        self.emit_changed(&asset);
        Ok(asset)
    }

    /// Remove an asset on behalf of the catalog.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the asset does not exist.
    pub fn remove(&self, asset_id: AssetId) -> CoreResult<Asset> {
        let removed = self
            .assets
            .write()
            .remove(&asset_id)
            .ok_or_else(|| CoreError::not_found("asset", asset_id.to_string()))?;

        tracing::debug!(asset_id = %asset_id, key = %removed.key, "Asset removed");
        self.signals.emit(Signal::AssetRemoved {
            asset_id,
            key: removed.key.clone(),
        });
        Ok(removed)
    }

    /// Get the current record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the asset does not exist.
    pub fn get(&self, asset_id: AssetId) -> CoreResult<Asset> {
        self.assets
            .read()
            .get(&asset_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("asset", asset_id.to_string()))
    }

    #[must_use]
    pub fn find_by_key(&self, key: &str) -> Option<Asset> {
        self.assets
            .read()
            .values()
            .find(|asset| asset.key == key)
            .cloned()
    }

    #[must_use]
    pub fn collection_of(&self, asset_id: AssetId) -> Option<CollectionId> {
        self.assets
            .read()
            .get(&asset_id)
            .map(|asset| asset.collection_id)
    }

    /// Consistent copy of every asset, ordered by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Asset> {
        let mut assets: Vec<Asset> = self.assets.read().values().cloned().collect();
        assets.sort_by(|a, b| a.key.cmp(&b.key));
        assets
    }

    #[must_use]
    pub fn assets_in_collection(&self, collection_id: CollectionId) -> Vec<Asset> {
        let mut assets: Vec<Asset> = self
            .assets
            .read()
            .values()
            .filter(|asset| asset.collection_id == collection_id)
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.key.cmp(&b.key));
        assets
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }

    /// Replace the ledger contents with persisted records.
    ///
    /// Versions are kept as stored. No signals are emitted.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidState` if a record breaks the presence
    /// invariants or two records share a key; the ledger is then unchanged.
    pub fn restore(&self, records: Vec<Asset>) -> CoreResult<usize> {
        let mut restored = HashMap::with_capacity(records.len());
        let mut keys = HashSet::with_capacity(records.len());
        for asset in records {
            check_invariants(Some(&asset), &asset)?;
            if !keys.insert(asset.key.clone()) {
                return Err(CoreError::invalid_state(format!(
                    "persisted ledger lists key `{}` twice",
                    asset.key
                )));
            }
            restored.insert(asset.asset_id, asset);
        }

        let count = restored.len();
        *self.assets.write() = restored;
        Ok(count)
    }

    /// Apply `mutate` if the stored version still equals `expected_version`.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the asset does not exist
    /// - `CoreError::ConcurrencyConflict` if the version moved on
    /// - `CoreError::InvalidState` if the result violates presence invariants
    pub fn compare_and_set<F>(
        &self,
        asset_id: AssetId,
        expected_version: u64,
        mutate: F,
    ) -> CoreResult<Asset>
    where
        F: FnOnce(&mut Asset),
    {
        let updated = {
            let mut assets = self.assets.write();
            let current = assets
                .get_mut(&asset_id)
                .ok_or_else(|| CoreError::not_found("asset", asset_id.to_string()))?;

            if current.version != expected_version {
                return Err(CoreError::ConcurrencyConflict {
                    entity: "asset",
                    id: asset_id.to_string(),
                    expected: expected_version,
                    actual: current.version,
                });
            }

            let mut next = current.clone();
            mutate(&mut next);
            next.asset_id = current.asset_id;
            next.collection_id = current.collection_id;
            next.version = current.version + 1;
            check_invariants(Some(&*current), &next)?;

            *current = next.clone();
            next
        };

        self.emit_changed(&updated);
        Ok(updated)
    }

    /// Read-modify-write with bounded retries on concurrency conflicts.
    ///
    /// `mutate` may be called more than once and must be free of side effects;
    /// returning an error aborts the update.
    ///
    /// # Errors
    ///
    /// Returns the first non-conflict error, or `CoreError::ConcurrencyConflict`
    /// when every attempt lost the race.
    pub fn update<F>(&self, asset_id: AssetId, writer: &'static str, mut mutate: F) -> CoreResult<Asset>
    where
        F: FnMut(&mut Asset) -> CoreResult<()>,
    {
        let mut last_conflict = None;

        for _ in 0..self.max_attempts {
            let current = self.get(asset_id)?;
            let mut next = current.clone();
            mutate(&mut next)?;

            match self.compare_and_set(asset_id, current.version, |asset| *asset = next) {
                Ok(asset) => return Ok(asset),
                Err(err) if err.is_conflict() => {
                    LEDGER_CONFLICTS.with_label_values(&[writer]).inc();
                    tracing::debug!(asset_id = %asset_id, writer, "Ledger write conflict, retrying");
                    last_conflict = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_conflict.unwrap_or_else(|| CoreError::internal("ledger update made no attempt")))
    }

    fn emit_changed(&self, asset: &Asset) {
        self.signals.emit(Signal::AssetChanged {
            asset_id: asset.asset_id,
            tier: asset.tier,
            presence: asset.presence,
            version: asset.version,
        });
    }
}

/// Presence invariants checked on every write.
fn check_invariants(previous: Option<&Asset>, next: &Asset) -> CoreResult<()> {
    if next.presence != Presence::CloudOnly {
        return Ok(());
    }

    let Some(upload) = next.last_verified_upload.as_ref() else {
        return Err(CoreError::invalid_state(format!(
            "asset `{}` cannot be cloud-only without a verified upload",
            next.key
        )));
    };

    let evicting = previous.map_or(true, |prev| prev.presence.has_local());
    if evicting && upload.checksum != next.checksum {
        return Err(CoreError::invalid_state(format!(
            "asset `{}` cannot drop its local copy: verified upload {} does not match checksum {}",
            next.key, upload.checksum, next.checksum
        )));
    }

    Ok(())
}
