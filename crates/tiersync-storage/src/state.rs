//! Durable state: the ledger, manifests and job history across restarts.
//!
//! Each part lives in its own JSON file under one directory. Files are
//! written to a temporary sibling and renamed into place, so a crash
//! mid-save leaves the previous file intact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tiersync_core::{Asset, CoreResult};

use crate::history::JobHistory;
use crate::ledger::AssetLedger;
use crate::manifest::{ManifestRecord, ManifestStore};

const LEDGER_FILE: &str = "ledger.json";
const MANIFESTS_FILE: &str = "manifests.json";
const HISTORY_FILE: &str = "history.json";

/// Counts of what was saved or loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateReport {
    pub assets: usize,
    pub manifests: usize,
    pub history: usize,
}

/// State directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the ledger, manifests and history.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or file I/O fails
    pub async fn save(
        &self,
        ledger: &AssetLedger,
        manifests: &ManifestStore,
        history: &JobHistory,
    ) -> CoreResult<StateReport> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let assets = ledger.snapshot();
        write_json(&self.dir.join(LEDGER_FILE), &assets).await?;
        let records = manifests.records();
        write_json(&self.dir.join(MANIFESTS_FILE), &records).await?;
        history.persist(&self.dir.join(HISTORY_FILE)).await?;

        let report = StateReport {
            assets: assets.len(),
            manifests: records.len(),
            history: history.len(),
        };
        tracing::debug!(
            dir = %self.dir.display(),
            assets = report.assets,
            manifests = report.manifests,
            history = report.history,
            "State saved"
        );
        Ok(report)
    }

    /// Replace the in-memory state with what was last saved.
    ///
    /// Missing files leave the matching part empty. The ledger is checked
    /// before anything is replaced, so a rejected ledger file changes nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if file I/O or deserialization fails, or
    /// `CoreError::InvalidState` if the stored ledger breaks an asset invariant.
    pub async fn load(
        &self,
        ledger: &AssetLedger,
        manifests: &ManifestStore,
        history: &JobHistory,
        now: DateTime<Utc>,
    ) -> CoreResult<StateReport> {
        let assets: Vec<Asset> = read_json(&self.dir.join(LEDGER_FILE))
            .await?
            .unwrap_or_default();
        let records: Vec<ManifestRecord> = read_json(&self.dir.join(MANIFESTS_FILE))
            .await?
            .unwrap_or_default();

        let report = StateReport {
            assets: ledger.restore(assets)?,
            manifests: manifests.restore(records),
            history: history.load(&self.dir.join(HISTORY_FILE), now).await?,
        };
        tracing::info!(
            dir = %self.dir.display(),
            assets = report.assets,
            manifests = report.manifests,
            history = report.history,
            "State loaded"
        );
        Ok(report)
    }
}

/// Serialize `value` to `path` through a temporary file and a rename.
pub(crate) async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> CoreResult<Option<T>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        tracing::debug!(path = %path.display(), "No state file, starting empty");
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}
