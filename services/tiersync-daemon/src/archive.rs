//! Local archive scan: every file below a top-level directory becomes an
//! asset of the collection named after that directory.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::Serialize;
use tiersync_core::{CollectionId, CoreError};
use tiersync_storage::{CloudAdapter, LocalFsAdapter, Orchestrator};
use uuid::Uuid;

/// Namespace for name-derived collection ids
const COLLECTION_NAMESPACE: Uuid = Uuid::from_u128(0x5f2b_8c3e_4a1d_4e6f_9b07_d2c4_1a38_e690);

/// Collection id for a top-level directory name; stable across restarts.
pub fn collection_id(name: &str) -> CollectionId {
    CollectionId::from_uuid(Uuid::new_v5(&COLLECTION_NAMESPACE, name.as_bytes()))
}

/// Top-level directory of a key, `None` for files at the archive root.
pub fn collection_of_key(key: &str) -> Option<&str> {
    key.split_once('/')
        .map(|(collection, _)| collection)
        .filter(|collection| !collection.is_empty())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub ingested: usize,
    /// Already tracked, or outside any collection
    pub skipped: usize,
    pub collections: BTreeSet<String>,
}

/// Ingest every file of the local archive into the ledger.
pub async fn scan(orchestrator: &Orchestrator, local: &LocalFsAdapter) -> Result<ScanReport> {
    let objects = local
        .list("")
        .await
        .with_context(|| format!("failed to list archive {}", local.base_dir().display()))?;

    let mut report = ScanReport::default();
    for meta in objects {
        let Some(collection) = collection_of_key(&meta.key) else {
            tracing::debug!(key = %meta.key, "Skipping file outside any collection");
            report.skipped += 1;
            continue;
        };

        match orchestrator
            .ingest_asset(collection_id(collection), &meta.key)
            .await
        {
            Ok(_) => {
                report.ingested += 1;
                report.collections.insert(collection.to_string());
            }
            Err(CoreError::AlreadyExists { .. }) => report.skipped += 1,
            Err(e) => return Err(e).with_context(|| format!("failed to ingest `{}`", meta.key)),
        }
    }

    tracing::info!(
        ingested = report.ingested,
        skipped = report.skipped,
        collections = report.collections.len(),
        "Archive scan complete"
    );
    Ok(report)
}
