use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AssetId, CollectionId, TargetId};

/// Expected access frequency of an asset, driving storage placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Recently accessed; local fast storage.
    Hot,
    /// Idle past the first threshold.
    Warm,
    /// Idle past the second threshold; candidate for cloud-only placement.
    Cold,
}

impl Tier {
    /// Next colder tier, `None` for `Cold`.
    #[must_use]
    pub fn colder(self) -> Option<Self> {
        match self {
            Self::Hot => Some(Self::Warm),
            Self::Warm => Some(Self::Cold),
            Self::Cold => None,
        }
    }

    /// Lowercase label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where durable copies of an asset currently exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    /// Only the local archive holds the asset.
    LocalOnly,
    /// Local archive and at least one cloud target hold the asset.
    LocalAndCloud,
    /// The local copy was evicted after a verified upload.
    CloudOnly,
}

impl Presence {
    /// Whether the local archive holds a copy.
    #[must_use]
    pub fn has_local(&self) -> bool {
        !matches!(self, Self::CloudOnly)
    }

    /// Whether any cloud target holds a copy.
    #[must_use]
    pub fn has_cloud(&self) -> bool {
        !matches!(self, Self::LocalOnly)
    }

    /// Presence after a confirmed upload.
    #[must_use]
    pub fn with_cloud(self) -> Self {
        match self {
            Self::LocalOnly | Self::LocalAndCloud => Self::LocalAndCloud,
            Self::CloudOnly => Self::CloudOnly,
        }
    }

    /// Presence after a confirmed download into the local archive.
    #[must_use]
    pub fn with_local(self) -> Self {
        match self {
            Self::LocalOnly => Self::LocalOnly,
            Self::LocalAndCloud | Self::CloudOnly => Self::LocalAndCloud,
        }
    }

    /// Lowercase label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::LocalAndCloud => "local_and_cloud",
            Self::CloudOnly => "cloud_only",
        }
    }
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of an upload whose remote checksum was confirmed after transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedUpload {
    /// SHA-256 hex digest confirmed on the target.
    pub checksum: String,
    /// Target holding the verified copy.
    pub target_id: TargetId,
    /// Time of verification.
    pub verified_at: DateTime<Utc>,
}

/// Ledger record for one managed asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: AssetId,
    pub collection_id: CollectionId,
    /// Path relative to the archive root; also the object key on every target.
    pub key: String,
    pub size_bytes: u64,
    /// SHA-256 hex digest of the current content.
    pub checksum: String,
    pub modified_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub tier: Tier,
    pub presence: Presence,
    pub last_verified_upload: Option<VerifiedUpload>,
    /// Bumped by the ledger on every accepted write.
    pub version: u64,
}

impl Asset {
    /// Creates a new hot, local-only asset as ingested from the catalog.
    #[must_use]
    pub fn new(
        collection_id: CollectionId,
        key: impl Into<String>,
        size_bytes: u64,
        checksum: impl Into<String>,
        modified_at: DateTime<Utc>,
    ) -> Self {
        Self {
            asset_id: AssetId::new(),
            collection_id,
            key: key.into(),
            size_bytes,
            checksum: checksum.into(),
            modified_at,
            last_access: modified_at,
            tier: Tier::Hot,
            presence: Presence::LocalOnly,
            last_verified_upload: None,
            version: 0,
        }
    }

    /// Sets the last access time (fixture and ingest helper).
    #[must_use]
    pub fn with_last_access(mut self, last_access: DateTime<Utc>) -> Self {
        self.last_access = last_access;
        self
    }

    /// Sets the tier (fixture and ingest helper).
    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Whether a cloud copy of exactly the current content has been verified.
    #[must_use]
    pub fn has_verified_cloud_copy(&self) -> bool {
        self.presence.has_cloud()
            && self
                .last_verified_upload
                .as_ref()
                .is_some_and(|upload| upload.checksum == self.checksum)
    }

    /// File extension of the key, lowercased.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.key)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }
}
