use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::ids::TargetId;

/// Backend type of a storage target; selects the adapter implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// S3-compatible object storage.
    ObjectStorage,
    /// WebDAV network drive.
    WebDav,
    /// Mounted network share or local directory.
    NetworkShare,
}

impl AdapterKind {
    /// Lowercase label for logs and errors.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObjectStorage => "object_storage",
            Self::WebDav => "webdav",
            Self::NetworkShare => "network_share",
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cloud or network destination that sync tasks transfer to and from.
///
/// Credentials are never stored here; `credential_ref` names a secret owned by
/// an external secrets collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTarget {
    pub target_id: TargetId,
    pub name: String,
    pub kind: AdapterKind,
    pub endpoint: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub credential_ref: Option<String>,
}

impl StorageTarget {
    /// Creates a target with a fresh identifier.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: AdapterKind, endpoint: impl Into<String>) -> Self {
        Self {
            target_id: TargetId::new(),
            name: name.into(),
            kind,
            endpoint: endpoint.into(),
            bucket: None,
            credential_ref: None,
        }
    }

    /// Sets the bucket or root folder.
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Sets the credential reference.
    #[must_use]
    pub fn with_credential_ref(mut self, credential_ref: impl Into<String>) -> Self {
        self.credential_ref = Some(credential_ref.into());
        self
    }

    /// Validate target definition
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ValidationError` if the name or endpoint is empty.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::validation("target name cannot be empty"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(CoreError::validation(format!(
                "target `{}` has an empty endpoint",
                self.name
            )));
        }
        Ok(())
    }
}
