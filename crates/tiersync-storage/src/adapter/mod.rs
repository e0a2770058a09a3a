//! Cloud adapter abstraction over heterogeneous storage backends
//!
//! One adapter implementation exists per target type:
//! - Network shares and `file://` endpoints ([`LocalFsAdapter`], also used as
//!   the local archive store)
//! - In-memory storage with scripted failures ([`MockCloudAdapter`])
//!
//! Vendor SDKs plug in by registering an [`AdapterFactory`] for their
//! [`AdapterKind`](tiersync_core::AdapterKind).

mod local;
mod mock;
mod registry;

pub use local::LocalFsAdapter;
pub use mock::{MockCloudAdapter, MockFailure};
pub use registry::{AdapterFactory, AdapterRegistry, LocalFsFactory};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tiersync_core::{CoreError, CoreResult, ErrorClass};

/// Object metadata returned by list operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key (relative path)
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// SHA-256 hex digest of the stored content
    pub checksum: String,
    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,
}

/// Transfer capability of one storage target
///
/// All implementations must be thread-safe (Send + Sync) and support
/// concurrent operations. Keys are UTF-8 relative paths.
///
/// # Error Handling
///
/// Failures are reported with the transfer taxonomy so the executor can
/// decide whether to retry:
/// - `CoreError::TransientTransfer` - timeouts, 5xx, resets, checksum mismatch
/// - `CoreError::PermanentTransfer` / `CoreError::NotFound` - will not succeed on retry
/// - `CoreError::AuthFailure` - credentials rejected
///
/// # Examples
///
/// ```rust
/// use tiersync_storage::adapter::{sha256_hex, CloudAdapter, MockCloudAdapter};
/// use bytes::Bytes;
///
/// # async fn example() -> tiersync_core::CoreResult<()> {
/// let adapter = MockCloudAdapter::new();
/// let data = Bytes::from("frame data");
/// let checksum = sha256_hex(&data);
///
/// adapter.put("promo/A001.mov", data, &checksum).await?;
///
/// let objects = adapter.list("promo/").await?;
/// assert_eq!(objects[0].checksum, checksum);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    /// Store an object, overwriting any previous content.
    ///
    /// The adapter rejects content whose digest differs from
    /// `expected_checksum` with a transient error.
    async fn put(&self, key: &str, data: Bytes, expected_checksum: &str) -> CoreResult<ObjectMeta>;

    /// Store an object uploaded in parts.
    async fn put_multipart(
        &self,
        key: &str,
        parts: Vec<Bytes>,
        expected_checksum: &str,
    ) -> CoreResult<ObjectMeta> {
        let total: usize = parts.iter().map(Bytes::len).sum();
        let mut combined = Vec::with_capacity(total);
        for part in parts {
            combined.extend_from_slice(&part);
        }
        self.put(key, Bytes::from(combined), expected_checksum).await
    }

    /// Fetch an object with its metadata.
    ///
    /// # Errors
    ///
    /// `CoreError::NotFound` if the object does not exist.
    async fn get(&self, key: &str) -> CoreResult<(Bytes, ObjectMeta)>;

    /// Delete an object (idempotent).
    async fn delete(&self, key: &str) -> CoreResult<()>;

    /// List objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMeta>>;

    /// Metadata of exactly `key`, if present.
    async fn head(&self, key: &str) -> CoreResult<Option<ObjectMeta>> {
        Ok(self
            .list(key)
            .await?
            .into_iter()
            .find(|meta| meta.key == key))
    }
}

/// SHA-256 hex digest used for every checksum in the system.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Validate an object key: non-empty, relative, no parent components.
pub(crate) fn validate_key(key: &str) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::ValidationError(
            "Key cannot be empty".to_string(),
        ));
    }
    if key.starts_with('/') || key.split('/').any(|part| part == "..") {
        return Err(CoreError::ValidationError(format!(
            "Key `{key}` must be a relative path without `..`"
        )));
    }
    Ok(())
}

/// Reject content whose digest differs from the caller's expectation.
pub(crate) fn verify_checksum(key: &str, data: &[u8], expected: &str) -> CoreResult<String> {
    let actual = sha256_hex(data);
    if actual != expected {
        return Err(CoreError::TransientTransfer(format!(
            "checksum mismatch for `{key}`: expected {expected}, got {actual}"
        )));
    }
    Ok(actual)
}

/// Map an I/O failure onto the transfer taxonomy.
pub(crate) fn io_to_transfer(key: &str, err: std::io::Error) -> CoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        return CoreError::not_found("object", key);
    }
    match tiersync_core::classify_io_error(&err) {
        ErrorClass::Transient => CoreError::TransientTransfer(format!("{key}: {err}")),
        ErrorClass::AuthFailure => CoreError::AuthFailure(format!("{key}: {err}")),
        ErrorClass::Permanent => CoreError::PermanentTransfer(format!("{key}: {err}")),
    }
}
