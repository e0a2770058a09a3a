//! In-memory cloud adapter for tests and demos
//!
//! Simulates a remote target with configurable failure patterns for testing
//! retries, timeouts and checksum verification without a real backend.
//!
//! # Features
//!
//! - **Deterministic Failures**: Pre-defined failure sequences, global or per key
//! - **Stalls**: Operations that hang past the executor's item timeout
//! - **Corruption**: Uploads that store different bytes than were sent
//! - **Call Counts**: Per-operation success and failure counts for assertions
//!
//! Scripted failures apply to transfer operations (`put`, `put_multipart`,
//! `get`, `delete`); `list` always answers from the stored objects.
//!
//! # Examples
//!
//! ```rust
//! use tiersync_storage::adapter::{sha256_hex, CloudAdapter, MockCloudAdapter, MockFailure};
//! use bytes::Bytes;
//!
//! # async fn example() -> tiersync_core::CoreResult<()> {
//! let mock = MockCloudAdapter::new_with_failures(vec![
//!     MockFailure::Transient("503 Service Unavailable"),
//!     MockFailure::Ok,
//! ]);
//! let data = Bytes::from("data");
//! let checksum = sha256_hex(&data);
//!
//! assert!(mock.put("key", data.clone(), &checksum).await.is_err());
//! assert!(mock.put("key", data, &checksum).await.is_ok());
//!
//! assert_eq!(mock.failed_puts(), 1);
//! assert_eq!(mock.successful_puts(), 1);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::{sha256_hex, validate_key, verify_checksum, CloudAdapter, ObjectMeta};
use tiersync_core::{CoreError, CoreResult};

/// Scripted outcome of one transfer operation.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Transient error (retry-able). Examples: 500, 503, connection reset.
    Transient(&'static str),

    /// Permanent error. Examples: 404, 400, quota exceeded.
    Permanent(&'static str),

    /// Credentials rejected. Example: 403.
    Auth(&'static str),

    /// Hang for the given duration, then succeed.
    Stall(Duration),

    /// Store the upload with one byte flipped.
    Corrupt,

    /// Success (no error).
    Ok,
}

impl MockFailure {
    fn to_error(&self) -> Option<CoreError> {
        match self {
            MockFailure::Transient(msg) => Some(CoreError::TransientTransfer((*msg).to_string())),
            MockFailure::Permanent(msg) => Some(CoreError::PermanentTransfer((*msg).to_string())),
            MockFailure::Auth(msg) => Some(CoreError::AuthFailure((*msg).to_string())),
            MockFailure::Stall(_) | MockFailure::Corrupt | MockFailure::Ok => None,
        }
    }
}

/// One recorded transfer call
#[derive(Debug, Clone, Copy)]
struct MockCall {
    /// "put", "get" or "delete"
    operation: &'static str,
    success: bool,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified_at: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size_bytes: self.data.len() as u64,
            checksum: sha256_hex(&self.data),
            modified_at: self.modified_at,
        }
    }
}

/// In-memory [`CloudAdapter`] with scripted failures.
#[derive(Clone)]
pub struct MockCloudAdapter {
    /// In-memory storage (simulates the remote bucket).
    storage: Arc<RwLock<HashMap<String, StoredObject>>>,

    /// Failure pattern queue consumed by any key.
    failure_queue: Arc<RwLock<VecDeque<MockFailure>>>,

    /// Failure pattern queues consumed before the global queue for one key.
    key_failures: Arc<RwLock<HashMap<String, VecDeque<MockFailure>>>>,

    calls: Arc<RwLock<Vec<MockCall>>>,
}

impl MockCloudAdapter {
    /// Create an empty mock adapter with no scripted failures.
    #[must_use]
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            failure_queue: Arc::new(RwLock::new(VecDeque::new())),
            key_failures: Arc::new(RwLock::new(HashMap::new())),
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Create mock adapter with deterministic failure pattern.
    ///
    /// Failures are consumed in order. Once the queue is empty, all operations succeed.
    #[must_use]
    pub fn new_with_failures(pattern: Vec<MockFailure>) -> Self {
        let mock = Self::new();
        *mock.failure_queue.write() = pattern.into();
        mock
    }

    /// Append failures to the global queue.
    pub fn push_failures(&self, pattern: impl IntoIterator<Item = MockFailure>) {
        self.failure_queue.write().extend(pattern);
    }

    /// Script failures for one key only.
    pub fn fail_key(&self, key: &str, pattern: impl IntoIterator<Item = MockFailure>) {
        self.key_failures
            .write()
            .entry(key.to_string())
            .or_default()
            .extend(pattern);
    }

    /// Seed an object directly, bypassing failures and call counts.
    pub fn insert_object(&self, key: &str, data: impl Into<Bytes>, modified_at: DateTime<Utc>) {
        self.storage.write().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                modified_at,
            },
        );
    }

    /// Content of a stored object.
    #[must_use]
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.storage.read().get(key).map(|obj| obj.data.clone())
    }

    /// Number of calls of one operation type.
    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|entry| entry.operation == operation)
            .count()
    }

    /// Get number of successful puts.
    #[must_use]
    pub fn successful_puts(&self) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|entry| entry.operation == "put" && entry.success)
            .count()
    }

    /// Get number of failed puts.
    #[must_use]
    pub fn failed_puts(&self) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|entry| entry.operation == "put" && !entry.success)
            .count()
    }

    /// Get current storage size (number of objects).
    #[must_use]
    pub fn storage_size(&self) -> usize {
        self.storage.read().len()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.storage.read().contains_key(key)
    }

    /// Pop the next scripted outcome for `key`, stalling if scripted.
    async fn next_outcome(&self, key: &str) -> MockFailure {
        let scripted = {
            let mut per_key = self.key_failures.write();
            per_key.get_mut(key).and_then(VecDeque::pop_front)
        };
        let outcome = scripted
            .or_else(|| self.failure_queue.write().pop_front())
            .unwrap_or(MockFailure::Ok);

        if let MockFailure::Stall(duration) = outcome {
            tokio::time::sleep(duration).await;
        }
        outcome
    }

    fn record_call(&self, operation: &'static str, success: bool) {
        self.calls.write().push(MockCall { operation, success });
    }
}

impl Default for MockCloudAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudAdapter for MockCloudAdapter {
    async fn put(&self, key: &str, data: Bytes, expected_checksum: &str) -> CoreResult<ObjectMeta> {
        validate_key(key)?;
        let outcome = self.next_outcome(key).await;

        if let Some(error) = outcome.to_error() {
            self.record_call("put", false);
            return Err(error);
        }

        if let Err(err) = verify_checksum(key, &data, expected_checksum) {
            self.record_call("put", false);
            return Err(err);
        }

        let stored = if matches!(outcome, MockFailure::Corrupt) {
            let mut bytes = data.to_vec();
            if let Some(first) = bytes.first_mut() {
                *first ^= 0xff;
            } else {
                bytes.push(0);
            }
            Bytes::from(bytes)
        } else {
            data
        };

        let object = StoredObject {
            data: stored,
            modified_at: Utc::now(),
        };
        let meta = object.meta(key);
        self.storage.write().insert(key.to_string(), object);
        self.record_call("put", true);

        Ok(meta)
    }

    async fn get(&self, key: &str) -> CoreResult<(Bytes, ObjectMeta)> {
        let outcome = self.next_outcome(key).await;

        if let Some(error) = outcome.to_error() {
            self.record_call("get", false);
            return Err(error);
        }

        let object = self.storage.read().get(key).cloned();
        match object {
            Some(object) => {
                self.record_call("get", true);
                let meta = object.meta(key);
                Ok((object.data, meta))
            }
            None => {
                self.record_call("get", false);
                Err(CoreError::not_found("object", key))
            }
        }
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        let outcome = self.next_outcome(key).await;

        if let Some(error) = outcome.to_error() {
            self.record_call("delete", false);
            return Err(error);
        }

        self.storage.write().remove(key);
        self.record_call("delete", true);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMeta>> {
        let storage = self.storage.read();
        let mut objects: Vec<ObjectMeta> = storage
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| object.meta(key))
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}
