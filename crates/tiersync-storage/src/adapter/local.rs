//! Local filesystem implementation of CloudAdapter
//!
//! Serves network shares mounted into the filesystem, `file://` endpoints, and
//! the local archive itself. Objects are stored as files with the key as the
//! relative path.

use super::{io_to_transfer, validate_key, verify_checksum, CloudAdapter, ObjectMeta};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tiersync_core::{CoreError, CoreResult};

/// Filesystem-backed adapter
///
/// # Example
///
/// ```rust,no_run
/// use tiersync_storage::adapter::{sha256_hex, CloudAdapter, LocalFsAdapter};
/// use bytes::Bytes;
///
/// #[tokio::main]
/// async fn main() -> tiersync_core::CoreResult<()> {
///     let share = LocalFsAdapter::new("/mnt/nas/archive").await?;
///
///     let data = Bytes::from("frame data");
///     share.put("promo/A001.mov", data.clone(), &sha256_hex(&data)).await?;
///
///     let objects = share.list("promo/").await?;
///     println!("Found {} objects", objects.len());
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LocalFsAdapter {
    base_dir: PathBuf,
}

impl LocalFsAdapter {
    /// Create the adapter, creating the base directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::IoError` if directory creation fails
    pub async fn new(base_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    /// Open a base directory without touching the filesystem.
    ///
    /// Accepts plain paths and `file://` URLs.
    #[must_use]
    pub fn open(endpoint: &str) -> Self {
        let path = endpoint.strip_prefix("file://").unwrap_or(endpoint);
        Self {
            base_dir: PathBuf::from(path),
        }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Convert key to full filesystem path
    fn full_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    /// Strip base directory from path to get key
    fn path_to_key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_dir).ok()?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }

    /// Recursively list all files under a directory
    fn list_recursive<'a>(
        &'a self,
        dir: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<Vec<PathBuf>>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut results = Vec::new();

            let mut read_dir = tokio::fs::read_dir(dir)
                .await
                .map_err(|e| io_to_transfer(&dir.display().to_string(), e))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| io_to_transfer(&dir.display().to_string(), e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_to_transfer(&path.display().to_string(), e))?;

                if file_type.is_file() {
                    if !is_partial_upload(&path) {
                        results.push(path);
                    }
                } else if file_type.is_dir() {
                    let mut sub_results = self.list_recursive(&path).await?;
                    results.append(&mut sub_results);
                }
            }

            Ok(results)
        })
    }

    async fn describe(&self, key: &str, path: &Path) -> CoreResult<ObjectMeta> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| io_to_transfer(key, e))?;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_to_transfer(key, e))?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size_bytes: metadata.len(),
            checksum: super::sha256_hex(&data),
            modified_at: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

/// Temporary files written before the atomic rename in `put`.
fn is_partial_upload(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "partial")
}

#[async_trait]
impl CloudAdapter for LocalFsAdapter {
    async fn put(&self, key: &str, data: Bytes, expected_checksum: &str) -> CoreResult<ObjectMeta> {
        validate_key(key)?;
        verify_checksum(key, &data, expected_checksum)?;

        let path = self.full_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_to_transfer(key, e))?;
        }

        // Write beside the target and rename so readers never see a torn file
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        tokio::fs::write(&partial, &data)
            .await
            .map_err(|e| io_to_transfer(key, e))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| io_to_transfer(key, e))?;

        self.describe(key, &path).await
    }

    async fn get(&self, key: &str) -> CoreResult<(Bytes, ObjectMeta)> {
        validate_key(key)?;
        let path = self.full_path(key);

        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| io_to_transfer(key, e))?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_to_transfer(key, e))?;

        let meta = ObjectMeta {
            key: key.to_string(),
            size_bytes: data.len() as u64,
            checksum: super::sha256_hex(&data),
            modified_at: metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        };
        Ok((Bytes::from(data), meta))
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            // Idempotent - no error if file doesn't exist
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_to_transfer(key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> CoreResult<Vec<ObjectMeta>> {
        if !tokio::fs::try_exists(&self.base_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        // Walk the deepest directory fully covered by the prefix
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let walk_root = self.full_path(dir_part);
        if !tokio::fs::try_exists(&walk_root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let files = self.list_recursive(&walk_root).await?;

        let mut results = Vec::new();
        for path in files {
            let Some(key) = self.path_to_key(&path) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            match self.describe(&key, &path).await {
                Ok(meta) => results.push(meta),
                // Removed between walk and read
                Err(CoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }

    async fn head(&self, key: &str) -> CoreResult<Option<ObjectMeta>> {
        validate_key(key)?;
        let path = self.full_path(key);
        match self.describe(key, &path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(CoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
