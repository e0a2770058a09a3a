//! Storage target catalog and adapter resolution.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tiersync_core::{AdapterKind, CoreError, CoreResult, StorageTarget, TargetId};

use super::{CloudAdapter, LocalFsAdapter};

/// Builds an adapter for a target of one [`AdapterKind`].
pub trait AdapterFactory: Send + Sync {
    /// Create the adapter instance serving `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint or credentials cannot be used.
    fn create(&self, target: &StorageTarget) -> CoreResult<Arc<dyn CloudAdapter>>;
}

/// Factory for network shares and `file://` endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFsFactory;

impl AdapterFactory for LocalFsFactory {
    fn create(&self, target: &StorageTarget) -> CoreResult<Arc<dyn CloudAdapter>> {
        let mut adapter = LocalFsAdapter::open(&target.endpoint);
        if let Some(bucket) = &target.bucket {
            adapter = LocalFsAdapter::open(&adapter.base_dir().join(bucket).to_string_lossy());
        }
        Ok(Arc::new(adapter))
    }
}

/// Registered targets, one factory per target kind, one cached adapter per target.
pub struct AdapterRegistry {
    targets: RwLock<HashMap<TargetId, StorageTarget>>,
    factories: RwLock<HashMap<AdapterKind, Arc<dyn AdapterFactory>>>,
    instances: RwLock<HashMap<TargetId, Arc<dyn CloudAdapter>>>,
    default_target: RwLock<Option<TargetId>>,
}

impl AdapterRegistry {
    /// Empty registry without any factory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            default_target: RwLock::new(None),
        }
    }

    /// Registry with the built-in filesystem factory for network shares.
    #[must_use]
    pub fn with_builtin_factories() -> Self {
        let registry = Self::new();
        registry.register_factory(AdapterKind::NetworkShare, Arc::new(LocalFsFactory));
        registry
    }

    /// Install the factory for a target kind, replacing any previous one.
    pub fn register_factory(&self, kind: AdapterKind, factory: Arc<dyn AdapterFactory>) {
        self.factories.write().insert(kind, factory);
    }

    /// Bind a ready adapter to a target, bypassing its factory.
    pub fn register_instance(&self, target_id: TargetId, adapter: Arc<dyn CloudAdapter>) {
        self.instances.write().insert(target_id, adapter);
    }

    /// Register a new target.
    ///
    /// # Errors
    ///
    /// - `CoreError::ValidationError` if the target is invalid
    /// - `CoreError::AlreadyExists` if the id or name is taken
    pub fn add_target(&self, target: StorageTarget) -> CoreResult<()> {
        target.validate()?;
        let mut targets = self.targets.write();
        if targets.contains_key(&target.target_id) {
            return Err(CoreError::already_exists(
                "target",
                target.target_id.to_string(),
            ));
        }
        if targets.values().any(|existing| existing.name == target.name) {
            return Err(CoreError::already_exists("target", target.name));
        }
        tracing::info!(
            target_id = %target.target_id,
            name = %target.name,
            kind = %target.kind,
            "Storage target registered"
        );
        targets.insert(target.target_id, target);
        Ok(())
    }

    /// Replace a target definition; the cached adapter is rebuilt on next use.
    ///
    /// # Errors
    ///
    /// - `CoreError::ValidationError` if the target is invalid
    /// - `CoreError::NotFound` if the target does not exist
    pub fn update_target(&self, target: StorageTarget) -> CoreResult<()> {
        target.validate()?;
        let mut targets = self.targets.write();
        let slot = targets
            .get_mut(&target.target_id)
            .ok_or_else(|| CoreError::not_found("target", target.target_id.to_string()))?;
        let target_id = target.target_id;
        *slot = target;
        drop(targets);

        self.instances.write().remove(&target_id);
        Ok(())
    }

    /// Remove a target. Callers check that nothing references it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the target does not exist.
    pub fn remove_target(&self, target_id: TargetId) -> CoreResult<StorageTarget> {
        let removed = self
            .targets
            .write()
            .remove(&target_id)
            .ok_or_else(|| CoreError::not_found("target", target_id.to_string()))?;
        self.instances.write().remove(&target_id);

        let mut default_target = self.default_target.write();
        if *default_target == Some(target_id) {
            *default_target = None;
        }
        Ok(removed)
    }

    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the target does not exist.
    pub fn target(&self, target_id: TargetId) -> CoreResult<StorageTarget> {
        self.targets
            .read()
            .get(&target_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("target", target_id.to_string()))
    }

    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<StorageTarget> {
        self.targets
            .read()
            .values()
            .find(|target| target.name == name)
            .cloned()
    }

    #[must_use]
    pub fn contains(&self, target_id: TargetId) -> bool {
        self.targets.read().contains_key(&target_id)
    }

    #[must_use]
    pub fn targets(&self) -> Vec<StorageTarget> {
        let mut targets: Vec<StorageTarget> = self.targets.read().values().cloned().collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets
    }

    /// Set the store-wide target used when a policy names none.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the target does not exist.
    pub fn set_default_target(&self, target_id: TargetId) -> CoreResult<()> {
        if !self.contains(target_id) {
            return Err(CoreError::not_found("target", target_id.to_string()));
        }
        *self.default_target.write() = Some(target_id);
        Ok(())
    }

    #[must_use]
    pub fn default_target(&self) -> Option<TargetId> {
        *self.default_target.read()
    }

    /// Adapter serving `target_id`, created by its kind's factory on first use.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the target does not exist
    /// - `CoreError::AdapterMissing` if no factory serves the target's kind
    pub fn resolve(&self, target_id: TargetId) -> CoreResult<Arc<dyn CloudAdapter>> {
        if let Some(adapter) = self.instances.read().get(&target_id) {
            return Ok(Arc::clone(adapter));
        }

        let target = self.target(target_id)?;
        let factory = self
            .factories
            .read()
            .get(&target.kind)
            .cloned()
            .ok_or_else(|| CoreError::AdapterMissing {
                kind: target.kind.to_string(),
            })?;

        let adapter = factory.create(&target)?;
        tracing::debug!(target_id = %target_id, kind = %target.kind, "Adapter created");

        // Another caller may have raced us; keep whichever landed first
        let mut instances = self.instances.write();
        Ok(Arc::clone(
            instances.entry(target_id).or_insert(adapter),
        ))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtin_factories()
    }
}
