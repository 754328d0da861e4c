//! Target registry.
//!
//! Persisted target configurations name their kind in a discriminator
//! field: `implementation` for sync-up targets, `type` for sync-down
//! targets. The registry maps those names back to factories. Built-in
//! targets are always present; applications register their own under a
//! custom name, which sync-down configurations reach through the `custom`
//! type.

use crate::down::{
    BriefcaseSyncDownTarget, LayoutSyncDownTarget, MetadataSyncDownTarget, MruSyncDownTarget,
    ParentChildrenSyncDownTarget, RefreshSyncDownTarget, SoqlSyncDownTarget, SoslSyncDownTarget,
    SyncDownTarget, BRIEFCASE_TYPE, LAYOUT_TYPE, METADATA_TYPE, MRU_TYPE, PARENT_CHILDREN_TYPE,
    REFRESH_TYPE, SOQL_TYPE, SOSL_TYPE,
};
use crate::error::{SyncError, SyncResult};
use crate::up::{
    BatchSyncUpTarget, CollectionSyncUpTarget, ParentChildrenSyncUpTarget, SingleSyncUpTarget,
    SyncUpTarget, BATCH_IMPLEMENTATION, COLLECTION_IMPLEMENTATION, PARENT_CHILDREN_IMPLEMENTATION,
    SINGLE_IMPLEMENTATION,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Key naming a sync-up target's kind.
pub const UP_DISCRIMINATOR: &str = "implementation";

/// Key naming a sync-down target's kind.
pub const DOWN_DISCRIMINATOR: &str = "type";

/// Sync-down type of application supplied targets; the factory is then
/// looked up by the `implementation` key.
pub const CUSTOM_TYPE: &str = "custom";

/// Builds a sync-up target from its configuration.
pub type UpFactory = Arc<dyn Fn(&Value) -> SyncResult<SyncUpTarget> + Send + Sync>;

/// Builds a sync-down target from its configuration.
pub type DownFactory = Arc<dyn Fn(&Value) -> SyncResult<SyncDownTarget> + Send + Sync>;

/// Serializes `target` and tags it with its discriminator.
pub(crate) fn tagged<T: Serialize>(target: &T, key: &str, name: &str) -> SyncResult<Value> {
    match serde_json::to_value(target)? {
        Value::Object(mut map) => {
            map.insert(key.to_string(), Value::String(name.to_string()));
            Ok(Value::Object(map))
        }
        _ => Err(SyncError::config(format!("target {name} does not serialize to an object"))),
    }
}

/// Maps discriminator names to target factories.
#[derive(Clone)]
pub struct TargetRegistry {
    up: BTreeMap<String, UpFactory>,
    down: BTreeMap<String, DownFactory>,
}

impl fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("up", &self.up.keys().collect::<Vec<_>>())
            .field("down", &self.down.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetRegistry {
    /// Creates a registry holding the built-in targets.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            up: BTreeMap::new(),
            down: BTreeMap::new(),
        };
        registry.insert_up(SINGLE_IMPLEMENTATION, |c| {
            Ok(SingleSyncUpTarget::from_config(c)?.into())
        });
        registry.insert_up(BATCH_IMPLEMENTATION, |c| Ok(BatchSyncUpTarget::from_config(c)?.into()));
        registry.insert_up(COLLECTION_IMPLEMENTATION, |c| {
            Ok(CollectionSyncUpTarget::from_config(c)?.into())
        });
        registry.insert_up(PARENT_CHILDREN_IMPLEMENTATION, |c| {
            Ok(ParentChildrenSyncUpTarget::from_config(c)?.into())
        });

        registry.insert_down(SOQL_TYPE, |c| Ok(SoqlSyncDownTarget::from_config(c)?.into()));
        registry.insert_down(REFRESH_TYPE, |c| Ok(RefreshSyncDownTarget::from_config(c)?.into()));
        registry.insert_down(MRU_TYPE, |c| Ok(MruSyncDownTarget::from_config(c)?.into()));
        registry.insert_down(SOSL_TYPE, |c| Ok(SoslSyncDownTarget::from_config(c)?.into()));
        registry.insert_down(PARENT_CHILDREN_TYPE, |c| {
            Ok(ParentChildrenSyncDownTarget::from_config(c)?.into())
        });
        registry.insert_down(METADATA_TYPE, |c| Ok(MetadataSyncDownTarget::from_config(c)?.into()));
        registry.insert_down(LAYOUT_TYPE, |c| Ok(LayoutSyncDownTarget::from_config(c)?.into()));
        registry.insert_down(BRIEFCASE_TYPE, |c| {
            Ok(BriefcaseSyncDownTarget::from_config(c)?.into())
        });
        registry
    }

    fn insert_up<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> SyncResult<SyncUpTarget> + Send + Sync + 'static,
    {
        self.up.insert(name.to_string(), Arc::new(factory));
    }

    fn insert_down<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&Value) -> SyncResult<SyncDownTarget> + Send + Sync + 'static,
    {
        self.down.insert(name.to_string(), Arc::new(factory));
    }

    /// Registers a sync-up target factory.
    ///
    /// Returns an error if the name is already taken.
    pub fn register_up<F>(&mut self, name: &str, factory: F) -> SyncResult<()>
    where
        F: Fn(&Value) -> SyncResult<SyncUpTarget> + Send + Sync + 'static,
    {
        if self.up.contains_key(name) {
            return Err(SyncError::config(format!("sync-up target {name} already registered")));
        }
        self.insert_up(name, factory);
        Ok(())
    }

    /// Registers a custom sync-down target factory.
    ///
    /// Returns an error if the name is already taken.
    pub fn register_down<F>(&mut self, name: &str, factory: F) -> SyncResult<()>
    where
        F: Fn(&Value) -> SyncResult<SyncDownTarget> + Send + Sync + 'static,
    {
        if name == CUSTOM_TYPE || self.down.contains_key(name) {
            return Err(SyncError::config(format!("sync-down target {name} already registered")));
        }
        self.insert_down(name, factory);
        Ok(())
    }

    /// Registered sync-up names.
    #[must_use]
    pub fn up_names(&self) -> Vec<&str> {
        self.up.keys().map(String::as_str).collect()
    }

    /// Registered sync-down names.
    #[must_use]
    pub fn down_names(&self) -> Vec<&str> {
        self.down.keys().map(String::as_str).collect()
    }

    /// Builds a sync-up target. A configuration without an implementation
    /// name is a single record target.
    pub fn up_from_config(&self, config: &Value) -> SyncResult<SyncUpTarget> {
        let name = config
            .get(UP_DISCRIMINATOR)
            .and_then(Value::as_str)
            .unwrap_or(SINGLE_IMPLEMENTATION);
        let factory = self
            .up
            .get(name)
            .ok_or_else(|| SyncError::config(format!("unknown sync-up target: {name}")))?;
        factory(config)
    }

    /// Builds a sync-down target.
    pub fn down_from_config(&self, config: &Value) -> SyncResult<SyncDownTarget> {
        let kind = config
            .get(DOWN_DISCRIMINATOR)
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::config("sync-down target without type"))?;
        let name = if kind == CUSTOM_TYPE {
            config
                .get(UP_DISCRIMINATOR)
                .and_then(Value::as_str)
                .ok_or_else(|| SyncError::config("custom sync-down target without implementation"))?
        } else {
            kind
        };
        let factory = self
            .down
            .get(name)
            .ok_or_else(|| SyncError::config(format!("unknown sync-down target: {name}")))?;
        factory(config)
    }
}
