/**
 * Plugin hooks specializing the watcher cache for one resource type
 *
 * The cache only moves bytes around. What gets stored for an object, how it
 * is decoded on read, and whether a delete should touch the store is up to
 * the hooks.
 */
use crate::error::Result;
use crate::k8s::utils::{check_generation, namespaced_name};
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[async_trait]
pub trait CacheHooks: Send + Sync + 'static {
    /// Decoded form of a stored value, returned by the cache's reads
    type Value: Send + 'static;

    /// Value to store for a new key, `None` to store nothing
    async fn on_add(&self, key: &str, obj: &DynamicObject) -> Result<Option<Vec<u8>>>;

    /// Value to store for a key that is already cached. `old` is what is
    /// stored right now, so the hook can decide whether anything changed.
    async fn on_modify(&self, key: &str, obj: &DynamicObject, old: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Decode a stored value
    async fn on_get(&self, key: &str, value: &[u8]) -> Result<Self::Value>;

    /// The object behind `key` is gone. Returns whether the stored value
    /// should be deleted as well.
    async fn on_delete(&self, key: &str) -> Result<bool>;

    /// The cache is about to be flushed and rebuilt. Clear any side state.
    async fn on_resync(&self) -> Result<()>;
}

/// Small summary of an object, as stored by [`ObjectSummaryHooks`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub namespace: String,
    pub name: String,
    pub kind: String,
    pub generation: Option<i64>,
    pub ready: bool,
}

impl ObjectSummary {
    /// # Errors
    ///
    /// Will return `Err` if the object has no name or namespace
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let nn = namespaced_name(obj)?;
        Ok(Self {
            namespace: nn.namespace,
            name: nn.name,
            kind: obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default(),
            generation: obj.metadata.generation,
            ready: is_ready(obj),
        })
    }
}

/// Whether `status.conditions` holds `Ready=True`
#[must_use]
pub fn is_ready(obj: &DynamicObject) -> bool {
    obj.data
        .get("status")
        .and_then(|status| status.get("conditions"))
        .and_then(|conditions| conditions.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
}

/// Caches an [`ObjectSummary`] of every object whose controller has caught up
/// with its latest generation
#[derive(Debug, Default, Clone)]
pub struct ObjectSummaryHooks;

#[async_trait]
impl CacheHooks for ObjectSummaryHooks {
    type Value = ObjectSummary;

    async fn on_add(&self, key: &str, obj: &DynamicObject) -> Result<Option<Vec<u8>>> {
        if !check_generation(obj) {
            debug!("⏳ Skipping [{}], not reconciled yet", key);
            return Ok(None);
        }
        let summary = ObjectSummary::from_object(obj)?;
        Ok(Some(bincode::serialize(&summary)?))
    }

    async fn on_modify(&self, key: &str, obj: &DynamicObject, old: &[u8]) -> Result<Option<Vec<u8>>> {
        if !check_generation(obj) {
            debug!("⏳ Skipping [{}], not reconciled yet", key);
            return Ok(None);
        }
        let summary = ObjectSummary::from_object(obj)?;
        let unchanged = bincode::deserialize::<ObjectSummary>(old).is_ok_and(|prev| prev == summary);
        if unchanged {
            return Ok(None);
        }
        Ok(Some(bincode::serialize(&summary)?))
    }

    async fn on_get(&self, _key: &str, value: &[u8]) -> Result<ObjectSummary> {
        Ok(bincode::deserialize(value)?)
    }

    async fn on_delete(&self, _key: &str) -> Result<bool> {
        Ok(true)
    }

    async fn on_resync(&self) -> Result<()> {
        Ok(())
    }
}
