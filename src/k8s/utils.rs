use super::cache::errors::invalid_argument_error;
use crate::error::Result;
use k8s_openapi::serde_json;
use kube::ResourceExt;
use kube::api::DynamicObject;
use serde::Serialize;

/// Namespace and name of a namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// # Errors
///
/// Will return `Err` if the object has no name or no namespace
pub fn namespaced_name(obj: &DynamicObject) -> Result<NamespacedName> {
    let name = obj.metadata.name.clone().filter(|n| !n.is_empty());
    let namespace = obj.namespace().filter(|n| !n.is_empty());
    match (namespace, name) {
        (Some(namespace), Some(name)) => Ok(NamespacedName { namespace, name }),
        _ => Err(invalid_argument_error(format!(
            "required field metadata.name/metadata.namespace not found on {}",
            obj.types.as_ref().map_or("object", |t| t.kind.as_str())
        ))),
    }
}

/// Whether the controller has caught up with the latest spec change, i.e.
/// `status.observedGeneration` equals `metadata.generation`
#[must_use]
pub fn check_generation(obj: &DynamicObject) -> bool {
    let Some(generation) = obj.metadata.generation else {
        return false;
    };
    obj.data
        .get("status")
        .and_then(|status| status.get("observedGeneration"))
        .and_then(serde_json::Value::as_i64)
        .is_some_and(|observed| observed == generation)
}

/// Indented JSON for log output. Falls back to `Debug` if serialization fails
pub fn pretty_print<T: Serialize + std::fmt::Debug>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| format!("{value:?}"))
}
