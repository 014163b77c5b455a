/**
 * Source of truth for the watcher cache
 *
 * List/get/watch over one custom resource type, in all namespaces. The
 * Kubernetes implementation talks to the API server with dynamic objects, so
 * any CRD can be cached without generated types.
 */
use super::cache::config::WATCH_TIMEOUT_SECONDS;
use super::cache::errors::{failed_precondition_error, internal_error};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, WatchEvent, WatchParams};
use kube::core::GroupVersionKind;
use kube::Client;
use tracing::{debug, info};

/// Group-Version-Resource of the watched custom resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    #[must_use]
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    /// Name of the CRD defining this resource, e.g.
    /// `helmrepositories.source.toolkit.fluxcd.io`
    #[must_use]
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.resource, self.group)
    }
}

impl std::fmt::Display for Gvr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}, Resource={}", self.group, self.version, self.resource)
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent<DynamicObject>>>;

/// What the watcher cache needs to know about the resources it mirrors
#[async_trait]
pub trait ResourceSource: Send + Sync {
    fn gvr(&self) -> &Gvr;

    /// Fail unless the resource type is registered and established
    async fn check_established(&self) -> Result<()>;

    /// Every object in every namespace, plus the resource version of the list
    async fn list(&self) -> Result<(Vec<DynamicObject>, String)>;

    /// The current state of one object, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>>;

    /// Change events following `resource_version`. The stream ends when the
    /// server closes the watch.
    async fn watch(&self, resource_version: &str) -> Result<WatchStream>;
}

/// [`ResourceSource`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeResourceSource {
    client: Client,
    gvr: Gvr,
    api_resource: ApiResource,
}

impl std::fmt::Debug for KubeResourceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResourceSource").field("gvr", &self.gvr).finish_non_exhaustive()
    }
}

impl KubeResourceSource {
    /// Resolve the kind of `gvr` from its CRD
    ///
    /// # Errors
    ///
    /// Will return `Err` if the CRD does not exist or can not be read
    pub async fn new(client: Client, gvr: Gvr) -> Result<Self> {
        let crd = fetch_crd(&client, &gvr).await?;
        let kind = crd.spec.names.kind.clone();
        let gvk = GroupVersionKind::gvk(&gvr.group, &gvr.version, &kind);
        let api_resource = ApiResource::from_gvk_with_plural(&gvk, &gvr.resource);
        debug!("🔍 Resolved {} to kind {}", gvr, kind);

        Ok(Self {
            client,
            gvr,
            api_resource,
        })
    }

    fn api_all(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.api_resource)
    }
}

async fn fetch_crd(client: &Client, gvr: &Gvr) -> Result<CustomResourceDefinition> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    crds.get_opt(&gvr.crd_name())
        .await?
        .ok_or_else(|| failed_precondition_error(format!("CRD [{}] is not registered", gvr.crd_name())))
}

/// Whether the CRD carries the `Established=True` condition
#[must_use]
pub fn is_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        })
}

#[async_trait]
impl ResourceSource for KubeResourceSource {
    fn gvr(&self) -> &Gvr {
        &self.gvr
    }

    async fn check_established(&self) -> Result<()> {
        let crd = fetch_crd(&self.client, &self.gvr).await?;
        if is_established(&crd) {
            info!("✅ CRD [{}] is established", self.gvr.crd_name());
            Ok(())
        } else {
            Err(failed_precondition_error(format!(
                "CRD [{}] is not established",
                self.gvr.crd_name()
            )))
        }
    }

    async fn list(&self) -> Result<(Vec<DynamicObject>, String)> {
        // no resource version, so this always returns the most recent state
        let list = self.api_all().list(&ListParams::default()).await?;
        let resource_version = list
            .metadata
            .resource_version
            .filter(|rv| !rv.is_empty())
            .ok_or_else(|| internal_error(format!("list of [{}] carries no resource version", self.gvr)))?;
        Ok((list.items, resource_version))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &self.api_resource);
        Ok(api.get_opt(name).await?)
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream> {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECONDS);
        let stream = self.api_all().watch(&wp, resource_version).await?;
        Ok(stream.map_err(Error::from).boxed())
    }
}
