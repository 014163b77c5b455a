#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::serde_json::json;
use kube::api::{ApiResource, DynamicObject, WatchEvent};
use kube::core::GroupVersionKind;
use kube::error::ErrorResponse;
use kubecache::error::{Error, Result};
use kubecache::k8s::cache::CacheHooks;
use kubecache::k8s::source::{Gvr, ResourceSource, WatchStream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::sync::{Notify, Semaphore};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn helm_repositories() -> Gvr {
    Gvr::new("source.toolkit.fluxcd.io", "v1beta2", "helmrepositories")
}

/// A `HelmRepository` whose status reports an index of `index_size` bytes
pub fn helm_repository(namespace: &str, name: &str, index_size: u64, resource_version: &str) -> DynamicObject {
    let gvk = GroupVersionKind::gvk("source.toolkit.fluxcd.io", "v1beta2", "HelmRepository");
    let ar = ApiResource::from_gvk_with_plural(&gvk, "helmrepositories");
    let mut obj = DynamicObject::new(name, &ar).within(namespace).data(json!({
        "spec": { "url": format!("https://charts.example.com/{name}") },
        "status": { "indexSize": index_size }
    }));
    obj.metadata.resource_version = Some(resource_version.to_string());
    obj
}

pub fn gone() -> ErrorResponse {
    ErrorResponse {
        status: "Failure".to_string(),
        message: "too old resource version: 1 (2200654)".to_string(),
        reason: "Expired".to_string(),
        code: 410,
    }
}

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<(String, String), DynamicObject>,
    not_established: bool,
    list_resource_version: String,
    list_calls: usize,
    hold_lists: bool,
    fail_lists: bool,
    watch_resource_versions: Vec<String>,
    sender: Option<UnboundedSender<Result<WatchEvent<DynamicObject>>>>,
}

/// In-memory [`ResourceSource`]. Watch events are whatever the test sends.
pub struct FakeSource {
    gvr: Gvr,
    state: Mutex<FakeState>,
    list_entered: Notify,
    list_release: Semaphore,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            gvr: helm_repositories(),
            state: Mutex::new(FakeState {
                list_resource_version: "1".to_string(),
                ..FakeState::default()
            }),
            list_entered: Notify::new(),
            list_release: Semaphore::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn put(&self, obj: DynamicObject) {
        let key = (obj.metadata.namespace.clone().unwrap(), obj.metadata.name.clone().unwrap());
        self.lock().objects.insert(key, obj);
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.lock().objects.remove(&(namespace.to_string(), name.to_string()))
    }

    pub fn set_established(&self, established: bool) {
        self.lock().not_established = !established;
    }

    pub fn set_list_resource_version(&self, resource_version: &str) {
        self.lock().list_resource_version = resource_version.to_string();
    }

    /// Make every following list wait for [`FakeSource::release_list`]
    pub fn hold_lists(&self, hold: bool) {
        self.lock().hold_lists = hold;
    }

    /// Wait until a held list has started
    pub async fn list_entered(&self) {
        self.list_entered.notified().await;
    }

    pub fn release_list(&self) {
        self.list_release.add_permits(1);
    }

    /// Make every following list fail
    pub fn fail_lists(&self, fail: bool) {
        self.lock().fail_lists = fail;
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn watch_resource_versions(&self) -> Vec<String> {
        self.lock().watch_resource_versions.clone()
    }

    /// Push an event into the currently open watch
    pub fn send_event(&self, event: WatchEvent<DynamicObject>) {
        let state = self.lock();
        let sender = state.sender.as_ref().expect("no watch is open");
        sender.send(Ok(event)).expect("watch receiver dropped");
    }

    /// End the currently open watch, as the server does on its timeout
    pub fn close_watch(&self) {
        self.lock().sender = None;
    }

    /// Break the currently open watch with 410 Gone
    pub fn send_gone(&self) {
        self.send_event(WatchEvent::Error(gone()));
    }
}

#[async_trait]
impl ResourceSource for FakeSource {
    fn gvr(&self) -> &Gvr {
        &self.gvr
    }

    async fn check_established(&self) -> Result<()> {
        if self.lock().not_established {
            return Err(Error::Custom(format!("CRD [{}] is not established", self.gvr.crd_name())));
        }
        Ok(())
    }

    async fn list(&self) -> Result<(Vec<DynamicObject>, String)> {
        let (hold, fail) = {
            let mut state = self.lock();
            state.list_calls += 1;
            (state.hold_lists, state.fail_lists)
        };
        if hold {
            self.list_entered.notify_one();
            self.list_release.acquire().await.unwrap().forget();
        }
        if fail {
            return Err(Error::Custom("the server is currently unable to handle the request".to_string()));
        }
        let state = self.lock();
        Ok((state.objects.values().cloned().collect(), state.list_resource_version.clone()))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.lock().objects.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream> {
        let (tx, rx) = unbounded_channel();
        let mut state = self.lock();
        state.watch_resource_versions.push(resource_version.to_string());
        state.sender = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIndex {
    pub index_size: u64,
}

/// Stores the index size of every repository. Can be told to fail.
#[derive(Default)]
pub struct RepoIndexHooks {
    pub failing: AtomicBool,
    pub resyncs: AtomicUsize,
}

impl RepoIndexHooks {
    fn value_for(&self, obj: &DynamicObject) -> Result<Option<Vec<u8>>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Custom("index could not be read".to_string()));
        }
        let index_size = obj.data["status"]["indexSize"].as_u64().unwrap_or_default();
        Ok(Some(bincode::serialize(&RepoIndex { index_size })?))
    }
}

#[async_trait]
impl CacheHooks for RepoIndexHooks {
    type Value = RepoIndex;

    async fn on_add(&self, _key: &str, obj: &DynamicObject) -> Result<Option<Vec<u8>>> {
        self.value_for(obj)
    }

    async fn on_modify(&self, _key: &str, obj: &DynamicObject, _old: &[u8]) -> Result<Option<Vec<u8>>> {
        self.value_for(obj)
    }

    async fn on_get(&self, _key: &str, value: &[u8]) -> Result<RepoIndex> {
        Ok(bincode::deserialize(value)?)
    }

    async fn on_delete(&self, _key: &str) -> Result<bool> {
        Ok(true)
    }

    async fn on_resync(&self) -> Result<()> {
        self.resyncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `check` until it holds, failing the test after [`TIMEOUT`]
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
