mod common;

use common::{FakeSource, RepoIndex, RepoIndexHooks, TIMEOUT, eventually, helm_repository};
use kube::api::WatchEvent;
use kubecache::error::Error;
use kubecache::k8s::cache::config::MAX_RESYNC_BACKOFF;
use kubecache::k8s::cache::{
    FatalErrorHandler, KeyValueStore, MemoryStore, NamespacedResourceWatcherCache, WatcherCacheConfig,
};
use kubecache::k8s::source::ResourceSource;
use kubecache::k8s::utils::NamespacedName;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const BITNAMI: &str = "helmrepositories:default:bitnami";
const PODINFO: &str = "helmrepositories:default:podinfo";

struct Fixture {
    source: Arc<FakeSource>,
    store: Arc<MemoryStore>,
    hooks: Arc<RepoIndexHooks>,
    cancel: CancellationToken,
    fatal_errors: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            source: Arc::new(FakeSource::new()),
            store: Arc::new(MemoryStore::new()),
            hooks: Arc::new(RepoIndexHooks::default()),
            cancel: CancellationToken::new(),
            fatal_errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn fatal_errors(&self) -> Vec<String> {
        self.fatal_errors.lock().unwrap().clone()
    }

    async fn start(&self) -> kubecache::error::Result<NamespacedResourceWatcherCache<RepoIndexHooks>> {
        let source: Arc<dyn ResourceSource> = self.source.clone();
        let store: Arc<dyn KeyValueStore> = self.store.clone();
        let fatal_errors = Arc::clone(&self.fatal_errors);
        let on_fatal: FatalErrorHandler = Arc::new(move |err: &Error| {
            fatal_errors.lock().unwrap().push(err.to_string());
        });
        let config = WatcherCacheConfig {
            source,
            store,
            hooks: Arc::clone(&self.hooks),
            settings: kubecache::k8s::cache::CacheConfig::default(),
            on_fatal: Some(on_fatal),
        };
        timeout(TIMEOUT, NamespacedResourceWatcherCache::new("helmrepositories", config, &self.cancel))
            .await
            .expect("cache did not start in time")
    }

    async fn stored(&self, key: &str) -> Option<RepoIndex> {
        let bytes = self.store.get(key).await.unwrap()?;
        Some(bincode::deserialize(&bytes).unwrap())
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn wait_for(cache: &NamespacedResourceWatcherCache<RepoIndexHooks>, key: &str) {
    timeout(TIMEOUT, cache.wait_until_forgotten(key))
        .await
        .expect("key was not processed in time");
}

#[tokio::test]
async fn test_bootstrap_populates_store() {
    let fixture = Fixture::new();
    fixture.source.put(helm_repository("default", "bitnami", 120, "10"));
    fixture.source.put(helm_repository("default", "podinfo", 7, "11"));

    let cache = fixture.start().await.unwrap();

    assert_eq!(fixture.store.keys(), vec![BITNAMI.to_string(), PODINFO.to_string()]);
    assert_eq!(fixture.stored(BITNAMI).await, Some(RepoIndex { index_size: 120 }));
    assert_eq!(fixture.source.list_calls(), 1);
    assert_eq!(fixture.source.watch_resource_versions(), vec!["1".to_string()]);
    assert_eq!(cache.get(PODINFO).await.unwrap(), Some(RepoIndex { index_size: 7 }));
}

#[tokio::test]
async fn test_bootstrap_logs_hook_failures() {
    let fixture = Fixture::new();
    fixture.source.put(helm_repository("default", "bitnami", 120, "10"));
    fixture.hooks.failing.store(true, Ordering::SeqCst);

    let _cache = fixture.start().await.unwrap();
    assert!(fixture.store.is_empty());
}

#[tokio::test]
async fn test_rejects_resource_that_is_not_established() {
    let fixture = Fixture::new();
    fixture.source.set_established(false);

    assert!(fixture.start().await.is_err());
    assert_eq!(fixture.source.list_calls(), 0);
}

#[tokio::test]
async fn test_added_event_is_computed_by_worker() {
    let fixture = Fixture::new();
    let cache = fixture.start().await.unwrap();
    assert!(fixture.store.is_empty());

    let obj = helm_repository("default", "bitnami", 120, "12");
    fixture.source.put(obj.clone());
    cache.expect_add(BITNAMI);
    fixture.source.send_event(WatchEvent::Added(obj));
    wait_for(&cache, BITNAMI).await;

    // what redis holds decodes to the computed value
    assert_eq!(fixture.stored(BITNAMI).await, Some(RepoIndex { index_size: 120 }));
}

#[tokio::test]
async fn test_modified_event_refetches_current_state() {
    let fixture = Fixture::new();
    fixture.source.put(helm_repository("default", "bitnami", 120, "10"));
    let cache = fixture.start().await.unwrap();

    // the event payload is stale, the source already has a newer object
    fixture.source.put(helm_repository("default", "bitnami", 300, "14"));
    cache.expect_add(BITNAMI);
    fixture
        .source
        .send_event(WatchEvent::Modified(helm_repository("default", "bitnami", 200, "13")));
    wait_for(&cache, BITNAMI).await;

    assert_eq!(cache.get(BITNAMI).await.unwrap(), Some(RepoIndex { index_size: 300 }));
}

#[tokio::test]
async fn test_get_miss_computes_value() {
    let fixture = Fixture::new();
    let cache = fixture.start().await.unwrap();

    // created without any watch event reaching the cache
    fixture.source.put(helm_repository("default", "bitnami", 120, "12"));

    let value = timeout(TIMEOUT, cache.get(BITNAMI)).await.unwrap().unwrap();
    assert_eq!(value, Some(RepoIndex { index_size: 120 }));
    assert_eq!(fixture.stored(BITNAMI).await, Some(RepoIndex { index_size: 120 }));
}

#[tokio::test]
async fn test_get_of_missing_object() {
    let fixture = Fixture::new();
    let cache = fixture.start().await.unwrap();

    let value = timeout(TIMEOUT, cache.get(BITNAMI)).await.unwrap().unwrap();
    assert!(value.is_none());
}

#[tokio::test]
async fn test_delete_is_terminal() {
    let fixture = Fixture::new();
    let obj = helm_repository("default", "bitnami", 120, "10");
    fixture.source.put(obj.clone());
    let cache = fixture.start().await.unwrap();
    assert!(fixture.stored(BITNAMI).await.is_some());

    fixture.source.remove("default", "bitnami");
    cache.expect_add(BITNAMI);
    fixture.source.send_event(WatchEvent::Deleted(obj.clone()));
    wait_for(&cache, BITNAMI).await;
    assert!(fixture.stored(BITNAMI).await.is_none());

    // a late event for the deleted object must not bring it back
    cache.expect_add(BITNAMI);
    fixture.source.send_event(WatchEvent::Modified(obj));
    wait_for(&cache, BITNAMI).await;
    assert!(fixture.stored(BITNAMI).await.is_none());
    assert!(timeout(TIMEOUT, cache.get(BITNAMI)).await.unwrap().unwrap().is_none());
}

#[tokio::test]
async fn test_hook_failure_clears_key() {
    let fixture = Fixture::new();
    let obj = helm_repository("default", "bitnami", 120, "10");
    fixture.source.put(obj.clone());
    let cache = fixture.start().await.unwrap();
    assert!(fixture.stored(BITNAMI).await.is_some());

    fixture.hooks.failing.store(true, Ordering::SeqCst);
    cache.expect_add(BITNAMI);
    fixture.source.send_event(WatchEvent::Modified(obj));
    wait_for(&cache, BITNAMI).await;

    assert!(fixture.stored(BITNAMI).await.is_none());
}

#[tokio::test]
async fn test_get_multiple() {
    let fixture = Fixture::new();
    fixture.source.put(helm_repository("default", "bitnami", 120, "10"));
    let cache = fixture.start().await.unwrap();
    fixture.source.put(helm_repository("default", "podinfo", 7, "11"));

    let missing = "helmrepositories:other:missing".to_string();
    let keys = vec![BITNAMI.to_string(), PODINFO.to_string(), missing.clone()];
    let values = timeout(TIMEOUT, cache.get_multiple(&keys)).await.unwrap().unwrap();

    assert_eq!(values.len(), 3);
    assert_eq!(values[BITNAMI], Some(RepoIndex { index_size: 120 }));
    assert_eq!(values[PODINFO], Some(RepoIndex { index_size: 7 }));
    assert_eq!(values[&missing], None);

    assert!(cache.get_multiple(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_keys() {
    let fixture = Fixture::new();
    let cache = fixture.start().await.unwrap();

    assert!(cache.get("helmcharts:default:bitnami/nginx:1.2.3").await.is_err());
    assert!(cache.get("helmrepositories:default").await.is_err());
    assert!(cache.get("helmrepositories::bitnami").await.is_err());
    assert!(
        cache
            .get_multiple(&[BITNAMI.to_string(), "bogus".to_string()])
            .await
            .is_err()
    );

    let nn = cache.from_key(BITNAMI).unwrap();
    assert_eq!(nn, NamespacedName { namespace: "default".to_string(), name: "bitnami".to_string() });
    assert_eq!(cache.key_for_namespaced_name(&nn), BITNAMI);
    assert_eq!(cache.key_for(&helm_repository("default", "bitnami", 1, "1")).unwrap(), BITNAMI);
}

#[tokio::test]
async fn test_closed_watch_resumes_from_last_resource_version() {
    let fixture = Fixture::new();
    let obj = helm_repository("default", "bitnami", 120, "7");
    fixture.source.put(obj.clone());
    let cache = fixture.start().await.unwrap();

    cache.expect_add(BITNAMI);
    fixture.source.send_event(WatchEvent::Modified(obj));
    wait_for(&cache, BITNAMI).await;
    fixture.source.close_watch();

    let source = Arc::clone(&fixture.source);
    eventually(|| {
        let source = Arc::clone(&source);
        async move { source.watch_resource_versions().len() == 2 }
    })
    .await;
    assert_eq!(fixture.source.watch_resource_versions(), vec!["1".to_string(), "7".to_string()]);
    assert_eq!(fixture.source.list_calls(), 1);
    assert_eq!(fixture.hooks.resyncs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_gone_watch_triggers_single_resync() {
    let fixture = Fixture::new();
    fixture.source.put(helm_repository("default", "bitnami", 120, "10"));
    let _cache = fixture.start().await.unwrap();

    // state changed while the watch was broken
    fixture.source.remove("default", "bitnami");
    fixture.source.put(helm_repository("default", "podinfo", 7, "2200650"));
    fixture.source.set_list_resource_version("2200654");
    fixture.source.send_gone();

    let source = Arc::clone(&fixture.source);
    eventually(|| {
        let source = Arc::clone(&source);
        async move { source.watch_resource_versions().len() == 2 }
    })
    .await;

    assert_eq!(
        fixture.source.watch_resource_versions(),
        vec!["1".to_string(), "2200654".to_string()]
    );
    assert_eq!(fixture.source.list_calls(), 2);
    assert_eq!(fixture.hooks.resyncs.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.store.keys(), vec![PODINFO.to_string()]);
    assert!(fixture.fatal_errors().is_empty());
}

#[tokio::test]
async fn test_reads_wait_for_resync_to_finish() {
    let fixture = Fixture::new();
    fixture.source.put(helm_repository("default", "bitnami", 120, "10"));
    let cache = fixture.start().await.unwrap();
    assert_eq!(cache.get(BITNAMI).await.unwrap(), Some(RepoIndex { index_size: 120 }));

    fixture.source.put(helm_repository("default", "bitnami", 300, "20"));
    fixture.source.put(helm_repository("default", "podinfo", 7, "21"));
    fixture.source.set_list_resource_version("22");
    fixture.source.hold_lists(true);
    fixture.source.send_gone();
    timeout(TIMEOUT, fixture.source.list_entered()).await.unwrap();

    // the store is flushed and being rebuilt
    assert!(fixture.store.is_empty());
    let keys = vec![BITNAMI.to_string(), PODINFO.to_string()];
    let get = cache.get(BITNAMI);
    let get_multiple = cache.get_multiple(&keys);
    tokio::pin!(get, get_multiple);
    assert!(timeout(Duration::from_millis(200), &mut get).await.is_err());
    assert!(timeout(Duration::from_millis(200), &mut get_multiple).await.is_err());

    fixture.source.release_list();

    let value = timeout(TIMEOUT, &mut get).await.unwrap().unwrap();
    assert_eq!(value, Some(RepoIndex { index_size: 300 }));
    let values = timeout(TIMEOUT, &mut get_multiple).await.unwrap().unwrap();
    assert_eq!(values[BITNAMI], Some(RepoIndex { index_size: 300 }));
    assert_eq!(values[PODINFO], Some(RepoIndex { index_size: 7 }));
    assert_eq!(fixture.source.list_calls(), 2);
}

#[tokio::test]
async fn test_exhausted_resync_is_fatal() {
    let fixture = Fixture::new();
    fixture.source.put(helm_repository("default", "bitnami", 120, "10"));
    let _cache = fixture.start().await.unwrap();

    fixture.source.fail_lists(true);
    fixture.source.send_gone();

    // one attempt per backoff step, 1s + 2s apart
    let fixture_ref = &fixture;
    eventually(|| async move { !fixture_ref.fatal_errors().is_empty() }).await;

    let fatal_errors = fixture.fatal_errors();
    assert_eq!(fatal_errors.len(), 1);
    assert!(fatal_errors[0].contains("retries were exhausted"));
    assert_eq!(fixture.source.list_calls(), 1 + MAX_RESYNC_BACKOFF as usize);
    // no watch was opened after the failed resyncs
    assert_eq!(fixture.source.watch_resource_versions(), vec!["1".to_string()]);
}

#[tokio::test]
async fn test_shutdown_during_resync_backoff_is_not_fatal() {
    let fixture = Fixture::new();
    let cache = fixture.start().await.unwrap();

    fixture.source.fail_lists(true);
    fixture.source.send_gone();
    let source = Arc::clone(&fixture.source);
    eventually(|| {
        let source = Arc::clone(&source);
        async move { source.list_calls() == 2 }
    })
    .await;

    // cancelled while waiting for the next attempt
    cache.shutdown();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(fixture.source.list_calls(), 2);
    assert!(fixture.fatal_errors().is_empty());
}

#[tokio::test]
async fn test_shutdown_unblocks_readers() {
    let fixture = Fixture::new();
    let cache = fixture.start().await.unwrap();
    cache.shutdown();

    fixture.source.put(helm_repository("default", "bitnami", 120, "12"));
    let value = timeout(TIMEOUT, cache.get(BITNAMI)).await.unwrap().unwrap();
    assert!(value.is_none());
}
