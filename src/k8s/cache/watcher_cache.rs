/**
 * Namespaced resource watcher cache
 *
 * Mirrors every object of one custom resource type into a key-value store.
 * Watch events only enqueue keys; a worker re-fetches the current object and
 * lets the hooks decide what to store. A broken watch (410 Gone) triggers a
 * resync: flush the store and rebuild it from a fresh list, with readers held
 * off for the duration.
 */
use super::config::{
    CacheConfig, KEY_SEGMENTS_SEPARATOR, MAX_PARALLELISM, MAX_RESYNC_BACKOFF, MAX_RETRIES, WATCH_RETRY_DELAY,
};
use super::errors::{internal_error, invalid_key_error, is_gone, is_not_found};
use super::gate::ResyncGate;
use super::hooks::CacheHooks;
use super::queue::RateLimitingQueue;
use super::store::KeyValueStore;
use crate::error::{Error, Result, handle_error};
use crate::k8s::source::{Gvr, ResourceSource, WatchStream};
use crate::k8s::utils::{NamespacedName, namespaced_name, pretty_print};
use futures::{StreamExt, stream};
use kube::api::{DynamicObject, WatchEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Called when the watch is broken for good and the cache can only serve
/// stale data. Must not return in production; see [`abort_process`].
pub type FatalErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Collaborators of a [`NamespacedResourceWatcherCache`]
pub struct WatcherCacheConfig<H: CacheHooks> {
    pub source: Arc<dyn ResourceSource>,
    pub store: Arc<dyn KeyValueStore>,
    pub hooks: Arc<H>,
    pub settings: CacheConfig,
    /// `None` ends the process with [`abort_process`]
    pub on_fatal: Option<FatalErrorHandler>,
}

/// Default [`FatalErrorHandler`]: log and abort the whole process, not just
/// the task running the watch
pub fn abort_process(err: &Error) {
    error!("💥 Watch can not be restored, exiting: {}", err);
    std::process::abort();
}

/// How a watch stream stopped
enum WatchOutcome {
    /// The cache is shutting down
    Shutdown,
    /// The server closed the stream, e.g. on its timeout
    Closed,
    /// The resource version is too old, only a resync helps
    Gone,
    /// Anything else, retried from the last seen resource version
    Failed(Error),
}

pub struct NamespacedResourceWatcherCache<H: CacheHooks> {
    inner: Arc<Inner<H>>,
}

struct Inner<H: CacheHooks> {
    gvr: Gvr,
    source: Arc<dyn ResourceSource>,
    store: Arc<dyn KeyValueStore>,
    hooks: Arc<H>,
    queue: Arc<RateLimitingQueue>,
    // held for read by every get and every worker, for write by a resync
    gate: ResyncGate,
    cancel: CancellationToken,
    debug_enabled: bool,
    on_fatal: FatalErrorHandler,
}

impl<H: CacheHooks> std::fmt::Debug for NamespacedResourceWatcherCache<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespacedResourceWatcherCache")
            .field("name", &self.name())
            .field("gvr", &self.inner.gvr)
            .field("queue_len", &self.queue_len())
            .finish()
    }
}

impl<H: CacheHooks> NamespacedResourceWatcherCache<H> {
    /// Check the resource type, populate the store from a fresh list and start
    /// the background workers and the watch. Everything stops once `cancel`
    /// fires or [`NamespacedResourceWatcherCache::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the CRD is not established or the initial sync
    /// keeps failing
    pub async fn new(name: &str, config: WatcherCacheConfig<H>, cancel: &CancellationToken) -> Result<Self> {
        let gvr = config.source.gvr().clone();
        info!("🚀 Starting watcher cache [{}] for {}", name, gvr);

        config.source.check_established().await?;

        let inner = Arc::new(Inner {
            gvr,
            source: config.source,
            store: config.store,
            hooks: config.hooks,
            queue: RateLimitingQueue::new(name, config.settings.debug_watcher_queue),
            gate: ResyncGate::new(),
            cancel: cancel.child_token(),
            debug_enabled: config.settings.debug_watcher_queue,
            on_fatal: config
                .on_fatal
                .unwrap_or_else(|| Arc::new(abort_process) as FatalErrorHandler),
        });

        // bootstrap errors surface here rather than leaving a half initialized cache
        let (resource_version, watch) = inner.resync_and_watch(true).await?;

        for _ in 0..config.settings.watcher_workers.max(1) {
            let worker = Arc::clone(&inner);
            tokio::spawn(async move { worker.run_worker().await });
        }

        let watcher = Arc::clone(&inner);
        tokio::spawn(async move { watcher.watch_loop(resource_version, watch).await });

        let stopper = Arc::clone(&inner);
        tokio::spawn(async move {
            stopper.cancel.cancelled().await;
            stopper.queue.shut_down();
        });

        Ok(Self { inner })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.queue.name()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Cache key of the object `nn`, e.g. `helmrepositories:default:bitnami`
    #[must_use]
    pub fn key_for_namespaced_name(&self, nn: &NamespacedName) -> String {
        self.inner.key_for_namespaced_name(nn)
    }

    /// # Errors
    ///
    /// Will return `Err` if the object has no name or namespace
    pub fn key_for(&self, obj: &DynamicObject) -> Result<String> {
        self.inner.key_for(obj)
    }

    /// # Errors
    ///
    /// Will return `Err` if `key` is not a key of this cache
    pub fn from_key(&self, key: &str) -> Result<NamespacedName> {
        self.inner.from_key(key)
    }

    /// Value cached for `key`. On a miss the value is computed by a worker
    /// first, so `None` means the object does not exist or the hooks chose
    /// not to store it.
    ///
    /// # Errors
    ///
    /// Will return `Err` if `key` is invalid, the store fails, or the stored
    /// value can not be decoded
    pub async fn get(&self, key: &str) -> Result<Option<H::Value>> {
        let _read = self.inner.gate.read().await;
        if self.inner.debug_enabled {
            info!("+get({})", key);
        }
        self.inner.from_key(key)?;

        if let Some(value) = self.inner.fetch_for_one(key).await? {
            return Ok(Some(value));
        }
        // cache miss
        self.inner.compute_and_fetch(key).await
    }

    /// Like [`NamespacedResourceWatcherCache::get`] for many keys at once.
    /// Cached values are read in parallel first, then the misses are computed
    /// in parallel. No resync can happen in between.
    ///
    /// # Errors
    ///
    /// Will return `Err` aggregating every failed key
    pub async fn get_multiple(&self, keys: &[String]) -> Result<HashMap<String, Option<H::Value>>> {
        let _read = self.inner.gate.read().await;
        if self.inner.debug_enabled {
            info!("+get_multiple({:?})", keys);
        }
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        for key in keys {
            self.inner.from_key(key)?;
        }

        // first, whatever is cached right now, before it might get evicted
        let fetches: Vec<_> = keys
            .iter()
            .map(|key| async move { (key.clone(), self.inner.fetch_for_one(key).await) })
            .collect();
        let fetched: Vec<(String, Result<Option<H::Value>>)> = stream::iter(fetches)
            .buffer_unordered(MAX_PARALLELISM)
            .collect()
            .await;

        let mut values = HashMap::with_capacity(keys.len());
        let mut misses = Vec::new();
        let mut errs = Vec::new();
        for (key, result) in fetched {
            match result {
                Ok(Some(value)) => {
                    values.insert(key, Some(value));
                }
                Ok(None) => misses.push(key),
                Err(e) => errs.push(e),
            }
        }
        if let Some(err) = Error::aggregate(errs) {
            return Err(err);
        }

        // then compute the misses
        let computes: Vec<_> = misses
            .into_iter()
            .map(|key| async move {
                let result = self.inner.compute_and_fetch(&key).await;
                (key, result)
            })
            .collect();
        let computed: Vec<(String, Result<Option<H::Value>>)> = stream::iter(computes)
            .buffer_unordered(MAX_PARALLELISM)
            .collect()
            .await;

        let mut errs = Vec::new();
        for (key, result) in computed {
            match result {
                Ok(value) => {
                    values.insert(key, value);
                }
                Err(e) => errs.push(e),
            }
        }
        match Error::aggregate(errs) {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }

    /// Mark `key` as about to be added, so waiters keep waiting for it
    pub fn expect_add(&self, key: &str) {
        self.inner.queue.expect_add(key);
    }

    /// Wait until the workers are done with `key`
    pub async fn wait_until_forgotten(&self, key: &str) {
        self.inner.queue.wait_until_forgotten(key).await;
    }

    /// Stop the workers and the watch
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.queue.shut_down();
    }
}

impl<H: CacheHooks> Inner<H> {
    fn key_for_namespaced_name(&self, nn: &NamespacedName) -> String {
        [self.gvr.resource.as_str(), nn.namespace.as_str(), nn.name.as_str()].join(KEY_SEGMENTS_SEPARATOR)
    }

    fn key_for(&self, obj: &DynamicObject) -> Result<String> {
        Ok(self.key_for_namespaced_name(&namespaced_name(obj)?))
    }

    fn from_key(&self, key: &str) -> Result<NamespacedName> {
        let parts: Vec<&str> = key.split(KEY_SEGMENTS_SEPARATOR).collect();
        match parts.as_slice() {
            [resource, namespace, name]
                if *resource == self.gvr.resource && !namespace.is_empty() && !name.is_empty() =>
            {
                Ok(NamespacedName {
                    namespace: (*namespace).to_string(),
                    name: (*name).to_string(),
                })
            }
            _ => Err(invalid_key_error(key)),
        }
    }

    async fn run_worker(&self) {
        info!("⚙️  [{}] worker started", self.queue.name());
        while self.process_next_work_item().await {}
    }

    /// Take one key off the queue and sync it. Returns false once the queue
    /// is shutting down.
    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            info!("[{}] worker shutting down...", self.queue.name());
            return false;
        };

        let _read = self.gate.read().await;
        if !self.queue.is_processing(&key) {
            // a resync ran between get() and here, the item is stale
            return true;
        }

        match self.sync_handler(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(e) if self.queue.num_requeues(&key) < MAX_RETRIES => {
                error!(
                    "❌ Error processing [{}] (will retry [{}] times): {}",
                    key,
                    MAX_RETRIES - self.queue.num_requeues(&key),
                    e
                );
                self.queue.add_rate_limited(&key);
            }
            Err(e) => {
                error!("❌ Error processing [{}] (giving up): {}", key, e);
                self.queue.forget(&key);
                handle_error(&Error::Custom(format!("error syncing key [{key}] due to: {e}")));
            }
        }
        self.queue.done(&key);
        true
    }

    /// Bring the stored value for `key` in line with the object's current
    /// state. The watch event that led here is not trusted.
    async fn sync_handler(&self, key: &str) -> Result<()> {
        debug!("+sync_handler({})", key);
        let nn = self.from_key(key)?;
        match self.source.get(&nn.namespace, &nn.name).await {
            Ok(Some(obj)) => self.on_add_or_modify(true, &obj).await,
            Ok(None) => self.on_delete(key).await,
            Err(e) if is_not_found(&e) => self.on_delete(key).await,
            Err(e) => Err(internal_error(format!("error fetching object with key [{key}]: {e}"))),
        }
    }

    async fn on_add_or_modify(&self, check_old_value: bool, obj: &DynamicObject) -> Result<()> {
        let key = self.key_for(obj)?;

        let old_value = if check_old_value { self.store.get(&key).await? } else { None };

        let (hook, result) = match old_value {
            None => ("on_add", self.hooks.on_add(&key, obj).await),
            Some(old) => ("on_modify", self.hooks.on_modify(&key, obj, &old).await),
        };

        match result {
            Err(e) => {
                error!("❌ Invocation of [{}] for object {}\nfailed due to: {}", hook, pretty_print(obj), e);
                // clear the key so the store holds nothing stale for this object
                match self.store.del(&key).await {
                    Ok(removed) => info!("🗑️  [DEL {}]: {}", key, removed),
                    Err(e2) => error!("❌ Failed to delete value for object [{}] from cache due to: {}", key, e2),
                }
                Err(e)
            }
            Ok(Some(value)) => {
                let start = Instant::now();
                self.store.set(&key, &value).await?;
                if self.debug_enabled {
                    let (used, total) = self.store.memory_stats().await?;
                    info!(
                        "💾 [SET {}]: {} bytes in [{}] ms. [INFO memory]: [{}/{}]",
                        key,
                        value.len(),
                        start.elapsed().as_millis(),
                        used,
                        total
                    );
                } else {
                    debug!("💾 [SET {}]: {} bytes in [{}] ms", key, value.len(), start.elapsed().as_millis());
                }
                Ok(())
            }
            Ok(None) => Ok(()),
        }
    }

    async fn on_delete(&self, key: &str) -> Result<()> {
        let delete = self.hooks.on_delete(key).await.map_err(|e| {
            error!("❌ Invocation of [on_delete] for object with key [{}] failed due to: {}", key, e);
            e
        })?;
        if delete {
            let removed = self.store.del(key).await?;
            info!("🗑️  [DEL {}]: {}", key, removed);
        }
        Ok(())
    }

    /// Pure cache read, `None` on a miss
    async fn fetch_for_one(&self, key: &str) -> Result<Option<H::Value>> {
        let Some(bytes) = self.store.get(key).await? else {
            debug!("🔍 [GET {}]: miss", key);
            return Ok(None);
        };
        debug!("🔍 [GET {}]: {} bytes read", key, bytes.len());
        let value = self.hooks.on_get(key, &bytes).await.map_err(|e| {
            error!("❌ Invocation of [on_get] for object with key [{}] failed due to: {}", key, e);
            e
        })?;
        Ok(Some(value))
    }

    /// Have a worker compute `key`, wait for it, then read the result
    async fn compute_and_fetch(&self, key: &str) -> Result<Option<H::Value>> {
        self.queue.add(key);
        self.queue.wait_until_forgotten(key).await;
        self.fetch_for_one(key).await
    }

    /// Flush the store and rebuild it from a fresh list. Must run with the
    /// write side of the gate held. Returns the resource version of the list.
    async fn resync(&self, bootstrap: bool) -> Result<String> {
        info!(
            "🔄 +resync(bootstrap={}), queue: [{}], size: [{}]",
            bootstrap,
            self.queue.name(),
            self.queue.len()
        );
        if !self.gate.is_write_locked() {
            return Err(internal_error("Invalid state of the cache in resync()"));
        }

        // the queue is empty on bootstrap
        if !bootstrap {
            info!("Resetting work queue [{}]...", self.queue.name());
            self.queue.reset();
            self.hooks
                .on_resync()
                .await
                .map_err(|e| internal_error(format!("invocation of [on_resync] failed due to: {e}")))?;
        }

        self.store.flush_db().await?;
        info!("🧹 [FLUSHDB]: OK");

        let (items, resource_version) = self.source.list().await?;
        info!(
            "📋 List({}) returned [{}] items, resource version [{}]",
            self.gvr.resource,
            items.len(),
            resource_version
        );

        // one object failing to sync should not fail the whole resync
        if let Err(e) = self.populate_with(&items).await {
            handle_error(&Error::Custom(format!("populate_with failed due to: {e}")));
        }
        Ok(resource_version)
    }

    /// Compute values for all listed objects in parallel, writing straight
    /// to the store. Only used by resync, after the store was flushed.
    async fn populate_with(&self, items: &[DynamicObject]) -> Result<()> {
        if !self.gate.is_write_locked() {
            return Err(internal_error("Invalid state of the cache in populate_with()"));
        }
        let updates: Vec<_> = items.iter().map(|item| self.on_add_or_modify(false, item)).collect();
        let results: Vec<Result<()>> = stream::iter(updates)
            .buffer_unordered(MAX_PARALLELISM)
            .collect()
            .await;

        let errs = results.into_iter().filter_map(std::result::Result::err).collect();
        Error::aggregate(errs).map_or(Ok(()), Err)
    }

    /// Resync and open a watch from the listed resource version, retrying
    /// with a doubling wait
    async fn resync_and_watch(&self, bootstrap: bool) -> Result<(String, WatchStream)> {
        let _write = self.gate.write().await;

        let mut last_err = internal_error("resync was not attempted");
        for attempt in 0..MAX_RESYNC_BACKOFF {
            match self.resync(bootstrap).await {
                Ok(resource_version) => match self.source.watch(&resource_version).await {
                    Ok(watch) => {
                        info!("✅ [{}] watching from resource version [{}]", self.queue.name(), resource_version);
                        return Ok((resource_version, watch));
                    }
                    Err(e) => {
                        handle_error(&Error::Custom(format!("failed to start a new watch due to: {e}")));
                        last_err = e;
                    }
                },
                Err(e) => {
                    handle_error(&Error::Custom(format!("failed to resync due to: {e}")));
                    last_err = e;
                }
            }
            let wait = Duration::from_secs(2_u64.pow(attempt));
            info!("⏳ Waiting [{}] seconds before retrying to resync()...", wait.as_secs());
            if self.sleep_or_cancelled(wait).await {
                return Err(internal_error(format!("resync of [{}] cancelled", self.gvr)));
            }
        }
        Err(last_err)
    }

    async fn watch_loop(self: Arc<Self>, mut resource_version: String, watch: WatchStream) {
        let mut current = Some(watch);
        loop {
            let watch = match current.take() {
                Some(watch) => watch,
                None => match self.source.watch(&resource_version).await {
                    Ok(watch) => watch,
                    Err(e) if is_gone(&e) => {
                        let Some((rv, watch)) = self.resync_or_die(e).await else {
                            return;
                        };
                        resource_version = rv;
                        current = Some(watch);
                        continue;
                    }
                    Err(e) => {
                        warn!("⚠️  [{}] failed to re-open watch: {}", self.queue.name(), e);
                        if self.sleep_or_cancelled(WATCH_RETRY_DELAY).await {
                            return;
                        }
                        continue;
                    }
                },
            };

            match self.process_events(watch, &mut resource_version).await {
                WatchOutcome::Shutdown => {
                    info!("🛑 [{}] watch loop shutting down", self.queue.name());
                    return;
                }
                WatchOutcome::Closed => {
                    debug!("🔍 [{}] watch closed, re-opening from [{}]", self.queue.name(), resource_version);
                }
                WatchOutcome::Gone => {
                    let cause = internal_error(format!("watch of [{}] is gone", self.gvr));
                    let Some((rv, watch)) = self.resync_or_die(cause).await else {
                        return;
                    };
                    resource_version = rv;
                    current = Some(watch);
                }
                WatchOutcome::Failed(e) => {
                    warn!("⚠️  [{}] watch failed, retrying: {}", self.queue.name(), e);
                    if self.sleep_or_cancelled(WATCH_RETRY_DELAY).await {
                        return;
                    }
                }
            }
        }
    }

    /// A watch that can not be resumed leaves a resync as the only way to
    /// stay consistent. If that keeps failing the cache can only serve stale
    /// data, so the fatal handler brings the process down. `None` means the
    /// watch loop must stop.
    async fn resync_or_die(&self, cause: Error) -> Option<(String, WatchStream)> {
        warn!("⚠️  Current watch stopped ({}). Will try resync and a new watch...", cause);
        match self.resync_and_watch(false).await {
            Ok(next) => Some(next),
            Err(_) if self.cancel.is_cancelled() => None,
            Err(e) => {
                let fatal = Error::Custom(format!(
                    "[{}]: Watch loop has been stopped after [{}] retries were exhausted, last error: {}",
                    self.queue.name(),
                    MAX_RESYNC_BACKOFF,
                    e
                ));
                (self.on_fatal)(&fatal);
                None
            }
        }
    }

    async fn process_events(&self, mut watch: WatchStream, resource_version: &mut String) -> WatchOutcome {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return WatchOutcome::Shutdown,
                next = watch.next() => match next {
                    None => return WatchOutcome::Closed,
                    Some(Err(e)) if is_gone(&e) => return WatchOutcome::Gone,
                    Some(Err(e)) => return WatchOutcome::Failed(e),
                    Some(Ok(event)) => {
                        if let Some(outcome) = self.process_one_event(event, resource_version) {
                            return outcome;
                        }
                    }
                },
            }
        }
    }

    fn process_one_event(&self, event: WatchEvent<DynamicObject>, resource_version: &mut String) -> Option<WatchOutcome> {
        let (kind, obj) = match event {
            WatchEvent::Added(obj) => ("➕ Added", obj),
            WatchEvent::Modified(obj) => ("📝 Modified", obj),
            WatchEvent::Deleted(obj) => ("🗑️  Deleted", obj),
            WatchEvent::Bookmark(bookmark) => {
                *resource_version = bookmark.metadata.resource_version;
                return None;
            }
            WatchEvent::Error(resp) if resp.code == 410 => {
                warn!("⚠️  [{}] watch expired: {}", self.queue.name(), resp.message);
                return Some(WatchOutcome::Gone);
            }
            WatchEvent::Error(resp) => {
                return Some(WatchOutcome::Failed(Error::Kube(kube::Error::Api(resp))));
            }
        };

        if let Some(rv) = obj.metadata.resource_version.as_ref().filter(|rv| !rv.is_empty()) {
            resource_version.clone_from(rv);
        }
        if self.debug_enabled {
            info!("{}: {}", kind, pretty_print(&obj));
        } else {
            debug!(
                "{}: {}/{}",
                kind,
                obj.metadata.namespace.as_deref().unwrap_or_default(),
                obj.metadata.name.as_deref().unwrap_or_default()
            );
        }

        match self.key_for(&obj) {
            Ok(key) => self.queue.add_rate_limited(&key),
            Err(e) => handle_error(&e),
        }
        None
    }

    /// Returns true if cancelled while sleeping
    async fn sleep_or_cancelled(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(delay) => false,
        }
    }
}
