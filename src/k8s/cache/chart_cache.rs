/**
 * Chart tarball cache
 *
 * Unlike the watcher cache there is no watch here: a chart version's tarball
 * never changes once published, so entries are only ever added or deleted,
 * and callers push that work explicitly. Pending work lives in a processing
 * store until a worker has applied it.
 */
use super::chart::{Chart, ChartCacheEntryValue, ChartDownloader, compute_value, resolve_url, unescaped_chart_id};
use super::config::{CHART_KEY_PREFIX, CacheConfig, KEY_SEGMENTS_SEPARATOR, MAX_RETRIES};
use super::errors::{internal_error, invalid_key_error};
use super::gate::ResyncGate;
use super::queue::RateLimitingQueue;
use super::store::KeyValueStore;
use crate::error::{Error, Result, handle_error};
use crate::k8s::utils::NamespacedName;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Work waiting to be applied for one key. Either a download or a delete.
#[derive(Clone)]
struct ChartCacheStoreEntry {
    id: String,
    version: String,
    url: String,
    downloader: Option<Arc<dyn ChartDownloader>>,
    deleted: bool,
    // identifies this entry among later ones queued for the same key
    seq: u64,
}

#[derive(Default)]
struct ProcessingStore {
    entries: HashMap<String, ChartCacheStoreEntry>,
    next_seq: u64,
}

impl ProcessingStore {
    fn add(&mut self, key: &str, mut entry: ChartCacheStoreEntry) {
        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.entries.insert(key.to_string(), entry);
    }

    /// Remove the entry for `key` unless it was replaced since `seq`
    fn remove_if_current(&mut self, key: &str, seq: u64) {
        if self.entries.get(key).is_some_and(|e| e.seq == seq) {
            self.entries.remove(key);
        }
    }
}

pub struct ChartCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    queue: Arc<RateLimitingQueue>,
    processing: Mutex<ProcessingStore>,
    gate: ResyncGate,
    cancel: CancellationToken,
    debug_enabled: bool,
}

impl std::fmt::Debug for ChartCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChartCache[queue size: [{}]]", self.queue_len())
    }
}

/// Cache key of one chart version, `helmcharts:<namespace>:<repo>/<chart>:<version>`
///
/// # Errors
///
/// Will return `Err` if a segment is empty or the chart ID is not `repo/chart`
pub fn chart_cache_key_for(namespace: &str, chart_id: &str, chart_version: &str) -> Result<String> {
    if namespace.is_empty() || chart_id.is_empty() || chart_version.is_empty() {
        return Err(internal_error(format!(
            "invalid chart in chart_cache_key_for: [{namespace},{chart_id},{chart_version}]"
        )));
    }
    let chart_id = unescaped_chart_id(chart_id)?;
    Ok([CHART_KEY_PREFIX, namespace, chart_id.as_str(), chart_version].join(KEY_SEGMENTS_SEPARATOR))
}

/// The opposite of [`chart_cache_key_for`]: (namespace, chart ID, version)
///
/// # Errors
///
/// Will return `Err` if `key` is not a chart cache key
pub fn chart_cache_from_key(key: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = key.split(KEY_SEGMENTS_SEPARATOR).collect();
    match parts.as_slice() {
        [prefix, namespace, chart_id, version]
            if *prefix == CHART_KEY_PREFIX && !namespace.is_empty() && !chart_id.is_empty() && !version.is_empty() =>
        {
            Ok(((*namespace).to_string(), (*chart_id).to_string(), (*version).to_string()))
        }
        _ => Err(invalid_key_error(key)),
    }
}

impl ChartCache {
    /// Start the background workers. They stop once `cancel` fires or
    /// [`ChartCache::shutdown`] is called.
    #[must_use]
    pub fn new(name: &str, store: Arc<dyn KeyValueStore>, settings: &CacheConfig, cancel: &CancellationToken) -> Self {
        info!("🚀 Starting chart cache [{}]", name);
        let inner = Arc::new(Inner {
            store,
            queue: RateLimitingQueue::new(name, settings.debug_chart_queue),
            processing: Mutex::new(ProcessingStore::default()),
            gate: ResyncGate::new(),
            cancel: cancel.child_token(),
            debug_enabled: settings.debug_chart_queue,
        });

        for i in 0..settings.chart_workers.max(1) {
            // unique worker names make the logs easier to follow
            let worker_name = format!("{}-worker-{}", name, i);
            let worker = Arc::clone(&inner);
            tokio::spawn(async move { worker.run_worker(&worker_name).await });
        }

        let stopper = Arc::clone(&inner);
        tokio::spawn(async move {
            stopper.cancel.cancelled().await;
            stopper.queue.shut_down();
        });

        Self { inner }
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// # Errors
    ///
    /// Will return `Err` if a segment is empty or the chart ID is not `repo/chart`
    pub fn key_for(&self, namespace: &str, chart_id: &str, chart_version: &str) -> Result<String> {
        chart_cache_key_for(namespace, chart_id, chart_version)
    }

    /// # Errors
    ///
    /// Will return `Err` if `key` is not a chart cache key
    pub fn from_key(&self, key: &str) -> Result<(String, String, String)> {
        chart_cache_from_key(key)
    }

    /// Queue the latest version of every chart for download. Returns right
    /// away; workers do the downloading. Charts without versions or URLs are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Will return `Err` aggregating the charts whose key or tarball URL is
    /// invalid. Every other chart is queued regardless.
    pub fn sync_charts(&self, charts: &[Chart], downloader: &Arc<dyn ChartDownloader>) -> Result<()> {
        let mut total = 0;
        let mut errs = Vec::new();
        for chart in charts {
            // versions are sorted, the latest one comes first
            let Some(latest) = chart.chart_versions.first() else {
                warn!("⚠️  Skipping chart [{}] due to empty version array", chart.id);
                continue;
            };
            let Some(url) = latest.urls.first() else {
                warn!("⚠️  Chart: [{}], version: [{}] has no URLs", chart.id, latest.version);
                continue;
            };

            let queued = resolve_url(&chart.repo.url, url).and_then(|url| {
                let key = chart_cache_key_for(&chart.repo.namespace, &chart.id, &latest.version)?;
                Ok((key, url))
            });
            match queued {
                Ok((key, url)) => {
                    self.inner.lock_processing().add(
                        &key,
                        ChartCacheStoreEntry {
                            id: chart.id.clone(),
                            version: latest.version.clone(),
                            url,
                            downloader: Some(Arc::clone(downloader)),
                            deleted: false,
                            seq: 0,
                        },
                    );
                    self.inner.queue.add_rate_limited(&key);
                    total += 1;
                }
                Err(e) => {
                    error!("❌ Failed to queue chart [{}] due to: {}", chart.id, e);
                    errs.push(e);
                }
            }
        }
        info!("📦 sync_charts(): [{}] total charts to sync", total);
        Error::aggregate(errs).map_or(Ok(()), Err)
    }

    /// Queue deletes for every chart of `repo`: those already cached and
    /// those still being worked on
    ///
    /// # Errors
    ///
    /// Will return `Err` if the store can not be scanned
    pub async fn delete_charts_for_repo(&self, repo: &NamespacedName) -> Result<()> {
        info!("🗑️  +delete_charts_for_repo({})", repo);

        let charts_of_repo = format!("{}/*", repo.name);
        let pattern = [CHART_KEY_PREFIX, repo.namespace.as_str(), charts_of_repo.as_str(), "*"].join(KEY_SEGMENTS_SEPARATOR);
        let mut keys: BTreeSet<String> = self.inner.store.scan_match(&pattern).await?.into_iter().collect();

        let pending: Vec<String> = self.inner.lock_processing().entries.keys().cloned().collect();
        for key in pending {
            match chart_cache_from_key(&key) {
                Ok((namespace, chart_id, _)) => match chart_id.split_once('/') {
                    Some((repo_name, _)) if namespace == repo.namespace && repo_name == repo.name => {
                        keys.insert(key);
                    }
                    Some(_) => {}
                    None => error!("❌ Unexpected chart ID format: [{}]", chart_id),
                },
                Err(e) => error!("❌ {}", e),
            }
        }

        for key in keys {
            match chart_cache_from_key(&key) {
                Ok((_, id, version)) => {
                    self.inner.lock_processing().add(
                        &key,
                        ChartCacheStoreEntry {
                            id,
                            version,
                            url: String::new(),
                            downloader: None,
                            deleted: true,
                            seq: 0,
                        },
                    );
                    debug!("Marked key [{}] to be deleted", key);
                    self.inner.queue.add(&key);
                }
                Err(e) => error!("❌ {}", e),
            }
        }
        Ok(())
    }

    /// Cached tarball for `key`, without computing anything on a miss
    ///
    /// # Errors
    ///
    /// Will return `Err` if the store fails or the value can not be decoded
    pub async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.fetch_for_one(key).await
    }

    /// Cached tarball for `key`. On a miss the version's tarball URL is taken
    /// from `chart` and downloaded first. `None` if that version has no URL.
    ///
    /// # Errors
    ///
    /// Will return `Err` if `key` is invalid or does not belong to `chart`,
    /// or the store fails
    pub async fn get(&self, key: &str, chart: &Chart, downloader: &Arc<dyn ChartDownloader>) -> Result<Option<Vec<u8>>> {
        let _read = self.inner.gate.read().await;
        if let Some(value) = self.inner.fetch_for_one(key).await? {
            return Ok(Some(value));
        }

        // cache miss
        let (namespace, chart_id, version) = chart_cache_from_key(key)?;
        if namespace != chart.repo.namespace || unescaped_chart_id(&chart.id)? != chart_id {
            return Err(internal_error(format!("unexpected state for chart with key [{key}]")));
        }

        let Some(chart_version) = chart.chart_versions.iter().find(|v| v.version == version) else {
            return Ok(None);
        };
        let Some(url) = chart_version.urls.first() else {
            warn!("⚠️  Chart: [{}], version: [{}] has no URLs", chart.id, version);
            return Ok(None);
        };

        self.inner.lock_processing().add(
            key,
            ChartCacheStoreEntry {
                id: chart.id.clone(),
                version,
                url: resolve_url(&chart.repo.url, url)?,
                downloader: Some(Arc::clone(downloader)),
                deleted: false,
                seq: 0,
            },
        );
        self.inner.queue.add(key);
        self.inner.queue.wait_until_forgotten(key).await;
        self.inner.fetch_for_one(key).await
    }

    /// Drop all pending work. Called when the repositories feeding this
    /// cache are resynced.
    ///
    /// # Errors
    ///
    /// Currently never
    pub async fn on_resync(&self) -> Result<()> {
        let _write = self.inner.gate.write().await;
        info!(
            "🔄 +on_resync(), queue: [{}], size: [{}]",
            self.inner.queue.name(),
            self.inner.queue.len()
        );
        self.inner.queue.reset();
        self.inner.lock_processing().entries.clear();
        Ok(())
    }

    /// Keys with work pending in the processing store
    #[must_use]
    pub fn processing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock_processing().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn expect_add(&self, key: &str) {
        self.inner.queue.expect_add(key);
    }

    pub async fn wait_until_forgotten(&self, key: &str) {
        self.inner.queue.wait_until_forgotten(key).await;
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.queue.shut_down();
    }
}

impl Inner {
    fn lock_processing(&self) -> MutexGuard<'_, ProcessingStore> {
        self.processing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_worker(&self, worker_name: &str) {
        info!("⚙️  +run_worker({})", worker_name);
        while self.process_next_work_item(worker_name).await {}
        info!("⚙️  -run_worker({})", worker_name);
    }

    async fn process_next_work_item(&self, worker_name: &str) -> bool {
        let Some(key) = self.queue.get().await else {
            info!("[{}] shutting down...", worker_name);
            return false;
        };

        let _read = self.gate.read().await;
        if !self.queue.is_processing(&key) {
            // a resync ran between get() and here, the item is stale
            return true;
        }

        let entry = self.lock_processing().entries.get(&key).cloned();
        let result = match &entry {
            Some(entry) => self.sync_handler(worker_name, &key, entry).await,
            None => Err(internal_error(format!("no object exists in cache store for key: [{key}]"))),
        };
        let seq = entry.as_ref().map_or(0, |e| e.seq);

        match result {
            Ok(()) => {
                self.queue.forget(&key);
                self.lock_processing().remove_if_current(&key, seq);
            }
            Err(e) if entry.is_some() && self.queue.num_requeues(&key) < MAX_RETRIES => {
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
                self.lock_processing().remove_if_current(&key, seq);
                handle_error(&Error::Custom(format!("error syncing key [{key}] due to: {e}")));
            }
        }
        self.queue.done(&key);
        true
    }

    async fn sync_handler(&self, worker_name: &str, key: &str, entry: &ChartCacheStoreEntry) -> Result<()> {
        debug!("+sync_handler({}, {})", worker_name, key);

        if entry.deleted {
            let removed = self.store.del(key).await?;
            info!("🗑️  [DEL {}]: {}", key, removed);
            return Ok(());
        }

        // a chart version never changes, so skip the download if it is cached
        if self.store.exists(key).await? {
            debug!("🔍 [EXISTS {}]: 1", key);
            return Ok(());
        }

        let downloader = entry
            .downloader
            .as_ref()
            .ok_or_else(|| internal_error(format!("no downloader for key [{key}]")))?;
        let value = compute_value(downloader.as_ref(), &entry.id, &entry.url, &entry.version).await?;

        let start = Instant::now();
        self.store.set(key, &value).await?;
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
            info!("💾 [SET {}]: {} bytes in [{}] ms", key, value.len(), start.elapsed().as_millis());
        }
        Ok(())
    }

    async fn fetch_for_one(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(bytes) = self.store.get(key).await? else {
            debug!("🔍 [GET {}]: miss", key);
            return Ok(None);
        };
        debug!("🔍 [GET {}]: {} bytes read", key, bytes.len());
        let value: ChartCacheEntryValue = bincode::deserialize(&bytes)?;
        Ok(Some(value.chart_tarball))
    }
}
