/**
 * Configuration constants and settings for the watcher and chart caches
 */
use std::num::NonZeroU32;
use std::time::Duration;

/// Max number of attempts to process one work item before giving up on it
pub const MAX_RETRIES: usize = 5;

/// Max number of resync attempts after a watch breaks down. The wait between
/// attempts doubles, starting at one second
pub const MAX_RESYNC_BACKOFF: u32 = 2;

/// Max number of concurrent tasks used by the parallel fan-outs
/// (bootstrap population, multi-key fetch and recompute)
pub const MAX_PARALLELISM: usize = 10;

/// Default number of background workers draining the watcher cache queue
pub const DEFAULT_WATCHER_WORKERS: usize = 1;

/// Default number of background workers draining the chart cache queue
pub const DEFAULT_CHART_WORKERS: usize = 2;

/// Watch request timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Delay before re-opening a watch that failed for a retryable reason
pub const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Base delay of the per-item exponential failure rate limiter
pub const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Cap of the per-item exponential failure rate limiter
pub const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Overall token bucket limits shared by all items of a queue
pub const RATE_LIMIT_QPS: NonZeroU32 = non_zero(10);
pub const RATE_LIMIT_BURST: NonZeroU32 = non_zero(100);

const fn non_zero(n: u32) -> NonZeroU32 {
    match NonZeroU32::new(n) {
        Some(n) => n,
        None => NonZeroU32::MIN,
    }
}

/// First segment of every chart cache key
pub const CHART_KEY_PREFIX: &str = "helmcharts";

/// Separator of cache key segments
pub const KEY_SEGMENTS_SEPARATOR: &str = ":";

pub const DEBUG_WATCHER_CACHE_QUEUE: &str = "DEBUG_WATCHER_CACHE_QUEUE";
pub const DEBUG_CHART_CACHE_QUEUE: &str = "DEBUG_CHART_CACHE_QUEUE";

/// Runtime settings of the caches
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Verbose tracing of the watcher cache work queue
    pub debug_watcher_queue: bool,
    /// Verbose tracing of the chart cache work queue
    pub debug_chart_queue: bool,
    pub watcher_workers: usize,
    pub chart_workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            debug_watcher_queue: false,
            debug_chart_queue: false,
            watcher_workers: DEFAULT_WATCHER_WORKERS,
            chart_workers: DEFAULT_CHART_WORKERS,
        }
    }
}

impl CacheConfig {
    /// Read the debug flags from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`CacheConfig::from_env`], with a custom variable lookup
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).is_some_and(|v| v == "true");
        Self {
            debug_watcher_queue: flag(DEBUG_WATCHER_CACHE_QUEUE),
            debug_chart_queue: flag(DEBUG_CHART_CACHE_QUEUE),
            ..Self::default()
        }
    }
}

/// Identity of the plugin running the caches. Built once at startup and
/// passed wherever it is needed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    pub name: String,
    pub version: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: "fluxv2.packages".to_string(),
            version: "v1alpha1".to_string(),
        }
    }
}

impl PluginConfig {
    /// User agent sent with outbound HTTP requests, e.g. chart downloads
    #[must_use]
    pub fn user_agent(&self) -> String {
        format!("{} ({}/{})", crate::k8s::USER_AGENT, self.name, self.version)
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(MAX_RETRIES > 0, "MAX_RETRIES must be greater than 0");
    assert!(MAX_RESYNC_BACKOFF > 0, "MAX_RESYNC_BACKOFF must be greater than 0");
    assert!(MAX_PARALLELISM > 0, "MAX_PARALLELISM must be greater than 0");
    assert!(DEFAULT_WATCHER_WORKERS > 0, "DEFAULT_WATCHER_WORKERS must be greater than 0");
    assert!(DEFAULT_CHART_WORKERS > 0, "DEFAULT_CHART_WORKERS must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(RATE_LIMIT_BURST.get() >= RATE_LIMIT_QPS.get(), "RATE_LIMIT_BURST must cover one second of RATE_LIMIT_QPS");
};
