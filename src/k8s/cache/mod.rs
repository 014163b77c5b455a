pub mod chart;
pub mod chart_cache;
pub mod config;
pub mod errors;
pub mod gate;
pub mod hooks;
pub mod queue;
pub mod rate_limiter;
pub mod store;
pub mod watcher_cache;

pub use chart::{Chart, ChartDownloader, ChartVersion, ClientOptions, HttpChartDownloader, RepoRef};
pub use chart_cache::ChartCache;
pub use config::{CacheConfig, PluginConfig};
pub use hooks::{CacheHooks, ObjectSummary, ObjectSummaryHooks};
pub use queue::RateLimitingQueue;
pub use store::{KeyValueStore, MemoryStore, RedisConfig, RedisStore};
pub use watcher_cache::{FatalErrorHandler, NamespacedResourceWatcherCache, WatcherCacheConfig, abort_process};
