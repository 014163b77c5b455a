use clap::Parser;
use kubecache::error::Result;
use kubecache::k8s::cache::{
    CacheConfig, KeyValueStore, MemoryStore, NamespacedResourceWatcherCache, ObjectSummaryHooks, PluginConfig,
    RedisStore, WatcherCacheConfig,
};
use kubecache::k8s::client;
use kubecache::k8s::source::{Gvr, KubeResourceSource};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mirror a custom resource type into redis until interrupted
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// API group of the resource
    #[arg(short, long, default_value = "source.toolkit.fluxcd.io")]
    group: String,

    /// API version of the resource
    #[arg(short = 'v', long, default_value = "v1beta2")]
    api_version: String,

    /// Plural resource name
    #[arg(short, long, default_value = "helmrepositories")]
    resource: String,

    /// Number of background workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Keep the cache in process instead of redis
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let plugin = PluginConfig::default();
    let mut settings = CacheConfig::from_env();
    if let Some(workers) = args.workers {
        settings.watcher_workers = workers;
    }

    let store: Arc<dyn KeyValueStore> = if args.in_memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::from_env().await?)
    };

    let client = client::new(&plugin.user_agent()).await?;
    let gvr = Gvr::new(&args.group, &args.api_version, &args.resource);
    let source = Arc::new(KubeResourceSource::new(client, gvr).await?);

    let cancel = CancellationToken::new();
    let cache = NamespacedResourceWatcherCache::new(
        &args.resource,
        WatcherCacheConfig {
            source,
            store: Arc::clone(&store),
            hooks: Arc::new(ObjectSummaryHooks),
            settings,
            on_fatal: None,
        },
        &cancel,
    )
    .await?;
    info!("✅ {:?} ready", cache);

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutting down");
    cancel.cancel();

    let (used, total) = store.memory_stats().await?;
    info!("💾 Memory [{}/{}]", used, total);
    Ok(())
}
