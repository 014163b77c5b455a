/**
 * Key-value storage behind the caches
 *
 * `RedisStore` is what runs in a cluster. `MemoryStore` keeps everything in
 * process, which is handy for local runs and tests.
 */
use super::errors::failed_precondition_error;
use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, aio::MultiplexedConnection};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub const REDIS_ADDR: &str = "REDIS_ADDR";
pub const REDIS_PASSWORD: &str = "REDIS_PASSWORD";
pub const REDIS_DB: &str = "REDIS_DB";

const SCAN_COUNT: usize = 100;

/// Operations the caches need from their backing store. Values are opaque
/// bytes and never expire.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Returns the number of keys removed
    async fn del(&self, key: &str) -> Result<usize>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove every key of the database
    async fn flush_db(&self) -> Result<()>;

    /// All keys matching a redis style glob pattern
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>>;

    /// Human readable (used, total) memory figures
    async fn memory_stats(&self) -> Result<(String, String)>;
}

/// Connection settings for [`RedisStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
}

impl RedisConfig {
    /// # Errors
    ///
    /// Will return `Err` if `REDIS_ADDR`, `REDIS_PASSWORD` or `REDIS_DB` is
    /// unset, or `REDIS_DB` is not a number
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`RedisConfig::from_env`], with a custom variable lookup
    ///
    /// # Errors
    ///
    /// Will return `Err` if a variable is missing or `REDIS_DB` is not a number
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |name: &str| {
            lookup(name).ok_or_else(|| failed_precondition_error(format!("missing environment variable {name}")))
        };
        let addr = require(REDIS_ADDR)?;
        let password = require(REDIS_PASSWORD)?;
        let db = require(REDIS_DB)?;
        let db = db
            .parse::<i64>()
            .map_err(|e| failed_precondition_error(format!("invalid {REDIS_DB} [{db}]: {e}")))?;

        Ok(Self { addr, password, db })
    }

    #[must_use]
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}/{}", self.addr, self.db)
        } else {
            format!("redis://:{}@{}/{}", urlencoding::encode(&self.password), self.addr, self.db)
        }
    }
}

/// Redis backed store sharing one multiplexed connection between all callers
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect and make sure the server answers
    ///
    /// # Errors
    ///
    /// Will return `Err` if the server can not be reached
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url())?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("🔌 Redis [PING]: {}", pong);

        let maxmemory: Vec<String> = redis::cmd("CONFIG").arg("GET").arg("maxmemory").query_async(&mut conn).await?;
        info!("🔌 Redis [CONFIG GET maxmemory]: {:?}", maxmemory);

        Ok(Self { conn })
    }

    /// # Errors
    ///
    /// Will return `Err` if the environment is incomplete or the server can
    /// not be reached
    pub async fn from_env() -> Result<Self> {
        Self::connect(&RedisConfig::from_env()?).await
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn flush_db(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(())
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!("🔍 SCAN [{}] matched {} keys", pattern, keys.len());
        Ok(keys)
    }

    async fn memory_stats(&self) -> Result<(String, String)> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;
        Ok(parse_memory_info(&info))
    }
}

fn parse_memory_info(info: &str) -> (String, String) {
    let mut used = "?".to_string();
    let mut total = "?".to_string();
    for line in info.lines() {
        if let Some((name, value)) = line.trim().split_once(':') {
            match name {
                "used_memory_rss_human" => used = value.to_string(),
                "maxmemory_human" => total = value.to_string(),
                _ => {}
            }
        }
    }
    (used, total)
}

/// In-process store, ordered by key
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<usize> {
        Ok(usize::from(self.lock().remove(key).is_some()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.lock().contains_key(key))
    }

    async fn flush_db(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let re = glob_to_regex(pattern)?;
        Ok(self.lock().keys().filter(|k| re.is_match(k)).cloned().collect())
    }

    async fn memory_stats(&self) -> Result<(String, String)> {
        let used: usize = self.lock().iter().map(|(k, v)| k.len() + v.len()).sum();
        Ok((format!("{used}B"), "0B".to_string()))
    }
}

/// Translate a redis glob (`*`, `?`, `[...]`, `\` escapes) to an anchored regex
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    re.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            '[' => {
                re.push('[');
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' || inner == '[' {
                        re.push('\\');
                    }
                    re.push(inner);
                }
                re.push(']');
            }
            _ => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::Custom(format!("invalid pattern [{pattern}]: {e}")))
}
