use crate::memory::MemoryStore;
use crate::mongo_store::MongoStore;
use crate::redis_store::RedisStore;
use crate::store::CheckpointStore;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use threadkeep_core::{ThreadkeepError, ThreadkeepResult, TtlPolicy};
use tracing::info;

/// Which backend to use and how to reach it.
///
/// Parsed from the `[store]` table of the config file, keyed by `backend`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local, no TTL.
    #[default]
    #[serde(alias = "in-memory")]
    Memory,
    /// Redis with TTL.
    #[serde(alias = "ttl-kv")]
    Redis(RedisConfig),
    /// MongoDB with TTL.
    #[serde(alias = "ttl-doc", alias = "mongo")]
    Mongodb(MongoConfig),
}

impl StoreConfig {
    /// Short name of the selected backend.
    pub fn backend_name(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::Redis(_) => "redis",
            StoreConfig::Mongodb(_) => "mongodb",
        }
    }

    /// Builds the selected backend, connecting to the server if it has one.
    pub async fn connect(&self) -> ThreadkeepResult<Arc<dyn CheckpointStore>> {
        let store: Arc<dyn CheckpointStore> = match self {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Redis(config) => Arc::new(RedisStore::connect(config).await?),
            StoreConfig::Mongodb(config) => Arc::new(MongoStore::connect(config).await?),
        };
        info!(backend = store.backend_name(), "Checkpoint store ready");
        Ok(store)
    }
}

// ---------------------------------------------------------------------------
// Redis
// ---------------------------------------------------------------------------

/// Connection and TTL settings for [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedisConfig {
    /// `redis://host:port/db` connection URL.
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Prefix of every key written by the store.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Session lifetime after the last write (or read, when sliding).
    #[serde(default = "default_redis_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Reset the expiry on every read.
    #[serde(default = "default_refresh_on_read")]
    pub refresh_on_read: bool,
    /// Upper bound on any single Redis round trip.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            namespace: default_namespace(),
            default_ttl_secs: default_redis_ttl_secs(),
            refresh_on_read: default_refresh_on_read(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl RedisConfig {
    /// The TTL policy this configuration describes.
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            refresh_on_read: self.refresh_on_read,
        }
    }

    /// The per-operation timeout.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Replaces the database index at the end of the URL.
    pub fn with_db(mut self, db: u32) -> Self {
        let base = match self.url.rsplit_once('/') {
            Some((head, tail)) if !head.ends_with('/') && tail.parse::<u32>().is_ok() => {
                head.to_string()
            }
            _ => self.url.trim_end_matches('/').to_string(),
        };
        self.url = format!("{base}/{db}");
        self
    }

    pub(crate) fn validate(&self) -> ThreadkeepResult<()> {
        if self.default_ttl_secs == 0 {
            return Err(ThreadkeepError::Config(
                "redis default_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.namespace.is_empty() || self.namespace.contains(' ') {
            return Err(ThreadkeepError::Config(format!(
                "invalid redis namespace '{}'",
                self.namespace
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MongoDB
// ---------------------------------------------------------------------------

/// Connection and TTL settings for [`MongoStore`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MongoConfig {
    /// `mongodb://` or `mongodb+srv://` connection string.
    #[serde(default)]
    pub uri: String,
    /// Database holding both collections.
    #[serde(default = "default_mongo_database")]
    pub database: String,
    /// Collection of checkpoint documents.
    #[serde(default = "default_checkpoint_collection")]
    pub checkpoint_collection: String,
    /// Collection of pending-write documents.
    #[serde(default = "default_writes_collection")]
    pub writes_collection: String,
    /// Collection holding one sequence head per session.
    #[serde(default = "default_head_collection")]
    pub head_collection: String,
    /// Seconds after the last write before the reaper may remove a record.
    #[serde(default = "default_mongo_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Upper bound on server selection and on any single operation.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            database: default_mongo_database(),
            checkpoint_collection: default_checkpoint_collection(),
            writes_collection: default_writes_collection(),
            head_collection: default_head_collection(),
            default_ttl_secs: default_mongo_ttl_secs(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl MongoConfig {
    /// The TTL policy this configuration describes. Reads never refresh.
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy::new(Duration::from_secs(self.default_ttl_secs))
    }

    /// The per-operation timeout.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub(crate) fn validate(&self) -> ThreadkeepResult<()> {
        if self.uri.trim().is_empty() {
            return Err(ThreadkeepError::Config(
                "mongodb uri is missing (set store.uri or MONGODB_URI)".to_string(),
            ));
        }
        if self.default_ttl_secs == 0 {
            return Err(ThreadkeepError::Config(
                "mongodb default_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.checkpoint_collection == self.writes_collection
            || self.checkpoint_collection == self.head_collection
            || self.writes_collection == self.head_collection
        {
            return Err(ThreadkeepError::Config(
                "checkpoint, pending-write and head collections must differ".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}
fn default_namespace() -> String {
    "threadkeep".to_string()
}
fn default_redis_ttl_secs() -> u64 {
    60
}
fn default_refresh_on_read() -> bool {
    true
}
fn default_op_timeout_ms() -> u64 {
    2_000
}
fn default_mongo_database() -> String {
    "threadkeep".to_string()
}
fn default_checkpoint_collection() -> String {
    "checkpoints".to_string()
}
fn default_writes_collection() -> String {
    "pending_writes".to_string()
}
fn default_head_collection() -> String {
    "session_heads".to_string()
}
fn default_mongo_ttl_secs() -> u64 {
    300
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        store: StoreConfig,
    }

    fn parse(src: &str) -> StoreConfig {
        toml::from_str::<Wrapper>(src).unwrap().store
    }

    #[test]
    fn memory_backend_parses() {
        assert_eq!(parse("[store]\nbackend = \"memory\"\n"), StoreConfig::Memory);
    }

    #[test]
    fn redis_defaults_follow_sliding_window() {
        let config = parse("[store]\nbackend = \"redis\"\n");
        let StoreConfig::Redis(redis) = config else {
            panic!("expected redis");
        };
        assert_eq!(redis.url, "redis://localhost:6379/0");
        assert_eq!(redis.default_ttl_secs, 60);
        assert!(redis.ttl_policy().refresh_on_read);
        assert_eq!(redis.op_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn ttl_aliases_are_accepted() {
        let config = parse("[store]\nbackend = \"ttl-kv\"\ndefault_ttl_secs = 5\n");
        assert_eq!(config.backend_name(), "redis");

        let config = parse(
            "[store]\nbackend = \"ttl-doc\"\nuri = \"mongodb://localhost\"\ncheckpoint_collection = \"cp\"\n",
        );
        let StoreConfig::Mongodb(mongo) = config else {
            panic!("expected mongodb");
        };
        assert_eq!(mongo.checkpoint_collection, "cp");
        assert_eq!(mongo.writes_collection, "pending_writes");
        assert_eq!(mongo.head_collection, "session_heads");
        assert_eq!(mongo.default_ttl_secs, 300);
        assert!(!mongo.ttl_policy().refresh_on_read);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(toml::from_str::<Wrapper>("[store]\nbackend = \"sqlite\"\n").is_err());
    }

    #[test]
    fn with_db_replaces_the_index() {
        let redis = RedisConfig::default().with_db(3);
        assert_eq!(redis.url, "redis://localhost:6379/3");

        let redis = RedisConfig {
            url: "redis://cache:6380".to_string(),
            ..RedisConfig::default()
        }
        .with_db(1);
        assert_eq!(redis.url, "redis://cache:6380/1");
    }

    #[test]
    fn validation_catches_bad_values() {
        assert!(MongoConfig::default().validate().is_err());
        let mongo = MongoConfig {
            uri: "mongodb://localhost".into(),
            writes_collection: "checkpoints".into(),
            ..MongoConfig::default()
        };
        assert!(mongo.validate().is_err());
        let mongo = MongoConfig {
            uri: "mongodb://localhost".into(),
            head_collection: "pending_writes".into(),
            ..MongoConfig::default()
        };
        assert!(mongo.validate().is_err());

        let redis = RedisConfig {
            default_ttl_secs: 0,
            ..RedisConfig::default()
        };
        assert!(redis.validate().is_err());
        assert!(RedisConfig::default().validate().is_ok());
    }
}
