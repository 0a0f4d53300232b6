use serde::Deserialize;
use std::path::Path;
use threadkeep_store::StoreConfig;
use tracing::info;

/// Contents of `threadkeep.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct ThreadkeepConfig {
    #[serde(default)]
    pub store: StoreConfig,
}

impl ThreadkeepConfig {
    /// Reads the config file, falling back to the in-memory backend when the
    /// file does not exist, then applies environment overrides.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = match tokio::fs::read_to_string(path).await {
            Ok(raw) => toml::from_str::<Self>(&raw).map_err(|e| {
                anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No config file, using the in-memory store");
                Self::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to read config file '{}': {}",
                    path.display(),
                    e
                ))
            }
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `REDIS_URL`, `REDIS_DB` and `MONGODB_URI` to the backend they
    /// belong to.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        match &mut self.store {
            StoreConfig::Memory => {}
            StoreConfig::Redis(redis) => {
                if let Some(url) = var("REDIS_URL") {
                    redis.url = url;
                }
                if let Some(db) = var("REDIS_DB") {
                    let db: u32 = db
                        .trim()
                        .parse()
                        .map_err(|_| anyhow::anyhow!("REDIS_DB must be a number, got '{db}'"))?;
                    *redis = redis.clone().with_db(db);
                }
            }
            StoreConfig::Mongodb(mongo) => {
                if let Some(uri) = var("MONGODB_URI") {
                    mongo.uri = uri;
                }
            }
        }
        Ok(())
    }
}
