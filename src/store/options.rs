use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{fs, sync::Mutex};

use super::ConfigStore;

const TRANSIENT_PREFIX: &str = "_transient_";

#[derive(Serialize, Deserialize)]
struct TransientEntry {
    value: Value,
    expires_at: i64,
}

/// Options kept as one JSON object, written through to disk on every change.
pub struct FileConfigStore {
    path: Option<PathBuf>,
    options: Mutex<Map<String, Value>>,
}

impl FileConfigStore {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let options = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Map<String, Value>>(&bytes)
                .with_context(|| format!("parse options file {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: Some(path),
            options: Mutex::new(options),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            options: Mutex::new(Map::new()),
        }
    }

    async fn persist(&self, options: &Map<String, Value>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(options)?;
        fs::write(path, payload).await?;
        Ok(())
    }

    fn transient_key(key: &str) -> String {
        format!("{TRANSIENT_PREFIX}{key}")
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.options.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut options = self.options.lock().await;
        options.insert(key.to_string(), value);
        self.persist(&options).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut options = self.options.lock().await;
        if options.remove(key).is_some() {
            self.persist(&options).await?;
        }
        Ok(())
    }

    async fn get_transient(&self, key: &str) -> Result<Option<Value>> {
        let storage_key = Self::transient_key(key);
        let mut options = self.options.lock().await;
        let Some(raw) = options.get(&storage_key).cloned() else {
            return Ok(None);
        };
        match serde_json::from_value::<TransientEntry>(raw) {
            Ok(entry) if entry.expires_at > Utc::now().timestamp() => Ok(Some(entry.value)),
            _ => {
                options.remove(&storage_key);
                self.persist(&options).await?;
                Ok(None)
            }
        }
    }

    async fn set_transient(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let entry = TransientEntry {
            value,
            expires_at: Utc::now().timestamp().saturating_add(ttl_secs),
        };
        let mut options = self.options.lock().await;
        options.insert(Self::transient_key(key), serde_json::to_value(entry)?);
        self.persist(&options).await
    }

    async fn delete_transient(&self, key: &str) -> Result<()> {
        self.delete(&Self::transient_key(key)).await
    }
}
