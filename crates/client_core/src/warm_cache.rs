use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use storage::{Storage, StoredCacheEntry};
use tracing::warn;

use crate::cache::{CacheKey, CacheMirror, MirroredEntry};

/// Response cache mirror backed by the SQLite `cache_entries` table.
pub struct SqliteCacheMirror {
    store: Storage,
}

impl SqliteCacheMirror {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize cache mirror at '{database_url}'"))?;
        Ok(Arc::new(Self { store }))
    }

    pub fn sqlite_url_for_data_dir(base_dir: &Path) -> String {
        format!("sqlite://{}", base_dir.join("inbox_cache.db").display())
    }
}

#[async_trait]
impl CacheMirror for SqliteCacheMirror {
    async fn store(&self, key: &CacheKey, value: &Value, ttl: Duration) -> Result<()> {
        let entry = StoredCacheEntry {
            key: key.as_str().to_string(),
            family: key.family().to_string(),
            value_json: serde_json::to_string(value)?,
            captured_at: Utc::now(),
            ttl_ms: i64::try_from(ttl.as_millis()).context("ttl out of range")?,
        };
        self.store.put_cache_entry(&entry).await
    }

    async fn invalidate_family(&self, family: &str) -> Result<()> {
        self.store.delete_cache_family(family).await.map(|_| ())
    }

    async fn load_live(&self) -> Result<Vec<MirroredEntry>> {
        let now = Utc::now();
        let stored = self.store.load_live_cache_entries(now).await?;
        let mut live = Vec::with_capacity(stored.len());
        for entry in stored {
            let Some(remaining) = entry.remaining_at(now) else {
                continue;
            };
            match serde_json::from_str(&entry.value_json) {
                Ok(value) => live.push(MirroredEntry {
                    key: CacheKey::from_raw(entry.key),
                    value,
                    remaining,
                }),
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "cache: skipping corrupt mirrored entry");
                    self.store.delete_cache_entry(&entry.key).await?;
                }
            }
        }
        Ok(live)
    }
}

#[cfg(test)]
#[path = "tests/warm_cache_tests.rs"]
mod tests;
