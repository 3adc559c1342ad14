//! SQLite mirror of the response cache, used only to warm-start a session.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredCacheEntry {
    pub key: String,
    pub family: String,
    pub value_json: String,
    pub captured_at: DateTime<Utc>,
    pub ttl_ms: i64,
}

impl StoredCacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.captured_at + Duration::milliseconds(self.ttl_ms)
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.expires_at() - now)
            .to_std()
            .ok()
            .filter(|remaining| !remaining.is_zero())
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // every pooled connection to `sqlite::memory:` would be a separate database
        let max_connections = if database_url.starts_with("sqlite::memory:") {
            1
        } else {
            4
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open cache database '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn put_cache_entry(&self, entry: &StoredCacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (cache_key, family, value_json, captured_at, ttl_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(cache_key) DO UPDATE SET
                family = excluded.family,
                value_json = excluded.value_json,
                captured_at = excluded.captured_at,
                ttl_ms = excluded.ttl_ms
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.family)
        .bind(&entry.value_json)
        .bind(entry.captured_at)
        .bind(entry.ttl_ms)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store cache entry '{}'", entry.key))?;
        Ok(())
    }

    /// Entries still live at `now`. Expired rows are deleted on the way.
    pub async fn load_live_cache_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredCacheEntry>> {
        let rows = sqlx::query(
            "SELECT cache_key, family, value_json, captured_at, ttl_ms FROM cache_entries",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut live = Vec::with_capacity(rows.len());
        let mut expired = Vec::new();
        for row in rows {
            let entry = StoredCacheEntry {
                key: row.try_get("cache_key")?,
                family: row.try_get("family")?,
                value_json: row.try_get("value_json")?,
                captured_at: row.try_get("captured_at")?,
                ttl_ms: row.try_get("ttl_ms")?,
            };
            if entry.remaining_at(now).is_some() {
                live.push(entry);
            } else {
                expired.push(entry.key);
            }
        }

        for key in expired {
            self.delete_cache_entry(&key).await?;
        }
        Ok(live)
    }

    pub async fn delete_cache_entry(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_cache_family(&self, family: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE family = ?1")
            .bind(family)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to invalidate cache family '{family}'"))?;
        Ok(result.rows_affected())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
