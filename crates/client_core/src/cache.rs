use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use url::form_urlencoded;

/// `path` or `path?query`, with the query pairs in the order they were given.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(path: &str, query: &[(&str, String)]) -> Self {
        let path = path.trim_matches('/');
        if query.is_empty() {
            return Self(path.to_string());
        }
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query.iter().map(|(name, value)| (*name, value.as_str())))
            .finish();
        Self(format!("{path}?{encoded}"))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The resource family is the first path segment: `messages?page=2`,
    /// `messages/7` and `messages/stats` all belong to `messages`.
    pub fn family(&self) -> &str {
        family_of(&self.0)
    }
}

pub fn family_of(path: &str) -> &str {
    let path = path.trim_start_matches('/');
    let end = path.find(['/', '?']).unwrap_or(path.len());
    &path[..end]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Bypass,
    Ttl(Duration),
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub captured_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_live_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.captured_at) < self.ttl
    }
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live value, or `None`. An expired entry is evicted on the way out.
    pub fn get(&mut self, key: &CacheKey) -> Option<Value> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live_at(now) => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&mut self, key: CacheKey, value: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        // pages nobody reads again would otherwise stay forever
        self.entries.retain(|_, entry| entry.is_live_at(now));
        self.entries.insert(
            key,
            CacheEntry {
                value,
                captured_at: now,
                ttl,
            },
        );
    }

    pub fn invalidate(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn invalidate_family(&mut self, family: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.family() != family);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A warm-start entry recovered from a mirror: the value and how long it
/// still has to live.
#[derive(Debug, Clone)]
pub struct MirroredEntry {
    pub key: CacheKey,
    pub value: Value,
    pub remaining: Duration,
}

/// Optional write-through copy of the cache that outlives the process.
/// Nothing about request correctness may depend on it.
#[async_trait]
pub trait CacheMirror: Send + Sync {
    async fn store(&self, key: &CacheKey, value: &Value, ttl: Duration) -> Result<()>;
    async fn invalidate_family(&self, family: &str) -> Result<()>;
    async fn load_live(&self) -> Result<Vec<MirroredEntry>>;
}

pub type SharedCacheMirror = Arc<dyn CacheMirror>;

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
