use std::time::Duration;

use serde::Deserialize;
use shared::domain::UserId;
use thiserror::Error;
use url::Url;

use crate::backoff::exponential_delay;

const MAX_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
    #[error("`{field}` must not exceed {max:?}")]
    TooLarge { field: &'static str, max: Duration },
    #[error("`{base}` must not exceed `{ceiling}`")]
    BaseAboveCeiling {
        base: &'static str,
        ceiling: &'static str,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub ws_base_url: Option<String>,
    pub request: RequestConfig,
    pub cache: CacheTtls,
    pub realtime: RealtimeConfig,
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api".into(),
            ws_base_url: None,
            request: RequestConfig::default(),
            cache: CacheTtls::default(),
            realtime: RealtimeConfig::default(),
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        exponential_delay(
            Duration::from_millis(self.base_delay_ms),
            retry,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheTtls {
    pub list_ms: u64,
    pub message_ms: u64,
    pub stats_ms: u64,
    pub notifications_ms: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            list_ms: 30_000,
            message_ms: 300_000,
            stats_ms: 15_000,
            notifications_ms: 30_000,
        }
    }
}

impl CacheTtls {
    pub fn list(&self) -> Duration {
        Duration::from_millis(self.list_ms)
    }

    pub fn message(&self) -> Duration {
        Duration::from_millis(self.message_ms)
    }

    pub fn stats(&self) -> Duration {
        Duration::from_millis(self.stats_ms)
    }

    pub fn notifications(&self) -> Duration {
        Duration::from_millis(self.notifications_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub heartbeat_interval_ms: u64,
    pub max_missed_acks: u32,
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            max_missed_acks: 3,
            connect_timeout_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        exponential_delay(
            Duration::from_millis(self.base_delay_ms),
            attempt,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn ttl_in_range(field: &'static str, ttl: Duration) -> Result<(), ConfigError> {
    if ttl.is_zero() {
        return Err(ConfigError::Zero { field });
    }
    if ttl > MAX_CACHE_TTL {
        return Err(ConfigError::TooLarge {
            field,
            max: MAX_CACHE_TTL,
        });
    }
    Ok(())
}

fn parse_http_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme `{other}`"),
        }),
    }
}

impl SyncConfig {
    pub fn with_api_base_url(mut self, api_base_url: impl Into<String>) -> Self {
        self.api_base_url = api_base_url.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_http_url(&self.api_base_url)?;
        if let Some(ws_base_url) = &self.ws_base_url {
            Url::parse(ws_base_url).map_err(|err| ConfigError::InvalidUrl {
                url: ws_base_url.clone(),
                reason: err.to_string(),
            })?;
        }

        non_zero("request.timeout_ms", self.request.timeout_ms)?;
        non_zero(
            "request.retry.max_attempts",
            u64::from(self.request.retry.max_attempts),
        )?;
        if self.request.retry.base_delay_ms > self.request.retry.max_delay_ms {
            return Err(ConfigError::BaseAboveCeiling {
                base: "request.retry.base_delay_ms",
                ceiling: "request.retry.max_delay_ms",
            });
        }

        ttl_in_range("cache.list_ms", self.cache.list())?;
        ttl_in_range("cache.message_ms", self.cache.message())?;
        ttl_in_range("cache.stats_ms", self.cache.stats())?;
        ttl_in_range("cache.notifications_ms", self.cache.notifications())?;

        let realtime = &self.realtime;
        non_zero(
            "realtime.heartbeat_interval_ms",
            realtime.heartbeat_interval_ms,
        )?;
        non_zero(
            "realtime.max_missed_acks",
            u64::from(realtime.max_missed_acks),
        )?;
        non_zero("realtime.connect_timeout_ms", realtime.connect_timeout_ms)?;
        non_zero(
            "realtime.reconnect.max_attempts",
            u64::from(realtime.reconnect.max_attempts),
        )?;
        if realtime.reconnect.base_delay_ms > realtime.reconnect.max_delay_ms {
            return Err(ConfigError::BaseAboveCeiling {
                base: "realtime.reconnect.base_delay_ms",
                ceiling: "realtime.reconnect.max_delay_ms",
            });
        }
        non_zero("event_buffer", self.event_buffer as u64)?;
        Ok(())
    }

    /// `{ws_base}/ws/{user_id}?token=…`. Without an explicit ws base the api
    /// base url is reused with its scheme switched to `ws`/`wss`.
    pub fn push_url(&self, user_id: UserId, token: &str) -> Result<Url, ConfigError> {
        let mut url = match &self.ws_base_url {
            Some(raw) => Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
                url: raw.clone(),
                reason: err.to_string(),
            })?,
            None => {
                let api = parse_http_url(&self.api_base_url)?;
                let ws_scheme = if api.scheme() == "https" { "wss" } else { "ws" };
                let raw = format!("{ws_scheme}{}", &api.as_str()[api.scheme().len()..]);
                Url::parse(&raw).map_err(|err| ConfigError::InvalidUrl {
                    url: raw.clone(),
                    reason: err.to_string(),
                })?
            }
        };

        let display = url.to_string();
        url.path_segments_mut()
            .map_err(|_| ConfigError::InvalidUrl {
                url: display,
                reason: "url cannot be a base".into(),
            })?
            .pop_if_empty()
            .push("ws")
            .push(&user_id.0.to_string());
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}
