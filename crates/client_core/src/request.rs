use std::time::Duration;

use reqwest::{header::RETRY_AFTER, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::error::ApiError;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::{family_of, CacheKey, CachePolicy, ResponseCache, SharedCacheMirror},
    config::{CacheTtls, RetryPolicy, SyncConfig},
    error::{RequestError, SyncError},
};

const ERROR_BODY_PREVIEW: usize = 200;

/// One failed attempt, before it is known whether it will be retried.
#[derive(Debug)]
enum AttemptFailure {
    Timeout,
    Network(String),
    Server { status: u16, message: String },
    RateLimited { retry_after: Option<Duration> },
    AuthExpired,
    Rejected { status: u16, message: String },
}

impl AttemptFailure {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            AttemptFailure::Timeout
                | AttemptFailure::Network(_)
                | AttemptFailure::Server { .. }
                | AttemptFailure::RateLimited { .. }
        )
    }

    fn into_error(self, attempts: u32) -> RequestError {
        match self {
            AttemptFailure::Timeout => RequestError::Timeout { attempts },
            AttemptFailure::Network(message) => RequestError::Network { attempts, message },
            AttemptFailure::Server { status, message } => RequestError::Server {
                status,
                attempts,
                message,
            },
            AttemptFailure::RateLimited { retry_after } => RequestError::RateLimited {
                attempts,
                retry_after,
            },
            AttemptFailure::AuthExpired => RequestError::AuthExpired,
            AttemptFailure::Rejected { status, message } => {
                RequestError::Rejected { status, message }
            }
        }
    }
}

fn transport_failure(err: reqwest::Error) -> AttemptFailure {
    if err.is_timeout() {
        AttemptFailure::Timeout
    } else {
        AttemptFailure::Network(err.to_string())
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn error_message(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    if let Ok(api_error) = serde_json::from_str::<ApiError>(&text) {
        return api_error.message;
    }
    text.chars().take(ERROR_BODY_PREVIEW).collect()
}

async fn classify(result: Result<Response, reqwest::Error>) -> Result<Response, AttemptFailure> {
    let response = result.map_err(transport_failure)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(AttemptFailure::AuthExpired),
        StatusCode::TOO_MANY_REQUESTS => Err(AttemptFailure::RateLimited {
            retry_after: retry_after(&response),
        }),
        StatusCode::REQUEST_TIMEOUT => Err(AttemptFailure::Timeout),
        status if status.is_server_error() => Err(AttemptFailure::Server {
            status: status.as_u16(),
            message: error_message(response).await,
        }),
        status => Err(AttemptFailure::Rejected {
            status: status.as_u16(),
            message: error_message(response).await,
        }),
    }
}

/// HTTP access for one session: bearer auth, bounded retries and a ttl cache
/// that every write invalidates by resource family.
pub struct RequestLayer {
    http: Client,
    api_base_url: String,
    token: RwLock<Option<String>>,
    cache: Mutex<ResponseCache>,
    retry: RetryPolicy,
    ttls: CacheTtls,
    mirror: Option<SharedCacheMirror>,
    cancel: CancellationToken,
}

impl RequestLayer {
    pub fn new(
        config: &SyncConfig,
        token: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let http = Client::builder().timeout(config.request.timeout()).build()?;
        Ok(Self {
            http,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(token),
            cache: Mutex::new(ResponseCache::new()),
            retry: config.request.retry,
            ttls: config.cache,
            mirror: None,
            cancel,
        })
    }

    pub fn with_mirror(mut self, mirror: SharedCacheMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn ttls(&self) -> CacheTtls {
        self.ttls
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base_url, path.trim_start_matches('/'))
    }

    /// Loads still-live entries from the mirror into memory. Returns how many
    /// were restored; mirror trouble only costs the warm start.
    pub async fn warm_start(&self) -> usize {
        let Some(mirror) = &self.mirror else {
            return 0;
        };
        let entries = match mirror.load_live().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "cache: warm start skipped");
                return 0;
            }
        };
        let restored = entries.len();
        let mut cache = self.cache.lock().await;
        for entry in entries {
            cache.insert(entry.key, entry.value, entry.remaining);
        }
        info!(restored, "cache: warm start loaded mirrored entries");
        restored
    }

    pub async fn invalidate_family(&self, family: &str) {
        let removed = self.cache.lock().await.invalidate_family(family);
        debug!(family, removed, "cache: family invalidated");
        if let Some(mirror) = &self.mirror {
            if let Err(err) = mirror.invalidate_family(family).await {
                warn!(family, error = %err, "cache: mirror invalidation failed");
            }
        }
    }

    async fn cached(&self, key: &CacheKey) -> Option<Value> {
        self.cache.lock().await.get(key)
    }

    async fn store(&self, key: CacheKey, value: Value, ttl: Duration) {
        if let Some(mirror) = &self.mirror {
            if let Err(err) = mirror.store(&key, &value, ttl).await {
                warn!(key = key.as_str(), error = %err, "cache: mirror write failed");
            }
        }
        self.cache.lock().await.insert(key, value, ttl);
    }

    /// Sends the request built by `build` until it succeeds, fails with a
    /// non-transient class, or `retry.max_attempts` attempts have been made.
    async fn execute<F>(&self, method: &str, path: &str, build: F) -> Result<Response, RequestError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt: u32 = 1;
        loop {
            let mut request = build(&self.http);
            if let Some(token) = self.token.read().await.as_deref() {
                request = request.bearer_auth(token);
            }

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(RequestError::Cancelled),
                result = request.send() => classify(result).await,
            };
            let failure = match outcome {
                Ok(response) => {
                    if attempt > 1 {
                        info!(method, path, attempt, "request: succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(failure) => failure,
            };

            if !failure.is_transient() || attempt >= self.retry.max_attempts {
                warn!(method, path, attempt, failure = ?failure, "request: giving up");
                return Err(failure.into_error(attempt));
            }

            let delay = match &failure {
                AttemptFailure::RateLimited {
                    retry_after: Some(hint),
                } => *hint,
                _ => self.retry.delay_before_retry(attempt),
            };
            warn!(
                method,
                path,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                failure = ?failure,
                "request: transient failure, retrying"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RequestError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<(T, Value), RequestError> {
        let value: Value = response
            .json()
            .await
            .map_err(|err| RequestError::Decode(err.to_string()))?;
        let typed = serde_json::from_value(value.clone())
            .map_err(|err| RequestError::Decode(err.to_string()))?;
        Ok((typed, value))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        policy: CachePolicy,
    ) -> Result<T, RequestError> {
        let key = CacheKey::new(path, query);
        if let CachePolicy::Ttl(_) = policy {
            if let Some(value) = self.cached(&key).await {
                match serde_json::from_value(value) {
                    Ok(typed) => {
                        debug!(key = key.as_str(), "cache: hit");
                        return Ok(typed);
                    }
                    Err(err) => {
                        warn!(key = key.as_str(), error = %err, "cache: dropping undecodable entry");
                        self.cache.lock().await.invalidate(&key);
                    }
                }
            }
        }

        let url = self.url(path);
        let response = self
            .execute("GET", path, |http| http.get(&url).query(query))
            .await?;
        let (typed, value) = Self::decode::<T>(response).await?;
        if let CachePolicy::Ttl(ttl) = policy {
            self.store(key, value, ttl).await;
        }
        Ok(typed)
    }

    async fn write<F>(&self, method: &str, path: &str, build: F) -> Result<Response, RequestError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let result = self.execute(method, path, build).await;
        if !matches!(result, Err(RequestError::Cancelled)) {
            self.invalidate_family(family_of(path)).await;
        }
        result
    }

    pub async fn create<B, T>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self
            .write("POST", path, |http| http.post(&url).json(body))
            .await?;
        Ok(Self::decode::<T>(response).await?.0)
    }

    pub async fn update<B, T>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        let response = self
            .write("PATCH", path, |http| http.patch(&url).json(body))
            .await?;
        Ok(Self::decode::<T>(response).await?.0)
    }

    pub async fn delete(&self, path: &str) -> Result<(), RequestError> {
        let url = self.url(path);
        self.write("DELETE", path, |http| http.delete(&url))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
#[path = "tests/request_tests.rs"]
mod tests;
