use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Coarse classification of a failed call. Everything above the request
/// layer and the channel manager decides on this, never on transport detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    RateLimited,
    AuthExpired,
    Permanent,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    #[error("network failure after {attempts} attempt(s): {message}")]
    Network { attempts: u32, message: String },
    #[error("server responded {status} after {attempts} attempt(s): {message}")]
    Server {
        status: u16,
        attempts: u32,
        message: String,
    },
    #[error("rate limited after {attempts} attempt(s)")]
    RateLimited {
        attempts: u32,
        retry_after: Option<Duration>,
    },
    #[error("authentication expired")]
    AuthExpired,
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response body: {0}")]
    Decode(String),
    #[error("request cancelled")]
    Cancelled,
}

impl RequestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RequestError::Timeout { .. }
            | RequestError::Network { .. }
            | RequestError::Server { .. } => ErrorClass::Transient,
            RequestError::RateLimited { .. } => ErrorClass::RateLimited,
            RequestError::AuthExpired => ErrorClass::AuthExpired,
            RequestError::Rejected { .. } | RequestError::Decode(_) => ErrorClass::Permanent,
            RequestError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open push channel: {0}")]
    Connect(String),
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("failed to receive frame: {0}")]
    Receive(String),
}

/// What a consumer is told when an intent does not go through. Deliberately
/// free of transport detail; that goes to the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("action failed, please retry")]
    Failed,
    #[error("session expired, sign in again and retry")]
    AuthExpired,
    #[error("connection lost, please refresh")]
    ConnectionLost,
    #[error("inbox session is closed")]
    Closed,
}

impl ActionError {
    pub fn from_class(class: ErrorClass) -> Self {
        match class {
            ErrorClass::AuthExpired => ActionError::AuthExpired,
            ErrorClass::Cancelled => ActionError::Closed,
            ErrorClass::Transient | ErrorClass::RateLimited | ErrorClass::Permanent => {
                ActionError::Failed
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
