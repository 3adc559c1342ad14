use std::path::PathBuf;

use anyhow::{Context, Result};
use client_core::SyncConfig;
use serde::Deserialize;

/// Everything the CLI needs to open a session. Layered as: defaults, then the
/// optional config file, then `INBOX__`-prefixed environment variables
/// (`INBOX__SYNC__REALTIME__HEARTBEAT_INTERVAL_MS=…`), then command-line flags.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub user_id: i64,
    pub token: String,
    /// Directory for the warm-start cache database. No mirror when unset.
    pub cache_dir: Option<PathBuf>,
    pub sync: SyncConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_id: 0,
            token: String::new(),
            cache_dir: None,
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub api_url: Option<String>,
    pub user_id: Option<i64>,
    pub token: Option<String>,
}

pub fn load_settings(file_stem: &str, overrides: Overrides) -> Result<Settings> {
    let layered = ::config::Config::builder()
        .add_source(::config::File::with_name(file_stem).required(false))
        .add_source(
            ::config::Environment::with_prefix("INBOX")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read settings from '{file_stem}'"))?;
    let mut settings: Settings = layered
        .try_deserialize()
        .context("invalid inbox settings")?;

    if let Some(api_url) = overrides.api_url {
        settings.sync.api_base_url = api_url;
    }
    if let Some(user_id) = overrides.user_id {
        settings.user_id = user_id;
    }
    if let Some(token) = overrides.token {
        settings.token = token;
    }

    anyhow::ensure!(settings.user_id > 0, "a user id is required (--user-id or INBOX__USER_ID)");
    anyhow::ensure!(!settings.token.is_empty(), "a token is required (--token or INBOX__TOKEN)");
    settings
        .sync
        .validate()
        .context("invalid sync configuration")?;
    Ok(settings)
}
