//! Client configuration.
//!
//! Recognised keys (JSON, camelCase): `baseUrl`, `reconnectBaseDelayMs`,
//! `reconnectMaxDelayMs`, `pageSize`. Anything else is rejected.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("malformed configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SyncConfig {
    /// REST root; the push endpoint is derived from it.
    pub base_url: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Default window size.
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            page_size: 10,
        }
    }
}

impl SyncConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration object.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_base()?;
        if self.reconnect_base_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "reconnectBaseDelayMs must be positive".into(),
            ));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnectMaxDelayMs must not be below reconnectBaseDelayMs".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("pageSize must be positive".into()));
        }
        Ok(())
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// HTTP(S) root for request/response calls.
    pub fn api_url(&self) -> Result<Url, ConfigError> {
        let url = self.parsed_base()?;
        let scheme = match url.scheme() {
            "http" | "ws" => "http",
            _ => "https",
        };
        Ok(with_scheme(url, scheme))
    }

    /// WebSocket endpoint of the push feed (`<base>/events`).
    pub fn push_url(&self) -> Result<Url, ConfigError> {
        let url = self.parsed_base()?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            _ => "wss",
        };
        let mut url = with_scheme(url, scheme);
        let path = format!("{}/events", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url)
    }

    fn parsed_base(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(url),
            other => Err(ConfigError::InvalidUrl {
                url: self.base_url.clone(),
                reason: format!("unsupported scheme `{other}`"),
            }),
        }
    }
}

/// `Url::set_scheme` refuses some special-scheme changes, so rebuild
/// from the serialized form instead.
fn with_scheme(url: Url, scheme: &str) -> Url {
    if url.scheme() == scheme {
        return url;
    }
    let rest = &url.as_str()[url.scheme().len()..];
    Url::parse(&format!("{scheme}{rest}")).unwrap_or(url)
}
