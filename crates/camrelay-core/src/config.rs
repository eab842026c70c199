//! Bridge configuration.
//!
//! Every tunable has a default in [`defaults`]; deployment-specific values
//! come from the environment variables named in [`env_vars`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default values.
pub mod defaults {
    pub const WS_URL: &str = "ws://localhost:3000";
    pub const OUTPUT_DIR: &str = "./local_files";
    pub const CAPTCHA_PORT: u16 = 8080;
    pub const FFMPEG_PATH: &str = "ffmpeg";
    pub const SCHEMA_VERSION: u32 = 21;

    /// Time to wait for `driver.connect` before firing the startup query anyway.
    pub const CONNECT_TIMEOUT_SECS: u64 = 10 * 60;
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const QUERY_RESPONSE_TIMEOUT_SECS: u64 = 30;
    pub const POLL_SCHEDULE_SECS: [u64; 5] = [5, 10, 20, 40, 80];

    pub const RECONNECT_FLOOR_MS: u64 = 1_000;
    pub const RECONNECT_CEILING_MS: u64 = 60_000;

    pub const WEBHOOK_TIMEOUT_SECS: u64 = 30;
    pub const MUX_TIMEOUT_SECS: u64 = 120;
}

/// Environment variable names.
pub mod env_vars {
    pub const WS_URL: &str = "EUFY_WS_URL";
    pub const STATION_SERIAL: &str = "HOMEBASE_SN";
    pub const DEVICE_SERIAL: &str = "DOORBELL_SN";
    pub const WEBHOOK_URL: &str = "N8N_WEBHOOK_URL";
    pub const WEBHOOK_USER: &str = "N8N_WEBHOOK_USER";
    pub const WEBHOOK_PASSWORD: &str = "N8N_WEBHOOK_PASSWORD";
    pub const OUTPUT_DIR: &str = "OUTPUT_DIR";
    pub const CAPTCHA_PORT: &str = "CAPTCHA_PORT";
    pub const FFMPEG_PATH: &str = "FFMPEG_PATH";
    pub const MUX_TIMEOUT_SECS: &str = "MUX_TIMEOUT_SECS";
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Webhook sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    defaults::WEBHOOK_TIMEOUT_SECS
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            timeout_secs: defaults::WEBHOOK_TIMEOUT_SECS,
        }
    }

    /// Basic-auth credentials, only when both halves are present.
    pub fn basic_auth(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Full bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Device-control WebSocket endpoint.
    pub ws_url: String,

    /// Serial number of the station (home base) the recordings live on.
    pub station_serial: String,

    /// Serial number of the monitored camera.
    pub device_serial: String,

    pub webhook: WebhookConfig,

    /// Staging directory for raw streams and muxed artifacts.
    pub output_dir: PathBuf,

    pub captcha_port: u16,

    pub ffmpeg_path: String,

    pub schema_version: u32,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,

    pub query_response_timeout_secs: u64,

    /// Sleep before each poll attempt, ascending.
    pub poll_schedule_secs: Vec<u64>,

    pub reconnect_floor_ms: u64,

    pub reconnect_ceiling_ms: u64,

    pub mux_timeout_secs: u64,
}

impl BridgeConfig {
    /// Create a configuration with defaults for everything but the identifiers.
    pub fn new(
        station_serial: impl Into<String>,
        device_serial: impl Into<String>,
        webhook_url: impl Into<String>,
    ) -> Self {
        Self {
            ws_url: defaults::WS_URL.to_string(),
            station_serial: station_serial.into(),
            device_serial: device_serial.into(),
            webhook: WebhookConfig::new(webhook_url),
            output_dir: PathBuf::from(defaults::OUTPUT_DIR),
            captcha_port: defaults::CAPTCHA_PORT,
            ffmpeg_path: defaults::FFMPEG_PATH.to_string(),
            schema_version: defaults::SCHEMA_VERSION,
            connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECS,
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            query_response_timeout_secs: defaults::QUERY_RESPONSE_TIMEOUT_SECS,
            poll_schedule_secs: defaults::POLL_SCHEDULE_SECS.to_vec(),
            reconnect_floor_ms: defaults::RECONNECT_FLOOR_MS,
            reconnect_ceiling_ms: defaults::RECONNECT_CEILING_MS,
            mux_timeout_secs: defaults::MUX_TIMEOUT_SECS,
        }
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let mut config = Self::new(
            required(env_vars::STATION_SERIAL)?,
            required(env_vars::DEVICE_SERIAL)?,
            required(env_vars::WEBHOOK_URL)?,
        );

        if let Some(url) = lookup(env_vars::WS_URL) {
            config.ws_url = url;
        }
        config.webhook.username = lookup(env_vars::WEBHOOK_USER);
        config.webhook.password = lookup(env_vars::WEBHOOK_PASSWORD);
        if let Some(dir) = lookup(env_vars::OUTPUT_DIR) {
            config.output_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup(env_vars::CAPTCHA_PORT) {
            config.captcha_port = port.parse().map_err(|_| ConfigError::Invalid {
                key: env_vars::CAPTCHA_PORT,
                value: port.clone(),
            })?;
        }
        if let Some(path) = lookup(env_vars::FFMPEG_PATH) {
            config.ffmpeg_path = path;
        }
        if let Some(secs) = lookup(env_vars::MUX_TIMEOUT_SECS) {
            config.mux_timeout_secs = secs.parse().map_err(|_| ConfigError::Invalid {
                key: env_vars::MUX_TIMEOUT_SECS,
                value: secs.clone(),
            })?;
        }

        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn query_response_timeout(&self) -> Duration {
        Duration::from_secs(self.query_response_timeout_secs)
    }

    pub fn poll_schedule(&self) -> Vec<Duration> {
        self.poll_schedule_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    pub fn reconnect_floor(&self) -> Duration {
        Duration::from_millis(self.reconnect_floor_ms)
    }

    pub fn reconnect_ceiling(&self) -> Duration {
        Duration::from_millis(self.reconnect_ceiling_ms)
    }

    pub fn mux_timeout(&self) -> Duration {
        Duration::from_secs(self.mux_timeout_secs)
    }
}
