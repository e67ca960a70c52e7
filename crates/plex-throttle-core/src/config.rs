//! Service configuration
//!
//! Loaded from a single file whose format follows its extension (`.json`,
//! `.yaml`/`.yml`, `.toml`), then overlaid with secrets from the environment,
//! validated, and completed with defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ThrottleError};
use crate::limit::UploadLimit;
use crate::manual::MAX_OVERRIDE_DURATION;

pub const DEFAULT_POLL_INTERVAL_SEC: u64 = 60;
pub const DEFAULT_COOLDOWN_MAX_TRANSITIONS: usize = 2;
pub const DEFAULT_COOLDOWN_WINDOW_MINUTES: u64 = 60;
pub const DEFAULT_COOLDOWN_STATE_PATH: &str = "cooldown_state.json";
pub const DEFAULT_MANUAL_THROTTLE_MINUTES: u64 = 60;
pub const DEFAULT_WEBHOOK_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_WEBHOOK_RETRY_DELAY_MS: u64 = 500;

/// Upper bounds for configured intervals, shared with manual overrides
pub const MAX_INTERVAL_SEC: u64 = MAX_OVERRIDE_DURATION.as_secs();
pub const MAX_INTERVAL_MINUTES: u64 = MAX_INTERVAL_SEC / 60;
pub const MAX_INTERVAL_MS: u64 = MAX_INTERVAL_SEC * 1000;

/// Environment variables that override secrets from the file
pub const ENV_PLEX_TOKEN: &str = "PLEX_TOKEN";
pub const ENV_QBITTORRENT_PASSWORD: &str = "QBITTORRENT_PASSWORD";
pub const ENV_TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const ENV_TELEGRAM_CHAT_ID: &str = "TELEGRAM_CHAT_ID";

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Pick a format from the file extension, defaulting to JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Full service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub plex_url: String,
    pub plex_token: String,
    pub qbittorrent_url: String,
    pub qbittorrent_username: String,
    pub qbittorrent_password: String,
    pub idle_upload_kbps: u64,
    pub streaming_upload_kbps: u64,
    pub poll_interval_sec: u64,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub health_port: u16,
    pub cooldown_max_transitions: usize,
    pub cooldown_window_minutes: u64,
    pub cooldown_state_path: String,
    pub manual_throttle_default_minutes: u64,
    pub webhook_retry_attempts: u32,
    pub webhook_retry_delay_ms: u64,
}

impl Settings {
    /// Load, override from the environment, validate, and fill defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ThrottleError::Io(format!("reading config file {}: {}", path.display(), e))
        })?;

        let mut settings = Self::parse(&content, ConfigFormat::from_path(path))?;
        settings.apply_env(|name| std::env::var(name).ok());
        settings.validate()?;
        settings.apply_defaults();
        Ok(settings)
    }

    /// Parse without touching the environment or applying defaults
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let settings = match format {
            ConfigFormat::Json => serde_json::from_str(content)?,
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Toml => toml::from_str(content)?,
        };
        Ok(settings)
    }

    /// Overlay secrets; empty values are ignored
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides: [(&str, &mut String); 4] = [
            (ENV_PLEX_TOKEN, &mut self.plex_token),
            (ENV_QBITTORRENT_PASSWORD, &mut self.qbittorrent_password),
            (ENV_TELEGRAM_BOT_TOKEN, &mut self.telegram_bot_token),
            (ENV_TELEGRAM_CHAT_ID, &mut self.telegram_chat_id),
        ];

        for (name, field) in overrides {
            if let Some(value) = lookup(name).filter(|v| !v.is_empty()) {
                *field = value;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.plex_url.is_empty() {
            return Err(ThrottleError::config("plex_url is required"));
        }
        if self.plex_token.is_empty() {
            return Err(ThrottleError::config(format!(
                "plex_token is required (set in config or {} env var)",
                ENV_PLEX_TOKEN
            )));
        }
        if self.qbittorrent_url.is_empty() {
            return Err(ThrottleError::config("qbittorrent_url is required"));
        }

        let max_kbps = UploadLimit::MAX.kbps();
        check_range("idle_upload_kbps", self.idle_upload_kbps, max_kbps)?;
        check_range("streaming_upload_kbps", self.streaming_upload_kbps, max_kbps)?;
        check_range("poll_interval_sec", self.poll_interval_sec, MAX_INTERVAL_SEC)?;
        check_range(
            "cooldown_window_minutes",
            self.cooldown_window_minutes,
            MAX_INTERVAL_MINUTES,
        )?;
        check_range(
            "manual_throttle_default_minutes",
            self.manual_throttle_default_minutes,
            MAX_INTERVAL_MINUTES,
        )?;
        check_range(
            "webhook_retry_delay_ms",
            self.webhook_retry_delay_ms,
            MAX_INTERVAL_MS,
        )?;
        Ok(())
    }

    pub fn apply_defaults(&mut self) {
        if self.poll_interval_sec == 0 {
            self.poll_interval_sec = DEFAULT_POLL_INTERVAL_SEC;
        }
        if self.cooldown_max_transitions == 0 {
            self.cooldown_max_transitions = DEFAULT_COOLDOWN_MAX_TRANSITIONS;
        }
        if self.cooldown_window_minutes == 0 {
            self.cooldown_window_minutes = DEFAULT_COOLDOWN_WINDOW_MINUTES;
        }
        if self.cooldown_state_path.is_empty() {
            self.cooldown_state_path = DEFAULT_COOLDOWN_STATE_PATH.to_string();
        }
        if self.manual_throttle_default_minutes == 0 {
            self.manual_throttle_default_minutes = DEFAULT_MANUAL_THROTTLE_MINUTES;
        }
        if self.webhook_retry_attempts == 0 {
            self.webhook_retry_attempts = DEFAULT_WEBHOOK_RETRY_ATTEMPTS;
        }
        if self.webhook_retry_delay_ms == 0 {
            self.webhook_retry_delay_ms = DEFAULT_WEBHOOK_RETRY_DELAY_MS;
        }
    }

    pub fn telegram_enabled(&self) -> bool {
        !self.telegram_bot_token.is_empty() && !self.telegram_chat_id.is_empty()
    }

    pub fn health_enabled(&self) -> bool {
        self.health_port > 0
    }

    pub fn idle_limit(&self) -> UploadLimit {
        UploadLimit::from_kbps(self.idle_upload_kbps)
    }

    pub fn streaming_limit(&self) -> UploadLimit {
        UploadLimit::from_kbps(self.streaming_upload_kbps)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_secs(self.cooldown_window_minutes.saturating_mul(60))
    }

    pub fn manual_throttle_default(&self) -> Duration {
        Duration::from_secs(self.manual_throttle_default_minutes.saturating_mul(60))
    }

    pub fn webhook_retry_delay(&self) -> Duration {
        Duration::from_millis(self.webhook_retry_delay_ms)
    }
}

fn check_range(field: &str, value: u64, max: u64) -> Result<()> {
    if value > max {
        return Err(ThrottleError::config(format!(
            "{} must be at most {} (got {})",
            field, max, value
        )));
    }
    Ok(())
}
