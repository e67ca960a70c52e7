//! Telegram bot client
//!
//! Sends notifications to the configured chat and long-polls for the
//! `/limit`, `/unlimit` and `/status` commands. Messages from any other chat
//! are ignored.

use async_trait::async_trait;
use plex_throttle_core::dispatcher::{Command, CommandKind, Mailbox};
use plex_throttle_core::manual::MAX_OVERRIDE_DURATION;
use plex_throttle_core::ports::{ChatId, Notifier, PortError, PortResult};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{read_error, transport_error, DEFAULT_TIMEOUT};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Seconds the server holds a `getUpdates` request open
pub const LONG_POLL_TIMEOUT_SECS: u64 = 30;

/// Pause after a failed `getUpdates`
pub const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct TelegramClient {
    api_base: String,
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl TelegramClient {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            client: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Point at another Bot API server
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    async fn post_message(&self, chat_id: serde_json::Value, text: &str) -> PortResult<()> {
        let payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(read_error(response).await)
        }
    }

    /// Post to the configured chat
    pub async fn send_message(&self, text: &str) -> PortResult<()> {
        self.post_message(json!(self.chat_id), text).await
    }

    /// Post to an arbitrary chat
    pub async fn send_reply(&self, chat_id: ChatId, text: &str) -> PortResult<()> {
        self.post_message(json!(chat_id), text).await
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> PortResult<Vec<Update>> {
        let response = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[("timeout", timeout_secs as i64), ("offset", offset)])
            .timeout(Duration::from_secs(timeout_secs + 10))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(read_error(response).await);
        }

        let body: UpdatesResponse = response
            .json()
            .await
            .map_err(|e| PortError::Parse(format!("decoding updates: {}", e)))?;
        if !body.ok {
            return Err(PortError::Rejected(
                "telegram API returned not OK".to_string(),
            ));
        }
        Ok(body.result)
    }

    /// Turn an update into a command if it comes from the configured chat
    pub fn command_from_update(&self, update: &Update, default_duration: Duration) -> Option<Command> {
        let message = update.message.as_ref()?;
        if message.chat.id.to_string() != self.chat_id {
            debug!(chat_id = message.chat.id, "Ignoring message from unknown chat");
            return None;
        }

        let kind = parse_command(message.text.as_deref()?, default_duration)?;
        Some(Command {
            kind,
            requested_by: message
                .from
                .as_ref()
                .and_then(|u| u.username.clone())
                .unwrap_or_default(),
            reply_to: message.chat.id,
        })
    }

    /// Poll forever, posting commands into `commands`. Stopped by aborting the task.
    pub async fn run_poller(self: Arc<Self>, commands: Mailbox<Command>, default_duration: Duration) {
        info!("Telegram command polling started");
        let mut offset = 0;

        loop {
            let updates = match self.get_updates(offset, LONG_POLL_TIMEOUT_SECS).await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "Error getting Telegram updates");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    continue;
                }
            };

            for update in updates {
                offset = update.update_id + 1;
                if let Some(command) = self.command_from_update(&update, default_duration) {
                    debug!(command = command.kind.name(), requested_by = %command.requested_by, "Received Telegram command");
                    commands.post(command);
                }
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramClient {
    async fn send(&self, text: &str) -> PortResult<()> {
        self.send_message(text).await
    }

    async fn reply(&self, chat_id: ChatId, text: &str) -> PortResult<()> {
        self.send_reply(chat_id, text).await
    }
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: Option<String>,
}

/// Parse `/limit [duration]`, `/unlimit` or `/status`, with an optional
/// `@botname` suffix. Anything else yields `None`.
pub fn parse_command(text: &str, default_duration: Duration) -> Option<CommandKind> {
    let mut parts = text.split_whitespace();
    let head = parts.next()?.strip_prefix('/')?;
    let name = head.split('@').next().unwrap_or(head);

    match name {
        "limit" => {
            let duration = parts
                .next()
                .and_then(parse_duration)
                .unwrap_or(default_duration);
            Some(CommandKind::Limit { duration })
        }
        "unlimit" => Some(CommandKind::Unlimit),
        "status" => Some(CommandKind::Status),
        _ => None,
    }
}

/// `1h30m`, `45m`, `90s`, `1.5h` or a bare number of minutes.
/// Returns `None` for anything unparseable, not strictly positive or longer
/// than [`MAX_OVERRIDE_DURATION`].
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        let minutes: u64 = s.parse().ok()?;
        return in_range(Duration::from_secs(minutes.checked_mul(60)?));
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut nanos = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let value: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "h" => 3_600e9,
            "m" => 60e9,
            "s" => 1e9,
            "ms" => 1e6,
            "us" | "µs" => 1e3,
            "ns" => 1.0,
            _ => return None,
        };
        nanos += value * scale;
        rest = &rest[unit_end..];
    }

    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return None;
    }
    in_range(Duration::from_nanos(nanos.round() as u64))
}

fn in_range(d: Duration) -> Option<Duration> {
    (!d.is_zero() && d <= MAX_OVERRIDE_DURATION).then_some(d)
}
