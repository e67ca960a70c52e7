//! Plex media server client
//!
//! Counts remote playback from `/status/sessions`.

use async_trait::async_trait;
use plex_throttle_core::ports::{MediaServer, PortError, PortResult};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::{read_error, transport_error, DEFAULT_TIMEOUT};

/// Plex client authenticated with an `X-Plex-Token`
pub struct PlexClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl PlexClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client: reqwest::Client::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch the current session list
    pub async fn sessions(&self) -> PortResult<Vec<PlexSession>> {
        let url = format!("{}/status/sessions", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("X-Plex-Token", &self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {
                let body: SessionsResponse = response
                    .json()
                    .await
                    .map_err(|e| PortError::Parse(format!("decoding sessions: {}", e)))?;
                Ok(body.media_container.metadata)
            }
            StatusCode::UNAUTHORIZED => Err(PortError::Unauthorized(
                "invalid plex token (401)".to_string(),
            )),
            _ => Err(read_error(response).await),
        }
    }
}

#[async_trait]
impl MediaServer for PlexClient {
    async fn remote_active_stream_count(&self) -> PortResult<u32> {
        let sessions = self.sessions().await?;
        let count = sessions.iter().filter(|s| s.is_remote_and_active()).count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn ping(&self) -> PortResult<()> {
        self.sessions().await.map(|_| ())
    }
}

#[derive(Debug, Default, Deserialize)]
struct SessionsResponse {
    #[serde(rename = "MediaContainer", default)]
    media_container: MediaContainer,
}

#[derive(Debug, Default, Deserialize)]
struct MediaContainer {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<PlexSession>,
}

/// One playback session as reported by Plex
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlexSession {
    #[serde(rename = "Player", default)]
    pub player: Player,
    #[serde(rename = "Session", default)]
    pub session: SessionInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Player {
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub location: String,
}

impl PlexSession {
    /// Off the LAN and currently moving bytes
    pub fn is_remote_and_active(&self) -> bool {
        let remote = self.session.location == "wan" || !self.player.local;
        let active = matches!(self.player.state.as_str(), "playing" | "buffering");
        remote && active
    }
}
