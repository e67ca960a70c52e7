//! qBittorrent Web API client
//!
//! Uses a cookie-backed session. A 403 on a limit change is treated as an
//! expired session: the client logs in again once and retries.

use async_trait::async_trait;
use plex_throttle_core::ports::{Actuator, PortError, PortResult};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

use crate::{read_error, transport_error, DEFAULT_TIMEOUT};

pub struct QBittorrentClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl QBittorrentClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> PortResult<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| PortError::Network(format!("building http client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            client,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// Open a session; the cookie is kept by the client
    pub async fn login(&self) -> PortResult<()> {
        let url = format!("{}/api/v2/auth/login", self.base_url);
        let form = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::REFERER, &self.base_url)
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {
                // qBittorrent answers 200 "Fails." on bad credentials
                let body = response.text().await.unwrap_or_default();
                if body.trim().eq_ignore_ascii_case("fails.") {
                    return Err(PortError::Unauthorized(
                        "login rejected: invalid username or password".to_string(),
                    ));
                }
                debug!(username = %self.username, "Logged in to qBittorrent");
                Ok(())
            }
            StatusCode::FORBIDDEN => Err(PortError::Forbidden(
                "login failed (403) - IP may be banned from too many attempts".to_string(),
            )),
            _ => Err(read_error(response).await),
        }
    }

    async fn post_upload_limit(&self, bytes_per_second: u64) -> PortResult<()> {
        let url = format!("{}/api/v2/transfer/setUploadLimit", self.base_url);
        let limit = bytes_per_second.to_string();

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::REFERER, &self.base_url)
            .form(&[("limit", limit.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::FORBIDDEN => Err(PortError::Forbidden(
                "forbidden (403) - session may have expired".to_string(),
            )),
            _ => Err(read_error(response).await),
        }
    }

    /// Version string of the running client
    pub async fn version(&self) -> PortResult<String> {
        let url = format!("{}/api/v2/app/version", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            response.text().await.map_err(|e| PortError::Parse(e.to_string()))
        } else {
            Err(read_error(response).await)
        }
    }
}

#[async_trait]
impl Actuator for QBittorrentClient {
    async fn set_upload_limit(&self, bytes_per_second: u64) -> PortResult<()> {
        match self.post_upload_limit(bytes_per_second).await {
            Err(PortError::Forbidden(_)) => {
                info!("qBittorrent session rejected, logging in again");
                self.login()
                    .await
                    .map_err(|e| PortError::Rejected(format!("re-login failed: {}", e)))?;
                self.post_upload_limit(bytes_per_second).await
            }
            other => other,
        }
    }

    async fn ping(&self) -> PortResult<()> {
        self.version().await.map(|_| ())
    }
}
