//! HTTP collaborators for Plex Throttle
//!
//! - [`plex::PlexClient`] implements [`MediaServer`](plex_throttle_core::MediaServer)
//! - [`qbittorrent::QBittorrentClient`] implements [`Actuator`](plex_throttle_core::Actuator)
//! - [`telegram::TelegramClient`] implements [`Notifier`](plex_throttle_core::Notifier)
//!   and produces chat commands

pub mod plex;
pub mod qbittorrent;
pub mod telegram;

pub use plex::PlexClient;
pub use qbittorrent::QBittorrentClient;
pub use telegram::TelegramClient;

use plex_throttle_core::ports::PortError;
use std::time::Duration;

/// Per-request timeout for short API calls
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn transport_error(e: reqwest::Error) -> PortError {
    PortError::Network(e.to_string())
}

/// Map a non-success response to a server error, keeping the body text
pub(crate) async fn read_error(response: reqwest::Response) -> PortError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    match status.as_u16() {
        401 => PortError::Unauthorized(message),
        403 => PortError::Forbidden(message),
        code => PortError::Server {
            status: code,
            message,
        },
    }
}
