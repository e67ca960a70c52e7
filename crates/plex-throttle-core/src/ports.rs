//! Collaborator traits
//!
//! The core talks to the outside world only through these traits. The media
//! server reports how many remote sessions are playing, the actuator applies
//! an upload limit, and the notifier relays human-readable messages.
//! Implementations live in `plex-throttle-integrations`.

use async_trait::async_trait;
use thiserror::Error;

/// Chat destination used when replying to a command
pub type ChatId = i64;

/// Errors surfaced by collaborators
#[derive(Error, Debug)]
pub enum PortError {
    /// Transport failure: connect, timeout, TLS
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials were rejected (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Session expired or access denied (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unexpected HTTP status
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Response body could not be decoded
    #[error("Parse error: {0}")]
    Parse(String),

    /// The remote accepted the request but reported failure
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl PortError {
    /// Whether a fresh login might clear this error
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, PortError::Unauthorized(_) | PortError::Forbidden(_))
    }
}

/// Result type for collaborator calls
pub type PortResult<T> = Result<T, PortError>;

/// Source of the remote-playback signal
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait MediaServer: Send + Sync {
    /// Count sessions that are both non-local and playing or buffering
    async fn remote_active_stream_count(&self) -> PortResult<u32>;

    /// Cheap reachability probe for health reporting
    async fn ping(&self) -> PortResult<()>;
}

/// Downstream system whose upload limit is controlled
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Apply a global upload limit; `0` means unlimited. Must be idempotent.
    async fn set_upload_limit(&self, bytes_per_second: u64) -> PortResult<()>;

    /// Cheap reachability probe for health reporting
    async fn ping(&self) -> PortResult<()>;
}

/// Best-effort message sink
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Broadcast to the default destination
    async fn send(&self, text: &str) -> PortResult<()>;

    /// Answer a specific chat
    async fn reply(&self, chat_id: ChatId, text: &str) -> PortResult<()>;
}

/// Notifier used when no chat transport is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _text: &str) -> PortResult<()> {
        Ok(())
    }

    async fn reply(&self, _chat_id: ChatId, _text: &str) -> PortResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_classification() {
        assert!(PortError::Forbidden("expired".into()).is_auth_failure());
        assert!(PortError::Unauthorized("bad token".into()).is_auth_failure());
        assert!(!PortError::Network("refused".into()).is_auth_failure());
        assert!(!PortError::Server {
            status: 500,
            message: String::new()
        }
        .is_auth_failure());
    }

    #[tokio::test]
    async fn test_noop_notifier_accepts_everything() {
        let notifier = NoopNotifier;
        assert!(notifier.send("hello").await.is_ok());
        assert!(notifier.reply(42, "hello").await.is_ok());
    }
}
