//! Operating state and the shared snapshot read by the health endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::limit::UploadLimit;

/// Last-applied bandwidth regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingState {
    #[default]
    Idle,
    Streaming,
}

impl OperatingState {
    /// The regime the media-server signal asks for
    pub fn desired_for(remote_streams: u32) -> Self {
        if remote_streams > 0 {
            OperatingState::Streaming
        } else {
            OperatingState::Idle
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingState::Idle => "idle",
            OperatingState::Streaming => "streaming",
        }
    }
}

impl fmt::Display for OperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the health endpoint reports
#[derive(Debug, Clone)]
pub struct AppSnapshot {
    pub state: OperatingState,
    pub last_check: Option<DateTime<Utc>>,
    pub remote_streams: u32,
    pub current_limit: UploadLimit,
    pub started_at: DateTime<Utc>,
    start_instant: Instant,
}

impl AppSnapshot {
    pub fn uptime(&self) -> Duration {
        self.start_instant.elapsed()
    }
}

/// Last-known-good snapshot, written by the control loop, read by anyone
#[derive(Debug)]
pub struct SharedState {
    inner: RwLock<AppSnapshot>,
}

impl SharedState {
    pub fn new(initial_limit: UploadLimit) -> Self {
        Self {
            inner: RwLock::new(AppSnapshot {
                state: OperatingState::Idle,
                last_check: None,
                remote_streams: 0,
                current_limit: initial_limit,
                started_at: Utc::now(),
                start_instant: Instant::now(),
            }),
        }
    }

    /// Record a completed media-server check
    pub fn record_check(&self, state: OperatingState, remote_streams: u32, limit: UploadLimit) {
        let mut snapshot = self.write();
        snapshot.state = state;
        snapshot.remote_streams = remote_streams;
        snapshot.current_limit = limit;
        snapshot.last_check = Some(Utc::now());
    }

    /// Record a manually forced limit. No sessions were queried, so the
    /// stream count resets to zero.
    pub fn record_manual_limit(&self, state: OperatingState, limit: UploadLimit) {
        let mut snapshot = self.write();
        snapshot.state = state;
        snapshot.remote_streams = 0;
        snapshot.current_limit = limit;
        snapshot.last_check = Some(Utc::now());
    }

    pub fn snapshot(&self) -> AppSnapshot {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, AppSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, AppSnapshot> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_state() {
        assert_eq!(OperatingState::desired_for(0), OperatingState::Idle);
        assert_eq!(OperatingState::desired_for(1), OperatingState::Streaming);
        assert_eq!(OperatingState::desired_for(7), OperatingState::Streaming);
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(OperatingState::Streaming.to_string(), "streaming");
        assert_eq!(
            serde_json::to_string(&OperatingState::Idle).unwrap(),
            "\"idle\""
        );
    }

    #[test]
    fn test_initial_snapshot() {
        let shared = SharedState::new(UploadLimit::UNLIMITED);
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.state, OperatingState::Idle);
        assert!(snapshot.last_check.is_none());
        assert_eq!(snapshot.current_limit, UploadLimit::UNLIMITED);
    }

    #[test]
    fn test_manual_limit_resets_stream_count() {
        let shared = SharedState::new(UploadLimit::UNLIMITED);
        shared.record_check(OperatingState::Idle, 3, UploadLimit::UNLIMITED);
        shared.record_manual_limit(OperatingState::Streaming, UploadLimit::from_kbps(100));

        let snapshot = shared.snapshot();
        assert_eq!(snapshot.state, OperatingState::Streaming);
        assert_eq!(snapshot.remote_streams, 0);
        assert_eq!(snapshot.current_limit.kbps(), 100);
        assert!(snapshot.last_check.is_some());
    }
}
