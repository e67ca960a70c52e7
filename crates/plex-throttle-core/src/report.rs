//! Human-readable messages sent through the notifier

use std::time::Duration;

use crate::limit::UploadLimit;
use crate::manual::OverrideStatus;
use crate::state::{AppSnapshot, OperatingState};

/// Compact duration: `1h30m`, `4m5s`, `42s`
pub fn format_duration(d: Duration) -> String {
    let secs = (d.as_millis() + 500) / 1000;
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

pub fn transition_message(to: OperatingState, limit: UploadLimit) -> String {
    match to {
        OperatingState::Streaming => {
            format!("*Streaming detected*\nThrottling upload to {}", limit)
        }
        OperatingState::Idle => format!("*Streaming ended*\nRestoring upload to {}", limit),
    }
}

pub fn manual_activated_message(duration: Duration, limit: UploadLimit) -> String {
    format!(
        "*Manual throttle activated*\nDuration: {}\nUpload limited to {}",
        format_duration(duration),
        limit
    )
}

pub fn manual_cancelled_message(state: OperatingState, limit: UploadLimit) -> String {
    format!(
        "*Manual throttle cancelled*\nRestored to {} state ({})",
        state, limit
    )
}

pub fn manual_expired_message(state: OperatingState, limit: UploadLimit) -> String {
    format!(
        "*Manual throttle expired*\nRestored to {} state ({})",
        state, limit
    )
}

pub const MANUAL_NOT_ACTIVE: &str = "Manual throttle is not currently active.";

pub fn manual_failed_message(error: &impl std::fmt::Display) -> String {
    format!("Error setting limit: {}", error)
}

/// Reply to the `status` command
pub fn status_report(snapshot: &AppSnapshot, manual: Option<&OverrideStatus>) -> String {
    let uptime = format_duration(snapshot.uptime());
    match manual {
        Some(o) => format!(
            "*Status*\nState: manual throttle\nUpload limit: {}\nTime remaining: {}\nRemote streams: {}\nUptime: {}",
            snapshot.current_limit,
            format_duration(o.remaining),
            snapshot.remote_streams,
            uptime
        ),
        None => format!(
            "*Status*\nState: {}\nUpload limit: {}\nRemote streams: {}\nUptime: {}",
            snapshot.state, snapshot.current_limit, snapshot.remote_streams, uptime
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SharedState;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4m5s");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_millis(1600)), "2s");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_transition_messages() {
        assert_eq!(
            transition_message(OperatingState::Streaming, UploadLimit::from_kbps(100)),
            "*Streaming detected*\nThrottling upload to 100 KB/s"
        );
        assert_eq!(
            transition_message(OperatingState::Idle, UploadLimit::UNLIMITED),
            "*Streaming ended*\nRestoring upload to unlimited"
        );
    }

    #[test]
    fn test_status_report_variants() {
        let shared = SharedState::new(UploadLimit::UNLIMITED);
        shared.record_check(OperatingState::Idle, 0, UploadLimit::UNLIMITED);
        let snapshot = shared.snapshot();

        let automatic = status_report(&snapshot, None);
        assert!(automatic.contains("State: idle"));
        assert!(automatic.contains("Upload limit: unlimited"));

        let manual = OverrideStatus {
            requested_by: "alice".into(),
            remaining: Duration::from_secs(1500),
        };
        let report = status_report(&snapshot, Some(&manual));
        assert!(report.contains("State: manual throttle"));
        assert!(report.contains("Time remaining: 25m0s"));
    }
}
