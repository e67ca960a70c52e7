//! Manual throttle guard
//!
//! A time-boxed override that forces the streaming limit regardless of what
//! the media server reports. `is_active` expires on read; the control loop
//! additionally arms a timer so the automatic state is restored promptly.
//!
//! Each activation gets a fresh generation number. The expiry timer carries
//! the generation it was armed for, so a late timer can never clear an
//! override that replaced the one it belonged to.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Longest override accepted, the span of a signed 64-bit nanosecond count
pub const MAX_OVERRIDE_DURATION: Duration = Duration::from_nanos(i64::MAX as u64);

/// An active manual override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualOverride {
    pub generation: u64,
    pub requested_by: String,
    pub activated_at: Instant,
    pub expires_at: Instant,
}

impl ManualOverride {
    /// Live at `now`; exactly `expires_at` counts as expired
    pub fn is_live_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Point-in-time view for status and health reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideStatus {
    pub requested_by: String,
    pub remaining: Duration,
}

#[derive(Debug, Default)]
struct GuardState {
    current: Option<ManualOverride>,
    next_generation: u64,
}

/// Holds at most one manual override at a time
#[derive(Debug, Default)]
pub struct ManualThrottle {
    state: Mutex<GuardState>,
}

impl ManualThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an override of `duration` starting now can be represented
    pub fn accepts(duration: Duration) -> bool {
        deadline(Instant::now(), duration).is_some()
    }

    /// Start an override, replacing any existing one. Returns its generation,
    /// or `None` (leaving the current override untouched) when `duration` is
    /// out of range.
    pub fn activate(&self, duration: Duration, requested_by: impl Into<String>) -> Option<u64> {
        let now = Instant::now();
        let expires_at = deadline(now, duration)?;
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.current = Some(ManualOverride {
            generation,
            requested_by: requested_by.into(),
            activated_at: now,
            expires_at,
        });
        Some(generation)
    }

    /// Clear the override, returning it if one was set
    pub fn deactivate(&self) -> Option<ManualOverride> {
        self.lock().current.take()
    }

    /// Clear the override only if it is still the one armed as `generation`
    pub fn expire(&self, generation: u64) -> Option<ManualOverride> {
        let mut state = self.lock();
        match &state.current {
            Some(current) if current.generation == generation => state.current.take(),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Instant::now())
    }

    pub fn is_active_at(&self, now: Instant) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|o| o.is_live_at(now))
    }

    /// Zero once the override has expired or been cleared
    pub fn time_remaining(&self) -> Duration {
        self.time_remaining_at(Instant::now())
    }

    pub fn time_remaining_at(&self, now: Instant) -> Duration {
        self.lock()
            .current
            .as_ref()
            .map(|o| o.remaining_at(now))
            .unwrap_or_default()
    }

    /// The live override, if any
    pub fn status(&self) -> Option<OverrideStatus> {
        let now = Instant::now();
        self.lock()
            .current
            .as_ref()
            .filter(|o| o.is_live_at(now))
            .map(|o| OverrideStatus {
                requested_by: o.requested_by.clone(),
                remaining: o.remaining_at(now),
            })
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn deadline(now: Instant, duration: Duration) -> Option<Instant> {
    if duration > MAX_OVERRIDE_DURATION {
        return None;
    }
    now.checked_add(duration)
}
