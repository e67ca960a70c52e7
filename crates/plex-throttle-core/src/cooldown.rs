//! Cooldown tracking for streaming -> idle transitions
//!
//! Keeps a trailing window of transition timestamps. Once `max_transitions`
//! have happened inside the window, further streaming -> idle transitions are
//! vetoed until the oldest entry slides out. The history is persisted as JSON
//! so a restart does not reset the budget.
//!
//! Every query prunes first, so the stored history never holds entries older
//! than `now - window`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, ThrottleError};

/// On-disk representation of the transition history
#[derive(Debug, Default, Serialize, Deserialize)]
struct CooldownState {
    transitions: Vec<DateTime<Utc>>,
}

/// How much of the cooldown budget is spent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownUsage {
    pub used: usize,
    pub max: usize,
}

impl CooldownUsage {
    pub fn has_capacity(&self) -> bool {
        self.used < self.max
    }
}

/// Sliding-window limiter over streaming -> idle transitions
#[derive(Debug)]
pub struct CooldownTracker {
    transitions: Mutex<Vec<DateTime<Utc>>>,
    max_transitions: usize,
    window: chrono::Duration,
    state_path: Option<PathBuf>,
}

impl CooldownTracker {
    /// Create a tracker backed by `state_path`, loading any saved history
    pub fn new(max_transitions: usize, window: Duration, state_path: impl Into<PathBuf>) -> Self {
        let tracker = Self {
            transitions: Mutex::new(Vec::new()),
            max_transitions,
            window: to_chrono(window),
            state_path: Some(state_path.into()),
        };
        tracker.load();
        tracker
    }

    /// Create a tracker that never touches the filesystem
    pub fn in_memory(max_transitions: usize, window: Duration) -> Self {
        Self {
            transitions: Mutex::new(Vec::new()),
            max_transitions,
            window: to_chrono(window),
            state_path: None,
        }
    }

    /// Seed the history, e.g. with transitions observed elsewhere
    pub fn with_transitions(self, mut transitions: Vec<DateTime<Utc>>) -> Self {
        transitions.sort();
        *self.lock() = transitions;
        self
    }

    pub fn max_transitions(&self) -> usize {
        self.max_transitions
    }

    pub fn window(&self) -> Duration {
        self.window.to_std().unwrap_or_default()
    }

    /// Whether another streaming -> idle transition fits in the window
    pub fn can_transition_to_idle(&self) -> bool {
        self.can_transition_to_idle_at(Utc::now())
    }

    pub fn can_transition_to_idle_at(&self, now: DateTime<Utc>) -> bool {
        self.usage_at(now).has_capacity()
    }

    /// Transitions currently counted against the budget
    pub fn transitions_in_window(&self) -> usize {
        self.usage_at(Utc::now()).used
    }

    pub fn usage(&self) -> CooldownUsage {
        self.usage_at(Utc::now())
    }

    pub fn usage_at(&self, now: DateTime<Utc>) -> CooldownUsage {
        let mut transitions = self.lock();
        self.prune(&mut transitions, now);
        CooldownUsage {
            used: transitions.len(),
            max: self.max_transitions,
        }
    }

    /// Record a streaming -> idle transition happening now and persist the history
    pub fn record_transition(&self) {
        self.record_transition_at(Utc::now());
    }

    pub fn record_transition_at(&self, now: DateTime<Utc>) {
        let history = {
            let mut transitions = self.lock();
            self.prune(&mut transitions, now);
            transitions.push(now);
            transitions.clone()
        };

        // Written outside the lock; the control loop is the only recorder.
        if let Err(e) = self.save(history) {
            warn!(error = %e, "Failed to save cooldown state");
        }
    }

    /// Snapshot of the pruned history, oldest first
    pub fn transitions(&self) -> Vec<DateTime<Utc>> {
        let mut transitions = self.lock();
        self.prune(&mut transitions, Utc::now());
        transitions.clone()
    }

    fn prune(&self, transitions: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>) {
        // A window reaching past the calendar's start keeps everything.
        if let Some(cutoff) = now.checked_sub_signed(self.window) {
            transitions.retain(|t| *t > cutoff);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DateTime<Utc>>> {
        self.transitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) {
        let Some(path) = self.state_path.as_deref() else {
            return;
        };

        let state = match read_state(path) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load cooldown state, starting empty");
                return;
            }
        };

        let mut transitions = self.lock();
        *transitions = state.transitions;
        transitions.sort();
        self.prune(&mut transitions, Utc::now());

        if !transitions.is_empty() {
            info!(
                count = transitions.len(),
                "Loaded recent cooldown transitions from state file"
            );
        }
    }

    fn save(&self, transitions: Vec<DateTime<Utc>>) -> Result<()> {
        let Some(path) = self.state_path.as_deref() else {
            return Ok(());
        };

        let state = CooldownState { transitions };
        let data = serde_json::to_vec(&state)
            .map_err(|e| ThrottleError::persistence(format!("encoding state: {}", e)))?;

        std::fs::write(path, data)
            .map_err(|e| ThrottleError::persistence(format!("writing {}: {}", path.display(), e)))
    }
}

fn read_state(path: &Path) -> Result<CooldownState> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn to_chrono(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
