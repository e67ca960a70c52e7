//! Policy evaluator
//!
//! The single decision point for the bandwidth regime. Each evaluation:
//!
//! 1. yields to an active manual override without querying the media server,
//! 2. derives the desired state from the remote stream count,
//! 3. does nothing when the desired state is already in force,
//! 4. vetoes streaming -> idle while the cooldown budget is spent,
//! 5. otherwise applies the new limit and commits the state only once the
//!    actuator has accepted it.
//!
//! Manual limit / unlimit / expiry are handled here as well so that every
//! mutation of the operating state goes through one owner.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cooldown::CooldownTracker;
use crate::limit::UploadLimit;
use crate::manual::ManualThrottle;
use crate::metrics::ThrottleMetrics;
use crate::ports::{Actuator, MediaServer, Notifier, PortError};
use crate::report;
use crate::state::{OperatingState, SharedState};

/// Limits and modes the evaluator applies
#[derive(Debug, Clone, Copy)]
pub struct PolicySettings {
    pub idle_limit: UploadLimit,
    pub streaming_limit: UploadLimit,
    /// Log intended limits instead of calling the actuator
    pub dry_run: bool,
}

impl PolicySettings {
    pub fn limit_for(&self, state: OperatingState) -> UploadLimit {
        match state {
            OperatingState::Idle => self.idle_limit,
            OperatingState::Streaming => self.streaming_limit,
        }
    }
}

/// External systems the evaluator drives
#[derive(Clone)]
pub struct Collaborators {
    pub media_server: Arc<dyn MediaServer>,
    pub actuator: Arc<dyn Actuator>,
    pub notifier: Arc<dyn Notifier>,
}

/// State shared with other tasks, each with its own synchronization
#[derive(Clone)]
pub struct Guards {
    pub cooldown: Arc<CooldownTracker>,
    pub manual: Arc<ManualThrottle>,
    pub shared: Arc<SharedState>,
}

/// An applied change of regime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: OperatingState,
    pub to: OperatingState,
    pub limit: UploadLimit,
}

/// Result of one evaluation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// A manual override is in force
    Suppressed,
    /// The media server could not be queried
    Skipped { reason: String },
    /// Desired state already in force
    Unchanged {
        state: OperatingState,
        remote_streams: u32,
    },
    /// Streaming -> idle vetoed by the cooldown tracker
    Blocked { used: usize, max: usize },
    /// The actuator rejected the new limit; state left as it was
    ActuatorFailed { reason: String },
    Applied(Transition),
}

impl Evaluation {
    pub fn changed(&self) -> bool {
        matches!(self, Evaluation::Applied(_))
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Evaluation::Suppressed => "suppressed",
            Evaluation::Skipped { .. } => "upstream_error",
            Evaluation::Unchanged { .. } => "unchanged",
            Evaluation::Blocked { .. } => "blocked",
            Evaluation::ActuatorFailed { .. } => "actuator_error",
            Evaluation::Applied(_) => "applied",
        }
    }
}

/// Outcome of a manual limit request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedThrottle {
    pub generation: u64,
    pub limit: UploadLimit,
    pub duration: Duration,
}

/// Why a manual limit request was not applied
#[derive(Error, Debug)]
pub enum ManualLimitError {
    /// The override deadline cannot be represented
    #[error("duration {0:?} is out of range")]
    DurationOutOfRange(Duration),

    /// The actuator refused the streaming limit
    #[error(transparent)]
    Actuator(#[from] PortError),
}

/// Owns the operating state and decides every transition
pub struct PolicyEvaluator {
    collaborators: Collaborators,
    guards: Guards,
    settings: PolicySettings,
    metrics: Option<Arc<ThrottleMetrics>>,
    state: OperatingState,
    current_limit: UploadLimit,
}

impl PolicyEvaluator {
    /// Start idle at the idle limit
    pub fn new(collaborators: Collaborators, guards: Guards, settings: PolicySettings) -> Self {
        Self {
            collaborators,
            guards,
            current_limit: settings.idle_limit,
            settings,
            metrics: None,
            state: OperatingState::Idle,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ThrottleMetrics>) -> Self {
        metrics.set_limit(self.current_limit);
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> OperatingState {
        self.state
    }

    pub fn current_limit(&self) -> UploadLimit {
        self.current_limit
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    pub fn guards(&self) -> &Guards {
        &self.guards
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.collaborators.notifier
    }

    /// Run one automatic evaluation cycle
    pub async fn evaluate(&mut self) -> Evaluation {
        let evaluation = self.evaluate_inner().await;
        if let Some(metrics) = &self.metrics {
            metrics.record_evaluation(evaluation.outcome());
        }
        evaluation
    }

    async fn evaluate_inner(&mut self) -> Evaluation {
        if self.guards.manual.is_active() {
            debug!("Manual throttle active, skipping media server check");
            return Evaluation::Suppressed;
        }

        let remote_streams = match self
            .collaborators
            .media_server
            .remote_active_stream_count()
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Error checking media server");
                return Evaluation::Skipped {
                    reason: e.to_string(),
                };
            }
        };

        self.guards
            .shared
            .record_check(self.state, remote_streams, self.current_limit);
        if let Some(metrics) = &self.metrics {
            metrics.set_remote_streams(remote_streams);
        }
        debug!(remote_streams, state = %self.state, "Checked remote streams");

        let desired = OperatingState::desired_for(remote_streams);
        if desired == self.state {
            return Evaluation::Unchanged {
                state: self.state,
                remote_streams,
            };
        }

        if self.state == OperatingState::Streaming && desired == OperatingState::Idle {
            let usage = self.guards.cooldown.usage();
            if !usage.has_capacity() {
                info!(
                    used = usage.used,
                    max = usage.max,
                    "Cooldown active: blocking streaming -> idle transition ({}/{} transitions used in window)",
                    usage.used,
                    usage.max
                );
                return Evaluation::Blocked {
                    used: usage.used,
                    max: usage.max,
                };
            }
        }

        self.apply(desired, remote_streams).await
    }

    async fn apply(&mut self, to: OperatingState, remote_streams: u32) -> Evaluation {
        let from = self.state;
        let limit = self.settings.limit_for(to);

        info!(from = %from, to = %to, limit = %limit, "State change: {} -> {} (setting upload limit to {})", from, to, limit);

        if self.settings.dry_run {
            info!(limit = %limit, "[DRY RUN] Would set upload limit to {}", limit);
        } else if let Err(e) = self
            .collaborators
            .actuator
            .set_upload_limit(limit.bytes_per_second())
            .await
        {
            error!(error = %e, "Error setting upload limit");
            return Evaluation::ActuatorFailed {
                reason: e.to_string(),
            };
        }

        self.state = to;
        self.current_limit = limit;
        self.guards.shared.record_check(to, remote_streams, limit);
        if from == OperatingState::Streaming && to == OperatingState::Idle {
            self.guards.cooldown.record_transition();
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(to, limit);
        }

        if !self.settings.dry_run {
            let message = report::transition_message(to, limit);
            if let Err(e) = self.collaborators.notifier.send(&message).await {
                warn!(error = %e, "Error sending notification");
            }
        }

        Evaluation::Applied(Transition { from, to, limit })
    }

    /// Force the streaming limit for `duration`, bypassing the media server and the cooldown
    pub async fn force_throttle(
        &mut self,
        duration: Duration,
        requested_by: &str,
    ) -> Result<ForcedThrottle, ManualLimitError> {
        if !ManualThrottle::accepts(duration) {
            warn!(requested_by, "Refusing manual throttle: duration {:?} is out of range", duration);
            return Err(ManualLimitError::DurationOutOfRange(duration));
        }

        let limit = self.settings.streaming_limit;
        info!(requested_by, duration_secs = duration.as_secs(), "Manual throttle activated by {} for {:?}", requested_by, duration);

        if self.settings.dry_run {
            info!(limit = %limit, "[DRY RUN] Would set upload limit to {}", limit);
        } else if let Err(e) = self
            .collaborators
            .actuator
            .set_upload_limit(limit.bytes_per_second())
            .await
        {
            error!(error = %e, "Error setting upload limit");
            return Err(e.into());
        }

        let generation = self
            .guards
            .manual
            .activate(duration, requested_by)
            .ok_or(ManualLimitError::DurationOutOfRange(duration))?;
        self.state = OperatingState::Streaming;
        self.current_limit = limit;
        self.guards.shared.record_manual_limit(self.state, limit);
        if let Some(metrics) = &self.metrics {
            metrics.record_manual("limit");
            metrics.set_limit(limit);
        }

        Ok(ForcedThrottle {
            generation,
            limit,
            duration,
        })
    }

    /// Clear a user's override and reconcile with the live signal.
    /// Returns `None` when no override was active.
    pub async fn release(&mut self, requested_by: &str) -> Option<Evaluation> {
        if !self.guards.manual.is_active() {
            return None;
        }
        self.guards.manual.deactivate();
        info!(requested_by, "Manual throttle cancelled by {}", requested_by);
        if let Some(metrics) = &self.metrics {
            metrics.record_manual("unlimit");
        }
        Some(self.evaluate().await)
    }

    /// Handle an expiry timer for override `generation`. Returns `None` when
    /// that override was already cleared or replaced.
    pub async fn expire(&mut self, generation: u64) -> Option<Evaluation> {
        if self.guards.manual.expire(generation).is_none() {
            debug!(generation, "Ignoring expiry for an override that is no longer armed");
            return None;
        }
        info!("Manual throttle expired");
        if let Some(metrics) = &self.metrics {
            metrics.record_manual("expire");
        }
        Some(self.evaluate().await)
    }

    /// Text for the `status` command; never mutates state
    pub fn status_report(&self) -> String {
        let snapshot = self.guards.shared.snapshot();
        let manual = self.guards.manual.status();
        report::status_report(&snapshot, manual.as_ref())
    }
}
