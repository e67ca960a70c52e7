//! Prometheus metrics for the throttle core
//!
//! - `plex_throttle_evaluations_total` (counter) - evaluation cycles by outcome
//! - `plex_throttle_transitions_total` (counter) - applied transitions by target state
//! - `plex_throttle_manual_actions_total` (counter) - limit / unlimit / expire
//! - `plex_throttle_remote_streams` (gauge) - last observed remote stream count
//! - `plex_throttle_upload_limit_kbps` (gauge) - limit currently in force

use prometheus::{CounterVec, Encoder, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::error::Result;
use crate::limit::UploadLimit;
use crate::state::OperatingState;

const NAMESPACE: &str = "plex_throttle";

/// Metrics recorded by the policy evaluator
pub struct ThrottleMetrics {
    registry: Arc<Registry>,
    evaluations_total: CounterVec,
    transitions_total: CounterVec,
    manual_actions_total: CounterVec,
    remote_streams: IntGauge,
    upload_limit_kbps: IntGauge,
}

impl ThrottleMetrics {
    /// Create and register all collectors with `registry`
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let evaluations_total = CounterVec::new(
            Opts::new("evaluations_total", "Policy evaluation cycles by outcome")
                .namespace(NAMESPACE),
            &["outcome"],
        )?;

        let transitions_total = CounterVec::new(
            Opts::new("transitions_total", "Applied state transitions by target state")
                .namespace(NAMESPACE),
            &["to"],
        )?;

        let manual_actions_total = CounterVec::new(
            Opts::new("manual_actions_total", "Manual throttle actions")
                .namespace(NAMESPACE),
            &["action"],
        )?;

        let remote_streams = IntGauge::with_opts(
            Opts::new("remote_streams", "Remote streams seen on the last check")
                .namespace(NAMESPACE),
        )?;

        let upload_limit_kbps = IntGauge::with_opts(
            Opts::new("upload_limit_kbps", "Upload limit in force, 0 = unlimited")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(evaluations_total.clone()))?;
        registry.register(Box::new(transitions_total.clone()))?;
        registry.register(Box::new(manual_actions_total.clone()))?;
        registry.register(Box::new(remote_streams.clone()))?;
        registry.register(Box::new(upload_limit_kbps.clone()))?;

        Ok(Self {
            registry,
            evaluations_total,
            transitions_total,
            manual_actions_total,
            remote_streams,
            upload_limit_kbps,
        })
    }

    pub fn record_evaluation(&self, outcome: &str) {
        self.evaluations_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_transition(&self, to: OperatingState, limit: UploadLimit) {
        self.transitions_total.with_label_values(&[to.as_str()]).inc();
        self.set_limit(limit);
    }

    pub fn record_manual(&self, action: &str) {
        self.manual_actions_total.with_label_values(&[action]).inc();
    }

    pub fn set_remote_streams(&self, count: u32) {
        self.remote_streams.set(i64::from(count));
    }

    pub fn set_limit(&self, limit: UploadLimit) {
        self.upload_limit_kbps
            .set(i64::try_from(limit.kbps()).unwrap_or(i64::MAX));
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_encode() {
        let metrics = ThrottleMetrics::new(Arc::new(Registry::new())).unwrap();
        metrics.record_evaluation("applied");
        metrics.record_transition(OperatingState::Streaming, UploadLimit::from_kbps(300));
        metrics.record_manual("limit");
        metrics.set_remote_streams(2);

        let text = metrics.encode().unwrap();
        assert!(text.contains("plex_throttle_evaluations_total{outcome=\"applied\"} 1"));
        assert!(text.contains("plex_throttle_transitions_total{to=\"streaming\"} 1"));
        assert!(text.contains("plex_throttle_upload_limit_kbps 300"));
        assert!(text.contains("plex_throttle_remote_streams 2"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Arc::new(Registry::new());
        ThrottleMetrics::new(registry.clone()).unwrap();
        assert!(ThrottleMetrics::new(registry).is_err());
    }
}
