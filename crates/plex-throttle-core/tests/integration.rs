//! End-to-end tests for the control loop with in-process collaborators

use async_trait::async_trait;
use chrono::Utc;
use plex_throttle_core::cooldown::CooldownTracker;
use plex_throttle_core::dispatcher::{
    Command, CommandKind, DispatchSettings, Dispatcher, DispatcherHandle, PushEvent,
};
use plex_throttle_core::manual::ManualThrottle;
use plex_throttle_core::policy::{
    Collaborators, Evaluation, Guards, PolicyEvaluator, PolicySettings,
};
use plex_throttle_core::ports::{Actuator, ChatId, MediaServer, Notifier, PortError, PortResult};
use plex_throttle_core::report;
use plex_throttle_core::state::{OperatingState, SharedState};
use plex_throttle_core::UploadLimit;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const HOUR: Duration = Duration::from_secs(3600);
const STREAMING_KBPS: u64 = 100;
const CHAT: ChatId = 4242;

/// Reports scripted counts first, then the steady value
#[derive(Default)]
struct FakeMediaServer {
    scripted: Mutex<VecDeque<u32>>,
    steady: Mutex<u32>,
    queries: AtomicUsize,
}

impl FakeMediaServer {
    fn set(&self, count: u32) {
        *self.steady.lock().unwrap() = count;
    }

    fn script(&self, counts: &[u32]) {
        self.scripted.lock().unwrap().extend(counts);
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaServer for FakeMediaServer {
    async fn remote_active_stream_count(&self) -> PortResult<u32> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let next = self.scripted.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| *self.steady.lock().unwrap()))
    }

    async fn ping(&self) -> PortResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingActuator {
    limits: Mutex<Vec<u64>>,
    failing: AtomicBool,
}

impl RecordingActuator {
    fn limits(&self) -> Vec<u64> {
        self.limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Actuator for RecordingActuator {
    async fn set_upload_limit(&self, bytes_per_second: u64) -> PortResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PortError::Network("connection refused".into()));
        }
        self.limits.lock().unwrap().push(bytes_per_second);
        Ok(())
    }

    async fn ping(&self) -> PortResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
    replies: Mutex<Vec<(ChatId, String)>>,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn last_reply(&self) -> Option<(ChatId, String)> {
        self.replies.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> PortResult<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn reply(&self, chat_id: ChatId, text: &str) -> PortResult<()> {
        self.replies.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

struct Harness {
    media: Arc<FakeMediaServer>,
    actuator: Arc<RecordingActuator>,
    notifier: Arc<RecordingNotifier>,
    guards: Guards,
}

fn harness(cooldown: CooldownTracker) -> (Harness, Dispatcher, DispatcherHandle) {
    let media = Arc::new(FakeMediaServer::default());
    let actuator = Arc::new(RecordingActuator::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let guards = Guards {
        cooldown: Arc::new(cooldown),
        manual: Arc::new(ManualThrottle::new()),
        shared: Arc::new(SharedState::new(UploadLimit::UNLIMITED)),
    };

    let evaluator = PolicyEvaluator::new(
        Collaborators {
            media_server: media.clone(),
            actuator: actuator.clone(),
            notifier: notifier.clone(),
        },
        guards.clone(),
        PolicySettings {
            idle_limit: UploadLimit::UNLIMITED,
            streaming_limit: UploadLimit::from_kbps(STREAMING_KBPS),
            dry_run: false,
        },
    );
    let (dispatcher, handle) = Dispatcher::new(
        evaluator,
        DispatchSettings {
            poll_interval: Duration::from_secs(60),
            retry_attempts: 5,
            retry_delay: Duration::from_millis(500),
        },
    );

    (
        Harness {
            media,
            actuator,
            notifier,
            guards,
        },
        dispatcher,
        handle,
    )
}

fn command(kind: CommandKind) -> Command {
    Command {
        kind,
        requested_by: "alice".to_string(),
        reply_to: CHAT,
    }
}

fn limit_for(minutes: u64) -> Command {
    command(CommandKind::Limit {
        duration: Duration::from_secs(minutes * 60),
    })
}

fn spawn_loop(dispatcher: Dispatcher) -> (oneshot::Sender<()>, JoinHandle<PolicyEvaluator>) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(dispatcher.run(async move {
        let _ = stop_rx.await;
    }));
    (stop_tx, join)
}

#[tokio::test(start_paused = true)]
async fn test_stream_start_throttles_without_cooldown() {
    let (h, mut dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    h.media.set(1);

    let result = dispatcher.run_once().await;

    assert!(result.changed());
    assert_eq!(dispatcher.evaluator().state(), OperatingState::Streaming);
    assert_eq!(h.actuator.limits(), vec![STREAMING_KBPS * 1024]);
    assert_eq!(h.guards.cooldown.transitions_in_window(), 0);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_end_records_one_transition() {
    let (h, mut dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    h.media.set(1);
    dispatcher.run_once().await;

    h.media.set(0);
    let result = dispatcher.run_once().await;

    assert!(result.changed());
    assert_eq!(dispatcher.evaluator().state(), OperatingState::Idle);
    assert_eq!(h.actuator.limits(), vec![STREAMING_KBPS * 1024, 0]);
    assert_eq!(h.guards.cooldown.transitions_in_window(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_third_idle_transition_in_window_is_blocked() {
    let now = Utc::now();
    let cooldown = CooldownTracker::in_memory(2, HOUR).with_transitions(vec![
        now - chrono::Duration::minutes(40),
        now - chrono::Duration::minutes(10),
    ]);
    let (h, mut dispatcher, _handle) = harness(cooldown);
    h.media.set(1);
    dispatcher.run_once().await;

    h.media.set(0);
    let result = dispatcher.run_once().await;

    assert_eq!(result, Evaluation::Blocked { used: 2, max: 2 });
    assert_eq!(dispatcher.evaluator().state(), OperatingState::Streaming);
    assert_eq!(h.actuator.limits(), vec![STREAMING_KBPS * 1024]);
    assert_eq!(h.guards.shared.snapshot().remote_streams, 0);
}

#[tokio::test(start_paused = true)]
async fn test_actuator_failure_keeps_state() {
    let (h, mut dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    h.actuator.failing.store(true, Ordering::SeqCst);
    h.media.set(2);

    let result = dispatcher.run_once().await;

    assert!(matches!(result, Evaluation::ActuatorFailed { .. }));
    assert_eq!(dispatcher.evaluator().state(), OperatingState::Idle);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_push_event_retries_until_sessions_catch_up() {
    let (h, mut dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    dispatcher.run_once().await;
    h.media.script(&[0, 0, 1]);

    let start = tokio::time::Instant::now();
    let result = dispatcher.handle_push_event().await;

    assert!(result.map(|e| e.changed()).unwrap_or(false));
    assert_eq!(h.media.queries(), 4);
    assert!(start.elapsed() >= Duration::from_millis(1500));
    assert!(start.elapsed() < Duration::from_millis(2000));
}

#[tokio::test(start_paused = true)]
async fn test_push_event_gives_up_after_all_attempts() {
    let (h, mut dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    dispatcher.run_once().await;

    let start = tokio::time::Instant::now();
    let result = dispatcher.handle_push_event().await;

    assert!(result.is_none());
    assert_eq!(h.media.queries(), 6);
    assert!(start.elapsed() >= Duration::from_millis(2500));
    assert!(start.elapsed() < Duration::from_millis(3000));
}

#[tokio::test(start_paused = true)]
async fn test_manual_limit_suppresses_automatic_evaluation() {
    let (h, mut dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    dispatcher.run_once().await;
    let queries_before = h.media.queries();

    dispatcher.handle_command(limit_for(30)).await;

    assert_eq!(dispatcher.evaluator().state(), OperatingState::Streaming);
    assert!(h.guards.manual.is_active());
    let remaining = h.guards.manual.time_remaining();
    assert!(remaining <= Duration::from_secs(30 * 60));
    assert!(remaining > Duration::from_secs(29 * 60));

    let (chat, reply) = h.notifier.last_reply().unwrap();
    assert_eq!(chat, CHAT);
    assert!(reply.contains("Manual throttle activated"));
    assert!(reply.contains("30m0s"));

    assert_eq!(dispatcher.run_once().await, Evaluation::Suppressed);
    assert_eq!(h.media.queries(), queries_before);
    assert_eq!(h.guards.cooldown.transitions_in_window(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unlimit_reconciles_and_replies() {
    let (h, mut dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    dispatcher.run_once().await;
    dispatcher.handle_command(limit_for(30)).await;

    dispatcher.handle_command(command(CommandKind::Unlimit)).await;

    assert!(!h.guards.manual.is_active());
    assert_eq!(dispatcher.evaluator().state(), OperatingState::Idle);
    let (_, reply) = h.notifier.last_reply().unwrap();
    assert!(reply.contains("Manual throttle cancelled"));
    assert!(reply.contains("idle"));
}

#[tokio::test(start_paused = true)]
async fn test_unlimit_without_override() {
    let (h, mut dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    dispatcher.run_once().await;

    dispatcher.handle_command(command(CommandKind::Unlimit)).await;

    let (_, reply) = h.notifier.last_reply().unwrap();
    assert_eq!(reply, report::MANUAL_NOT_ACTIVE);
}

#[tokio::test(start_paused = true)]
async fn test_status_does_not_query_or_mutate() {
    let (h, mut dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    h.media.set(1);
    dispatcher.run_once().await;
    let queries_before = h.media.queries();

    dispatcher.handle_command(command(CommandKind::Status)).await;

    let (_, reply) = h.notifier.last_reply().unwrap();
    assert!(reply.contains("State: streaming"));
    assert!(reply.contains("Remote streams: 1"));
    assert_eq!(h.media.queries(), queries_before);
    assert_eq!(h.actuator.limits().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_override_expiry_restores_automatic_state() {
    let (h, dispatcher, handle) = harness(CooldownTracker::in_memory(2, HOUR));
    let (stop, join) = spawn_loop(dispatcher);

    assert!(handle.commands.post(limit_for(30)));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.guards.shared.snapshot().state, OperatingState::Streaming);

    tokio::time::sleep(Duration::from_secs(30 * 60)).await;

    assert!(!h.guards.manual.is_active());
    assert_eq!(h.guards.shared.snapshot().state, OperatingState::Idle);
    assert!(h
        .notifier
        .sent()
        .iter()
        .any(|m| m.contains("Manual throttle expired")));
    assert_eq!(h.actuator.limits(), vec![STREAMING_KBPS * 1024, 0]);

    stop.send(()).unwrap();
    let evaluator = join.await.unwrap();
    assert_eq!(evaluator.state(), OperatingState::Idle);
    assert_eq!(evaluator.current_limit(), UploadLimit::UNLIMITED);
}

#[tokio::test(start_paused = true)]
async fn test_override_expiry_keeps_throttle_while_remote_stream_plays() {
    let (h, dispatcher, handle) = harness(CooldownTracker::in_memory(2, HOUR));
    let (stop, join) = spawn_loop(dispatcher);

    handle.commands.post(limit_for(10));
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.media.set(1);
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;

    assert!(!h.guards.manual.is_active());
    assert_eq!(h.guards.shared.snapshot().state, OperatingState::Streaming);
    assert_eq!(h.guards.shared.snapshot().remote_streams, 1);
    assert_eq!(h.actuator.limits(), vec![STREAMING_KBPS * 1024]);

    stop.send(()).unwrap();
    join.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_new_limit_replaces_pending_expiry() {
    let (h, dispatcher, handle) = harness(CooldownTracker::in_memory(2, HOUR));
    let (stop, join) = spawn_loop(dispatcher);

    handle.commands.post(limit_for(10));
    tokio::time::sleep(Duration::from_secs(60)).await;
    handle.commands.post(limit_for(30));
    tokio::time::sleep(Duration::from_secs(15 * 60)).await;

    assert!(h.guards.manual.is_active());
    assert_eq!(h.guards.shared.snapshot().state, OperatingState::Streaming);
    assert!(h.notifier.sent().iter().all(|m| !m.contains("expired")));

    tokio::time::sleep(Duration::from_secs(20 * 60)).await;
    assert!(!h.guards.manual.is_active());
    assert_eq!(h.guards.shared.snapshot().state, OperatingState::Idle);

    stop.send(()).unwrap();
    join.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_limit_is_refused_and_loop_survives() {
    let (h, dispatcher, handle) = harness(CooldownTracker::in_memory(2, HOUR));
    let (stop, join) = spawn_loop(dispatcher);

    handle.commands.post(limit_for(10));
    tokio::time::sleep(Duration::from_secs(60)).await;
    handle.commands.post(command(CommandKind::Limit {
        duration: Duration::from_secs(200_000_000_000_000_000 * 60),
    }));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (_, reply) = h.notifier.last_reply().unwrap();
    assert!(reply.starts_with("Error setting limit"));
    assert!(reply.contains("out of range"));
    assert_eq!(h.actuator.limits(), vec![STREAMING_KBPS * 1024]);
    assert!(h.guards.manual.is_active());

    // The earlier override still expires on its own timer.
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert!(!h.guards.manual.is_active());
    assert_eq!(h.guards.shared.snapshot().state, OperatingState::Idle);
    assert!(h.notifier.sent().iter().any(|m| m.contains("expired")));

    stop.send(()).unwrap();
    join.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fallback_poll_picks_up_missed_events() {
    let (h, dispatcher, _handle) = harness(CooldownTracker::in_memory(2, HOUR));
    let (stop, join) = spawn_loop(dispatcher);

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.media.set(1);
    assert_eq!(h.guards.shared.snapshot().state, OperatingState::Idle);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.guards.shared.snapshot().state, OperatingState::Streaming);

    stop.send(()).unwrap();
    join.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_push_event_through_the_loop() {
    let (h, dispatcher, handle) = harness(CooldownTracker::in_memory(2, HOUR));
    let (stop, join) = spawn_loop(dispatcher);
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.media.script(&[0, 1]);
    assert!(handle.events.post(PushEvent::new("media.play")));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(h.guards.shared.snapshot().state, OperatingState::Streaming);

    stop.send(()).unwrap();
    join.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_event_burst_collapses_to_one_pending() {
    let (_h, _dispatcher, handle) = harness(CooldownTracker::in_memory(2, HOUR));

    assert!(handle.events.post(PushEvent::new("media.play")));
    assert!(!handle.events.post(PushEvent::new("media.pause")));
    assert!(!handle.events.post(PushEvent::new("media.stop")));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_push_event_retries() {
    let (h, dispatcher, handle) = harness(CooldownTracker::in_memory(2, HOUR));
    let (stop, join) = spawn_loop(dispatcher);
    tokio::time::sleep(Duration::from_millis(10)).await;

    handle.events.post(PushEvent::new("media.stop"));
    tokio::time::sleep(Duration::from_millis(600)).await;
    stop.send(()).unwrap();

    let evaluator = join.await.unwrap();
    assert_eq!(evaluator.state(), OperatingState::Idle);
    assert!(h.media.queries() < 6);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cooldown_state.json");

    {
        let (h, mut dispatcher, _handle) = harness(CooldownTracker::new(1, HOUR, &path));
        h.media.set(1);
        dispatcher.run_once().await;
        h.media.set(0);
        assert!(dispatcher.run_once().await.changed());
    }

    let (h, mut dispatcher, _handle) = harness(CooldownTracker::new(1, HOUR, &path));
    assert_eq!(h.guards.cooldown.transitions_in_window(), 1);
    h.media.set(1);
    dispatcher.run_once().await;
    h.media.set(0);
    assert_eq!(
        dispatcher.run_once().await,
        Evaluation::Blocked { used: 1, max: 1 }
    );
}
