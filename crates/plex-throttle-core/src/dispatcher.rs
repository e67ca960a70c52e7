//! Event dispatcher and control loop
//!
//! One task owns the [`PolicyEvaluator`] and drains every trigger in turn:
//! push events, the fallback poll timer, chat commands, override expiry and
//! shutdown. Producers reach the loop only through capacity-1 mailboxes that
//! drop messages when full, so a burst of webhooks collapses into a single
//! pending evaluation.
//!
//! ```text
//! webhook ──► Mailbox<PushEvent> ──┐
//! chat    ──► Mailbox<Command>  ───┼──► Dispatcher ──► PolicyEvaluator ──► Actuator
//! timer   ──► Mailbox<Expiry>   ───┤
//! ticker  ─────────────────────────┘
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::policy::{Evaluation, PolicyEvaluator};
use crate::ports::ChatId;
use crate::report;

/// Sending half of a capacity-1, drop-if-full queue
#[derive(Debug)]
pub struct Mailbox<T> {
    sender: mpsc::Sender<T>,
    name: &'static str,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            name: self.name,
        }
    }
}

impl<T> Mailbox<T> {
    /// Post without waiting. Returns `false` when the message was dropped.
    pub fn post(&self, message: T) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(mailbox = self.name, "Mailbox full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(mailbox = self.name, "Mailbox closed, dropping message");
                false
            }
        }
    }
}

/// Create a mailbox and its receiving end
pub fn mailbox<T>(name: &'static str) -> (Mailbox<T>, mpsc::Receiver<T>) {
    let (sender, receiver) = mpsc::channel(1);
    (Mailbox { sender, name }, receiver)
}

/// A playback-change notification; only the occurrence matters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub event: String,
}

impl PushEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
        }
    }
}

/// What a chat user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Limit { duration: Duration },
    Unlimit,
    Status,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Limit { .. } => "limit",
            CommandKind::Unlimit => "unlimit",
            CommandKind::Status => "status",
        }
    }
}

/// A parsed chat command, already validated by the producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub requested_by: String,
    pub reply_to: ChatId,
}

/// Expiry of the override armed as `generation`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub generation: u64,
}

/// Timing knobs for the loop
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub poll_interval: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

/// Producer side handed to the webhook server and the chat poller
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    pub events: Mailbox<PushEvent>,
    pub commands: Mailbox<Command>,
}

/// The control loop
pub struct Dispatcher {
    evaluator: PolicyEvaluator,
    settings: DispatchSettings,
    events: mpsc::Receiver<PushEvent>,
    commands: mpsc::Receiver<Command>,
    expiry_tx: Mailbox<Expiry>,
    expiry_rx: mpsc::Receiver<Expiry>,
    expiry_timer: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(evaluator: PolicyEvaluator, settings: DispatchSettings) -> (Self, DispatcherHandle) {
        let (events_tx, events) = mailbox("push-events");
        let (commands_tx, commands) = mailbox("commands");
        let (expiry_tx, expiry_rx) = mailbox("override-expiry");

        let dispatcher = Self {
            evaluator,
            settings,
            events,
            commands,
            expiry_tx,
            expiry_rx,
            expiry_timer: None,
        };
        let handle = DispatcherHandle {
            events: events_tx,
            commands: commands_tx,
        };
        (dispatcher, handle)
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    /// The evaluation performed before any trigger is awaited
    pub async fn run_once(&mut self) -> Evaluation {
        self.evaluator.evaluate().await
    }

    /// Evaluate once, then serve triggers until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F) -> PolicyEvaluator
    where
        F: Future<Output = ()>,
    {
        self.run_once().await;

        let period = self.settings.poll_interval;
        let mut fallback = interval_at(Instant::now() + period, period);
        fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_secs = period.as_secs(),
            "Starting control loop (fallback poll: {}s)",
            period.as_secs()
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping control loop");
                    break;
                }
                Some(event) = self.events.recv() => {
                    debug!(event = %event.event, "Push event");
                    let finished = tokio::select! {
                        _ = &mut shutdown => false,
                        _ = self.handle_push_event() => true,
                    };
                    if !finished {
                        info!("Shutdown requested during push-event retries");
                        break;
                    }
                }
                _ = fallback.tick() => {
                    debug!("Fallback poll triggered");
                    self.evaluator.evaluate().await;
                }
                Some(command) = self.commands.recv() => {
                    debug!(command = command.kind.name(), requested_by = %command.requested_by, "Chat command");
                    self.handle_command(command).await;
                }
                Some(expiry) = self.expiry_rx.recv() => {
                    self.handle_expiry(expiry).await;
                }
            }
        }

        self.disarm_expiry();
        self.evaluator
    }

    /// Retry until the session list catches up with the event, or attempts run out
    pub async fn handle_push_event(&mut self) -> Option<Evaluation> {
        for attempt in 1..=self.settings.retry_attempts {
            tokio::time::sleep(self.settings.retry_delay).await;
            let evaluation = self.evaluator.evaluate().await;
            if evaluation.changed() {
                debug!(attempt, "Push event produced a state change");
                return Some(evaluation);
            }
        }
        None
    }

    pub async fn handle_command(&mut self, command: Command) {
        let reply = match command.kind {
            CommandKind::Limit { duration } => self.manual_limit(duration, &command.requested_by).await,
            CommandKind::Unlimit => self.manual_unlimit(&command.requested_by).await,
            CommandKind::Status => self.evaluator.status_report(),
        };

        if let Err(e) = self.evaluator.notifier().reply(command.reply_to, &reply).await {
            warn!(error = %e, "Error sending command reply");
        }
    }

    async fn manual_limit(&mut self, duration: Duration, requested_by: &str) -> String {
        match self.evaluator.force_throttle(duration, requested_by).await {
            Ok(forced) => {
                self.disarm_expiry();
                self.arm_expiry(forced.generation, forced.duration);
                report::manual_activated_message(forced.duration, forced.limit)
            }
            Err(e) => report::manual_failed_message(&e),
        }
    }

    async fn manual_unlimit(&mut self, requested_by: &str) -> String {
        if !self.evaluator.guards().manual.is_active() {
            return report::MANUAL_NOT_ACTIVE.to_string();
        }
        self.disarm_expiry();
        self.evaluator.release(requested_by).await;
        report::manual_cancelled_message(self.evaluator.state(), self.evaluator.current_limit())
    }

    pub async fn handle_expiry(&mut self, expiry: Expiry) {
        if self.evaluator.expire(expiry.generation).await.is_none() {
            return;
        }
        self.expiry_timer = None;

        let message =
            report::manual_expired_message(self.evaluator.state(), self.evaluator.current_limit());
        if let Err(e) = self.evaluator.notifier().send(&message).await {
            warn!(error = %e, "Error sending expiry notification");
        }
    }

    fn arm_expiry(&mut self, generation: u64, after: Duration) {
        // A message left over from a superseded timer would block the new one.
        while self.expiry_rx.try_recv().is_ok() {}

        let mailbox = self.expiry_tx.clone();
        self.expiry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            mailbox.post(Expiry { generation });
        }));
    }

    fn disarm_expiry(&mut self) {
        if let Some(timer) = self.expiry_timer.take() {
            timer.abort();
        }
    }
}
