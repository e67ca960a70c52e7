//! Plex Throttle core
//!
//! Decides whether the torrent client should run at its idle or its
//! streaming upload limit, based on remote playback on a Plex server.
//!
//! # Components
//! - [`cooldown::CooldownTracker`]: sliding-window cap on streaming -> idle transitions
//! - [`manual::ManualThrottle`]: time-boxed override set from chat commands
//! - [`policy::PolicyEvaluator`]: the single decision point for the operating state
//! - [`dispatcher::Dispatcher`]: serializes every trigger into the evaluator
//! - [`state::SharedState`]: last completed check, read by the health endpoint
//!
//! External systems are reached only through the traits in [`ports`].

pub mod config;
pub mod cooldown;
pub mod dispatcher;
pub mod error;
pub mod limit;
pub mod manual;
pub mod metrics;
pub mod policy;
pub mod ports;
pub mod report;
pub mod state;

pub use config::Settings;
pub use cooldown::CooldownTracker;
pub use dispatcher::{
    mailbox, Command, CommandKind, DispatchSettings, Dispatcher, DispatcherHandle, Mailbox,
    PushEvent,
};
pub use error::{Result, ThrottleError};
pub use limit::UploadLimit;
pub use manual::{ManualThrottle, MAX_OVERRIDE_DURATION};
pub use policy::{
    Collaborators, Evaluation, Guards, ManualLimitError, PolicyEvaluator, PolicySettings,
};
pub use ports::{Actuator, ChatId, MediaServer, Notifier, PortError, PortResult};
pub use state::{AppSnapshot, OperatingState, SharedState};
