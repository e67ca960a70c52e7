//! Plex Throttle service
//!
//! Wires the core control loop to Plex, qBittorrent and Telegram, and serves
//! the health, webhook and metrics endpoints.

pub mod cli;
pub mod handler;

pub use cli::{Cli, LogFormat};
pub use handler::{create_router, AppState};
