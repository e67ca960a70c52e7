//! Command-line interface

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "plex-throttle")]
#[command(about = "Throttle qBittorrent uploads while Plex streams to remote clients")]
#[command(version)]
pub struct Cli {
    /// Path to the config file (.json, .yaml or .toml)
    #[arg(short, long, default_value = "config.json", env = "PLEX_THROTTLE_CONFIG")]
    pub config: PathBuf,

    /// Log intended limit changes without applying them
    #[arg(long)]
    pub dry_run: bool,

    /// Run a single check and exit
    #[arg(long)]
    pub once: bool,

    /// Log every check, skip and incoming event
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl Cli {
    /// Filter used when `RUST_LOG` is unset
    pub fn default_filter(&self) -> &'static str {
        if self.verbose {
            "info,plex_throttle_core=debug,plex_throttle_integrations=debug,plex_throttle_agent=debug,plex_throttle=debug"
        } else {
            "info"
        }
    }
}
