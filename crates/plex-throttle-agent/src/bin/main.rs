//! Plex Throttle entry point

use anyhow::Context;
use clap::Parser;
use plex_throttle_agent::cli::{Cli, LogFormat};
use plex_throttle_agent::handler::{create_router, AppState};
use plex_throttle_core::dispatcher::{DispatchSettings, Dispatcher};
use plex_throttle_core::metrics::ThrottleMetrics;
use plex_throttle_core::policy::{Collaborators, Guards, PolicyEvaluator, PolicySettings};
use plex_throttle_core::ports::{NoopNotifier, Notifier};
use plex_throttle_core::{CooldownTracker, ManualThrottle, Settings, SharedState};
use plex_throttle_integrations::{PlexClient, QBittorrentClient, TelegramClient};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let plex = Arc::new(PlexClient::new(&settings.plex_url, &settings.plex_token));
    let qbittorrent = Arc::new(
        QBittorrentClient::new(
            &settings.qbittorrent_url,
            &settings.qbittorrent_username,
            &settings.qbittorrent_password,
        )
        .context("Failed to create qBittorrent client")?,
    );
    if qbittorrent.has_credentials() {
        qbittorrent
            .login()
            .await
            .context("Failed to login to qBittorrent")?;
        info!("Logged in to qBittorrent");
    }

    let telegram = settings.telegram_enabled().then(|| {
        Arc::new(TelegramClient::new(
            &settings.telegram_bot_token,
            &settings.telegram_chat_id,
        ))
    });
    let notifier: Arc<dyn Notifier> = match &telegram {
        Some(client) => {
            info!("Telegram notifications enabled");
            client.clone()
        }
        None => Arc::new(NoopNotifier),
    };

    let metrics = Arc::new(
        ThrottleMetrics::new(Arc::new(Registry::new())).context("Failed to register metrics")?,
    );

    let guards = Guards {
        cooldown: Arc::new(CooldownTracker::new(
            settings.cooldown_max_transitions,
            settings.cooldown_window(),
            &settings.cooldown_state_path,
        )),
        manual: Arc::new(ManualThrottle::new()),
        shared: Arc::new(SharedState::new(settings.idle_limit())),
    };

    let evaluator = PolicyEvaluator::new(
        Collaborators {
            media_server: plex.clone(),
            actuator: qbittorrent.clone(),
            notifier,
        },
        guards.clone(),
        PolicySettings {
            idle_limit: settings.idle_limit(),
            streaming_limit: settings.streaming_limit(),
            dry_run: cli.dry_run,
        },
    )
    .with_metrics(metrics.clone());

    let (mut dispatcher, handle) = Dispatcher::new(
        evaluator,
        DispatchSettings {
            poll_interval: settings.poll_interval(),
            retry_attempts: settings.webhook_retry_attempts,
            retry_delay: settings.webhook_retry_delay(),
        },
    );

    if cli.once {
        let evaluation = dispatcher.run_once().await;
        info!(outcome = evaluation.outcome(), "Single check complete");
        return Ok(());
    }

    let (stop_server, server_stopped) = oneshot::channel::<()>();
    let server = if settings.health_enabled() {
        let addr = SocketAddr::from(([0, 0, 0, 0], settings.health_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        let router = create_router(Arc::new(AppState {
            shared: guards.shared.clone(),
            manual: guards.manual.clone(),
            media_server: plex,
            actuator: qbittorrent,
            events: handle.events.clone(),
            metrics,
        }));

        info!("Starting server on {} (health + webhook + metrics)", addr);
        Some(tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = server_stopped.await;
                })
                .await
        }))
    } else {
        None
    };

    let poller = telegram.map(|client| {
        tokio::spawn(client.run_poller(
            handle.commands.clone(),
            settings.manual_throttle_default(),
        ))
    });

    dispatcher.run(shutdown_signal()).await;

    if let Some(poller) = poller {
        poller.abort();
    }
    if let Some(server) = server {
        let _ = stop_server.send(());
        match server.await {
            Ok(Err(e)) => warn!(error = %e, "Server error"),
            Err(e) => warn!(error = %e, "Server task failed"),
            Ok(Ok(())) => {}
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.default_filter()));
    let registry = tracing_subscriber::registry().with(filter);

    match cli.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
