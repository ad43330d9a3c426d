//! StatusHub Server - Main entry point.
//!
//! This binary starts the StatusHub log hub with:
//! - Structured JSON logging for production
//! - First-run password setup
//! - Graceful shutdown handling (SIGTERM/SIGINT) that also ends live streams
//! - Background login rate limiter cleanup
//!
//! # Configuration
//!
//! See [`statushub_server::config`] for environment variable configuration.
//! On first run the initial password is read from `STATUSHUB_PASSWORD` or
//! prompted for on the terminal.
//!
//! # Example
//!
//! ```bash
//! STATUSHUB_SESSION_SECRET="long-random-string" \
//! STATUSHUB_PROXIES=1 \
//! PORT=8080 \
//! cargo run --release --bin statushub-server
//! ```

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::process::ExitCode;

use anyhow::Context;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Password;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use statushub_server::config::ServerConfig;
use statushub_server::rate_limit::CLEANUP_INTERVAL;
use statushub_server::routes::{create_router, AppState};
use statushub_server::settings::{FileSettingsStore, Settings, SettingsError};

/// Environment variable holding the initial password for unattended setup.
const INITIAL_PASSWORD_VAR: &str = "STATUSHUB_PASSWORD";

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "Server failed");
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("failed to load configuration")?;

    let settings = Settings::open(
        FileSettingsStore::new(&config.settings_path),
        prompt_initial_password,
    )
    .with_context(|| format!("failed to open settings at {}", config.settings_path.display()))?;

    info!(
        port = config.port,
        settings = %config.settings_path.display(),
        assets = %config.assets_dir.display(),
        reverse_proxies = config.reverse_proxies,
        log_size = settings.log_size(),
        media_cache_bytes = settings.media_cache_bytes(),
        "StatusHub server starting"
    );

    let state = AppState::new(config.clone(), settings);
    let shutdown = state.shutdown.clone();

    let cleanup_handle = state.login_limiter.spawn_cleanup_task(CLEANUP_INTERVAL);
    info!(
        interval_secs = CLEANUP_INTERVAL.as_secs(),
        "Rate limiter cleanup task started"
    );

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(address = %bind_addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await
    .context("server error")?;

    info!("Server shutting down gracefully");
    cleanup_handle.abort();
    Ok(())
}

/// Obtains the password for a fresh settings file.
fn prompt_initial_password() -> Result<String, SettingsError> {
    if let Ok(value) = std::env::var(INITIAL_PASSWORD_VAR) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    if !std::io::stdin().is_terminal() {
        return Err(SettingsError::Prompt(format!(
            "no settings file found and no terminal available; set {INITIAL_PASSWORD_VAR}"
        )));
    }

    Password::with_theme(&ColorfulTheme::default())
        .with_prompt("New password")
        .with_confirmation("Confirm password", "Passwords do not match")
        .interact()
        .map_err(|err| SettingsError::Prompt(err.to_string()))
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` (default `info,tower_http=debug`).
fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves on SIGINT or SIGTERM after cancelling `shutdown`, which ends
/// every live stream so the graceful shutdown does not wait on them.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    shutdown.cancel();
}
