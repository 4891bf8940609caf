//! # Speech Session Bridge - Main Application Entry Point
//!
//! This is the main entry point for the speech-session-bridge server.
//! It multiplexes client WebSocket connections onto independent backend
//! speech sessions and relays typed events in both directions.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every connection is an independent task on the runtime
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc**: The registry and backends are shared by every connection
//! - **Trait objects**: Session backends and record stores plug in behind traits
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Manages shared application state and metrics
//! - **session**: The session resource seam and the bundled loopback backend
//! - **connection**: WebSocket transport and the per-connection handler
//! - **registry** / **reaper**: Live session table and the inactivity sweep
//! - **shutdown**: Deadline-bounded drain on SIGINT/SIGTERM
//! - **summary**: End-of-call chat summary helper
//! - **records** / **handlers**: Record-store lookups over REST
//! - **health**: Health and metrics endpoints
//! - **error**: Custom error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod audio;       // Audio chunk decoding (audio.rs)
mod config;      // Configuration management (config.rs)
mod connection;  // WebSocket transport and handler (connection/ directory)
mod deadline;    // Timer-vs-operation race (deadline.rs)
mod error;       // Error handling types (error.rs)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod health;      // Health check endpoints (health.rs)
mod reaper;      // Inactivity sweep (reaper.rs)
mod records;     // Record store (records.rs)
mod registry;    // Session registry (registry.rs)
mod session;     // Session resource seam (session/ directory)
mod shutdown;    // Shutdown coordinator (shutdown.rs)
mod state;       // Application state management (state.rs)
mod summary;     // Chat summary helper (summary.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use crate::reaper::Reaper;
use crate::shutdown::ShutdownCoordinator;
use crate::state::AppState;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates shared application state** (registry, backends, metrics)
/// 4. **Starts the reaper** that force-closes idle sessions
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Coordinates shutdown** when receiving SIGINT or SIGTERM
///
/// ## Exit status:
/// `ExitCode::SUCCESS` only if every session drained before the shutdown
/// deadline. Startup errors are returned as `Err` and also exit non-zero.
#[actix_web::main]
async fn main() -> Result<ExitCode> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-session-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let app_state = AppState::from_config(config.clone())?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // The reaper runs until shutdown begins
    let reaper_cancel = CancellationToken::new();
    let reaper = Reaper::new(
        app_state.registry.clone(),
        app_state.metrics.clone(),
        config.session.inactivity_timeout(),
        config.session.reaper_interval(),
    );
    let reaper_task = tokio::spawn(reaper.run(reaper_cancel.clone()));

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/ws/session", web::get().to(connection::socket::session_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/records", web::get().to(handlers::scan_records))
                    .route("/records/{key}", web::get().to(handlers::get_record)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    // The shutdown coordinator owns the signal-driven sequence
    .disable_signals()
    .shutdown_timeout(config.shutdown.deadline().as_secs().max(1))
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first: the server on its own (an error), or a signal
    let exit_code = tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => info!("Server stopped"),
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
            ExitCode::FAILURE
        }
        signal = wait_for_shutdown_signal() => {
            signal?;
            reaper_cancel.cancel();

            let coordinator = ShutdownCoordinator::new(
                app_state.registry.clone(),
                app_state.metrics.clone(),
                config.shutdown.deadline(),
            );
            coordinator.run(&server_handle).await.exit_code()
        }
    };

    reaper_cancel.cancel();
    if let Err(e) = reaper_task.await {
        error!("Reaper task error: {}", e);
    }

    info!("Shutdown finished");
    Ok(exit_code)
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "speech_session_bridge=trace")
/// - If not set, defaults to "speech_session_bridge=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_session_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialize tracing")?;

    Ok(())
}

/// Resolve on the first SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Received Ctrl+C");
    Ok(())
}
