//! # Speech Relay - Main Application Entry Point
//!
//! This is the main entry point for the speech-relay web server.
//! Browsers stream microphone audio to it over a WebSocket; it forwards the
//! audio to a remote streaming speech-translation service and pushes the
//! recognition/translation results back to the browser as they arrive.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous for better performance
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & trait objects**: Thread-safe shared state and swappable upstream collaborators
//! - **actors**: One actix actor per browser connection
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Manages shared application state and relay metrics
//! - **relay**: Upstream protocol, signing, transport, sessions and the session registry
//! - **websocket**: The browser-facing WebSocket gateway
//! - **health**: Provides system health monitoring endpoints
//! - **handlers**: HTTP request handlers for API endpoints
//! - **error**: Custom error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod config;     // Configuration management (config.rs)
mod error;      // Error handling types (error.rs)
mod handlers;   // HTTP request handlers (handlers/ directory)
mod health;     // Health check endpoints (health.rs)
mod relay;      // Relay core (relay/ directory)
mod state;      // Application state management (state.rs)
mod websocket;  // Browser WebSocket gateway (websocket.rs)

// External crate imports - These are dependencies from Cargo.toml
use actix_cors::Cors;                   // Cross-Origin Resource Sharing support
use actix_web::{web, App, HttpServer};  // Web framework
use anyhow::Result;                     // Better error handling with context
use crate::config::AppConfig;           // Our custom configuration struct
use crate::state::AppState;             // Our custom application state
use tracing::{error, info, warn};       // Structured logging
use tracing_actix_web::TracingLogger;   // Per-request spans for HTTP traffic
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};  // Logging setup

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Creates shared application state** (registry, metrics, upstream signer and connector)
/// 4. **Configures the HTTP server** with middleware, the WebSocket gateway and API routes
/// 5. **Handles graceful shutdown** when receiving system signals
///
/// ## Key Rust Concepts:
/// - `#[actix_web::main]`: This macro sets up the async runtime
/// - `?`: The question mark operator automatically returns early if there's an error
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!("Upstream service: {}", config.upstream.url);

    if !config.has_credentials() {
        warn!("No upstream credentials configured (APP_KEY / APP_SECRET); upstream connects will fail");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // Browsers load the capture page from anywhere during development
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            // Browser WebSocket gateway
            .route("/ws", web::get().to(websocket::relay_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{client_id}", web::get().to(handlers::get_session)),
            )
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first wins: the server (usually an error) or a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "speech_relay=debug")
/// - If not set, defaults to "speech_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve once SIGTERM or SIGINT arrives.
///
/// Falls back to Ctrl+C alone where unix signal handlers cannot be installed.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        // Without a signal source the server runs until it exits on its own
        std::future::pending::<()>().await;
    }
}
