//! # Configuration Management
//!
//! This module handles loading and managing the relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, APP_KEY, APP_SECRET)
//! 2. Prefixed environment variables (APP_SERVER__PORT, APP_UPSTREAM__URL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables

/// Main relay configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern: the HTTP listener, the remote recognition
/// service, the audio format announced to it, and per-client session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to (e.g., "127.0.0.1", "0.0.0.0")
/// - `port`: TCP port number to listen on
/// - `max_frame_bytes`: Largest WebSocket frame accepted from a browser client.
///   Base64 audio chunks are a third bigger than the PCM they carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_frame_bytes: usize,
}

/// Remote streaming speech-translation service.
///
/// ## Fields:
/// - `url`: WebSocket endpoint; signed parameters are appended as the query string
/// - `app_key` / `app_secret`: Credentials handed to the request signer
/// - `connect_timeout_ms`: Upper bound on one connect attempt
/// - `end_marker`: Optional text frame sent after the last audio chunk of an utterance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
    pub app_key: String,
    pub app_secret: String,
    pub connect_timeout_ms: u64,
    pub end_marker: Option<String>,
}

/// Audio format parameters announced to the upstream service.
///
/// These are sent verbatim as request parameters, so they stay strings
/// except where we validate them numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub format: String,
    pub channels: u16,
    pub sample_rate: u32,
    pub version: String,
}

/// Per-client session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Source language for a freshly connected client
    pub default_from: String,
    /// Target language for a freshly connected client
    pub default_to: String,
    /// Upgrade requests beyond this many registered clients get a 503
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the relay can start even if no configuration file exists.
/// Credentials default to empty strings; connects will fail until they are set.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8000,
                max_frame_bytes: 1024 * 1024,
            },
            upstream: UpstreamConfig {
                url: "wss://openapi.youdao.com/stream_speech_trans".to_string(),
                app_key: String::new(),
                app_secret: String::new(),
                connect_timeout_ms: 10_000,
                end_marker: Some(r#"{"end": "true"}"#.to_string()),
            },
            audio: AudioConfig {
                format: "wav".to_string(),
                channels: 1,
                sample_rate: 16_000,
                version: "v1".to_string(),
            },
            session: SessionConfig {
                default_from: "zh-CHS".to_string(),
                default_to: "en".to_string(),
                max_concurrent_sessions: 100,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT, APP_KEY and APP_SECRET
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_UPSTREAM__CONNECT_TIMEOUT_MS=5000`: Override connect timeout
    /// - `APP_SESSION__DEFAULT_TO=ja`: Override default target language
    /// - `APP_KEY=...` / `APP_SECRET=...`: Upstream credentials (usually from .env)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Field names contain underscores, so nesting uses a double underscore
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // Credentials keep the plain names the vendor's samples use
        if let Ok(key) = env::var("APP_KEY") {
            settings = settings.set_override("upstream.app_key", key)?;
        }

        if let Ok(secret) = env::var("APP_SECRET") {
            settings = settings.set_override("upstream.app_secret", secret)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Limits and timeouts are non-zero
    /// - The heartbeat fires before a client is considered dead
    /// - The upstream URL parses and uses a WebSocket scheme
    ///
    /// Missing credentials are not an error here: the server can still run
    /// and report every connect failure to its clients.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.upstream.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Upstream connect timeout must be greater than 0"));
        }

        if self.session.heartbeat_interval_secs == 0
            || self.session.heartbeat_interval_secs >= self.session.client_timeout_secs
        {
            return Err(anyhow::anyhow!(
                "Heartbeat interval must be non-zero and shorter than the client timeout"
            ));
        }

        if self.audio.channels == 0 || self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio channels and sample rate must be greater than 0"));
        }

        let url = url::Url::parse(&self.upstream.url)
            .map_err(|e| anyhow::anyhow!("Invalid upstream URL '{}': {}", self.upstream.url, e))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(anyhow::anyhow!(
                "Upstream URL must use ws:// or wss://, got {}://",
                url.scheme()
            ));
        }

        Ok(())  // All validation passed
    }

    /// Whether both upstream credentials are present.
    pub fn has_credentials(&self) -> bool {
        !self.upstream.app_key.is_empty() && !self.upstream.app_secret.is_empty()
    }
}
