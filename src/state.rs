//! # Application State Management
//!
//! This module holds everything the HTTP handlers and WebSocket actors share:
//! configuration, relay metrics, the session registry, and the upstream
//! collaborators (request signer + connector) every new relay session is built with.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Every actix worker thread gets its own clone of `AppState`
//!
//! ### Trait objects (`Arc<dyn Trait>`)
//! - **Purpose**: The relay only knows "something that signs" and "something that connects"
//! - **Why needed**: Production uses the real signer and WebSocket connector, tests inject
//!   an in-memory upstream without touching any relay code
//!
//! ## Why not globals:
//! The registry and metrics are passed around explicitly, so their lifetime is
//! the lifetime of the server and tests can build as many independent states as they need.

use crate::config::AppConfig;
use crate::relay::protocol::LanguagePair;
use crate::relay::registry::SessionRegistry;
use crate::relay::session::{EventSink, RelaySession, UpstreamContext};
use crate::relay::signer::{RequestSigner, YoudaoSigner};
use crate::relay::transport::{UpstreamConnector, WsConnector};

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all request handlers and actors.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration (read-only after startup)
    pub config: Arc<AppConfig>,

    /// Relay counters, updated by sessions and the gateway
    pub metrics: Arc<RelayMetrics>,

    /// client_id → (client channel, relay session)
    pub registry: Arc<SessionRegistry>,

    /// Signs upstream connection parameters
    pub signer: Arc<dyn RequestSigner>,

    /// Opens upstream transports
    pub connector: Arc<dyn UpstreamConnector>,

    /// When the server started (never changes, so no lock needed)
    pub start_time: Instant,
}

/// Counters collected across all relay sessions.
///
/// ## Why these metrics matter:
/// - **sessions_opened / active_sessions**: client load
/// - **upstream_connects / connect_failures / reconnect_attempts**: upstream health
/// - **audio_frames_sent / audio_bytes_sent**: outbound throughput
/// - **results_relayed / upstream_errors / dropped_messages**: inbound quality
#[derive(Debug, Default, Clone, Serialize)]
pub struct RelayCounters {
    pub sessions_opened: u64,
    pub active_sessions: u32,
    pub upstream_connects: u64,
    pub connect_failures: u64,
    pub reconnect_attempts: u64,
    pub audio_frames_sent: u64,
    pub audio_bytes_sent: u64,
    pub results_relayed: u64,
    pub upstream_errors: u64,
    pub dropped_messages: u64,
}

/// Thread-safe wrapper around `RelayCounters`.
///
/// Every update takes the write lock for a single addition, so contention is
/// negligible next to the network I/O that triggers it.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    counters: RwLock<RelayCounters>,
}

impl RelayMetrics {
    pub fn record_session_opened(&self) {
        let mut counters = self.counters.write();
        counters.sessions_opened += 1;
        counters.active_sessions += 1;
    }

    /// Includes an underflow guard: a double removal must not wrap the counter.
    pub fn record_session_closed(&self) {
        let mut counters = self.counters.write();
        if counters.active_sessions > 0 {
            counters.active_sessions -= 1;
        }
    }

    pub fn record_connect(&self) {
        self.counters.write().upstream_connects += 1;
    }

    pub fn record_connect_failure(&self) {
        self.counters.write().connect_failures += 1;
    }

    pub fn record_reconnect_attempt(&self) {
        self.counters.write().reconnect_attempts += 1;
    }

    pub fn record_audio_frame(&self, bytes: usize) {
        let mut counters = self.counters.write();
        counters.audio_frames_sent += 1;
        counters.audio_bytes_sent += bytes as u64;
    }

    pub fn record_result(&self) {
        self.counters.write().results_relayed += 1;
    }

    pub fn record_upstream_error(&self) {
        self.counters.write().upstream_errors += 1;
    }

    pub fn record_dropped_message(&self) {
        self.counters.write().dropped_messages += 1;
    }

    /// Copy of the current counters, so no lock is held while serializing.
    pub fn snapshot(&self) -> RelayCounters {
        self.counters.read().clone()
    }
}

impl RelayCounters {
    /// Share of inbound upstream messages that were errors (0.0 to 1.0).
    pub fn upstream_error_rate(&self) -> f64 {
        let total = self.results_relayed + self.upstream_errors + self.dropped_messages;
        if total > 0 {
            self.upstream_errors as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Share of connect attempts that failed (0.0 to 1.0).
    pub fn connect_failure_rate(&self) -> f64 {
        let total = self.upstream_connects + self.connect_failures;
        if total > 0 {
            self.connect_failures as f64 / total as f64
        } else {
            0.0
        }
    }
}

impl AppState {
    /// Create the production state: Youdao signer + tokio-tungstenite connector.
    pub fn new(config: AppConfig) -> Self {
        let signer = Arc::new(YoudaoSigner::new(
            config.upstream.app_key.clone(),
            config.upstream.app_secret.clone(),
        ));
        Self::with_upstream(config, signer, Arc::new(WsConnector))
    }

    /// Create a state with explicit upstream collaborators.
    pub fn with_upstream(
        config: AppConfig,
        signer: Arc<dyn RequestSigner>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        let registry = SessionRegistry::new(config.session.max_concurrent_sessions);
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RelayMetrics::default()),
            registry: Arc::new(registry),
            signer,
            connector,
            start_time: Instant::now(),
        }
    }

    /// Languages a freshly connected client starts with.
    pub fn default_languages(&self) -> LanguagePair {
        LanguagePair::new(
            self.config.session.default_from.clone(),
            self.config.session.default_to.clone(),
        )
    }

    /// Build a relay session wired to this state's upstream collaborators.
    pub fn new_session(
        &self,
        client_id: &str,
        languages: LanguagePair,
        events: EventSink,
    ) -> Arc<RelaySession> {
        let context = UpstreamContext {
            upstream: self.config.upstream.clone(),
            audio: self.config.audio.clone(),
            signer: self.signer.clone(),
            connector: self.connector.clone(),
            metrics: self.metrics.clone(),
        };
        Arc::new(RelaySession::new(client_id.to_string(), languages, context, events))
    }

    /// Server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
