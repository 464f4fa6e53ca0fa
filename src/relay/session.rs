//! # Relay Session
//!
//! One relay session per browser client. It owns the upstream connection for
//! that client and everything that has ordering or failure concerns:
//!
//! ## Responsibilities:
//! 1. **Connect**: sign the request, open the transport, wait (bounded) for it
//! 2. **Send**: decode client audio and forward it as one binary frame, reconnecting once if needed
//! 3. **Drain**: a single background task pops raw upstream messages in arrival order
//! 4. **Translate**: map each upstream envelope onto a client event
//! 5. **Close**: drop the upstream socket; the session object stays usable
//!
//! ## Session Lifecycle:
//! ```text
//! Disconnected → Connecting → Connected → (send fails / reconfigure) → Disconnected → …
//!                                   └──── close() ────→ Closed
//! ```
//! A `send_audio` on a Closed session reconnects through the same path as a
//! Disconnected one; a discarded session is simply dropped.
//!
//! ## Concurrency:
//! - The transport's receive task is the only producer of the inbound queue per socket
//! - The drain task is the only consumer, so messages are handled one at a time, in order
//! - Nothing upstream-related happens inside the receive task itself

use crate::config::{AudioConfig, UpstreamConfig};
use crate::relay::error::UpstreamError;
use crate::relay::protocol::{AudioPayload, ClientEvent, LanguagePair, ResultEvent, UpstreamEnvelope};
use crate::relay::signer::{RequestParams, RequestSigner};
use crate::relay::transport::{InboundSink, UpstreamConnector, UpstreamTarget, UpstreamTransport};
use crate::state::RelayMetrics;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Channel to the client-facing side. Sending to a disconnected client is a no-op.
pub type EventSink = mpsc::UnboundedSender<ClientEvent>;

/// Upstream connection state as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Everything a session needs to reach the upstream service.
#[derive(Clone)]
pub struct UpstreamContext {
    pub upstream: UpstreamConfig,
    pub audio: AudioConfig,
    pub signer: Arc<dyn RequestSigner>,
    pub connector: Arc<dyn UpstreamConnector>,
    pub metrics: Arc<RelayMetrics>,
}

/// Turns raw upstream messages into client events.
///
/// Split out of `RelaySession` so the drain task can own one without keeping
/// the session itself alive.
#[derive(Clone)]
pub struct ResultRouter {
    client_id: String,
    events: EventSink,
    metrics: Arc<RelayMetrics>,
}

impl ResultRouter {
    /// Parse one upstream envelope and forward the matching client event.
    ///
    /// Never fails: upstream errors become `error` events, malformed
    /// envelopes are logged and dropped.
    pub fn translate_result(&self, raw: &str) {
        let envelope = match UpstreamEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(client_id = %self.client_id, "Dropping upstream message: {}", err);
                self.metrics.record_dropped_message();
                return;
            }
        };

        let event = match envelope.into_event() {
            Ok(event) => event,
            Err(err) => {
                warn!(client_id = %self.client_id, "Dropping upstream message: {}", err);
                self.metrics.record_dropped_message();
                return;
            }
        };

        match &event {
            ResultEvent::Error(message) => {
                error!(client_id = %self.client_id, "Upstream error: {}", message);
                self.metrics.record_upstream_error();
            }
            ResultEvent::Partial(payload) | ResultEvent::Final(payload) => {
                info!(
                    client_id = %self.client_id,
                    recognition = %payload.recognition,
                    translation = %payload.translation,
                    is_final = matches!(event, ResultEvent::Final(_)),
                    "Relaying result"
                );
                self.metrics.record_result();
            }
        }

        self.emit(event.into());
    }

    /// Best-effort delivery to the client.
    pub fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!(client_id = %self.client_id, "Client already gone, dropping event");
        }
    }
}

/// Drain loop: one per session, one message in flight at a time.
///
/// Ends once every producer (the session and all of its transports) is gone.
async fn process_inbound_loop(router: ResultRouter, mut inbound: mpsc::UnboundedReceiver<String>) {
    while let Some(raw) = inbound.recv().await {
        router.translate_result(&raw);
    }
    debug!(client_id = %router.client_id, "Inbound drain finished");
}

/// Per-client relay session.
pub struct RelaySession {
    client_id: String,
    languages: LanguagePair,
    context: UpstreamContext,
    state: Mutex<ConnectionState>,
    /// At most one live transport. Replaced wholesale, never mutated into a new socket.
    transport: tokio::sync::Mutex<Option<Box<dyn UpstreamTransport>>>,
    inbound_tx: InboundSink,
    /// Taken by the drain task when it starts; `None` afterwards.
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    router: ResultRouter,
}

impl RelaySession {
    pub fn new(
        client_id: String,
        languages: LanguagePair,
        context: UpstreamContext,
        events: EventSink,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let router = ResultRouter {
            client_id: client_id.clone(),
            events,
            metrics: context.metrics.clone(),
        };

        Self {
            client_id,
            languages,
            context,
            state: Mutex::new(ConnectionState::Disconnected),
            transport: tokio::sync::Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            router,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn languages(&self) -> &LanguagePair {
        &self.languages
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Unsigned request parameters for this session's languages and audio format.
    pub fn request_params(&self) -> RequestParams {
        let audio = &self.context.audio;
        let mut params = RequestParams::new();
        params.insert("from".to_string(), self.languages.from.clone());
        params.insert("to".to_string(), self.languages.to.clone());
        params.insert("format".to_string(), audio.format.clone());
        params.insert("channel".to_string(), audio.channels.to_string());
        params.insert("version".to_string(), audio.version.clone());
        params.insert("rate".to_string(), audio.sample_rate.to_string());
        params
    }

    /// Open (or reopen) the upstream connection.
    ///
    /// Returns false on any failure and leaves the session Disconnected; the
    /// next `send_audio` will try again.
    pub async fn connect(&self) -> bool {
        match self.try_connect().await {
            Ok(()) => true,
            Err(err) => {
                error!(client_id = %self.client_id, "Failed to connect to upstream: {}", err);
                self.set_state(ConnectionState::Disconnected);
                self.context.metrics.record_connect_failure();
                false
            }
        }
    }

    async fn try_connect(&self) -> Result<(), UpstreamError> {
        self.set_state(ConnectionState::Connecting);
        self.ensure_drain_task();

        let params = self.context.signer.sign(self.request_params())?;
        let target = UpstreamTarget {
            url: self.context.upstream.url.clone(),
            params,
        };

        let mut slot = self.transport.lock().await;

        // Old socket goes down before the new one is opened
        if let Some(mut previous) = slot.take() {
            previous.close().await;
        }

        let timeout_ms = self.context.upstream.connect_timeout_ms;
        let open = self.context.connector.open(&target, self.inbound_tx.clone());
        let transport = tokio::time::timeout(Duration::from_millis(timeout_ms), open)
            .await
            .map_err(|_| UpstreamError::Timeout(timeout_ms))??;

        if !transport.connected() {
            return Err(UpstreamError::ConnectionLost);
        }

        *slot = Some(transport);
        self.set_state(ConnectionState::Connected);
        self.context.metrics.record_connect();

        info!(
            client_id = %self.client_id,
            from = %self.languages.from,
            to = %self.languages.to,
            "Connected to upstream"
        );
        Ok(())
    }

    /// Start the drain task unless it is already running.
    fn ensure_drain_task(&self) {
        if let Some(inbound) = self.inbound_rx.lock().take() {
            tokio::spawn(process_inbound_loop(self.router.clone(), inbound));
        }
    }

    /// Whether a send can go out right now without reconnecting.
    async fn is_ready(&self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let slot = self.transport.lock().await;
        slot.as_ref().map(|t| t.connected()).unwrap_or(false)
    }

    /// Forward one chunk of client audio upstream.
    ///
    /// ## Behaviour:
    /// - Empty or undecodable payloads: no-op, returns false, no reconnect
    /// - Not connected: exactly one reconnect attempt; if it fails the client
    ///   gets an `error` event and nothing is sent
    /// - Otherwise: exactly one binary frame with the decoded bytes, followed
    ///   by the end-of-stream marker when `is_last` is set and one is configured
    pub async fn send_audio(&self, data: &AudioPayload, is_last: bool) -> bool {
        let Some(bytes) = data.decode() else {
            warn!(client_id = %self.client_id, "No valid audio data to send");
            return false;
        };

        if !self.is_ready().await {
            warn!(client_id = %self.client_id, "Upstream not connected, reconnecting before send");
            self.context.metrics.record_reconnect_attempt();
            if !self.connect().await {
                self.router.emit(ClientEvent::error(
                    "upstream service unavailable, audio was not sent",
                ));
                return false;
            }
            info!(client_id = %self.client_id, "Reconnected to upstream");
        }

        let mut slot = self.transport.lock().await;
        let Some(transport) = slot.as_mut() else {
            // Closed between the readiness check and here
            return false;
        };

        let len = bytes.len();
        let sent = transport.send_binary(bytes).await;
        if let Err(err) = sent {
            error!(client_id = %self.client_id, "Failed to send audio: {}", err);
            drop(slot);
            self.set_state(ConnectionState::Disconnected);
            return false;
        }

        self.context.metrics.record_audio_frame(len);
        debug!(client_id = %self.client_id, "Sent {} bytes of audio", len);

        if is_last {
            if let Some(marker) = &self.context.upstream.end_marker {
                if let Err(err) = transport.send_text(marker.clone()).await {
                    warn!(client_id = %self.client_id, "Failed to send end-of-stream marker: {}", err);
                }
            }
        }

        true
    }

    /// Close the upstream socket. Idempotent; the registry is not touched.
    pub async fn close(&self) {
        let previous = self.transport.lock().await.take();
        if let Some(mut transport) = previous {
            transport.close().await;
            info!(client_id = %self.client_id, "Closed upstream connection");
        }
        self.set_state(ConnectionState::Closed);
    }
}
