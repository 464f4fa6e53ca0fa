//! # Client WebSocket Gateway
//!
//! Browsers connect to `/ws`, stream captured audio as JSON (or binary) frames
//! and receive recognition/translation results back on the same socket.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the relay allocates a client id, opens the upstream connection
//!    and acknowledges with `{"type":"connection","status":"connected","client_id":…}`
//! 2. **Audio**: `{"type":"audio","data":<base64>,"is_last":false}`, forwarded upstream in order
//! 3. **Config**: `{"type":"config","data":{"from":…,"to":…}}` switches languages
//!    by replacing the relay session
//! 4. **Results**: `results` / `final_results` / `error` events pushed as they arrive
//!
//! ## Actor Model:
//! Each connection is one `RelaySocket` actor. Client frames that touch the
//! upstream are dispatched with `ctx.wait`, which parks the actor's mailbox and
//! stream processing until the dispatch finishes, so audio leaves in exactly the
//! order the client sent it. Results arrive as a second stream on the same actor
//! (the session's event channel) and are written straight to the socket.

use crate::error::AppError;
use crate::relay::protocol::{
    decode_client_message, AudioPayload, ClientEvent, ClientRequest, LanguageUpdate,
};
use crate::relay::session::RelaySession;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// WebSocket actor for one browser client.
pub struct RelaySocket {
    /// Id announced to the client and used as the registry key
    client_id: String,

    /// Shared application state (config, registry, metrics, upstream collaborators)
    state: AppState,

    /// Current relay session; replaced when the language pair changes
    session: Arc<RelaySession>,

    /// Client events from the relay session(s); moved into the actor's context on start
    events: Option<UnboundedReceiver<ClientEvent>>,

    /// Last frame or pong from the client
    last_heartbeat: Instant,
}

impl RelaySocket {
    pub fn new(
        client_id: String,
        state: AppState,
        session: Arc<RelaySession>,
        events: UnboundedReceiver<ClientEvent>,
    ) -> Self {
        Self {
            client_id,
            state,
            session,
            events: Some(events),
            last_heartbeat: Instant::now(),
        }
    }

    /// Ping the client periodically and drop it once it stops answering.
    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = Duration::from_secs(self.state.config.session.heartbeat_interval_secs);
        let timeout = Duration::from_secs(self.state.config.session.client_timeout_secs);

        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(client_id = %act.client_id, "Client heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_event(&self, ctx: &mut ws::WebsocketContext<Self>, event: ClientEvent) {
        ctx.text(event.to_json());
    }

    /// Forward one audio chunk; the actor waits until it has gone out (or failed).
    fn dispatch_audio(
        &mut self,
        data: AudioPayload,
        is_last: bool,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let session = self.session.clone();

        ctx.wait(
            async move { session.send_audio(&data, is_last).await }
                .into_actor(self)
                .map(|sent, act, _ctx| {
                    if !sent {
                        debug!(client_id = %act.client_id, "Audio chunk was not forwarded");
                    }
                }),
        );
    }

    /// Apply a `config` message.
    ///
    /// An unchanged pair is a no-op. Otherwise the old session is closed before
    /// the replacement connects, so a client never has two upstream sockets.
    fn apply_language_update(
        &mut self,
        update: LanguageUpdate,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let languages = update.resolve(self.session.languages());
        if &languages == self.session.languages() {
            debug!(client_id = %self.client_id, "Language pair unchanged");
            return;
        }

        let Some(events) = self.state.registry.events_for(&self.client_id) else {
            warn!(client_id = %self.client_id, "Client no longer registered, ignoring config");
            return;
        };

        info!(
            client_id = %self.client_id,
            from = %languages.from,
            to = %languages.to,
            "Switching languages"
        );

        let previous = self.session.clone();
        let replacement = self.state.new_session(&self.client_id, languages.clone(), events);
        let registry = self.state.registry.clone();
        let client_id = self.client_id.clone();

        ctx.wait(
            async move {
                previous.close().await;
                registry.replace_session(&client_id, &replacement);
                if !replacement.connect().await {
                    warn!(client_id = %client_id, "Reconfigured session could not connect yet");
                }
                replacement
            }
            .into_actor(self)
            .map(move |replacement, act, ctx| {
                act.session = replacement;
                act.send_event(ctx, ClientEvent::ConfigUpdated { data: languages });
            }),
        );
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match decode_client_message(text) {
            Ok(ClientRequest::Audio { data: Some(data), is_last }) => {
                self.dispatch_audio(data, is_last, ctx)
            }
            Ok(ClientRequest::Audio { data: None, .. }) => {
                debug!(client_id = %self.client_id, "Ignoring audio message without data");
            }
            Ok(ClientRequest::Config { data }) => self.apply_language_update(data, ctx),
            Err(err) => {
                warn!(client_id = %self.client_id, "Rejected client message: {:?}", err);
                self.send_event(ctx, ClientEvent::error(err.client_message()));
            }
        }
    }
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called once the upgrade has completed.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "Client connected");
        self.state.metrics.record_session_opened();

        if let Some(events) = self.events.take() {
            ctx.add_stream(UnboundedReceiverStream::new(events));
        }
        self.start_heartbeat(ctx);

        // Upstream failure here is not fatal, the first audio chunk retries
        let session = self.session.clone();
        ctx.wait(
            async move { session.connect().await }
                .into_actor(self)
                .map(|connected, act, ctx| {
                    if !connected {
                        warn!(client_id = %act.client_id, "Upstream not available yet");
                    }
                    let ack = ClientEvent::connected(act.client_id.clone());
                    act.send_event(ctx, ack);
                }),
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "Client disconnected");

        self.state.registry.remove(&self.client_id);
        self.state.metrics.record_session_closed();

        let session = self.session.clone();
        tokio::spawn(async move {
            session.close().await;
        });
    }
}

/// Frames from the browser.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.dispatch_audio(AudioPayload::Raw(data.to_vec()), false, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, "Client closed the connection: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "Ignoring continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(client_id = %self.client_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Events from the relay session, written to the browser as JSON text frames.
impl StreamHandler<ClientEvent> for RelaySocket {
    fn handle(&mut self, event: ClientEvent, ctx: &mut Self::Context) {
        self.send_event(ctx, event);
    }

    /// The event channel only ends when every session is gone; the socket itself
    /// decides when the actor stops.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(client_id = %self.client_id, "Relay event stream finished");
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// A full registry answers 503 without upgrading. The client is registered
/// before the upgrade, and `register` re-checks capacity under its lock for
/// requests that raced past the first check.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!("WebSocket upgrade request from {:?}", req.connection_info().peer_addr());

    if !app_state.registry.has_capacity() {
        warn!(
            "Refusing WebSocket connection: {} sessions already registered",
            app_state.registry.max_sessions()
        );
        return Err(AppError::ServiceUnavailable(format!(
            "Maximum concurrent sessions ({}) reached",
            app_state.registry.max_sessions()
        ))
        .into());
    }

    let client_id = uuid::Uuid::new_v4().to_string();
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = app_state.new_session(&client_id, app_state.default_languages(), events_tx.clone());

    if let Err(err) = app_state.registry.register(&client_id, events_tx, &session) {
        warn!("Refusing WebSocket connection: {}", err);
        return Err(AppError::ServiceUnavailable(err.to_string()).into());
    }

    let socket = RelaySocket::new(
        client_id.clone(),
        app_state.get_ref().clone(),
        session,
        events_rx,
    );

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(app_state.config.server.max_frame_bytes)
        .start()
        .map_err(|err| {
            app_state.registry.remove(&client_id);
            err
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::relay::testing::{Lifecycle, MockUpstream, StaticSigner};
    use actix_web::{App, HttpServer};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_state(mock: &MockUpstream, max_sessions: usize) -> AppState {
        let mut config = AppConfig::default();
        config.session.max_concurrent_sessions = max_sessions;
        state_with_config(mock, config)
    }

    fn state_with_config(mock: &MockUpstream, config: AppConfig) -> AppState {
        AppState::with_upstream(config, Arc::new(StaticSigner), Arc::new(mock.clone()))
    }

    /// Poll until `condition` holds or `limit` elapses.
    async fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    fn start_server(state: AppState) -> SocketAddr {
        let data = web::Data::new(state);
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws", web::get().to(relay_websocket))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();

        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        addr
    }

    async fn next_json(client: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for server frame")
                .expect("server closed the stream")
                .expect("socket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn send_json(client: &mut Client, value: Value) {
        client.send(Message::Text(value.to_string())).await.unwrap();
    }

    #[actix_web::test]
    async fn test_end_to_end_relay() {
        let mock = MockUpstream::new();
        let state = test_state(&mock, 10);
        let addr = start_server(state.clone());

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

        // Acknowledgment comes after the initial upstream connect
        let ack = next_json(&mut client).await;
        assert_eq!(ack["type"], "connection");
        assert_eq!(ack["status"], "connected");
        let client_id = ack["client_id"].as_str().unwrap().to_string();
        assert!(!client_id.is_empty());
        assert_eq!(mock.opens(), 1);
        assert_eq!(mock.targets()[0].params["from"], "zh-CHS");
        assert_eq!(mock.targets()[0].params["to"], "en");

        // Base64 audio, then a binary frame, arrive upstream in order
        send_json(&mut client, json!({"type": "audio", "data": "AAEC", "is_last": false})).await;
        client.send(Message::Binary(vec![5, 6])).await.unwrap();
        mock.wait_for(|m| m.binary_frames().len() == 2).await;
        assert_eq!(mock.binary_frames(), vec![vec![0, 1, 2], vec![5, 6]]);

        mock.push_inbound(
            r#"{"errorCode":"0","end":false,"result":{"context":"hello","tranContent":"你好"}}"#,
        );
        assert_eq!(
            next_json(&mut client).await,
            json!({"type": "results", "data": {"recognition": "hello", "translation": "你好"}})
        );

        // Audio messages without data are dropped without a reply
        send_json(&mut client, json!({"type": "audio", "is_last": false})).await;
        send_json(&mut client, json!({"type": "audio", "data": null})).await;

        // Bad input is answered, not fatal. The first reply proves the
        // data-less audio messages above produced no event.
        client.send(Message::Text("{oops".into())).await.unwrap();
        assert_eq!(
            next_json(&mut client).await,
            json!({"type": "error", "message": "invalid JSON format"})
        );
        send_json(&mut client, json!({"type": "dance"})).await;
        let reply = next_json(&mut client).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["message"].as_str().unwrap().starts_with("error processing message: "));
        assert_eq!(mock.binary_frames().len(), 2);

        // Language change: old upstream closed before the new one opens
        send_json(&mut client, json!({"type": "config", "data": {"to": "ja"}})).await;
        assert_eq!(
            next_json(&mut client).await,
            json!({"type": "config_updated", "data": {"from": "zh-CHS", "to": "ja"}})
        );
        assert_eq!(mock.opens(), 2);
        assert_eq!(mock.max_live(), 1);
        assert_eq!(
            mock.lifecycle(),
            vec![Lifecycle::Open(1), Lifecycle::Close(1), Lifecycle::Open(2)]
        );
        assert_eq!(mock.targets()[1].params["to"], "ja");

        let summaries = state.registry.snapshot();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].client_id, client_id);
        assert_eq!(summaries[0].to, "ja");

        // Same pair again changes nothing
        send_json(&mut client, json!({"type": "config", "data": {"from": "zh-CHS", "to": "ja"}})).await;
        mock.push_inbound(
            r#"{"errorCode":"0","end":true,"result":{"context":"bye","tranContent":"さようなら"}}"#,
        );
        let event = next_json(&mut client).await;
        assert_eq!(event["type"], "final_results");
        assert_eq!(mock.opens(), 2);

        // Disconnect releases the registry entry and the upstream socket
        client.close(None).await.unwrap();
        mock.wait_for(|m| m.live() == 0).await;
        assert!(wait_until(Duration::from_secs(2), || state.registry.is_empty()).await);
        assert_eq!(state.metrics.snapshot().active_sessions, 0);
    }

    #[actix_web::test]
    async fn test_silent_client_is_dropped_after_timeout() {
        let mock = MockUpstream::new();
        let mut config = AppConfig::default();
        config.session.heartbeat_interval_secs = 1;
        config.session.client_timeout_secs = 2;
        let state = state_with_config(&mock, config);
        let addr = start_server(state.clone());

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        assert_eq!(next_json(&mut client).await["type"], "connection");
        assert_eq!(state.registry.len(), 1);
        assert_eq!(mock.live(), 1);

        // The client stops reading, so server pings are never answered
        assert!(wait_until(Duration::from_secs(8), || state.registry.is_empty()).await);
        assert!(wait_until(Duration::from_secs(2), || mock.live() == 0).await);
        assert_eq!(state.metrics.snapshot().active_sessions, 0);
        drop(client);
    }

    #[actix_web::test]
    async fn test_upstream_down_still_acknowledges() {
        let mock = MockUpstream::new();
        mock.set_failing(true);
        let addr = start_server(test_state(&mock, 10));

        let (mut client, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        assert_eq!(next_json(&mut client).await["type"], "connection");

        // The send reconnects once, fails, and tells the client
        send_json(&mut client, json!({"type": "audio", "data": "AAEC"})).await;
        let reply = next_json(&mut client).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(mock.opens(), 2);
        assert!(mock.frames().is_empty());
    }

    #[actix_web::test]
    async fn test_rejects_clients_over_capacity() {
        let mock = MockUpstream::new();
        let addr = start_server(test_state(&mock, 1));

        let (mut first, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        assert_eq!(next_json(&mut first).await["type"], "connection");

        let second = connect_async(format!("ws://{}/ws", addr)).await;
        match second {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), 503);
            }
            other => panic!("expected 503, got {:?}", other.map(|_| ())),
        }
    }
}
