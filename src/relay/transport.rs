//! # Upstream Transport
//!
//! One WebSocket connection to the remote recognition service.
//!
//! ## Shape:
//! - **`UpstreamConnector`**: opens a transport for a signed target. Sessions hold an
//!   `Arc<dyn UpstreamConnector>` so tests can swap in an in-memory upstream.
//! - **`UpstreamTransport`**: the live socket. Outbound frames go through
//!   `send_binary`/`send_text`; inbound text frames are pushed, in receipt order,
//!   into the `InboundSink` handed over at open time by the transport's own
//!   receive task. The transport never interprets them.
//!
//! `connected()` is a point-in-time observation. The socket can die right after
//! it returns true, so callers still have to handle a failing send.

use crate::relay::error::UpstreamError;
use crate::relay::signer::RequestParams;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Producer half of a session's inbound queue. Each raw upstream message is one item.
pub type InboundSink = mpsc::UnboundedSender<String>;

/// Where to connect and with which (already signed) parameters.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub url: String,
    pub params: RequestParams,
}

impl UpstreamTarget {
    /// Base URL with the signed parameters appended as the query string.
    pub fn signed_url(&self) -> Result<url::Url, UpstreamError> {
        url::Url::parse_with_params(&self.url, self.params.iter())
            .map_err(|e| UpstreamError::InvalidUrl(format!("{}: {}", self.url, e)))
    }
}

/// A live connection to the upstream service.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Advisory liveness check.
    fn connected(&self) -> bool;

    /// Send one binary frame.
    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), UpstreamError>;

    /// Send one text frame (control messages such as the end-of-stream marker).
    async fn send_text(&mut self, text: String) -> Result<(), UpstreamError>;

    /// Close the socket. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens transports. One call, one socket.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn open(
        &self,
        target: &UpstreamTarget,
        inbound: InboundSink,
    ) -> Result<Box<dyn UpstreamTransport>, UpstreamError>;
}

/// Connector backed by tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl UpstreamConnector for WsConnector {
    async fn open(
        &self,
        target: &UpstreamTarget,
        inbound: InboundSink,
    ) -> Result<Box<dyn UpstreamTransport>, UpstreamError> {
        let url = target.signed_url()?;

        let (stream, response) = connect_async(url.as_str())
            .await
            .map_err(|e| UpstreamError::ConnectFailed(e.to_string()))?;

        // The query string carries the signature, log only the base URL
        info!(url = %target.url, status = %response.status(), "Upstream WebSocket connected");

        let (sink, stream) = stream.split();
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(receive_loop(stream, inbound, connected.clone()));

        Ok(Box::new(WsTransport {
            sink,
            connected,
            reader,
        }))
    }
}

/// One tokio-tungstenite socket, split into a write half owned here and a
/// read half owned by `receive_loop`.
pub struct WsTransport {
    sink: SplitSink<WsStream, Message>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl UpstreamTransport for WsTransport {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), UpstreamError> {
        if !self.connected() {
            return Err(UpstreamError::ConnectionLost);
        }

        self.sink.send(Message::Binary(data)).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            UpstreamError::SendFailed(e.to_string())
        })
    }

    async fn send_text(&mut self, text: String) -> Result<(), UpstreamError> {
        if !self.connected() {
            return Err(UpstreamError::ConnectionLost);
        }

        self.sink.send(Message::Text(text)).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            UpstreamError::SendFailed(e.to_string())
        })
    }

    async fn close(&mut self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if was_connected {
            if let Err(e) = self.sink.close().await {
                debug!("Upstream close handshake failed: {}", e);
            }
        }
        self.reader.abort();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        // The read half would otherwise keep the socket open after a replace
        self.reader.abort();
    }
}

/// Receive loop for one upstream socket.
///
/// Pushes every text frame into the session's inbound queue and returns when
/// the socket closes, errors, or the queue's consumer is gone. Clears the
/// `connected` flag on the way out.
async fn receive_loop(
    mut stream: SplitStream<WsStream>,
    inbound: InboundSink,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                debug!("Upstream message received: {}", text);
                if inbound.send(text).is_err() {
                    debug!("Inbound queue closed, stopping upstream reader");
                    break;
                }
            }
            Ok(Message::Binary(data)) => {
                debug!("Ignoring {} byte binary frame from upstream", data.len());
            }
            Ok(Message::Close(reason)) => {
                info!("Upstream closed the connection: {:?}", reason);
                break;
            }
            // Ping/pong replies are handled inside tungstenite
            Ok(_) => {}
            Err(e) => {
                warn!("Upstream socket error: {}", e);
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}
