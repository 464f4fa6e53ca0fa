//! In-memory upstream used by the relay and gateway tests.
//!
//! `MockUpstream` is both the connector and the observation point: it records
//! every open/close and every frame sent, and lets a test push raw upstream
//! messages into whichever session opened the most recent transport.

use crate::relay::error::UpstreamError;
use crate::relay::signer::{RequestParams, RequestSigner};
use crate::relay::transport::{InboundSink, UpstreamConnector, UpstreamTarget, UpstreamTransport};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
}

/// Lifecycle log entries, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Open(usize),
    Close(usize),
}

#[derive(Default)]
struct MockState {
    opens: usize,
    failing: bool,
    hang: bool,
    live: usize,
    max_live: usize,
    lifecycle: Vec<Lifecycle>,
    frames: Vec<Frame>,
    targets: Vec<UpstreamTarget>,
    inbound: Option<InboundSink>,
    current: Option<Arc<AtomicBool>>,
}

#[derive(Clone, Default)]
pub struct MockUpstream {
    state: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following open fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Make every following open never complete.
    pub fn set_hanging(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    /// Simulate the remote side dropping the current socket.
    pub fn drop_connection(&self) {
        if let Some(alive) = self.state.lock().current.take() {
            alive.store(false, Ordering::SeqCst);
        }
    }

    /// Deliver a raw message as if the upstream had sent it.
    pub fn push_inbound(&self, raw: &str) {
        let state = self.state.lock();
        let sink = state.inbound.as_ref().expect("no transport has been opened");
        sink.send(raw.to_string()).expect("inbound queue closed");
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn live(&self) -> usize {
        self.state.lock().live
    }

    pub fn max_live(&self) -> usize {
        self.state.lock().max_live
    }

    pub fn lifecycle(&self) -> Vec<Lifecycle> {
        self.state.lock().lifecycle.clone()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.state.lock().frames.clone()
    }

    pub fn binary_frames(&self) -> Vec<Vec<u8>> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Binary(data) => Some(data),
                Frame::Text(_) => None,
            })
            .collect()
    }

    pub fn targets(&self) -> Vec<UpstreamTarget> {
        self.state.lock().targets.clone()
    }

    /// Poll until `predicate` holds, for tests that cross task boundaries.
    pub async fn wait_for(&self, predicate: impl Fn(&MockUpstream) -> bool) {
        for _ in 0..200 {
            if predicate(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mock upstream condition not reached");
    }
}

#[async_trait]
impl UpstreamConnector for MockUpstream {
    async fn open(
        &self,
        target: &UpstreamTarget,
        inbound: InboundSink,
    ) -> Result<Box<dyn UpstreamTransport>, UpstreamError> {
        let hang = {
            let mut state = self.state.lock();
            state.opens += 1;
            state.targets.push(target.clone());
            if state.failing {
                return Err(UpstreamError::ConnectFailed("mock refused".to_string()));
            }
            state.hang
        };

        if hang {
            std::future::pending::<()>().await;
        }

        let alive = Arc::new(AtomicBool::new(true));
        let mut state = self.state.lock();
        let id = state.opens;
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        state.lifecycle.push(Lifecycle::Open(id));
        state.inbound = Some(inbound);
        state.current = Some(alive.clone());

        Ok(Box::new(MockTransport {
            id,
            alive,
            closed: false,
            state: self.state.clone(),
        }))
    }
}

struct MockTransport {
    id: usize,
    alive: Arc<AtomicBool>,
    closed: bool,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.alive.store(false, Ordering::SeqCst);
            let mut state = self.state.lock();
            state.live -= 1;
            state.lifecycle.push(Lifecycle::Close(self.id));
        }
    }
}

#[async_trait]
impl UpstreamTransport for MockTransport {
    fn connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), UpstreamError> {
        if !self.connected() {
            return Err(UpstreamError::ConnectionLost);
        }
        self.state.lock().frames.push(Frame::Binary(data));
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> Result<(), UpstreamError> {
        if !self.connected() {
            return Err(UpstreamError::ConnectionLost);
        }
        self.state.lock().frames.push(Frame::Text(text));
        Ok(())
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.release();
    }
}

/// Signer that marks parameters without any credentials.
pub struct StaticSigner;

impl RequestSigner for StaticSigner {
    fn sign(&self, mut params: RequestParams) -> Result<RequestParams, UpstreamError> {
        params.insert("sign".to_string(), "test".to_string());
        Ok(params)
    }
}
