//! In-crate doubles for the transport and synthesis engines.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{SynthesisError, TransportError};
use crate::peer::connection::Transport;
use crate::peer::data_channel::DataChannel;
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription};
use crate::synthesis::SpeechEngine;

#[derive(Default)]
struct TransportInner {
    state: Option<ConnectionState>,
    remote_offer: Option<String>,
    applied: Vec<String>,
    reject: Vec<String>,
    fail_remote: bool,
    fail_answer: bool,
    fail_close: bool,
    close_calls: usize,
}

#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<TransportInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.inner.lock().unwrap().state = Some(state);
    }

    pub fn reject_candidates_containing(&self, needle: &str) {
        self.inner.lock().unwrap().reject.push(needle.to_string());
    }

    pub fn fail_remote_description(&self) {
        self.inner.lock().unwrap().fail_remote = true;
    }

    pub fn fail_create_answer(&self) {
        self.inner.lock().unwrap().fail_answer = true;
    }

    pub fn fail_close(&self) {
        self.inner.lock().unwrap().fail_close = true;
    }

    pub fn remote_offer(&self) -> Option<String> {
        self.inner.lock().unwrap().remote_offer.clone()
    }

    /// Candidate strings the engine accepted, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner.lock().unwrap().applied.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.inner.lock().unwrap().close_calls
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn set_remote_offer(&self, sdp: String) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_remote {
            return Err(TransportError::Rejected("invalid offer".into()));
        }
        inner.remote_offer = Some(sdp);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.inner.lock().unwrap().fail_answer {
            return Err(TransportError::Rejected("no codecs in common".into()));
        }
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.remote_offer.is_none() {
            return Err(TransportError::Rejected("remote description not set".into()));
        }
        if inner.reject.iter().any(|r| candidate.candidate.contains(r)) {
            return Err(TransportError::Rejected("malformed candidate".into()));
        }
        inner.applied.push(candidate.candidate);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner
            .lock()
            .unwrap()
            .state
            .unwrap_or(ConnectionState::New)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.close_calls += 1;
        inner.state = Some(ConnectionState::Closed);
        if inner.fail_close {
            return Err(TransportError::Rejected("already broken".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Binary(usize),
    Text(String),
}

struct ChannelInner {
    open: bool,
    buffered: usize,
    sent: Vec<Sent>,
    close_after: Option<usize>,
    close_calls: usize,
}

pub struct MockDataChannel {
    inner: Mutex<ChannelInner>,
}

impl MockDataChannel {
    pub fn open() -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                open: true,
                buffered: 0,
                sent: Vec::new(),
                close_after: None,
                close_calls: 0,
            }),
        }
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.inner.lock().unwrap().sent.clone()
    }

    pub fn set_buffered_amount(&self, amount: usize) {
        self.inner.lock().unwrap().buffered = amount;
    }

    /// The channel reports closed once `n` messages have gone out.
    pub fn close_after_sends(&self, n: usize) {
        self.inner.lock().unwrap().close_after = Some(n);
    }

    pub fn close_calls(&self) -> usize {
        self.inner.lock().unwrap().close_calls
    }

    fn record(&self, msg: Sent) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(TransportError::ChannelClosed);
        }
        inner.sent.push(msg);
        if inner.close_after == Some(inner.sent.len()) {
            inner.open = false;
        }
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        "mock"
    }

    fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.lock().unwrap().buffered
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.record(Sent::Binary(data.len()))
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.record(Sent::Text(text))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.open = false;
        inner.close_calls += 1;
        Ok(())
    }
}

enum Script {
    Bytes(usize),
    EchoLen,
    Fail(String),
}

/// Engine that writes a fixed amount of audio, or fails, on request.
pub struct ScriptedEngine {
    script: Script,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn bytes(n: usize) -> Self {
        Self::with_script(Script::Bytes(n))
    }

    /// Produces one byte of audio per byte of input text.
    pub fn echo_len() -> Self {
        Self::with_script(Script::EchoLen)
    }

    pub fn failing(reason: &str) -> Self {
        Self::with_script(Script::Fail(reason.to_string()))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechEngine for ScriptedEngine {
    async fn render(&self, text: &str, output: &Path) -> Result<(), SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let len = match &self.script {
            Script::Bytes(n) => *n,
            Script::EchoLen => text.len(),
            Script::Fail(reason) => return Err(SynthesisError::Engine(reason.clone())),
        };
        std::fs::write(output, vec![0x52u8; len])?;
        Ok(())
    }
}
