//! Control-channel protocol and the per-session task that drives it.
//!
//! Inbound (one JSON object per message):
//! - `{"type":"offer","sdp":"..."}`, optionally tagged `"event":"offer"`
//! - `{"candidate":{"candidate":"...","sdpMid":"0","sdpMLineIndex":0}}`,
//!   optionally tagged `"event":"candidate"`
//! - `{"event":"close"}`
//!
//! Outbound: `{"sdp":"...","type":"answer"}`, `{"candidate":{...}}`,
//! `{"state":"connected"}` and `{"error":"..."}`.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SignalingError, TransportFailure};
use crate::logger::dump_candidate;
use crate::peer::data_channel::DataChannel;
use crate::peer::ice::analyze_candidates;
use crate::peer::types::{DataMessage, IceCandidate, SessionDescription, TransportEvent};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::session::{Session, SessionState, StateEffect};
use crate::streaming::{SpeechQueue, SpeechWorker, StreamOptions};
use crate::synthesis::SynthesisGateway;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Offer { sdp: String },
    Candidate(IceCandidate),
    Close,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    event: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    sdp: Option<String>,
    candidate: Option<serde_json::Value>,
}

/// Validates the shape of a control message, then parses it.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, SignalingError> {
    let raw: RawMessage =
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;

    match raw.event.as_deref() {
        Some("close") => Ok(InboundMessage::Close),
        Some("offer") => parse_offer(raw),
        Some("candidate") => parse_candidate(raw),
        Some(other) => Err(SignalingError::UnrecognizedKind(other.to_string())),
        None if raw.candidate.is_some() => parse_candidate(raw),
        None if raw.kind.is_some() || raw.sdp.is_some() => parse_offer(raw),
        None => Err(SignalingError::UnrecognizedKind("<untagged>".into())),
    }
}

fn parse_offer(raw: RawMessage) -> Result<InboundMessage, SignalingError> {
    if let Some(kind) = raw.kind {
        if kind != "offer" {
            return Err(SignalingError::UnexpectedType(kind));
        }
    }
    match raw.sdp {
        Some(sdp) if !sdp.is_empty() => Ok(InboundMessage::Offer { sdp }),
        _ => Err(SignalingError::MissingField("sdp")),
    }
}

fn parse_candidate(raw: RawMessage) -> Result<InboundMessage, SignalingError> {
    let value = raw.candidate.ok_or(SignalingError::MissingField("candidate"))?;
    let candidate: IceCandidate = serde_json::from_value(value)
        .map_err(|e| SignalingError::Malformed(format!("candidate: {e}")))?;
    Ok(InboundMessage::Candidate(candidate))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Answer(SessionDescription),
    Candidate { candidate: IceCandidate },
    State { state: &'static str },
    Error { error: String },
}

impl OutboundMessage {
    pub fn error(reason: impl std::fmt::Display) -> Self {
        OutboundMessage::Error {
            error: reason.to_string(),
        }
    }
}

/// Process-wide collaborators shared by every session task.
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub synthesis: SynthesisGateway,
    pub stream: StreamOptions,
    pub queue_depth: usize,
    pub grace_period: Duration,
    pub close_timeout: Duration,
}

struct Speech {
    queue: SpeechQueue,
    worker: JoinHandle<()>,
}

/// Serializes everything that happens to one session: control messages,
/// engine callbacks and data-channel messages are handled one at a time.
pub struct SessionDriver {
    session: Session,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    ctx: Arc<SessionContext>,
    handle: SessionHandle,
    speech_cancel: CancellationToken,
    speech: Option<Speech>,
    grace_deadline: Option<Instant>,
    local_candidates: Vec<IceCandidate>,
}

impl SessionDriver {
    /// Registers the session; it stays registered until [`run`](Self::run)
    /// has finished cleaning up.
    pub fn new(
        session: Session,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        ctx: Arc<SessionContext>,
    ) -> Self {
        let handle = SessionHandle::new(session.id().to_string(), ctx.close_timeout);
        ctx.registry.add(session.id(), Arc::new(handle.clone()));
        let speech_cancel = handle.shutdown_token().child_token();
        Self {
            session,
            outbound,
            ctx,
            handle,
            speech_cancel,
            speech: None,
            grace_deadline: None,
            local_candidates: Vec::new(),
        }
    }

    /// Runs until the session is closed or failed; returns the final state.
    pub async fn run<S>(
        mut self,
        mut inbound: S,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> SessionState
    where
        S: Stream<Item = String> + Unpin,
    {
        let shutdown = self.handle.shutdown_token();
        info!(session_id = %self.session.id(), "session started");

        while !self.session.state().is_terminal() {
            let deadline = self.grace_deadline;
            let grace = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(session_id = %self.session.id(), "shutdown requested");
                    self.close().await;
                }
                msg = inbound.next() => match msg {
                    Some(text) => self.on_control_message(&text).await,
                    None => {
                        info!(session_id = %self.session.id(), "control channel disconnected");
                        self.close().await;
                    }
                },
                Some(event) = events.recv() => self.on_transport_event(event).await,
                _ = grace => {
                    self.stop_speech().await;
                    self.session
                        .fail(TransportFailure {
                            reason: "peer did not reconnect within the grace period".into(),
                        })
                        .await;
                    self.send(OutboundMessage::State { state: "failed" });
                }
            }
        }

        self.stop_speech().await;
        let id = self.session.id().to_string();
        let state = self.session.state();
        self.ctx.registry.remove(&id);
        self.handle.mark_finished();
        info!(session_id = %id, %state, "session finished");
        state
    }

    fn send(&self, msg: OutboundMessage) {
        if self.outbound.send(msg).is_err() {
            debug!(session_id = %self.session.id(), "control channel gone, event dropped");
        }
    }

    async fn on_control_message(&mut self, text: &str) {
        let msg = match parse_inbound(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(session_id = %self.session.id(), error = %e, "rejected control message");
                self.send(OutboundMessage::error(e));
                return;
            }
        };

        match msg {
            InboundMessage::Offer { sdp } => match self.session.accept_offer(sdp).await {
                Ok(answer) => self.send(OutboundMessage::Answer(answer)),
                Err(e) => {
                    warn!(session_id = %self.session.id(), error = %e, "offer failed");
                    self.send(OutboundMessage::error(e));
                }
            },
            InboundMessage::Candidate(candidate) => {
                self.session.add_remote_candidate(candidate).await;
            }
            InboundMessage::Close => {
                info!(session_id = %self.session.id(), "close requested by client");
                self.close().await;
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if !self.session.accepts_local_candidates() {
                    return;
                }
                dump_candidate(self.session.id(), "LOCAL", &candidate);
                self.local_candidates.push(candidate.clone());
                self.send(OutboundMessage::Candidate { candidate });
            }
            TransportEvent::GatheringComplete => {
                debug!(session_id = %self.session.id(), "ICE gathering complete");
                analyze_candidates(self.session.id(), &self.local_candidates);
            }
            TransportEvent::StateChanged(st) => {
                if self.session.state().is_terminal() {
                    return;
                }
                if st.is_terminal() {
                    self.stop_speech().await;
                }
                let effect = self.session.on_connection_state(st).await;
                self.send(OutboundMessage::State { state: st.as_str() });
                match effect {
                    StateEffect::Connected => self.grace_deadline = None,
                    StateEffect::Interrupted => {
                        if self.grace_deadline.is_none() {
                            info!(
                                session_id = %self.session.id(),
                                grace = ?self.ctx.grace_period,
                                "peer disconnected, waiting for it to come back"
                            );
                            self.grace_deadline = Some(Instant::now() + self.ctx.grace_period);
                        }
                    }
                    StateEffect::None | StateEffect::Failed | StateEffect::Closed => {}
                }
            }
            TransportEvent::DataChannel(dc) => self.on_data_channel(dc),
            TransportEvent::DataMessage(msg) => self.on_data_message(msg),
        }
    }

    fn on_data_channel(&mut self, dc: Arc<dyn DataChannel>) {
        if !self.session.attach_data_channel(dc.clone()) {
            return;
        }
        let (queue, worker) = SpeechWorker::spawn(
            self.session.id().to_string(),
            dc,
            self.ctx.synthesis.clone(),
            self.ctx.stream.clone(),
            self.ctx.queue_depth,
            self.speech_cancel.clone(),
        );
        self.speech = Some(Speech { queue, worker });
    }

    fn on_data_message(&mut self, msg: DataMessage) {
        let text = match msg {
            DataMessage::Text(text) => text,
            DataMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    self.send(OutboundMessage::error(
                        "binary data-channel message is not UTF-8 text",
                    ));
                    return;
                }
            },
        };
        let Some(speech) = &self.speech else {
            warn!(session_id = %self.session.id(), "text received without a data channel");
            return;
        };
        if let Err(e) = speech.queue.enqueue(text) {
            warn!(session_id = %self.session.id(), error = %e, "speech request rejected");
            self.send(OutboundMessage::error(e));
        }
    }

    /// Aborts any in-flight synthesis or stream and waits for the worker.
    async fn stop_speech(&mut self) {
        self.speech_cancel.cancel();
        if let Some(speech) = self.speech.take() {
            drop(speech.queue);
            if let Err(e) = speech.worker.await {
                warn!(session_id = %self.session.id(), error = %e, "speech worker panicked");
            }
        }
    }

    async fn close(&mut self) {
        self.stop_speech().await;
        if let Err(e) = self.session.close().await {
            warn!(session_id = %self.session.id(), error = %e, "transport release failed");
        }
    }
}
