use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{SignalingError, TransportError, TransportFailure};
use crate::logger::log_state;
use crate::peer::connection::Transport;
use crate::peer::data_channel::DataChannel;
use crate::peer::ice::{apply_candidate, apply_pending_candidates, CandidateBuffer};
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    New,
    OfferReceived,
    AnswerSent,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::New => "new",
            SessionState::OfferReceived => "offer-received",
            SessionState::AnswerSent => "answer-sent",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a transport state report did to the session.
#[derive(Debug, PartialEq, Eq)]
pub enum StateEffect {
    None,
    Connected,
    /// The peer dropped; it may come back within the grace period.
    Interrupted,
    Failed,
    Closed,
}

/// One client connection, from signaling through data-channel close.
pub struct Session {
    id: String,
    state: SessionState,
    transport: Option<Arc<dyn Transport>>,
    data_channel: Option<Arc<dyn DataChannel>>,
    candidates: CandidateBuffer,
}

impl Session {
    pub fn new(id: String, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            state: SessionState::New,
            transport: Some(transport),
            data_channel: None,
            candidates: CandidateBuffer::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn data_channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.data_channel.as_ref()
    }

    pub fn pending_candidates(&self) -> usize {
        self.candidates.pending()
    }

    /// Local candidates are forwarded only while this holds.
    pub fn accepts_local_candidates(&self) -> bool {
        !self.state.is_terminal()
    }

    fn transition(&mut self, to: SessionState) {
        log_state(&self.id, self.state, to);
        self.state = to;
    }

    /// `New` → `OfferReceived` → `AnswerSent`. Buffered remote candidates
    /// are applied right after the remote description, before the answer.
    /// A failed answer leaves nothing to retry against, so it fails the
    /// session.
    pub async fn accept_offer(&mut self, sdp: String) -> Result<SessionDescription, SignalingError> {
        if self.state != SessionState::New {
            return Err(SignalingError::UnexpectedOffer(self.state));
        }
        let transport = match &self.transport {
            Some(t) => t.clone(),
            None => return Err(SignalingError::UnexpectedOffer(self.state)),
        };
        let engine_state = transport.connection_state();
        if engine_state.is_terminal() {
            return Err(SignalingError::TransportTerminal(engine_state));
        }

        transport
            .set_remote_offer(sdp)
            .await
            .map_err(SignalingError::RemoteDescription)?;
        self.transition(SessionState::OfferReceived);

        let pending = self.candidates.remote_description_applied();
        apply_pending_candidates(&self.id, transport.as_ref(), pending).await;

        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(TransportFailure {
                    reason: format!("answer could not be created: {e}"),
                })
                .await;
                return Err(SignalingError::Answer(e));
            }
        };
        self.transition(SessionState::AnswerSent);
        info!(session_id = %self.id, "answer created");
        Ok(answer)
    }

    /// Buffers the candidate until a remote description exists, otherwise
    /// applies it immediately. Rejections are logged and dropped.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state.is_terminal() {
            debug!(session_id = %self.id, "ignoring candidate for finished session");
            return;
        }
        let Some(candidate) = self.candidates.admit(candidate) else {
            debug!(
                session_id = %self.id,
                pending = self.candidates.pending(),
                "remote description not set yet, queuing candidate"
            );
            return;
        };
        if let Some(transport) = &self.transport {
            let _ = apply_candidate(&self.id, transport.as_ref(), candidate).await;
        }
    }

    /// Records the peer-opened data channel. Only the first one is kept.
    pub fn attach_data_channel(&mut self, dc: Arc<dyn DataChannel>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self.data_channel.is_some() {
            warn!(session_id = %self.id, label = dc.label(), "ignoring additional data channel");
            return false;
        }
        info!(session_id = %self.id, label = dc.label(), "data channel attached");
        self.data_channel = Some(dc);
        true
    }

    /// Applies a connection state reported by the transport engine.
    pub async fn on_connection_state(&mut self, st: ConnectionState) -> StateEffect {
        if self.state.is_terminal() {
            return StateEffect::None;
        }
        match st {
            ConnectionState::Connected => {
                if self.state == SessionState::AnswerSent {
                    self.transition(SessionState::Connected);
                }
                StateEffect::Connected
            }
            ConnectionState::Disconnected => StateEffect::Interrupted,
            ConnectionState::Failed => {
                self.fail(TransportFailure {
                    reason: "peer connection failed".into(),
                })
                .await;
                StateEffect::Failed
            }
            ConnectionState::Closed => {
                if let Err(e) = self.close().await {
                    debug!(session_id = %self.id, error = %e, "close after engine closed");
                }
                StateEffect::Closed
            }
            ConnectionState::New | ConnectionState::Connecting => StateEffect::None,
        }
    }

    /// Any non-terminal state → `Failed`; releases the transport.
    pub async fn fail(&mut self, failure: TransportFailure) {
        if self.state.is_terminal() {
            return;
        }
        warn!(session_id = %self.id, error = %failure, "session failed");
        self.transition(SessionState::Failed);
        if let Err(e) = self.release().await {
            debug!(session_id = %self.id, error = %e, "release after failure");
        }
    }

    /// Any state → `Closing` → `Closed`. Closing a finished session is a
    /// no-op. The session ends `Closed` even if releasing the transport
    /// reports an error, which is passed back to the caller.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.transition(SessionState::Closing);
        let result = self.release().await;
        self.transition(SessionState::Closed);
        result
    }

    async fn release(&mut self) -> Result<(), TransportError> {
        if let Some(dc) = &self.data_channel {
            if let Err(e) = dc.close().await {
                debug!(session_id = %self.id, error = %e, "data channel close");
            }
        }
        match self.transport.take() {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }
}
