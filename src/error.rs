use std::time::Duration;
use thiserror::Error;

use crate::peer::types::ConnectionState;
use crate::session::SessionState;

/// Failure reported by the transport engine for a single call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Engine(#[from] webrtc::Error),

    #[error("{0}")]
    Rejected(String),

    #[error("data channel is not open")]
    ChannelClosed,
}

/// Malformed or out-of-order control-channel traffic.
///
/// Recovered locally: the reason is sent back as an `error` event and the
/// session keeps running.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unexpected description type `{0}`, expected `offer`")]
    UnexpectedType(String),

    #[error("unrecognized message kind `{0}`")]
    UnrecognizedKind(String),

    #[error("offer received while session is {0}")]
    UnexpectedOffer(SessionState),

    #[error("transport is already {0}")]
    TransportTerminal(ConnectionState),

    #[error("failed to apply remote description: {0}")]
    RemoteDescription(#[source] TransportError),

    #[error("failed to create answer: {0}")]
    Answer(#[source] TransportError),
}

/// A single remote candidate the engine refused. Logged and dropped.
#[derive(Debug, Error)]
#[error("candidate `{candidate}` rejected: {source}")]
pub struct CandidateError {
    pub candidate: String,
    #[source]
    pub source: TransportError,
}

/// The engine reported the connection as unrecoverable. Fatal to the session.
#[derive(Debug, Error)]
#[error("transport failed: {reason}")]
pub struct TransportFailure {
    pub reason: String,
}

/// Audio generation failed. Reported to the client as an `ERROR:` sentinel.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("text is empty")]
    EmptyText,

    #[error("{0}")]
    Engine(String),

    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),

    #[error("temporary output: {0}")]
    Io(#[from] std::io::Error),
}

/// A speech request the session's worker could not take.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("speech request queue is full")]
    Full,

    #[error("speech worker has stopped")]
    Stopped,
}

/// A registry member that could not be closed cleanly.
#[derive(Debug, Error)]
pub enum CloseError {
    #[error("session {id} did not finish closing within {timeout:?}")]
    Timeout { id: String, timeout: Duration },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
