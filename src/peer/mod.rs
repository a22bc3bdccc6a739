pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod types;

pub use connection::{RtcTransport, Transport};
pub use data_channel::{DataChannel, RtcDataChannel};
pub use ice::CandidateBuffer;
pub use types::{
    ConnectionState, DataMessage, IceCandidate, ServerConfig, SessionDescription, TransportEvent,
};
