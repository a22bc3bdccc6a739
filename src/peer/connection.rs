use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::{
    api::APIBuilder,
    data_channel::RTCDataChannel,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

use crate::error::TransportError;
use crate::peer::data_channel::attach_dc;
use crate::peer::types::{
    ConnectionState, IceCandidate, ServerConfig, SessionDescription, TransportEvent,
};
use crate::utils::add_ice_url_scheme;

/// The capability set a session needs from the transport engine.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn set_remote_offer(&self, sdp: String) -> Result<(), TransportError>;

    /// Creates an answer and installs it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<(), TransportError>;
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    /// Creates the answering side of a peer connection. Engine callbacks are
    /// forwarded to `events`; the remote peer opens the data channel.
    pub async fn new(
        session_id: &str,
        ice_servers: &[ServerConfig],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(api.new_peer_connection(rtc_config(ice_servers)).await?);

        pc.on_ice_candidate(Box::new({
            let events = events.clone();
            let session_id = session_id.to_string();
            move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let _ = events.send(TransportEvent::LocalCandidate(init.into()));
                        }
                        Err(e) => debug!(%session_id, error = %e, "unserializable local candidate"),
                    },
                    // None marks the end of gathering
                    None => {
                        let _ = events.send(TransportEvent::GatheringComplete);
                    }
                }
                Box::pin(async {})
            }
        }));

        pc.on_ice_gathering_state_change(Box::new({
            let session_id = session_id.to_string();
            move |state| {
                debug!(%session_id, ?state, "ICE gathering state changed");
                Box::pin(async {})
            }
        }));

        pc.on_peer_connection_state_change(Box::new({
            let events = events.clone();
            let session_id = session_id.to_string();
            move |st: RTCPeerConnectionState| {
                info!(%session_id, state = %st, "peer connection state changed");
                let _ = events.send(TransportEvent::StateChanged(st.into()));
                Box::pin(async {})
            }
        }));

        pc.on_data_channel(Box::new({
            let session_id = session_id.to_string();
            move |dc: Arc<RTCDataChannel>| {
                attach_dc(&session_id, dc, events.clone());
                Box::pin(async {})
            }
        }));

        Ok(Self { pc })
    }
}

#[async_trait]
impl Transport for RtcTransport {
    async fn set_remote_offer(&self, sdp: String) -> Result<(), TransportError> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        // Trickle ICE: the answer goes out before gathering completes.
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Rejected("no local description after answer".into()))?;
        Ok(SessionDescription::answer(local.sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.pc.connection_state().into()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Builds the peer connection configuration from the configured ICE servers.
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_get_scheme_and_credentials() {
        let servers = vec![
            ServerConfig {
                id: "a".into(),
                r#type: "stun".into(),
                url: "stun.example.org:3478".into(),
                username: None,
                credential: None,
            },
            ServerConfig {
                id: "b".into(),
                r#type: "turn".into(),
                url: "turn.example.org:3478".into(),
                username: Some("user".into()),
                credential: Some("pass".into()),
            },
        ];

        let ice = get_ice_servers(&servers);
        assert_eq!(ice[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(ice[0].username, "");
        assert_eq!(ice[1].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(ice[1].credential, "pass");
    }
}
