use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::data_channel::{
    data_channel_message::DataChannelMessage, data_channel_state::RTCDataChannelState,
    RTCDataChannel,
};

use crate::error::TransportError;
use crate::peer::types::{DataMessage, TransportEvent};

/// Send side of a peer-opened data channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Bytes queued in the engine but not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    pub fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self { dc }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.dc.close().await?;
        Ok(())
    }
}

/// Wires a channel opened by the remote peer into the session's event queue.
pub fn attach_dc(
    session_id: &str,
    dc: Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    info!(session_id, label = dc.label(), "data channel announced by peer");

    dc.on_open(Box::new({
        let session_id = session_id.to_string();
        let label = dc.label().to_string();
        move || {
            debug!(%session_id, %label, "data channel open");
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let session_id = session_id.to_string();
        move || {
            debug!(%session_id, "data channel closed");
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let events = events.clone();
        move |msg: DataChannelMessage| {
            let message = if msg.is_string {
                DataMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                DataMessage::Binary(msg.data)
            };
            let _ = events.send(TransportEvent::DataMessage(message));
            Box::pin(async {})
        }
    }));

    let _ = events.send(TransportEvent::DataChannel(Arc::new(RtcDataChannel::new(dc))));
}
