//! Peer connection seam
//!
//! The media stack itself (ICE, DTLS, codecs) belongs to the host. The
//! negotiator drives it through these traits; events flow back on an
//! unbounded channel handed out at creation time.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::{MediaKind, TrackInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offer" => Some(SdpType::Offer),
            "answer" => Some(SdpType::Answer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// Notifications from one peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IceConnectionState(IceConnectionState),
    /// Remote media arrived
    Track(TrackInfo),
    TrackEnded(TrackInfo),
    DataChannelOpen,
    DataChannelMessage(String),
    DataChannelClosed,
}

pub trait Transceiver: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn direction(&self) -> TransceiverDirection;

    /// Swap the outgoing track in place (`None` sends nothing)
    fn replace_track(&self, track_id: Option<&str>) -> Result<(), NegotiationError>;

    fn current_track(&self) -> Option<String>;
}

pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn send(&self, text: &str) -> Result<(), NegotiationError>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

pub trait PeerConnection: Send + Sync {
    fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn Transceiver>, NegotiationError>;

    fn transceivers(&self) -> Vec<Arc<dyn Transceiver>>;

    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NegotiationError>;

    fn create_offer(&self, ice_restart: bool)
        -> BoxFuture<'static, Result<SessionDescription, NegotiationError>>;

    fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> BoxFuture<'static, Result<(), NegotiationError>>;

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> BoxFuture<'static, Result<(), NegotiationError>>;

    fn close(&self);
}

/// Peer connection plus its event stream
pub type PeerHandle = (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>);

pub trait PeerConnectionFactory: Send + Sync {
    fn create(&self, ice_servers: &[String]) -> Result<PeerHandle, NegotiationError>;
}
