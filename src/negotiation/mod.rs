//! Peer connection setup: offer/answer, codec preference and recovery

pub mod mock;
mod negotiator;
mod peer;
mod sdp;
mod signaling;

pub use negotiator::{Negotiator, NegotiatorEvent, NegotiatorEvents, NegotiatorOptions};
pub use peer::{
    DataChannel, IceConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerHandle,
    SdpType, SessionDescription, Transceiver, TransceiverDirection,
};
pub use sdp::{filter_codec, payload_types};
pub use signaling::{HttpSignaling, SignalingClient};
