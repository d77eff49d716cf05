//! Error taxonomy for the transport core
//!
//! Each layer has its own error enum; everything converges on
//! [`TransportError`], which carries the categories the host application
//! reacts to (transient vs. terminal vs. cancellation).

use std::time::Duration;

/// Errors from the reconnecting duplex channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The initial connection attempt failed (never retried)
    ConnectionFailed(String),
    /// The handshake did not complete before the connection timeout
    Timeout(Duration),
    /// A newer attempt or a manual close superseded this attempt
    Cancelled,
    /// The channel is not open
    NotOpen,
    /// Sending a frame failed
    SendFailed(String),
    /// The reconnect budget is spent
    ReconnectFailed { attempts: u32 },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::ConnectionFailed(e) => write!(f, "Connection failed: {}", e),
            ChannelError::Timeout(d) => write!(f, "Connection timed out after {:?}", d),
            ChannelError::Cancelled => write!(f, "Connection attempt cancelled"),
            ChannelError::NotOpen => write!(f, "Channel is not open"),
            ChannelError::SendFailed(e) => write!(f, "Failed to send: {}", e),
            ChannelError::ReconnectFailed { attempts } => {
                write!(f, "Reconnect failed after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for ChannelError {}

/// Errors from the peer connection negotiator
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationError {
    /// The host peer-connection stack rejected an operation
    PeerConnection(String),
    /// The signaling endpoint could not be reached or answered with an error
    Signaling(String),
    /// The local or remote session description is unusable
    InvalidSdp(String),
    /// Recovery attempts are exhausted
    RecoveryExhausted { attempts: u32 },
    /// A recovery is already running (single-flight guard)
    RecoveryInProgress,
    /// The session was closed while the operation was in flight
    Closed,
}

impl std::fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationError::PeerConnection(e) => write!(f, "Peer connection error: {}", e),
            NegotiationError::Signaling(e) => write!(f, "Signaling error: {}", e),
            NegotiationError::InvalidSdp(e) => write!(f, "Invalid session description: {}", e),
            NegotiationError::RecoveryExhausted { attempts } => {
                write!(f, "Peer connection recovery failed after {} attempts", attempts)
            }
            NegotiationError::RecoveryInProgress => write!(f, "Recovery already in progress"),
            NegotiationError::Closed => write!(f, "Negotiation session closed"),
        }
    }
}

impl std::error::Error for NegotiationError {}

/// Errors from the audio capture pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// `begin` called while a session is already running
    AlreadyBegun,
    /// `record`/`pause`/`end` called before `begin`
    NotBegun,
    /// `record` called while already recording
    AlreadyRecording,
    /// `pause` called while not recording
    NotRecording,
    /// The processing thread is gone
    ProcessorGone,
    /// The source track could not be attached
    Track(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::AlreadyBegun => write!(f, "Capture already begun"),
            CaptureError::NotBegun => write!(f, "Capture not begun"),
            CaptureError::AlreadyRecording => write!(f, "Already recording"),
            CaptureError::NotRecording => write!(f, "Not recording"),
            CaptureError::ProcessorGone => write!(f, "Audio processor is not running"),
            CaptureError::Track(e) => write!(f, "Audio track error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Errors from the playback output stage
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// The output stream could not be built or started
    Output(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::Output(e) => write!(f, "Audio output error: {}", e),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// Errors from device enumeration and selection
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Enumerating devices failed
    Enumeration(String),
    /// The requested device id is not in the inventory
    NotFound(String),
    /// Building the pipeline stage for the device failed
    Unavailable(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Enumeration(e) => write!(f, "Device enumeration failed: {}", e),
            DeviceError::NotFound(id) => write!(f, "Device not found: {}", id),
            DeviceError::Unavailable(e) => write!(f, "Device unavailable: {}", e),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Transport-level error seen by the host application
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Initial connect failed; not retried
    Connection(String),
    /// Post-connect failure, recovered internally
    TransientDrop(String),
    /// Keep-alive timeout, recovered like a transient drop
    StaleConnection,
    /// A newer attempt or manual close superseded an in-flight operation
    Cancelled,
    /// Offer/answer or SDP rewrite failure
    Negotiation(NegotiationError),
    /// Reconnect or recovery budget spent; terminal
    ExhaustedRetries { attempts: u32 },
    /// Device enumeration or selection failure
    Device(DeviceError),
    /// Operation requires the `ready` state
    NotReady,
    /// Operation is not allowed in the current state
    InvalidState(String),
    /// Malformed message on the wire
    Protocol(String),
    /// Audio pipeline failure
    Audio(String),
}

impl TransportError {
    /// Terminal categories end the session with an observable `error` state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportError::Connection(_)
                | TransportError::ExhaustedRetries { .. }
                | TransportError::Negotiation(NegotiationError::RecoveryExhausted { .. })
        )
    }

    /// Transient categories are recovered internally
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::TransientDrop(_) | TransportError::StaleConnection
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Connection(e) => write!(f, "Connection error: {}", e),
            TransportError::TransientDrop(e) => write!(f, "Connection dropped: {}", e),
            TransportError::StaleConnection => write!(f, "Connection went stale (keep-alive timeout)"),
            TransportError::Cancelled => write!(f, "Operation cancelled"),
            TransportError::Negotiation(e) => write!(f, "Negotiation error: {}", e),
            TransportError::ExhaustedRetries { attempts } => {
                write!(f, "Gave up after {} reconnect attempts", attempts)
            }
            TransportError::Device(e) => write!(f, "{}", e),
            TransportError::NotReady => write!(f, "Transport is not ready"),
            TransportError::InvalidState(e) => write!(f, "Invalid state: {}", e),
            TransportError::Protocol(e) => write!(f, "Protocol error: {}", e),
            TransportError::Audio(e) => write!(f, "Audio error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ChannelError> for TransportError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::ConnectionFailed(e) => TransportError::Connection(e),
            ChannelError::Timeout(d) => {
                TransportError::Connection(format!("timed out after {:?}", d))
            }
            ChannelError::Cancelled => TransportError::Cancelled,
            ChannelError::NotOpen => TransportError::NotReady,
            ChannelError::SendFailed(e) => TransportError::TransientDrop(e),
            ChannelError::ReconnectFailed { attempts } => {
                TransportError::ExhaustedRetries { attempts }
            }
        }
    }
}

impl From<NegotiationError> for TransportError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::RecoveryExhausted { attempts } => {
                TransportError::ExhaustedRetries { attempts }
            }
            NegotiationError::Closed => TransportError::Cancelled,
            other => TransportError::Negotiation(other),
        }
    }
}

impl From<DeviceError> for TransportError {
    fn from(err: DeviceError) -> Self {
        TransportError::Device(err)
    }
}

impl From<CaptureError> for TransportError {
    fn from(err: CaptureError) -> Self {
        TransportError::Audio(err.to_string())
    }
}

impl From<PlaybackError> for TransportError {
    fn from(err: PlaybackError) -> Self {
        TransportError::Audio(err.to_string())
    }
}
