//! Client-side real-time voice transport
//!
//! Carries voice (and control messages) between an application and a remote
//! conversational backend, over either a reconnecting duplex socket or a
//! negotiated peer connection. Both variants share one lifecycle:
//!
//! ```text
//! uninitialized -> initializing -> initialized -> connecting -> connected -> ready
//! ```
//!
//! with `reconnecting`, `disconnecting`, `disconnected` and `error` around it.
//! See [`transport::Transport`] for the entry point.
//!
//! Logging goes through the `log` facade; the host application installs the
//! logger.

pub mod audio;
pub mod channel;
pub mod config;
pub mod devices;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod state_machine;
pub mod transport;

pub use config::TransportConfig;
pub use devices::{DeviceKind, MediaDeviceInfo, MediaDevices, StaticDevices};
pub use diagnostics::{DiagnosticHook, DiagnosticsCollector};
pub use error::TransportError;
pub use events::{Callbacks, EventBus, SubscriptionId, TransportEvent};
pub use media::{MediaKind, Participant, TrackInfo, Tracks};
pub use protocol::ControlMessage;
pub use state_machine::TransportState;
pub use transport::{Transport, TransportBackend, TransportHandle};
