//! Duplex message channel with bounded reconnection and keep-alive

mod backoff;
mod keepalive;
pub mod mock;
mod reconnecting;
mod socket;

pub use backoff::ReconnectPolicy;
pub use keepalive::{KeepAliveMonitor, KeepAliveVerdict};
pub use reconnecting::{
    AttemptFlags, ChannelEvent, ChannelEvents, ChannelOptions, DropReason, ReconnectingChannel,
};
pub use socket::{Frame, SocketCommand, SocketConnector, SocketEvent, SocketLink, WsConnector};
