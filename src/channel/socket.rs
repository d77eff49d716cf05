//! Single-use duplex socket primitive
//!
//! A [`SocketConnector`] opens one socket per call and hands back a
//! [`SocketLink`]: a command sender for outgoing frames and an event receiver
//! fed by a background reader task. A link is never reopened; reconnection
//! is the job of [`super::ReconnectingChannel`].

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
};

use crate::error::ChannelError;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Frame(Frame),
    /// Remote closed the socket (or the stream ended)
    Closed { reason: String },
    /// Transport-level error; the socket is unusable afterwards
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketCommand {
    Send(Frame),
    Close,
}

/// Halves of one open socket
pub struct SocketLink {
    pub outgoing: mpsc::UnboundedSender<SocketCommand>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens single-use sockets
pub trait SocketConnector: Send + Sync + 'static {
    /// Resolves once the handshake completes
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<SocketLink, ChannelError>>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    headers: Vec<(String, String)>,
}

impl WsConnector {
    pub fn new() -> Self {
        // Only the first install wins; later calls are harmless
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self::default()
    }

    /// Extra request header sent with every handshake
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl SocketConnector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<SocketLink, ChannelError>> {
        let url = url.to_string();
        let headers = self.headers.clone();

        Box::pin(async move {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

            for (name, value) in &headers {
                let name = tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(
                    name.as_bytes(),
                )
                .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
                let value = tokio_tungstenite::tungstenite::http::HeaderValue::from_str(value)
                    .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
                request.headers_mut().insert(name, value);
            }

            log::info!("Opening WebSocket to {}", url);

            let (ws_stream, _response) = connect_async_with_config(
                request, None, true, // disable_nagle: audio frames are latency-sensitive
            )
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

            let (mut write, mut read) = ws_stream.split();
            let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<SocketCommand>();
            let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<SocketEvent>();

            // Writer: exits on Close or when every sender is dropped
            tokio::spawn(async move {
                while let Some(command) = outgoing_rx.recv().await {
                    let result = match command {
                        SocketCommand::Send(Frame::Text(text)) => {
                            write.send(Message::Text(text)).await
                        }
                        SocketCommand::Send(Frame::Binary(bytes)) => {
                            write.send(Message::Binary(bytes)).await
                        }
                        SocketCommand::Close => break,
                    };
                    if let Err(e) = result {
                        log::warn!("WebSocket write failed: {}", e);
                        break;
                    }
                }
                if let Err(e) = write.close().await {
                    log::debug!("Error closing WebSocket: {}", e);
                }
                log::debug!("WebSocket writer exiting");
            });

            // Reader: forwards frames until close/error
            tokio::spawn(async move {
                while let Some(msg_result) = read.next().await {
                    let event = match msg_result {
                        Ok(Message::Text(text)) => SocketEvent::Frame(Frame::Text(text)),
                        Ok(Message::Binary(bytes)) => SocketEvent::Frame(Frame::Binary(bytes)),
                        Ok(Message::Close(frame)) => {
                            let reason = frame
                                .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                                .unwrap_or_else(|| "closed by remote".to_string());
                            let _ = incoming_tx.send(SocketEvent::Closed { reason });
                            return;
                        }
                        Err(e) => {
                            let _ = incoming_tx.send(SocketEvent::Error(e.to_string()));
                            return;
                        }
                        _ => continue, // ping/pong/raw frames
                    };
                    if incoming_tx.send(event).is_err() {
                        log::debug!("WebSocket reader: receiver dropped");
                        return;
                    }
                }
                let _ = incoming_tx.send(SocketEvent::Closed {
                    reason: "stream ended".to_string(),
                });
            });

            Ok(SocketLink {
                outgoing: outgoing_tx,
                incoming: incoming_rx,
            })
        })
    }
}
