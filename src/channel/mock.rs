//! In-memory socket connector for tests and offline development
//!
//! Every `connect()` call is announced on a channel as a [`PendingSocket`];
//! the test decides whether to accept it (yielding a [`MockRemote`] that
//! plays the server side), reject it, or leave it hanging.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::socket::{Frame, SocketCommand, SocketConnector, SocketEvent, SocketLink};
use crate::error::ChannelError;

/// Server side of an accepted mock socket
pub struct MockRemote {
    to_client: mpsc::UnboundedSender<SocketEvent>,
    from_client: mpsc::UnboundedReceiver<SocketCommand>,
}

impl MockRemote {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(SocketEvent::Frame(Frame::Text(text.into())))
            .is_ok()
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.to_client
            .send(SocketEvent::Frame(Frame::Binary(bytes)))
            .is_ok()
    }

    /// Simulate the remote closing the socket
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.to_client.send(SocketEvent::Closed {
            reason: reason.into(),
        });
    }

    pub fn fail(&self, error: impl Into<String>) {
        let _ = self.to_client.send(SocketEvent::Error(error.into()));
    }

    /// Next command written by the client
    pub async fn recv(&mut self) -> Option<SocketCommand> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SocketCommand> {
        self.from_client.try_recv().ok()
    }

    /// Drain every text frame written so far
    pub fn drain_text(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(command) = self.from_client.try_recv() {
            if let SocketCommand::Send(Frame::Text(text)) = command {
                out.push(text);
            }
        }
        out
    }
}

/// A connect() call waiting for the test to decide its fate
pub struct PendingSocket {
    pub url: String,
    reply: oneshot::Sender<Result<SocketLink, ChannelError>>,
}

impl PendingSocket {
    pub fn accept(self) -> MockRemote {
        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let _ = self.reply.send(Ok(SocketLink { outgoing, incoming }));
        MockRemote {
            to_client,
            from_client,
        }
    }

    pub fn reject(self, error: impl Into<String>) {
        let _ = self
            .reply
            .send(Err(ChannelError::ConnectionFailed(error.into())));
    }
}

#[derive(Clone)]
pub struct MockConnector {
    pending: mpsc::UnboundedSender<PendingSocket>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingSocket>) {
        let (pending, rx) = mpsc::unbounded_channel();
        (
            Self {
                pending,
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Number of connect() calls so far
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl SocketConnector for MockConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<SocketLink, ChannelError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (reply, wait) = oneshot::channel();
        let sent = self.pending.send(PendingSocket {
            url: url.to_string(),
            reply,
        });

        Box::pin(async move {
            if sent.is_err() {
                return Err(ChannelError::ConnectionFailed("mock server gone".to_string()));
            }
            wait.await.unwrap_or_else(|_| {
                Err(ChannelError::ConnectionFailed("mock socket dropped".to_string()))
            })
        })
    }
}
