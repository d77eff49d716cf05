//! Reconnecting duplex channel
//!
//! Wraps a [`SocketConnector`] and keeps one logical connection alive across
//! transient drops, within a bounded retry budget.
//!
//! # Attempt lifecycle
//!
//! 1. `connect()` creates a [`ConnectionAttempt`] (the only "current" one) and
//!    arms the connection timeout.
//! 2. Open: the attempt is marked ok, the keep-alive ticker starts, the
//!    reconnect budget is refilled.
//! 3. Drop (remote close, socket error, keep-alive staleness): if the channel
//!    has never opened, nothing is retried. Otherwise a reconnect is scheduled
//!    after the backoff wait, or `ReconnectFailed` is emitted once the budget
//!    is spent.
//!
//! Every socket event is tagged with its attempt id; events from superseded
//! attempts are dropped on the floor.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::ReconnectPolicy;
use super::keepalive::{KeepAliveMonitor, KeepAliveVerdict};
use super::socket::{Frame, SocketCommand, SocketConnector, SocketEvent, SocketLink};
use crate::config::WebSocketConfig;
use crate::error::ChannelError;

/// Why a connection went away without a manual close
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    Remote(String),
    Error(String),
    /// Keep-alive staleness timeout
    Stale,
    /// A scheduled reconnect attempt failed to open
    ReconnectFailed(String),
}

/// Notifications from the channel, delivered in order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open { reconnected: bool },
    Message(Frame),
    /// The open connection went away
    Dropped(DropReason),
    Reconnecting { attempt: u32, delay: Duration },
    /// The backoff wait is over and reconnect `attempt` is dialing
    Retrying { attempt: u32 },
    /// Terminal: the reconnect budget is spent
    ReconnectFailed { attempts: u32 },
    /// Nothing sent for a full interval; send an application-level ping
    KeepAlive,
    /// Initial connection failed; not retried
    Error(ChannelError),
    /// Manual close finished
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub url: String,
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub policy: ReconnectPolicy,
}

impl From<&WebSocketConfig> for ChannelOptions {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            url: config.url.clone(),
            connect_timeout: config.connect_timeout(),
            keep_alive_interval: config.keep_alive_interval(),
            keep_alive_timeout: config.keep_alive_timeout(),
            policy: config.reconnect_policy(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttemptFlags {
    pub closed_manually: bool,
    pub errored: bool,
    pub timed_out: bool,
    pub rejected: bool,
    pub initial_connection_ok: bool,
}

/// One low-level socket, from connect to discard
struct ConnectionAttempt {
    id: u64,
    cancel: CancellationToken,
    outgoing: Option<mpsc::UnboundedSender<SocketCommand>>,
    reader_task: Option<JoinHandle<()>>,
    flags: AttemptFlags,
}

impl ConnectionAttempt {
    fn new(id: u64) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
            outgoing: None,
            reader_task: None,
            flags: AttemptFlags::default(),
        }
    }

    /// Cancel an in-flight connect and shut the socket down
    fn discard(mut self) {
        self.cancel.cancel();
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(SocketCommand::Close);
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        log::debug!("Connection attempt {} discarded ({:?})", self.id, self.flags);
    }
}

struct ChannelState {
    next_attempt_id: u64,
    current: Option<ConnectionAttempt>,
    policy: ReconnectPolicy,
    keep_alive: KeepAliveMonitor,
    initial_connection_ok: bool,
    closed_manually: bool,
    reconnect_pending: bool,
    reconnect_task: Option<JoinHandle<()>>,
    keep_alive_task: Option<JoinHandle<()>>,
}

impl ChannelState {
    fn is_current(&self, id: u64) -> bool {
        self.current.as_ref().map(|a| a.id) == Some(id)
    }

    fn stop_keep_alive(&mut self) {
        if let Some(task) = self.keep_alive_task.take() {
            task.abort();
        }
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_pending = false;
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

struct Inner {
    url: String,
    connect_timeout: Duration,
    connector: Arc<dyn SocketConnector>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: Mutex<ChannelState>,
}

/// Cheaply clonable handle to one logical connection
#[derive(Clone)]
pub struct ReconnectingChannel {
    inner: Arc<Inner>,
}

/// Receiver of [`ChannelEvent`]s
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

impl ReconnectingChannel {
    pub fn new(options: ChannelOptions, connector: Arc<dyn SocketConnector>) -> (Self, ChannelEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            url: options.url,
            connect_timeout: options.connect_timeout,
            connector,
            events,
            state: Mutex::new(ChannelState {
                next_attempt_id: 0,
                current: None,
                policy: options.policy,
                keep_alive: KeepAliveMonitor::new(
                    options.keep_alive_interval,
                    options.keep_alive_timeout,
                ),
                initial_connection_ok: false,
                closed_manually: false,
                reconnect_pending: false,
                reconnect_task: None,
                keep_alive_task: None,
            }),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Open the channel
    ///
    /// Resolves when this attempt's handshake completes and it is still the
    /// current attempt. A superseded attempt (newer `connect()`, or `close()`
    /// while in flight) fails with [`ChannelError::Cancelled`].
    pub async fn connect(&self) -> Result<(), ChannelError> {
        {
            let mut state = self.inner.lock();
            state.closed_manually = false;
            state.cancel_reconnect();
        }
        self.inner.open_attempt().await
    }

    /// Send a frame if the channel is open
    ///
    /// Never queues: on a closed channel the frame is dropped with a warning.
    pub fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let mut state = self.inner.lock();
        let Some(tx) = state.current.as_ref().and_then(|a| a.outgoing.as_ref()) else {
            log::warn!("Channel not open, dropping outgoing frame");
            return Err(ChannelError::NotOpen);
        };

        tx.send(SocketCommand::Send(frame))
            .map_err(|_| ChannelError::SendFailed("socket writer is gone".to_string()))?;
        state.keep_alive.record_sent(Instant::now());
        Ok(())
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.send(Frame::Text(text.into()))
    }

    /// Close the channel and cancel every timer
    ///
    /// An in-flight `connect()` fails with [`ChannelError::Cancelled`]; no
    /// reconnect fires afterwards.
    pub fn close(&self) {
        {
            let mut state = self.inner.lock();
            state.closed_manually = true;
            state.initial_connection_ok = false;
            state.policy.reset();
            state.cancel_reconnect();
            state.stop_keep_alive();
            if let Some(mut attempt) = state.current.take() {
                attempt.flags.closed_manually = true;
                attempt.discard();
            }
        }
        log::info!("Channel closed");
        self.inner.emit(ChannelEvent::Closed);
    }

    pub fn is_open(&self) -> bool {
        self.inner
            .lock()
            .current
            .as_ref()
            .is_some_and(|a| a.outgoing.is_some())
    }

    pub fn is_reconnect_pending(&self) -> bool {
        self.inner.lock().reconnect_pending
    }

    /// Reconnects consumed since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().policy.attempts()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Channel event receiver dropped");
        }
    }

    async fn open_attempt(self: &Arc<Self>) -> Result<(), ChannelError> {
        let (id, cancel) = {
            let mut state = self.lock();
            if let Some(mut old) = state.current.take() {
                log::debug!("Attempt {} superseded", old.id);
                old.flags.rejected = true;
                old.discard();
            }
            state.stop_keep_alive();

            let id = state.next_attempt_id;
            state.next_attempt_id += 1;
            let attempt = ConnectionAttempt::new(id);
            let cancel = attempt.cancel.clone();
            state.current = Some(attempt);
            (id, cancel)
        };

        log::debug!("Connection attempt {} to {}", id, self.url);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChannelError::Cancelled),
            connected = tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.url)) => {
                match connected {
                    Ok(result) => result,
                    Err(_) => Err(ChannelError::Timeout(self.connect_timeout)),
                }
            }
        };

        match result {
            Ok(link) => self.on_open(id, link),
            Err(err) => self.on_connect_failed(id, err),
        }
    }

    fn on_open(self: &Arc<Self>, id: u64, link: SocketLink) -> Result<(), ChannelError> {
        let reconnected = {
            let mut state = self.lock();
            if state.closed_manually || !state.is_current(id) {
                let _ = link.outgoing.send(SocketCommand::Close);
                log::debug!("Attempt {} opened after being superseded", id);
                return Err(ChannelError::Cancelled);
            }

            let reconnected = state.initial_connection_ok;
            state.initial_connection_ok = true;
            state.policy.reset();
            state.keep_alive.reset(Instant::now());

            let weak = Arc::downgrade(self);
            let reader_task = tokio::spawn(read_loop(weak.clone(), id, link.incoming));
            let interval = state.keep_alive.interval();
            state.keep_alive_task = Some(tokio::spawn(keep_alive_loop(weak, id, interval)));

            if let Some(attempt) = state.current.as_mut() {
                attempt.flags.initial_connection_ok = true;
                attempt.outgoing = Some(link.outgoing);
                attempt.reader_task = Some(reader_task);
            }
            reconnected
        };

        log::info!("Channel open (attempt {}, reconnected: {})", id, reconnected);
        self.emit(ChannelEvent::Open { reconnected });
        Ok(())
    }

    fn on_connect_failed(self: &Arc<Self>, id: u64, err: ChannelError) -> Result<(), ChannelError> {
        let retry = {
            let mut state = self.lock();
            if state.closed_manually || !state.is_current(id) {
                log::debug!("Attempt {} cancelled: {}", id, err);
                return Err(ChannelError::Cancelled);
            }

            if let Some(mut attempt) = state.current.take() {
                match err {
                    ChannelError::Timeout(_) => attempt.flags.timed_out = true,
                    _ => attempt.flags.errored = true,
                }
                attempt.discard();
            }
            state.initial_connection_ok
        };

        if retry {
            log::warn!("Reconnect attempt {} failed: {}", id, err);
            self.handle_drop_with(DropReason::ReconnectFailed(err.to_string()));
        } else {
            log::error!("Initial connection failed: {}", err);
            self.emit(ChannelEvent::Error(err.clone()));
        }
        Err(err)
    }

    fn on_frame(&self, id: u64, frame: Frame) -> bool {
        {
            let mut state = self.lock();
            if !state.is_current(id) {
                return false;
            }
            state.keep_alive.record_received(Instant::now());
        }
        self.emit(ChannelEvent::Message(frame));
        true
    }

    fn on_socket_gone(self: &Arc<Self>, id: u64, reason: DropReason) {
        {
            let mut state = self.lock();
            if state.closed_manually || !state.is_current(id) {
                return;
            }
            state.stop_keep_alive();
            if let Some(mut attempt) = state.current.take() {
                attempt.flags.errored = matches!(reason, DropReason::Error(_));
                // the reader is the caller; it exits on its own
                attempt.reader_task = None;
                attempt.discard();
            }
        }

        log::warn!("Channel dropped: {:?}", reason);
        self.emit(ChannelEvent::Dropped(reason));
        self.handle_drop();
    }

    /// Keep-alive tick; returns false when the ticker should stop
    fn keep_alive_tick(self: &Arc<Self>, id: u64) -> bool {
        let verdict = {
            let mut state = self.lock();
            if state.closed_manually || !state.is_current(id) {
                return false;
            }
            let now = Instant::now();
            let verdict = state.keep_alive.check(now);
            if verdict == KeepAliveVerdict::Stale {
                log::warn!(
                    "No message received for {:?}, closing stale channel",
                    state.keep_alive.since_received(now)
                );
                // the ticker is the caller; it stops on return
                state.keep_alive_task = None;
                if let Some(attempt) = state.current.take() {
                    attempt.discard();
                }
            }
            verdict
        };

        match verdict {
            KeepAliveVerdict::Stale => {
                self.emit(ChannelEvent::Dropped(DropReason::Stale));
                self.handle_drop();
                false
            }
            KeepAliveVerdict::SendPing => {
                self.emit(ChannelEvent::KeepAlive);
                true
            }
            KeepAliveVerdict::Healthy => true,
        }
    }

    fn handle_drop(self: &Arc<Self>) {
        self.schedule_reconnect();
    }

    fn handle_drop_with(self: &Arc<Self>, reason: DropReason) {
        self.emit(ChannelEvent::Dropped(reason));
        self.schedule_reconnect();
    }

    /// Schedule the next reconnect; a second request while one is pending is ignored
    fn schedule_reconnect(self: &Arc<Self>) {
        let scheduled = {
            let mut state = self.lock();
            if state.closed_manually {
                return;
            }
            if state.reconnect_pending {
                log::debug!("Reconnect already scheduled");
                return;
            }
            match state.policy.next_delay() {
                Some(delay) => {
                    state.reconnect_pending = true;
                    Ok((state.policy.attempts(), delay))
                }
                None => Err(state.policy.max_attempts()),
            }
        };

        let (attempt, delay) = match scheduled {
            Ok(next) => next,
            Err(attempts) => {
                log::error!("Reconnect budget spent after {} attempts", attempts);
                self.emit(ChannelEvent::ReconnectFailed { attempts });
                return;
            }
        };

        log::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        self.emit(ChannelEvent::Reconnecting { attempt, delay });

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.lock();
                if !state.reconnect_pending {
                    return;
                }
                state.reconnect_pending = false;
                state.reconnect_task = None;
            }
            inner.emit(ChannelEvent::Retrying { attempt });
            if let Err(e) = inner.open_attempt().await {
                log::debug!("Scheduled reconnect ended: {}", e);
            }
        });

        let mut state = self.lock();
        if state.reconnect_pending {
            state.reconnect_task = Some(task);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_reconnect();
        state.stop_keep_alive();
        if let Some(attempt) = state.current.take() {
            attempt.discard();
        }
    }
}

async fn read_loop(
    weak: Weak<Inner>,
    id: u64,
    mut incoming: mpsc::UnboundedReceiver<SocketEvent>,
) {
    while let Some(event) = incoming.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match event {
            SocketEvent::Frame(frame) => {
                if !inner.on_frame(id, frame) {
                    return;
                }
            }
            SocketEvent::Closed { reason } => {
                inner.on_socket_gone(id, DropReason::Remote(reason));
                return;
            }
            SocketEvent::Error(e) => {
                inner.on_socket_gone(id, DropReason::Error(e));
                return;
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        inner.on_socket_gone(id, DropReason::Remote("stream ended".to_string()));
    }
}

async fn keep_alive_loop(weak: Weak<Inner>, id: u64, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.keep_alive_tick(id) {
            return;
        }
    }
}
