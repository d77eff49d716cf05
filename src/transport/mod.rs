//! Transport engine shared by every wire variant
//!
//! [`Transport`] owns the lifecycle: it runs the state machine, talks to the
//! application through the [`EventBus`], and delegates everything wire-specific
//! to a [`TransportBackend`]. The backends are:
//!
//! - [`websocket::WebSocketBackend`]: reconnecting duplex socket carrying
//!   control envelopes and raw PCM audio
//! - [`webrtc::WebRtcBackend`]: negotiated peer connection with a control
//!   data channel
//!
//! # Handshake
//!
//! Once the backend reports it is connected, the engine sends `client-ready`;
//! the remote's `bot-ready` moves the transport to `ready`. The same handshake
//! runs again after every reconnect.

pub mod webrtc;
pub mod websocket;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::TrackOffset;
use crate::devices::{DeviceKind, DeviceManager, MediaDeviceInfo, MediaDevices};
use crate::diagnostics::DiagnosticHook;
use crate::error::TransportError;
use crate::events::{Callbacks, EventBus, SubscriptionId, TransportEvent};
use crate::media::{Participant, Tracks, TrackInfo};
use crate::protocol::{message_types, ControlMessage};
use crate::state_machine::{reduce, Effect, Event, TransportState};

/// Notifications from a backend to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// The wire is up (first time or after recovery)
    Connected { reconnected: bool },
    /// The wire dropped and a retry is scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// A scheduled retry started dialing
    Retrying { attempt: u32 },
    /// Control envelope from the remote side
    Message(ControlMessage),
    TrackStarted(TrackInfo),
    TrackStopped(TrackInfo),
    /// Unrecoverable; the engine moves to `error`
    Failed(TransportError),
    /// Reported to the application; the session continues
    Error(TransportError),
    /// The remote side hung up
    RemoteLeft,
}

pub type BackendSink = mpsc::UnboundedSender<BackendEvent>;

/// Wire-specific half of a transport
///
/// The engine calls these hooks; it never touches sockets, peers or devices
/// itself. Futures are `'static` so backends keep their state behind an `Arc`.
pub trait TransportBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Synchronous setup; `events` stays valid for the backend's lifetime
    fn initialize_backend(&self, events: BackendSink);

    /// Acquire media from the currently selected devices
    fn init_media(&self, devices: DeviceManager) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Establish the wire; resolves once it is up
    fn connect_backend(&self) -> BoxFuture<'static, Result<(), TransportError>>;

    fn send_backend(&self, message: &ControlMessage) -> Result<(), TransportError>;

    /// Close the wire and halt media; must be safe to call repeatedly
    fn teardown_backend(&self) -> BoxFuture<'static, ()>;

    /// Rebuild the pipeline stage fed by `kind` from the current selection
    fn switch_device(
        &self,
        kind: DeviceKind,
        devices: DeviceManager,
    ) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Barge-in: stop local playback; `None` when the backend plays nothing itself
    fn interrupt_playback(&self) -> Option<TrackOffset> {
        None
    }
}

type ReadySender = oneshot::Sender<Result<(), TransportError>>;

struct EngineState {
    state: TransportState,
    tracks: Tracks,
    pump: Option<JoinHandle<()>>,
    /// Resolves the in-flight `connect()` on `ready`, `error` or disconnect
    ready: Option<ReadySender>,
}

struct Shared {
    backend: Arc<dyn TransportBackend>,
    bus: EventBus,
    devices: DeviceManager,
    diagnostics: Option<Arc<dyn DiagnosticHook>>,
    state: Mutex<EngineState>,
    /// Serializes transitions so notifications go out in event order
    dispatch_lock: tokio::sync::Mutex<()>,
}

/// One transport instance with a uniform lifecycle
pub struct Transport {
    shared: Arc<Shared>,
}

/// Capability-restricted view of a transport for collaborators
///
/// Exposes messaging, state and track queries, and subscriptions; lifecycle
/// control stays with the owner of the [`Transport`].
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

impl Transport {
    pub fn new(
        backend: Arc<dyn TransportBackend>,
        devices: Arc<dyn MediaDevices>,
        diagnostics: Option<Arc<dyn DiagnosticHook>>,
    ) -> Self {
        let bus = EventBus::new();
        let shared = Shared {
            backend,
            devices: DeviceManager::new(devices, bus.clone()),
            bus,
            diagnostics,
            state: Mutex::new(EngineState {
                state: TransportState::Uninitialized,
                tracks: Tracks::default(),
                pump: None,
                ready: None,
            }),
            dispatch_lock: tokio::sync::Mutex::new(()),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Wire the backend to the engine (idempotent)
    ///
    /// Must run inside a Tokio runtime; `init_devices` and `connect` call it.
    pub fn initialize(&self) -> Result<(), TransportError> {
        self.shared.initialize()
    }

    /// Enumerate devices and acquire media
    ///
    /// A device failure is reported (error callback, returned error) but still
    /// leaves the transport `initialized`, so connecting remains possible.
    pub async fn init_devices(&self) -> Result<(), TransportError> {
        self.shared.initialize()?;
        let shared = &self.shared;

        if shared.state() != TransportState::Uninitialized {
            shared.devices.refresh().await?;
            return Ok(());
        }

        shared.dispatch(Event::Initialize).await;

        let result = match shared.devices.refresh().await {
            Ok(_) => shared.backend.init_media(shared.devices.clone()).await,
            Err(e) => Err(e.into()),
        };

        match &result {
            Ok(()) => shared.dispatch(Event::Initialized).await,
            Err(e) => shared.dispatch(Event::Warning(e.clone())).await,
        }
        result
    }

    /// Connect and wait for `ready`
    ///
    /// `abort` is checked before the backend connects and again after; an
    /// already-cancelled token returns [`TransportError::Cancelled`] without
    /// touching state.
    pub async fn connect(&self, abort: Option<CancellationToken>) -> Result<(), TransportError> {
        let abort = abort.unwrap_or_default();
        let shared = &self.shared;

        if abort.is_cancelled() {
            log::debug!("Connect aborted before start");
            return Err(TransportError::Cancelled);
        }

        let state = shared.state();
        if !state.can_connect() {
            return Err(TransportError::InvalidState(format!(
                "cannot connect while {}",
                state
            )));
        }

        if state == TransportState::Uninitialized {
            if let Err(e) = self.init_devices().await {
                log::warn!("Connecting without media: {}", e);
            }
        }
        shared.initialize()?;

        if abort.is_cancelled() {
            log::debug!("Connect aborted before negotiation");
            return Err(TransportError::Cancelled);
        }

        let (tx, ready) = oneshot::channel();
        shared.claim_connect(tx).await?;

        let connected = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(TransportError::Cancelled),
            result = shared.backend.connect_backend() => result,
        };

        match connected {
            Ok(()) if abort.is_cancelled() => {
                log::debug!("Connect aborted after negotiation");
                shared.dispatch(Event::Cancelled).await;
                return Err(TransportError::Cancelled);
            }
            Ok(()) => {}
            Err(TransportError::Cancelled) => {
                log::debug!("Connect cancelled");
                shared.dispatch(Event::Cancelled).await;
                return Err(TransportError::Cancelled);
            }
            Err(e) => {
                log::error!("{} connect failed: {}", shared.backend.name(), e);
                shared.dispatch(Event::Fatal(e.clone())).await;
                return Err(e);
            }
        }

        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                log::debug!("Connect aborted while waiting for bot-ready");
                shared.dispatch(Event::Cancelled).await;
                Err(TransportError::Cancelled)
            }
            result = ready => result.unwrap_or(Err(TransportError::Cancelled)),
        }
    }

    /// Tear down and wait for `disconnected`
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.shared.disconnect().await;
        Ok(())
    }

    /// Fire-and-forget; dropped with a warning unless `ready`
    pub fn send_message(&self, message: ControlMessage) {
        self.shared.send_message(message)
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn tracks(&self) -> Tracks {
        self.shared.lock().tracks.clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.bus.unsubscribe(id)
    }

    pub fn set_callbacks(&self, callbacks: Callbacks) -> SubscriptionId {
        callbacks.install(&self.shared.bus)
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.shared.devices
    }

    pub fn microphones(&self) -> Vec<MediaDeviceInfo> {
        self.shared.devices.microphones()
    }

    pub fn speakers(&self) -> Vec<MediaDeviceInfo> {
        self.shared.devices.speakers()
    }

    pub fn cameras(&self) -> Vec<MediaDeviceInfo> {
        self.shared.devices.cameras()
    }

    pub fn selected_device(&self, kind: DeviceKind) -> Option<MediaDeviceInfo> {
        self.shared.devices.selected(kind)
    }

    /// Select a device and rebuild the pipeline stage it feeds
    ///
    /// A failure is reported but leaves an open media session untouched.
    pub async fn select_device(&self, kind: DeviceKind, device_id: &str) -> Result<(), TransportError> {
        let shared = &self.shared;
        let result = match shared.devices.select(kind, device_id) {
            Ok(_) if shared.state() == TransportState::Uninitialized => Ok(()),
            Ok(_) => {
                shared
                    .backend
                    .switch_device(kind, shared.devices.clone())
                    .await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = &result {
            shared.dispatch(Event::Warning(e.clone())).await;
        }
        result
    }

    /// Stop bot audio now; the offset says how much the user heard
    pub fn interrupt_playback(&self) -> Option<TrackOffset> {
        self.shared.backend.interrupt_playback()
    }
}

impl TransportHandle {
    pub fn send_message(&self, message: ControlMessage) {
        self.shared.send_message(message)
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn tracks(&self) -> Tracks {
        self.shared.lock().tracks.clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.bus.unsubscribe(id)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> TransportState {
        self.lock().state
    }

    fn initialize(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.pump.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TransportError::InvalidState("initialize requires a Tokio runtime".to_string())
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.backend.initialize_backend(tx);
        state.pump = Some(runtime.spawn(pump(Arc::downgrade(self), rx)));
        log::info!("{} transport initialized", self.backend.name());
        Ok(())
    }

    fn send_message(&self, message: ControlMessage) {
        let state = self.state();
        if state != TransportState::Ready {
            log::warn!(
                "Dropping {} message while {} (not ready)",
                message.msg_type,
                state
            );
            return;
        }

        match self.backend.send_backend(&message) {
            Ok(()) => {
                if let Some(hook) = &self.diagnostics {
                    hook.message_sent(&message);
                }
            }
            Err(e) => log::warn!("Failed to send {} message: {}", message.msg_type, e),
        }
    }

    async fn disconnect(&self) {
        if !self.state().is_active() {
            log::debug!("Disconnect ignored while {}", self.state());
            return;
        }
        self.dispatch(Event::Disconnect).await;
        self.dispatch(Event::TeardownComplete).await;
    }

    /// Check, store `ready` and dispatch `Connect` under one lock hold
    ///
    /// Of two racing connects only one moves to connecting; the other gets
    /// `InvalidState` and leaves the first one's `ready` sender alone.
    async fn claim_connect(&self, ready: ReadySender) -> Result<(), TransportError> {
        let _order = self.dispatch_lock.lock().await;
        {
            let mut engine = self.lock();
            if !engine.state.can_connect() {
                return Err(TransportError::InvalidState(format!(
                    "cannot connect while {}",
                    engine.state
                )));
            }
            engine.ready = Some(ready);
        }
        self.dispatch_locked(Event::Connect).await;
        Ok(())
    }

    /// Run one event through the reducer and apply its effects in order
    async fn dispatch(&self, event: Event) {
        let _order = self.dispatch_lock.lock().await;
        self.dispatch_locked(event).await;
    }

    /// Caller holds `dispatch_lock`
    async fn dispatch_locked(&self, event: Event) {
        let fatal = match &event {
            Event::Fatal(e) => Some(e.clone()),
            _ => None,
        };

        let (prev, effects) = {
            let mut engine = self.lock();
            let prev = engine.state;
            let (next, effects) = reduce(&prev, event);
            engine.state = next;

            if next != prev {
                let outcome = match next {
                    TransportState::Ready => Some(Ok(())),
                    TransportState::Error => {
                        Some(Err(fatal.unwrap_or(TransportError::Cancelled)))
                    }
                    TransportState::Disconnecting | TransportState::Disconnected => {
                        Some(Err(TransportError::Cancelled))
                    }
                    _ => None,
                };
                if let Some(outcome) = outcome {
                    if let Some(tx) = engine.ready.take() {
                        let _ = tx.send(outcome);
                    }
                }
            }
            (prev, effects)
        };

        for effect in effects {
            self.apply(prev, effect).await;
        }
    }

    async fn apply(&self, prev: TransportState, effect: Effect) {
        match effect {
            Effect::NotifyState(next) => {
                log::info!("Transport state: {:?} -> {:?}", prev, next);
                if let Some(hook) = &self.diagnostics {
                    hook.state_changed(prev, next);
                }
                self.bus.publish(&TransportEvent::StateChanged(next));
            }
            Effect::NotifyError(err) => {
                if err.is_cancellation() {
                    log::debug!("{}", err);
                } else if err.is_terminal() {
                    log::error!("Transport error: {}", err);
                } else {
                    log::warn!("Transport error: {}", err);
                }
                if let Some(hook) = &self.diagnostics {
                    hook.error(&err);
                }
                self.bus.publish(&TransportEvent::Error(err));
            }
            Effect::NotifyConnected => self.bus.publish(&TransportEvent::Connected),
            Effect::NotifyReconnecting { attempt, delay } => {
                log::warn!("Reconnecting (attempt {}) in {:?}", attempt, delay);
                self.bus
                    .publish(&TransportEvent::Reconnecting { attempt, delay });
            }
            Effect::NotifyReconnected => self.bus.publish(&TransportEvent::Reconnected),
            Effect::NotifyReady => self.bus.publish(&TransportEvent::Ready),
            Effect::NotifyDisconnected => self.bus.publish(&TransportEvent::Disconnected),
            Effect::SendClientReady => {
                let message = ControlMessage::client_ready();
                match self.backend.send_backend(&message) {
                    Ok(()) => {
                        log::debug!("Sent client-ready");
                        if let Some(hook) = &self.diagnostics {
                            hook.message_sent(&message);
                        }
                    }
                    Err(e) => log::warn!("Failed to send client-ready: {}", e),
                }
            }
            Effect::Teardown => {
                self.backend.teardown_backend().await;
                let stopped: Vec<TrackInfo> = {
                    let mut engine = self.lock();
                    [engine.tracks.bot_audio.take(), engine.tracks.bot_video.take()]
                        .into_iter()
                        .flatten()
                        .collect()
                };
                for track in stopped {
                    self.bus.publish(&TransportEvent::TrackStopped(track));
                }
            }
        }
    }

    async fn on_backend_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::Connected { reconnected } => {
                self.dispatch(Event::BackendConnected { reconnected }).await
            }
            BackendEvent::Reconnecting { attempt, delay } => {
                self.dispatch(Event::ConnectionLost { attempt, delay }).await
            }
            BackendEvent::Retrying { attempt } => {
                log::debug!("Reconnect attempt {} dialing", attempt);
                self.dispatch(Event::Retrying { attempt }).await
            }
            BackendEvent::Message(message) => {
                if let Some(hook) = &self.diagnostics {
                    hook.message_received(&message);
                }
                if message.is_type(message_types::BOT_READY) {
                    log::info!("Remote confirmed setup (bot-ready)");
                    self.dispatch(Event::BotReady).await;
                } else if message.is_type(message_types::ERROR) {
                    log::warn!("Remote reported an error: {}", message.data);
                }
                self.bus.publish(&TransportEvent::Message(message));
            }
            BackendEvent::TrackStarted(track) => {
                log::debug!("Track started: {} ({:?})", track.id, track.kind);
                self.lock().tracks.insert(track.clone());
                self.bus.publish(&TransportEvent::TrackStarted(track));
            }
            BackendEvent::TrackStopped(track) => {
                let removed = self.lock().tracks.remove(&track.id);
                if removed.is_some() || track.participant == Participant::Bot {
                    self.bus.publish(&TransportEvent::TrackStopped(track));
                }
            }
            BackendEvent::Failed(err) => self.dispatch(Event::Fatal(err)).await,
            BackendEvent::Error(err) => self.dispatch(Event::Warning(err)).await,
            BackendEvent::RemoteLeft => {
                log::info!("Remote left, disconnecting");
                self.disconnect().await;
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let engine = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = engine.pump.take() {
            task.abort();
        }
    }
}

async fn pump(weak: Weak<Shared>, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        shared.on_backend_event(event).await;
    }
}
