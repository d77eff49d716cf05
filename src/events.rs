//! Publish/subscribe registry for lifecycle and device notifications
//!
//! Every notification is one [`TransportEvent`] variant with one payload
//! shape. Subscribers run synchronously, in subscription order, on the
//! thread that published; they must not block.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::devices::MediaDeviceInfo;
use crate::error::TransportError;
use crate::media::TrackInfo;
use crate::protocol::ControlMessage;
use crate::state_machine::TransportState;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Authoritative state changed
    StateChanged(TransportState),
    /// Backend channel is up (before the remote confirms setup)
    Connected,
    /// Remote confirmed setup
    Ready,
    Disconnected,
    /// A dropped connection is being retried
    Reconnecting { attempt: u32, delay: Duration },
    /// A reconnect attempt succeeded
    Reconnected,
    TrackStarted(TrackInfo),
    TrackStopped(TrackInfo),
    /// Application-level envelope from the remote side
    Message(ControlMessage),
    /// Device inventory changed
    DevicesChanged(Vec<MediaDeviceInfo>),
    /// A device was selected for a pipeline stage
    DeviceSelected(MediaDeviceInfo),
    Error(TransportError),
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
}

/// Typed event registry shared by a transport and its components
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Returns false if the id was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let before = registry.subscribers.len();
        registry.subscribers.retain(|(sid, _)| *sid != id);
        registry.subscribers.len() != before
    }

    /// Deliver an event to every subscriber
    ///
    /// The registry lock is released before callbacks run, so a callback may
    /// subscribe or unsubscribe without deadlocking.
    pub fn publish(&self, event: &TransportEvent) {
        let subscribers: Vec<Subscriber> = {
            let registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.subscribers.iter().map(|(_, s)| s.clone()).collect()
        };

        for subscriber in subscribers {
            subscriber(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

type Callback<T> = Option<Box<dyn Fn(T) + Send + Sync>>;
type Notify = Option<Box<dyn Fn() + Send + Sync>>;

/// Optional typed callbacks, installed on an [`EventBus`] as one subscriber
#[derive(Default)]
pub struct Callbacks {
    on_state_change: Callback<TransportState>,
    on_connected: Notify,
    on_ready: Notify,
    on_disconnected: Notify,
    on_track_started: Callback<TrackInfo>,
    on_track_stopped: Callback<TrackInfo>,
    on_message: Callback<ControlMessage>,
    on_error: Callback<TransportError>,
    on_device_change: Callback<Vec<MediaDeviceInfo>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_state_change(mut self, f: impl Fn(TransportState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Box::new(f));
        self
    }

    pub fn on_connected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Box::new(f));
        self
    }

    pub fn on_ready(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_ready = Some(Box::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Box::new(f));
        self
    }

    pub fn on_track_started(mut self, f: impl Fn(TrackInfo) + Send + Sync + 'static) -> Self {
        self.on_track_started = Some(Box::new(f));
        self
    }

    pub fn on_track_stopped(mut self, f: impl Fn(TrackInfo) + Send + Sync + 'static) -> Self {
        self.on_track_stopped = Some(Box::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(ControlMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(TransportError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_device_change(
        mut self,
        f: impl Fn(Vec<MediaDeviceInfo>) + Send + Sync + 'static,
    ) -> Self {
        self.on_device_change = Some(Box::new(f));
        self
    }

    fn dispatch(&self, event: &TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => call(&self.on_state_change, *state),
            TransportEvent::Connected => notify(&self.on_connected),
            TransportEvent::Ready => notify(&self.on_ready),
            TransportEvent::Disconnected => notify(&self.on_disconnected),
            TransportEvent::TrackStarted(track) => call(&self.on_track_started, track.clone()),
            TransportEvent::TrackStopped(track) => call(&self.on_track_stopped, track.clone()),
            TransportEvent::Message(msg) => call(&self.on_message, msg.clone()),
            TransportEvent::Error(err) => call(&self.on_error, err.clone()),
            TransportEvent::DevicesChanged(devices) => {
                call(&self.on_device_change, devices.clone())
            }
            TransportEvent::Reconnecting { .. }
            | TransportEvent::Reconnected
            | TransportEvent::DeviceSelected(_) => {}
        }
    }

    /// Register these callbacks on `bus`
    pub fn install(self, bus: &EventBus) -> SubscriptionId {
        bus.subscribe(move |event| self.dispatch(event))
    }
}

fn call<T>(callback: &Callback<T>, value: T) {
    if let Some(f) = callback {
        f(value);
    }
}

fn notify(callback: &Notify) {
    if let Some(f) = callback {
        f();
    }
}
