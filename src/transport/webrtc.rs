//! Peer-connection backend
//!
//! Media flows over the peer connection's two transceivers; control envelopes
//! travel on its data channel. Recovery (soft renegotiation, hard replacement)
//! is owned by the [`Negotiator`]; only hard recovery is visible to the
//! application as a reconnect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;

use super::{BackendEvent, BackendSink, Transport, TransportBackend};
use crate::config::{MediaConfig, TransportConfig};
use crate::devices::{DeviceKind, DeviceManager, MediaDevices, DEFAULT_DEVICE_ID};
use crate::diagnostics::DiagnosticHook;
use crate::error::{NegotiationError, TransportError};
use crate::media::{MediaKind, Participant, TrackInfo};
use crate::negotiation::{
    HttpSignaling, Negotiator, NegotiatorEvent, NegotiatorEvents, NegotiatorOptions,
    PeerConnectionFactory, SignalingClient,
};
use crate::protocol::{classify, ControlMessage, Inbound};

pub struct WebRtcBackend {
    inner: Arc<RtcInner>,
}

struct RtcInner {
    negotiator: Negotiator,
    media: MediaConfig,
    sink: Mutex<Option<BackendSink>>,
    /// Handed to the pump on initialize
    negotiator_events: Mutex<Option<NegotiatorEvents>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    local_audio: Mutex<Option<TrackInfo>>,
    local_video: Mutex<Option<TrackInfo>>,
}

impl WebRtcBackend {
    pub fn new(
        config: &TransportConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingClient>,
    ) -> Self {
        let options = NegotiatorOptions::from(&config.webrtc);
        let (negotiator, events) = Negotiator::new(options, factory, signaling);
        let inner = RtcInner {
            negotiator,
            media: config.media.clone(),
            sink: Mutex::new(None),
            negotiator_events: Mutex::new(Some(events)),
            pump: Mutex::new(None),
            local_audio: Mutex::new(None),
            local_video: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.inner.negotiator
    }
}

impl Transport {
    /// Transport over a negotiated peer connection
    pub fn webrtc(
        config: &TransportConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingClient>,
        devices: Arc<dyn MediaDevices>,
        diagnostics: Option<Arc<dyn DiagnosticHook>>,
    ) -> Self {
        let backend = WebRtcBackend::new(config, factory, signaling);
        Transport::new(Arc::new(backend), devices, diagnostics)
    }

    /// Peer transport that posts its offers to `config.webrtc.offer_url`
    pub fn webrtc_from_config(
        config: &TransportConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        diagnostics: Option<Arc<dyn DiagnosticHook>>,
    ) -> Result<Self, TransportError> {
        let signaling = HttpSignaling::from_config(&config.webrtc)?;
        log::debug!("Offer endpoint: {}", signaling.endpoint());
        Ok(Self::webrtc(config, factory, Arc::new(signaling), devices, diagnostics))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransportBackend for WebRtcBackend {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    fn initialize_backend(&self, events: BackendSink) {
        *lock(&self.inner.sink) = Some(events.clone());
        if let Some(negotiator_events) = lock(&self.inner.negotiator_events).take() {
            let task = tokio::spawn(negotiator_pump(events, negotiator_events));
            *lock(&self.inner.pump) = Some(task);
        }
    }

    fn init_media(&self, devices: DeviceManager) -> BoxFuture<'static, Result<(), TransportError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let audio = inner.apply_track(MediaKind::Audio, &devices);
            let video = inner.apply_track(MediaKind::Video, &devices);
            audio.and(video)
        })
    }

    fn connect_backend(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.negotiator.connect().await?;
            inner.emit(BackendEvent::Connected { reconnected: false });
            Ok(())
        })
    }

    fn send_backend(&self, message: &ControlMessage) -> Result<(), TransportError> {
        let text =
            serde_json::to_string(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.inner.negotiator.send(&text).map_err(|e| match e {
            NegotiationError::Closed => TransportError::NotReady,
            other => other.into(),
        })
    }

    fn teardown_backend(&self) -> BoxFuture<'static, ()> {
        self.inner.negotiator.close();
        Box::pin(async {})
    }

    fn switch_device(
        &self,
        kind: DeviceKind,
        devices: DeviceManager,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let result = match kind {
            DeviceKind::AudioInput => self.inner.apply_track(MediaKind::Audio, &devices),
            DeviceKind::VideoInput => self.inner.apply_track(MediaKind::Video, &devices),
            // Remote media is rendered by the peer stack
            DeviceKind::AudioOutput => {
                log::info!("Speaker selection is applied by the peer connection host");
                Ok(())
            }
        };
        Box::pin(async move { result })
    }
}

impl RtcInner {
    fn emit(&self, event: BackendEvent) {
        if let Some(sink) = lock(&self.sink).as_ref() {
            if sink.send(event).is_err() {
                log::debug!("Transport engine gone, dropping backend event");
            }
        }
    }

    /// Point the transceiver of `kind` at the selected device
    fn apply_track(&self, kind: MediaKind, devices: &DeviceManager) -> Result<(), TransportError> {
        let (enabled, device_kind, slot) = match kind {
            MediaKind::Audio => (self.media.enable_mic, DeviceKind::AudioInput, &self.local_audio),
            MediaKind::Video => (self.media.enable_cam, DeviceKind::VideoInput, &self.local_video),
        };

        let track_id = enabled.then(|| {
            devices
                .selected(device_kind)
                .map(|d| d.device_id)
                .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string())
        });
        self.negotiator.replace_track(kind, track_id.as_deref())?;

        let started = track_id.map(|id| TrackInfo::new(id, kind, Participant::Local));
        let stopped = std::mem::replace(&mut *lock(slot), started.clone());
        if stopped == started {
            return Ok(());
        }
        if let Some(track) = stopped {
            self.emit(BackendEvent::TrackStopped(track));
        }
        if let Some(track) = started {
            log::info!("Local {} track: {}", kind.as_str(), track.id);
            self.emit(BackendEvent::TrackStarted(track));
        }
        Ok(())
    }
}

impl Drop for RtcInner {
    fn drop(&mut self) {
        self.negotiator.close();
        if let Some(task) = lock(&self.pump).take() {
            task.abort();
        }
    }
}

async fn negotiator_pump(sink: BackendSink, mut events: NegotiatorEvents) {
    while let Some(event) = events.recv().await {
        let mapped = match event {
            NegotiatorEvent::Message(text) => match classify(&text) {
                Ok(Inbound::Control(message)) => vec![BackendEvent::Message(message)],
                Ok(other) => {
                    log::debug!("Ignoring non-control data channel message: {:?}", other);
                    vec![]
                }
                Err(e) => vec![BackendEvent::Error(TransportError::Protocol(e.to_string()))],
            },
            NegotiatorEvent::TrackStarted(track) => vec![BackendEvent::TrackStarted(track)],
            NegotiatorEvent::TrackStopped(track) => vec![BackendEvent::TrackStopped(track)],
            // Hard recovery dials its replacement right away
            NegotiatorEvent::Recovering { hard: true, attempt } => vec![
                BackendEvent::Reconnecting {
                    attempt,
                    delay: Duration::ZERO,
                },
                BackendEvent::Retrying { attempt },
            ],
            NegotiatorEvent::Recovering { hard: false, attempt } => {
                log::info!("Renegotiating (attempt {})", attempt);
                vec![]
            }
            NegotiatorEvent::Recovered { hard: true } => {
                vec![BackendEvent::Connected { reconnected: true }]
            }
            NegotiatorEvent::Recovered { hard: false } => {
                log::info!("Renegotiation complete");
                vec![]
            }
            NegotiatorEvent::PeerLeft => vec![BackendEvent::RemoteLeft],
            NegotiatorEvent::Failed(e) => vec![BackendEvent::Failed(e.into())],
        };

        for event in mapped {
            if sink.send(event).is_err() {
                log::debug!("Transport engine gone, stopping negotiator pump");
                return;
            }
        }
    }
}
