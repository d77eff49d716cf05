//! Peer connection negotiation and failure recovery
//!
//! # Session layout
//!
//! Every peer connection gets exactly two transceivers (audio first, then
//! video) and one control data channel, created together in
//! [`Inner::build_session`]. Renegotiation reuses them; only the outgoing
//! tracks are ever swapped.
//!
//! # Recovery
//!
//! - Soft: a new offer/answer on the live peer connection (signaled
//!   `renegotiate`). If it fails, hard recovery runs after a short delay.
//! - Hard: a fresh peer connection is built and negotiated with an ICE restart
//!   while the old one keeps running; the old one is closed only after the new
//!   data channel opens. Used for ICE `failed` and for `disconnected` that
//!   outlasts the grace period.
//!
//! Both tiers share one in-progress flag and one attempt counter. The counter
//! resets when ICE reports `connected`; exceeding it tears the session down and
//! reports [`NegotiationError::RecoveryExhausted`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::peer::{
    DataChannel, IceConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, SdpType,
    SessionDescription, Transceiver, TransceiverDirection,
};
use super::sdp::filter_codec;
use super::signaling::SignalingClient;
use crate::config::WebRtcConfig;
use crate::error::NegotiationError;
use crate::media::{MediaKind, TrackInfo};
use crate::protocol::{classify, Inbound, OfferRequest, SignallingAction};

#[derive(Debug, Clone)]
pub struct NegotiatorOptions {
    pub ice_servers: Vec<String>,
    pub audio_codec: Option<String>,
    pub video_codec: Option<String>,
    pub max_recovery_attempts: u32,
    pub disconnect_grace: Duration,
    pub soft_failure_retry: Duration,
    pub recovery_timeout: Duration,
    pub data_channel_label: String,
}

impl From<&WebRtcConfig> for NegotiatorOptions {
    fn from(config: &WebRtcConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            audio_codec: config.audio_codec.clone(),
            video_codec: config.video_codec.clone(),
            max_recovery_attempts: config.max_recovery_attempts,
            disconnect_grace: config.disconnect_grace(),
            soft_failure_retry: config.soft_failure_retry(),
            recovery_timeout: config.recovery_timeout(),
            data_channel_label: config.data_channel_label.clone(),
        }
    }
}

/// Notifications from the negotiator
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    /// Data channel text that is not signaling
    Message(String),
    TrackStarted(TrackInfo),
    TrackStopped(TrackInfo),
    /// A recovery attempt started
    Recovering { hard: bool, attempt: u32 },
    /// A recovery attempt completed
    Recovered { hard: bool },
    /// The remote side hung up
    PeerLeft,
    /// Terminal; the session has been torn down
    Failed(NegotiationError),
}

/// One peer connection with its transceivers and data channel
struct Session {
    generation: u64,
    pc: Arc<dyn PeerConnection>,
    audio: Arc<dyn Transceiver>,
    video: Arc<dyn Transceiver>,
    data: Arc<dyn DataChannel>,
    event_task: Option<JoinHandle<()>>,
    ice_state: IceConnectionState,
}

impl Session {
    fn teardown(mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.data.close();
        self.pc.close();
        log::debug!("Peer connection {} closed", self.generation);
    }
}

/// Waiter for a session's data channel to open
struct OpenResolver {
    generation: u64,
    tx: oneshot::Sender<Result<(), NegotiationError>>,
}

#[derive(Default)]
struct NegotiatorState {
    next_generation: u64,
    live: Option<Session>,
    /// Replacement being brought up by hard recovery
    pending: Option<Session>,
    resolver: Option<OpenResolver>,
    connection_id: Option<String>,
    recovering: bool,
    recovery_attempts: u32,
    grace_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    local_audio: Option<String>,
    local_video: Option<String>,
    closed: bool,
}

impl NegotiatorState {
    fn is_live(&self, generation: u64) -> bool {
        self.live.as_ref().map(|s| s.generation) == Some(generation)
    }

    fn is_pending(&self, generation: u64) -> bool {
        self.pending.as_ref().map(|s| s.generation) == Some(generation)
    }

    fn cancel_timers(&mut self) {
        if let Some(task) = self.grace_task.take() {
            task.abort();
        }
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
    }

    /// True while `generation` still has a caller waiting for its data channel
    fn awaiting_open(&self, generation: u64) -> bool {
        self.resolver.as_ref().map(|r| r.generation) == Some(generation)
    }

    fn resolve(&mut self, generation: u64, result: Result<(), NegotiationError>) {
        if self.awaiting_open(generation) {
            if let Some(resolver) = self.resolver.take() {
                let _ = resolver.tx.send(result);
            }
        }
    }
}

struct Inner {
    factory: Arc<dyn PeerConnectionFactory>,
    signaling: Arc<dyn SignalingClient>,
    options: NegotiatorOptions,
    events: mpsc::UnboundedSender<NegotiatorEvent>,
    state: Mutex<NegotiatorState>,
}

/// Establishes and recovers one media session
#[derive(Clone)]
pub struct Negotiator {
    inner: Arc<Inner>,
}

pub type NegotiatorEvents = mpsc::UnboundedReceiver<NegotiatorEvent>;

impl Negotiator {
    pub fn new(
        options: NegotiatorOptions,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SignalingClient>,
    ) -> (Self, NegotiatorEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            factory,
            signaling,
            options,
            events,
            state: Mutex::new(NegotiatorState::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Build the session, negotiate it and wait for the data channel
    pub async fn connect(&self) -> Result<(), NegotiationError> {
        let inner = &self.inner;
        let (generation, pc, opened) = {
            let mut state = inner.lock();
            if state.live.is_some() || state.pending.is_some() {
                return Err(NegotiationError::PeerConnection(
                    "session already established".to_string(),
                ));
            }
            state.closed = false;
            state.recovery_attempts = 0;
            state.connection_id = None;
            let (session, opened) = inner.build_session(&mut state)?;
            let generation = session.generation;
            let pc = session.pc.clone();
            state.live = Some(session);
            (generation, pc, opened)
        };

        let result = match inner.negotiate(pc, false).await {
            Ok(()) => opened.await.unwrap_or(Err(NegotiationError::Closed)),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            log::error!("Peer connection setup failed: {}", e);
            let mut state = inner.lock();
            if state.is_live(generation) {
                if let Some(session) = state.live.take() {
                    session.teardown();
                }
            }
            if state.awaiting_open(generation) {
                state.resolver = None;
            }
        } else {
            log::info!("Peer connection {} established", generation);
        }
        result
    }

    /// Soft recovery on demand (same path as a signaled `renegotiate`)
    pub async fn renegotiate(&self) -> Result<(), NegotiationError> {
        self.inner.clone().soft_renegotiate().await
    }

    /// Send text on the live data channel
    pub fn send(&self, text: &str) -> Result<(), NegotiationError> {
        let data = {
            let state = self.inner.lock();
            state.live.as_ref().map(|s| s.data.clone())
        };
        match data {
            Some(data) if data.is_open() => data.send(text),
            _ => Err(NegotiationError::Closed),
        }
    }

    /// Swap the outgoing track of one transceiver; never recreates it
    pub fn replace_track(&self, kind: MediaKind, track_id: Option<&str>) -> Result<(), NegotiationError> {
        let transceiver = {
            let mut state = self.inner.lock();
            match kind {
                MediaKind::Audio => state.local_audio = track_id.map(str::to_string),
                MediaKind::Video => state.local_video = track_id.map(str::to_string),
            }
            state.live.as_ref().map(|s| match kind {
                MediaKind::Audio => s.audio.clone(),
                MediaKind::Video => s.video.clone(),
            })
        };
        match transceiver {
            Some(t) => t.replace_track(track_id),
            None => Ok(()),
        }
    }

    /// Tear everything down; pending waits fail with `Closed`
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.recovering = false;
        state.cancel_timers();
        if let Some(resolver) = state.resolver.take() {
            let _ = resolver.tx.send(Err(NegotiationError::Closed));
        }
        if let Some(session) = state.pending.take() {
            session.teardown();
        }
        if let Some(session) = state.live.take() {
            session.teardown();
            log::info!("Peer session closed");
        }
    }

    pub fn connection_id(&self) -> Option<String> {
        self.inner.lock().connection_id.clone()
    }

    /// Transceivers on the live peer connection
    pub fn transceiver_count(&self) -> usize {
        self.inner
            .lock()
            .live
            .as_ref()
            .map(|s| s.pc.transceivers().len())
            .unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .lock()
            .live
            .as_ref()
            .is_some_and(|s| s.data.is_open())
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.lock().recovering
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.inner.lock().recovery_attempts
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, NegotiatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: NegotiatorEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Negotiator event receiver dropped");
        }
    }

    /// New peer connection, transceivers (audio then video) and data channel
    fn build_session(
        self: &Arc<Self>,
        state: &mut NegotiatorState,
    ) -> Result<(Session, oneshot::Receiver<Result<(), NegotiationError>>), NegotiationError> {
        let (pc, peer_events) = self.factory.create(&self.options.ice_servers)?;

        let built = (|| {
            let audio = pc.add_transceiver(MediaKind::Audio, TransceiverDirection::SendRecv)?;
            let video = pc.add_transceiver(MediaKind::Video, TransceiverDirection::SendRecv)?;
            audio.replace_track(state.local_audio.as_deref())?;
            video.replace_track(state.local_video.as_deref())?;
            let data = pc.create_data_channel(&self.options.data_channel_label)?;
            Ok::<_, NegotiationError>((audio, video, data))
        })();
        let (audio, video, data) = match built {
            Ok(parts) => parts,
            Err(e) => {
                pc.close();
                return Err(e);
            }
        };

        let generation = state.next_generation;
        state.next_generation += 1;

        let (tx, opened) = oneshot::channel();
        state.resolver = Some(OpenResolver { generation, tx });

        let event_task = tokio::spawn(event_loop(Arc::downgrade(self), generation, peer_events));

        log::debug!("Peer connection {} created", generation);
        Ok((
            Session {
                generation,
                pc,
                audio,
                video,
                data,
                event_task: Some(event_task),
                ice_state: IceConnectionState::New,
            },
            opened,
        ))
    }

    /// Offer, optional codec rewrite, signaling round trip, answer
    async fn negotiate(&self, pc: Arc<dyn PeerConnection>, restart: bool) -> Result<(), NegotiationError> {
        let offer = pc.create_offer(restart).await?;

        let mut sdp = offer.sdp;
        if let Some(codec) = &self.options.audio_codec {
            sdp = filter_codec(&sdp, MediaKind::Audio, codec);
        }
        if let Some(codec) = &self.options.video_codec {
            sdp = filter_codec(&sdp, MediaKind::Video, codec);
        }

        pc.set_local_description(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: sdp.clone(),
        })
        .await?;

        let connection_id = self.lock().connection_id.clone();
        let answer = self
            .signaling
            .exchange(OfferRequest {
                sdp,
                sdp_type: SdpType::Offer.as_str().to_string(),
                connection_id,
                restart,
            })
            .await?;

        let sdp_type = SdpType::parse(&answer.sdp_type).ok_or_else(|| {
            NegotiationError::InvalidSdp(format!("unexpected answer type {}", answer.sdp_type))
        })?;

        {
            let mut state = self.lock();
            if state.connection_id.is_none() {
                if let Some(id) = answer.connection_id.clone() {
                    log::debug!("Signaling assigned connection id {}", id);
                    state.connection_id = Some(id);
                }
            }
        }

        pc.set_remote_description(SessionDescription {
            sdp_type,
            sdp: answer.sdp,
        })
        .await
    }

    /// Claim the recovery slot; `Ok(attempt)` or why not
    fn begin_recovery(&self, hard: bool) -> Result<u32, NegotiationError> {
        let claimed = {
            let mut state = self.lock();
            if state.closed {
                return Err(NegotiationError::Closed);
            }
            if state.recovering {
                log::debug!("Recovery already in progress, dropping request");
                return Err(NegotiationError::RecoveryInProgress);
            }
            if state.recovery_attempts >= self.options.max_recovery_attempts {
                Err(state.recovery_attempts)
            } else {
                state.recovering = true;
                state.recovery_attempts += 1;
                Ok(state.recovery_attempts)
            }
        };

        match claimed {
            Ok(attempt) => {
                log::warn!(
                    "Starting {} recovery (attempt {}/{})",
                    if hard { "hard" } else { "soft" },
                    attempt,
                    self.options.max_recovery_attempts
                );
                self.emit(NegotiatorEvent::Recovering { hard, attempt });
                Ok(attempt)
            }
            Err(attempts) => {
                log::error!("Recovery attempts exhausted after {}", attempts);
                self.fail(NegotiationError::RecoveryExhausted { attempts });
                Err(NegotiationError::RecoveryExhausted { attempts })
            }
        }
    }

    /// Terminal failure: tear down and report
    fn fail(&self, error: NegotiationError) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.recovering = false;
            state.cancel_timers();
            if let Some(resolver) = state.resolver.take() {
                let _ = resolver.tx.send(Err(error.clone()));
            }
            if let Some(session) = state.pending.take() {
                session.teardown();
            }
            if let Some(session) = state.live.take() {
                session.teardown();
            }
        }
        self.emit(NegotiatorEvent::Failed(error));
    }

    async fn soft_renegotiate(self: Arc<Self>) -> Result<(), NegotiationError> {
        self.begin_recovery(false)?;

        let pc = self.lock().live.as_ref().map(|s| s.pc.clone());
        let result = match pc {
            Some(pc) => self.negotiate(pc, false).await,
            None => Err(NegotiationError::Closed),
        };

        let closed = {
            let mut state = self.lock();
            state.recovering = false;
            state.closed
        };

        match result {
            Ok(()) => {
                log::info!("Soft renegotiation complete");
                self.emit(NegotiatorEvent::Recovered { hard: false });
                Ok(())
            }
            Err(e) if closed => Err(e),
            Err(e) => {
                log::warn!(
                    "Soft renegotiation failed ({}), hard recovery in {:?}",
                    e,
                    self.options.soft_failure_retry
                );
                self.schedule_hard_recovery(self.options.soft_failure_retry);
                Err(e)
            }
        }
    }

    async fn hard_recover(self: Arc<Self>) -> Result<(), NegotiationError> {
        self.begin_recovery(true)?;

        let built = {
            let mut state = self.lock();
            if let Some(task) = state.grace_task.take() {
                task.abort();
            }
            self.build_session(&mut state).map(|(session, opened)| {
                let generation = session.generation;
                let pc = session.pc.clone();
                state.pending = Some(session);
                (generation, pc, opened)
            })
        };

        let result = match built {
            Ok((generation, pc, opened)) => {
                let live = async {
                    self.negotiate(pc, true).await?;
                    opened.await.unwrap_or(Err(NegotiationError::Closed))
                };
                match tokio::time::timeout(self.options.recovery_timeout, live).await {
                    Ok(result) => result.map(|()| generation),
                    Err(_) => Err(NegotiationError::PeerConnection(
                        "replacement connection did not come up".to_string(),
                    )),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(generation) => {
                let swapped = {
                    let mut state = self.lock();
                    state.recovering = false;
                    if state.closed || !state.is_pending(generation) {
                        false
                    } else {
                        let fresh = state.pending.take();
                        let old = std::mem::replace(&mut state.live, fresh);
                        if let Some(old) = old {
                            old.teardown();
                        }
                        true
                    }
                };
                if swapped {
                    log::info!("Hard recovery complete, now on peer connection {}", generation);
                    self.emit(NegotiatorEvent::Recovered { hard: true });
                    Ok(())
                } else {
                    Err(NegotiationError::Closed)
                }
            }
            Err(e) => {
                let closed = {
                    let mut state = self.lock();
                    state.recovering = false;
                    if let Some(session) = state.pending.take() {
                        if state.awaiting_open(session.generation) {
                            state.resolver = None;
                        }
                        session.teardown();
                    }
                    state.closed
                };
                if !closed {
                    log::warn!("Hard recovery failed: {}", e);
                    self.schedule_hard_recovery(self.options.soft_failure_retry);
                }
                Err(e)
            }
        }
    }

    fn schedule_hard_recovery(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.lock().retry_task = None;
            if let Err(e) = inner.hard_recover().await {
                log::debug!("Scheduled hard recovery ended: {}", e);
            }
        });

        let mut state = self.lock();
        if let Some(old) = state.retry_task.replace(task) {
            old.abort();
        }
    }

    fn spawn_soft_renegotiation(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.soft_renegotiate().await {
                log::debug!("Signaled renegotiation ended: {}", e);
            }
        });
    }

    fn spawn_hard_recovery(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.hard_recover().await {
                log::debug!("Hard recovery ended: {}", e);
            }
        });
    }

    fn on_ice_state(self: &Arc<Self>, generation: u64, ice: IceConnectionState) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        log::debug!("Peer connection {} ICE state: {:?}", generation, ice);

        // A replacement only records its state until it is swapped in
        if state.is_pending(generation) {
            if let Some(session) = state.pending.as_mut() {
                session.ice_state = ice;
            }
            if matches!(ice, IceConnectionState::Connected | IceConnectionState::Completed) {
                state.recovery_attempts = 0;
            }
            return;
        }
        if !state.is_live(generation) {
            return;
        }
        if let Some(session) = state.live.as_mut() {
            session.ice_state = ice;
        }

        match ice {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if let Some(task) = state.grace_task.take() {
                    log::info!("ICE recovered within grace period");
                    task.abort();
                }
                state.recovery_attempts = 0;
            }
            IceConnectionState::Disconnected => {
                if state.grace_task.is_some() {
                    return;
                }
                let grace = self.options.disconnect_grace;
                log::warn!("ICE disconnected, waiting {:?} before hard recovery", grace);
                let weak = Arc::downgrade(self);
                state.grace_task = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let still_down = {
                        let mut state = inner.lock();
                        state.grace_task = None;
                        let down = state.is_live(generation)
                            && state.live.as_ref().is_some_and(|s| {
                                s.ice_state == IceConnectionState::Disconnected
                            });
                        if down && state.awaiting_open(generation) {
                            state.resolve(
                                generation,
                                Err(NegotiationError::PeerConnection(
                                    "ICE disconnected before the data channel opened".to_string(),
                                )),
                            );
                            return;
                        }
                        down
                    };
                    if still_down {
                        inner.spawn_hard_recovery();
                    }
                }));
            }
            IceConnectionState::Failed => {
                if let Some(task) = state.grace_task.take() {
                    task.abort();
                }
                // Initial setup has nothing to recover yet; fail the waiting connect()
                if state.awaiting_open(generation) {
                    log::error!("ICE failed before peer connection {} opened", generation);
                    state.resolve(
                        generation,
                        Err(NegotiationError::PeerConnection(
                            "ICE failed before the data channel opened".to_string(),
                        )),
                    );
                    return;
                }
                drop(state);
                log::error!("ICE failed on peer connection {}", generation);
                self.spawn_hard_recovery();
            }
            IceConnectionState::New | IceConnectionState::Checking | IceConnectionState::Closed => {}
        }
    }

    fn on_peer_event(self: &Arc<Self>, generation: u64, event: PeerEvent) {
        let (live, pending) = {
            let state = self.lock();
            (state.is_live(generation), state.is_pending(generation))
        };
        if !live && !pending {
            log::debug!("Dropping event from stale peer connection {}", generation);
            return;
        }

        match event {
            PeerEvent::IceConnectionState(ice) => self.on_ice_state(generation, ice),
            PeerEvent::DataChannelOpen => {
                log::debug!("Data channel open on peer connection {}", generation);
                self.lock().resolve(generation, Ok(()));
            }
            PeerEvent::DataChannelClosed => {
                log::debug!("Data channel closed on peer connection {}", generation);
            }
            PeerEvent::Track(track) => self.emit(NegotiatorEvent::TrackStarted(track)),
            PeerEvent::TrackEnded(track) => self.emit(NegotiatorEvent::TrackStopped(track)),
            PeerEvent::DataChannelMessage(text) => {
                if !live {
                    return;
                }
                match classify(&text) {
                    Ok(Inbound::Signalling(SignallingAction::Renegotiate)) => {
                        log::info!("Remote requested renegotiation");
                        self.spawn_soft_renegotiation();
                    }
                    Ok(Inbound::Signalling(SignallingAction::PeerLeft)) => {
                        log::info!("Remote peer left");
                        self.emit(NegotiatorEvent::PeerLeft);
                    }
                    Ok(Inbound::Signalling(SignallingAction::Unknown(name))) => {
                        log::warn!("Ignoring unknown signalling message: {}", name);
                    }
                    _ => self.emit(NegotiatorEvent::Message(text)),
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_timers();
        if let Some(session) = state.pending.take() {
            session.teardown();
        }
        if let Some(session) = state.live.take() {
            session.teardown();
        }
    }
}

async fn event_loop(weak: Weak<Inner>, generation: u64, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.on_peer_event(generation, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::negotiation::mock::{MockPeerFactory, MockSignaling};

    fn options() -> NegotiatorOptions {
        NegotiatorOptions::from(&WebRtcConfig {
            ice_servers: Vec::new(),
            ..WebRtcConfig::default()
        })
    }

    fn negotiator(
        options: NegotiatorOptions,
    ) -> (Negotiator, NegotiatorEvents, MockPeerFactory, MockSignaling) {
        let factory = MockPeerFactory::new();
        let signaling = MockSignaling::new("conn-1");
        let (negotiator, events) =
            Negotiator::new(options, Arc::new(factory.clone()), Arc::new(signaling.clone()));
        (negotiator, events, factory, signaling)
    }

    async fn next_matching(
        events: &mut NegotiatorEvents,
        pred: impl Fn(&NegotiatorEvent) -> bool,
    ) -> NegotiatorEvent {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_creates_two_transceivers_and_data_channel() {
        let (negotiator, _events, factory, signaling) = negotiator(options());

        negotiator.connect().await.unwrap();

        let peer = factory.latest().unwrap();
        assert_eq!(peer.transceiver_kinds(), vec![MediaKind::Audio, MediaKind::Video]);
        assert_eq!(negotiator.transceiver_count(), 2);
        assert!(negotiator.is_connected());
        assert_eq!(negotiator.connection_id().as_deref(), Some("conn-1"));

        let offers = signaling.offers();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].connection_id, None);
        assert!(!offers[0].restart);
    }

    #[tokio::test]
    async fn test_preferred_codec_applied_to_local_offer() {
        let mut opts = options();
        opts.audio_codec = Some("OPUS".to_string());
        let (negotiator, _events, factory, signaling) = negotiator(opts);

        negotiator.connect().await.unwrap();

        let local = factory.latest().unwrap().local_sdp().unwrap();
        assert!(local.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 63\r\n"));
        assert!(!local.contains("G722"));
        assert_eq!(signaling.offers()[0].sdp, local);
    }

    #[tokio::test]
    async fn test_signaling_failure_fails_connect() {
        let (negotiator, _events, factory, signaling) = negotiator(options());
        signaling.fail_next(1);

        assert!(matches!(negotiator.connect().await, Err(NegotiationError::Signaling(_))));
        assert!(factory.latest().unwrap().is_closed());
        assert_eq!(negotiator.transceiver_count(), 0);
    }

    #[tokio::test]
    async fn test_signaled_renegotiate_reuses_transceivers_and_echoes_connection_id() {
        let (negotiator, mut events, factory, signaling) = negotiator(options());
        negotiator.connect().await.unwrap();
        negotiator.replace_track(MediaKind::Audio, Some("mic-1")).unwrap();

        let peer = factory.latest().unwrap();
        peer.emit(PeerEvent::DataChannelMessage(
            r#"{"type":"signalling","message":"renegotiate"}"#.to_string(),
        ));

        assert_eq!(
            next_matching(&mut events, |e| matches!(e, NegotiatorEvent::Recovered { .. })).await,
            NegotiatorEvent::Recovered { hard: false }
        );
        assert_eq!(factory.created(), 1);
        assert_eq!(peer.transceiver_count(), 2);
        assert_eq!(peer.offers_created(), 2);
        assert_eq!(peer.track_ids()[0].as_deref(), Some("mic-1"));

        let offers = signaling.offers();
        assert_eq!(offers[1].connection_id.as_deref(), Some("conn-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_soft_renegotiation_falls_back_to_hard() {
        let (negotiator, mut events, factory, signaling) = negotiator(options());
        negotiator.connect().await.unwrap();
        negotiator.replace_track(MediaKind::Audio, Some("mic-1")).unwrap();
        let first = factory.latest().unwrap();

        signaling.fail_next(1);
        assert!(negotiator.renegotiate().await.is_err());

        assert_eq!(
            next_matching(&mut events, |e| matches!(e, NegotiatorEvent::Recovered { .. })).await,
            NegotiatorEvent::Recovered { hard: true }
        );

        let second = factory.latest().unwrap();
        assert_eq!(second.index(), 1);
        assert!(first.is_closed());
        assert_eq!(second.transceiver_count(), 2);
        assert_eq!(second.ice_restarts(), 1);
        assert_eq!(second.track_ids()[0].as_deref(), Some("mic-1"));
        assert_eq!(negotiator.transceiver_count(), 2);
        assert!(signaling.offers().last().unwrap().restart);
    }

    #[tokio::test]
    async fn test_ice_failure_replaces_connection_after_new_one_is_live() {
        let (negotiator, mut events, factory, _signaling) = negotiator(options());
        negotiator.connect().await.unwrap();
        let first = factory.latest().unwrap();

        first.emit(PeerEvent::IceConnectionState(IceConnectionState::Failed));

        assert_eq!(
            next_matching(&mut events, |e| matches!(e, NegotiatorEvent::Recovering { .. })).await,
            NegotiatorEvent::Recovering { hard: true, attempt: 1 }
        );
        next_matching(&mut events, |e| matches!(e, NegotiatorEvent::Recovered { hard: true })).await;

        assert!(first.is_closed());
        assert!(!factory.latest().unwrap().is_closed());
        assert!(negotiator.is_connected());
        // ICE connected on the new peer resets the counter
        assert_eq!(negotiator.recovery_attempts(), 0);

        // Events from the retired connection are ignored
        first.emit(PeerEvent::IceConnectionState(IceConnectionState::Failed));
        tokio::task::yield_now().await;
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_heals_within_grace_period() {
        let (negotiator, _events, factory, _signaling) = negotiator(options());
        negotiator.connect().await.unwrap();
        let peer = factory.latest().unwrap();

        peer.emit(PeerEvent::IceConnectionState(IceConnectionState::Disconnected));
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        peer.emit(PeerEvent::IceConnectionState(IceConnectionState::Connected));
        tokio::time::sleep(Duration::from_millis(10_000)).await;

        assert_eq!(factory.created(), 1);
        assert!(!negotiator.is_recovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prolonged_disconnect_triggers_hard_recovery() {
        let (negotiator, mut events, factory, _signaling) = negotiator(options());
        negotiator.connect().await.unwrap();

        factory
            .latest()
            .unwrap()
            .emit(PeerEvent::IceConnectionState(IceConnectionState::Disconnected));

        next_matching(&mut events, |e| matches!(e, NegotiatorEvent::Recovered { hard: true })).await;
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_cap_is_terminal() {
        let mut opts = options();
        opts.max_recovery_attempts = 2;
        let (negotiator, mut events, factory, signaling) = negotiator(opts);
        negotiator.connect().await.unwrap();
        let first = factory.latest().unwrap();

        // Every replacement fails to negotiate
        signaling.fail_next(usize::MAX);
        first.emit(PeerEvent::IceConnectionState(IceConnectionState::Failed));

        let failed =
            next_matching(&mut events, |e| matches!(e, NegotiatorEvent::Failed(_))).await;
        assert_eq!(
            failed,
            NegotiatorEvent::Failed(NegotiationError::RecoveryExhausted { attempts: 2 })
        );
        assert!(first.is_closed());
        assert_eq!(negotiator.transceiver_count(), 0);
        assert_eq!(negotiator.send("hi"), Err(NegotiationError::Closed));

        // Nothing further is attempted
        let created = factory.created();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(factory.created(), created);
    }

    #[tokio::test]
    async fn test_second_recovery_while_in_progress_is_dropped() {
        let (negotiator, _events, factory, _signaling) = negotiator(options());
        negotiator.connect().await.unwrap();
        factory.manual_connect(true);

        let first = factory.latest().unwrap();
        first.emit(PeerEvent::IceConnectionState(IceConnectionState::Failed));
        while !negotiator.is_recovering() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            negotiator.renegotiate().await,
            Err(NegotiationError::RecoveryInProgress)
        );
        assert_eq!(negotiator.recovery_attempts(), 1);
        negotiator.close();
    }

    #[tokio::test]
    async fn test_data_channel_routing() {
        let (negotiator, mut events, factory, _signaling) = negotiator(options());
        negotiator.connect().await.unwrap();
        let peer = factory.latest().unwrap();

        negotiator.send(r#"{"label":"rtvi-ai","type":"client-ready","id":"1","data":{}}"#).unwrap();
        assert_eq!(peer.sent_messages().len(), 1);

        peer.emit(PeerEvent::DataChannelMessage(
            r#"{"type":"signalling","message":"somethingElse"}"#.to_string(),
        ));
        peer.emit(PeerEvent::DataChannelMessage(
            r#"{"type":"signalling","message":{"type":"peerLeft"}}"#.to_string(),
        ));
        peer.emit(PeerEvent::DataChannelMessage(
            r#"{"label":"rtvi-ai","type":"bot-ready","id":"2","data":{}}"#.to_string(),
        ));

        assert_eq!(events.recv().await, Some(NegotiatorEvent::PeerLeft));
        assert!(matches!(events.recv().await, Some(NegotiatorEvent::Message(text)) if text.contains("bot-ready")));
    }

    #[tokio::test]
    async fn test_ice_failure_during_setup_fails_connect() {
        let (negotiator, _events, factory, _signaling) = negotiator(options());
        factory.manual_connect(true);

        let connecting = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        while factory.latest().and_then(|p| p.remote_sdp()).is_none() {
            tokio::task::yield_now().await;
        }
        factory
            .latest()
            .unwrap()
            .emit(PeerEvent::IceConnectionState(IceConnectionState::Failed));

        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, NegotiationError::PeerConnection(_)));
        assert!(!TransportError::from(err).is_cancellation());
        // No replacement is built for a session that never came up
        assert_eq!(factory.created(), 1);
        assert!(factory.latest().unwrap().is_closed());
        assert!(!negotiator.is_recovering());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prolonged_disconnect_during_setup_fails_connect() {
        let (negotiator, _events, factory, _signaling) = negotiator(options());
        factory.manual_connect(true);

        let connecting = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        while factory.latest().and_then(|p| p.remote_sdp()).is_none() {
            tokio::task::yield_now().await;
        }
        factory
            .latest()
            .unwrap()
            .emit(PeerEvent::IceConnectionState(IceConnectionState::Disconnected));

        assert!(matches!(
            connecting.await.unwrap(),
            Err(NegotiationError::PeerConnection(_))
        ));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_close_fails_pending_connect() {
        let (negotiator, _events, factory, _signaling) = negotiator(options());
        factory.manual_connect(true);

        let connecting = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.connect().await })
        };
        while factory.latest().and_then(|p| p.remote_sdp()).is_none() {
            tokio::task::yield_now().await;
        }
        negotiator.close();

        assert_eq!(connecting.await.unwrap(), Err(NegotiationError::Closed));
        assert!(factory.latest().unwrap().is_closed());
    }
}
