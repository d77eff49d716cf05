//! In-memory peer connections and signaling for tests and offline development
//!
//! A [`MockPeer`] goes "live" (ICE connected, data channel open) as soon as a
//! remote description is applied, unless auto-connect is switched off on the
//! factory. Tests drive everything else through [`MockPeer::emit`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::peer::{
    DataChannel, IceConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent, PeerHandle,
    SdpType, SessionDescription, Transceiver, TransceiverDirection,
};
use super::signaling::SignalingClient;
use crate::error::NegotiationError;
use crate::media::MediaKind;
use crate::protocol::{AnswerResponse, OfferRequest};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

const OFFER_SDP: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 63 9 0\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=rtpmap:63 rtx/48000\r\n\
a=fmtp:63 apt=111\r\n\
a=rtpmap:9 G722/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97 98\r\n\
a=rtpmap:96 VP8/90000\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=rtpmap:98 H264/90000\r\n";

pub struct MockTransceiver {
    kind: MediaKind,
    direction: TransceiverDirection,
    track: Mutex<Option<String>>,
}

impl Transceiver for MockTransceiver {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn direction(&self) -> TransceiverDirection {
        self.direction
    }

    fn replace_track(&self, track_id: Option<&str>) -> Result<(), NegotiationError> {
        *lock(&self.track) = track_id.map(str::to_string);
        Ok(())
    }

    fn current_track(&self) -> Option<String> {
        lock(&self.track).clone()
    }
}

pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, text: &str) -> Result<(), NegotiationError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }
        lock(&self.sent).push(text.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

pub struct MockPeer {
    index: usize,
    auto_connect: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
    transceivers: Mutex<Vec<Arc<MockTransceiver>>>,
    data_channels: Mutex<Vec<Arc<MockDataChannel>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    offers: AtomicUsize,
    restarts: AtomicUsize,
    fail_offers: AtomicUsize,
    closed: AtomicBool,
}

impl MockPeer {
    /// Creation order within the factory
    pub fn index(&self) -> usize {
        self.index
    }

    /// Inject a peer event
    pub fn emit(&self, event: PeerEvent) {
        if let PeerEvent::DataChannelOpen = event {
            self.open_data_channels(true);
        } else if let PeerEvent::DataChannelClosed = event {
            self.open_data_channels(false);
        }
        let _ = self.events.send(event);
    }

    fn open_data_channels(&self, open: bool) {
        for channel in lock(&self.data_channels).iter() {
            channel.open.store(open, Ordering::SeqCst);
        }
    }

    pub fn transceiver_count(&self) -> usize {
        lock(&self.transceivers).len()
    }

    pub fn transceiver_kinds(&self) -> Vec<MediaKind> {
        lock(&self.transceivers).iter().map(|t| t.kind).collect()
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn ice_restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Make the next `n` `create_offer` calls fail
    pub fn fail_next_offers(&self, n: usize) {
        self.fail_offers.store(n, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn local_sdp(&self) -> Option<String> {
        lock(&self.local).as_ref().map(|d| d.sdp.clone())
    }

    pub fn remote_sdp(&self) -> Option<String> {
        lock(&self.remote).as_ref().map(|d| d.sdp.clone())
    }

    /// Text sent on every data channel of this peer
    pub fn sent_messages(&self) -> Vec<String> {
        lock(&self.data_channels)
            .iter()
            .flat_map(|c| lock(&c.sent).clone())
            .collect()
    }

    pub fn track_ids(&self) -> Vec<Option<String>> {
        lock(&self.transceivers)
            .iter()
            .map(|t| t.current_track())
            .collect()
    }
}

impl PeerConnection for MockPeer {
    fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<Arc<dyn Transceiver>, NegotiationError> {
        let transceiver = Arc::new(MockTransceiver {
            kind,
            direction,
            track: Mutex::new(None),
        });
        lock(&self.transceivers).push(transceiver.clone());
        Ok(transceiver)
    }

    fn transceivers(&self) -> Vec<Arc<dyn Transceiver>> {
        lock(&self.transceivers)
            .iter()
            .map(|t| t.clone() as Arc<dyn Transceiver>)
            .collect()
    }

    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let channel = Arc::new(MockDataChannel {
            label: label.to_string(),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        });
        lock(&self.data_channels).push(channel.clone());
        Ok(channel)
    }

    fn create_offer(
        &self,
        ice_restart: bool,
    ) -> BoxFuture<'static, Result<SessionDescription, NegotiationError>> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        if ice_restart {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }

        let fail = self
            .fail_offers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let closed = self.is_closed();

        Box::pin(async move {
            if closed {
                return Err(NegotiationError::Closed);
            }
            if fail {
                return Err(NegotiationError::PeerConnection("offer failed".to_string()));
            }
            Ok(SessionDescription {
                sdp_type: SdpType::Offer,
                sdp: OFFER_SDP.to_string(),
            })
        })
    }

    fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> BoxFuture<'static, Result<(), NegotiationError>> {
        *lock(&self.local) = Some(description);
        Box::pin(async { Ok(()) })
    }

    fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> BoxFuture<'static, Result<(), NegotiationError>> {
        *lock(&self.remote) = Some(description);
        if self.auto_connect && !self.is_closed() {
            self.emit(PeerEvent::IceConnectionState(IceConnectionState::Connected));
            let already_open = lock(&self.data_channels).iter().any(|c| c.is_open());
            if !already_open {
                self.emit(PeerEvent::DataChannelOpen);
            }
        }
        Box::pin(async { Ok(()) })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.open_data_channels(false);
    }
}

#[derive(Default)]
struct FactoryState {
    peers: Vec<Arc<MockPeer>>,
    manual: bool,
    fail_next_create: bool,
}

/// Hands out [`MockPeer`]s and remembers them in creation order
#[derive(Clone, Default)]
pub struct MockPeerFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers created from now on stay down until the test emits events
    pub fn manual_connect(&self, manual: bool) {
        lock(&self.state).manual = manual;
    }

    pub fn fail_next_create(&self) {
        lock(&self.state).fail_next_create = true;
    }

    pub fn peer(&self, index: usize) -> Option<Arc<MockPeer>> {
        lock(&self.state).peers.get(index).cloned()
    }

    pub fn latest(&self) -> Option<Arc<MockPeer>> {
        lock(&self.state).peers.last().cloned()
    }

    pub fn created(&self) -> usize {
        lock(&self.state).peers.len()
    }
}

impl PeerConnectionFactory for MockPeerFactory {
    fn create(&self, _ice_servers: &[String]) -> Result<PeerHandle, NegotiationError> {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.fail_next_create) {
            return Err(NegotiationError::PeerConnection("create failed".to_string()));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MockPeer {
            index: state.peers.len(),
            auto_connect: !state.manual,
            events,
            transceivers: Mutex::new(Vec::new()),
            data_channels: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            offers: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
            fail_offers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        state.peers.push(peer.clone());
        let handle: Arc<dyn PeerConnection> = peer;
        Ok((handle, rx))
    }
}

#[derive(Default)]
struct SignalingState {
    offers: Vec<OfferRequest>,
    fail_next: usize,
}

/// Answers every offer, assigning one connection id per instance
#[derive(Clone)]
pub struct MockSignaling {
    state: Arc<Mutex<SignalingState>>,
    connection_id: String,
}

impl MockSignaling {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SignalingState::default())),
            connection_id: connection_id.into(),
        }
    }

    pub fn fail_next(&self, n: usize) {
        lock(&self.state).fail_next = n;
    }

    pub fn offers(&self) -> Vec<OfferRequest> {
        lock(&self.state).offers.clone()
    }
}

impl SignalingClient for MockSignaling {
    fn exchange(
        &self,
        offer: OfferRequest,
    ) -> BoxFuture<'static, Result<AnswerResponse, NegotiationError>> {
        let result = {
            let mut state = lock(&self.state);
            state.offers.push(offer);
            if state.fail_next > 0 {
                state.fail_next -= 1;
                Err(NegotiationError::Signaling("endpoint unavailable".to_string()))
            } else {
                Ok(AnswerResponse {
                    sdp: "v=0\r\ns=answer\r\n".to_string(),
                    sdp_type: "answer".to_string(),
                    connection_id: Some(self.connection_id.clone()),
                })
            }
        };
        Box::pin(async move { result })
    }
}
