//! In-memory media engine and signaling transport for tests
//!
//! Enabled for unit tests and with the `test-utils` feature. The doubles are
//! scriptable (queued failures, adjustable link states) and record what the
//! code under test did to them.

use crate::engine::{EngineError, LinkEvent, LocalTrack, MediaEngine, PeerLinkHandle, RtpSender};
use crate::ice::IceConfiguration;
use crate::media::{CaptureConstraints, MediaError};
use crate::signaling::{
    decode_outbound, InboundSignal, OutboundSignal, SignalingError, SignalingTransport,
    TransportFrame,
};
use crate::types::{
    ChannelId, IceCandidate, IceConnectionState, LinkStats, MediaKind, NegotiationState, PeerId,
    SdpType, SessionDescription, TransportState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;

/// Captured track double
#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MockTrack {
    /// New live, enabled track
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }

    /// Microphone track
    pub fn audio(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, MediaKind::Audio)
    }

    /// Camera or screen track
    pub fn video(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, MediaKind::Video)
    }

    /// Whether `stop` was called
    pub fn is_stopped(&self) -> bool {
        !self.live.load(Ordering::SeqCst)
    }
}

impl LocalTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Sender slot double
pub struct MockSender {
    kind: MediaKind,
    track: Mutex<Option<Arc<dyn LocalTrack>>>,
    fail_replace: AtomicBool,
    replace_calls: AtomicUsize,
}

impl MockSender {
    fn new(kind: MediaKind, track: Option<Arc<dyn LocalTrack>>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            track: Mutex::new(track),
            fail_replace: AtomicBool::new(false),
            replace_calls: AtomicUsize::new(0),
        })
    }

    /// Make `replace_track` fail
    pub fn set_fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    /// Number of `replace_track` calls
    pub fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RtpSender for MockSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> Option<Arc<dyn LocalTrack>> {
        self.track.lock().clone()
    }

    async fn replace_track(&self, track: Option<Arc<dyn LocalTrack>>) -> Result<(), EngineError> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(EngineError::SenderFailed("replace rejected".to_string()));
        }
        if let Some(track) = &track {
            if track.kind() != self.kind {
                return Err(EngineError::SenderFailed("kind mismatch".to_string()));
            }
        }
        *self.track.lock() = track;
        Ok(())
    }
}

struct LinkState {
    negotiation: NegotiationState,
    transport: TransportState,
    ice: IceConnectionState,
    configuration: IceConfiguration,
    stats: LinkStats,
    local_descriptions: Vec<SessionDescription>,
    remote_descriptions: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
}

/// Peer link double with a simplified offer/answer state machine
pub struct MockPeerLink {
    state: Mutex<LinkState>,
    senders: Mutex<Vec<Arc<MockSender>>>,
    events: broadcast::Sender<LinkEvent>,
    closed: AtomicBool,
    offers: AtomicUsize,
    ice_restarts: AtomicUsize,
    stats_calls: AtomicUsize,
    concurrent_offers: AtomicUsize,
    max_concurrent_offers: AtomicUsize,
    offer_delay: Mutex<Duration>,
    fail_offers: AtomicBool,
}

impl MockPeerLink {
    /// New link in the `new` state
    pub fn new() -> Arc<Self> {
        Self::with_configuration(IceConfiguration::default())
    }

    fn with_configuration(configuration: IceConfiguration) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            state: Mutex::new(LinkState {
                negotiation: NegotiationState::New,
                transport: TransportState::New,
                ice: IceConnectionState::New,
                configuration,
                stats: LinkStats::default(),
                local_descriptions: Vec::new(),
                remote_descriptions: Vec::new(),
                candidates: Vec::new(),
            }),
            senders: Mutex::new(Vec::new()),
            events,
            closed: AtomicBool::new(false),
            offers: AtomicUsize::new(0),
            ice_restarts: AtomicUsize::new(0),
            stats_calls: AtomicUsize::new(0),
            concurrent_offers: AtomicUsize::new(0),
            max_concurrent_offers: AtomicUsize::new(0),
            offer_delay: Mutex::new(Duration::ZERO),
            fail_offers: AtomicBool::new(false),
        })
    }

    /// Publish a link event
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    fn set_negotiation(&self, state: NegotiationState) {
        self.state.lock().negotiation = state;
        self.emit(LinkEvent::NegotiationStateChanged(state));
    }

    /// Force the negotiation state
    pub fn set_negotiation_state(&self, state: NegotiationState) {
        self.set_negotiation(state);
    }

    /// Force the transport state and publish the change
    pub fn set_transport_state(&self, state: TransportState) {
        self.state.lock().transport = state;
        self.emit(LinkEvent::TransportStateChanged(state));
    }

    /// Force the ICE state and publish the change
    pub fn set_ice_connection_state(&self, state: IceConnectionState) {
        self.state.lock().ice = state;
        self.emit(LinkEvent::IceConnectionStateChanged(state));
    }

    /// Statistics returned by `stats`
    pub fn set_stats(&self, stats: LinkStats) {
        self.state.lock().stats = stats;
    }

    /// Delay applied inside `create_offer`
    pub fn set_offer_delay(&self, delay: Duration) {
        *self.offer_delay.lock() = delay;
    }

    /// Make `create_offer` fail
    pub fn set_fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Offers created
    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    /// Offers created with `ice_restart`
    pub fn ice_restarts(&self) -> usize {
        self.ice_restarts.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `create_offer` calls seen
    pub fn max_concurrent_offers(&self) -> usize {
        self.max_concurrent_offers.load(Ordering::SeqCst)
    }

    /// `stats` calls
    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Configuration last applied
    pub fn configuration(&self) -> IceConfiguration {
        self.state.lock().configuration.clone()
    }

    /// Local descriptions applied, in order
    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().local_descriptions.clone()
    }

    /// Remote descriptions applied, in order
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote_descriptions.clone()
    }

    /// Remote candidates added
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Concrete sender slots
    pub fn mock_senders(&self) -> Vec<Arc<MockSender>> {
        self.senders.lock().clone()
    }

    /// Id of the track on the first sender of `kind`
    pub fn sent_track_id(&self, kind: MediaKind) -> Option<String> {
        self.senders
            .lock()
            .iter()
            .find(|s| s.kind == kind)
            .and_then(|s| s.track().map(|t| t.id().to_string()))
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerLinkHandle for MockPeerLink {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        let running = self.concurrent_offers.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_offers.fetch_max(running, Ordering::SeqCst);

        let delay = *self.offer_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.concurrent_offers.fetch_sub(1, Ordering::SeqCst);

        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(EngineError::Other("offer refused".to_string()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        if ice_restart {
            self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(format!(
            "v=0 offer-{n}{}",
            if ice_restart { " ice-restart" } else { "" }
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        let state = self.state.lock().negotiation;
        if state != NegotiationState::HaveRemoteOffer {
            return Err(EngineError::InvalidState(state.to_string()));
        }
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let current = self.state.lock().negotiation;
        let next = match (desc.sdp_type, current) {
            (
                SdpType::Offer,
                NegotiationState::New | NegotiationState::Stable | NegotiationState::HaveLocalOffer,
            ) => NegotiationState::HaveLocalOffer,
            (SdpType::Answer | SdpType::Pranswer, NegotiationState::HaveRemoteOffer) => {
                NegotiationState::Stable
            }
            (SdpType::Rollback, NegotiationState::HaveLocalOffer) => NegotiationState::Stable,
            _ => return Err(EngineError::InvalidState(current.to_string())),
        };
        self.state.lock().local_descriptions.push(desc);
        self.set_negotiation(next);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        if desc.sdp.is_empty() {
            return Err(EngineError::InvalidDescription("empty sdp".to_string()));
        }
        let current = self.state.lock().negotiation;
        let next = match (desc.sdp_type, current) {
            (SdpType::Offer, NegotiationState::New | NegotiationState::Stable) => {
                NegotiationState::HaveRemoteOffer
            }
            (SdpType::Answer | SdpType::Pranswer, NegotiationState::HaveLocalOffer) => {
                NegotiationState::Stable
            }
            _ => return Err(EngineError::InvalidState(current.to_string())),
        };
        self.state.lock().remote_descriptions.push(desc);
        self.set_negotiation(next);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        if candidate.candidate.is_empty() {
            return Err(EngineError::InvalidCandidate("empty candidate".to_string()));
        }
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<Arc<dyn RtpSender>, EngineError> {
        self.ensure_open()?;
        let sender = MockSender::new(track.kind(), Some(track));
        self.senders.lock().push(sender.clone());
        self.emit(LinkEvent::NegotiationNeeded);
        Ok(sender as Arc<dyn RtpSender>)
    }

    async fn remove_track(&self, sender: &Arc<dyn RtpSender>) -> Result<(), EngineError> {
        self.ensure_open()?;
        let target = Arc::as_ptr(sender).cast::<()>();
        let mut senders = self.senders.lock();
        let before = senders.len();
        senders.retain(|s| Arc::as_ptr(s).cast::<()>() != target);
        if senders.len() == before {
            return Err(EngineError::SenderFailed("unknown sender".to_string()));
        }
        drop(senders);
        self.emit(LinkEvent::NegotiationNeeded);
        Ok(())
    }

    fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.senders
            .lock()
            .iter()
            .map(|s| s.clone() as Arc<dyn RtpSender>)
            .collect()
    }

    async fn stats(&self) -> Result<LinkStats, EngineError> {
        self.ensure_open()?;
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().stats.clone())
    }

    fn negotiation_state(&self) -> NegotiationState {
        self.state.lock().negotiation
    }

    fn transport_state(&self) -> TransportState {
        self.state.lock().transport
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    async fn set_configuration(&self, ice: &IceConfiguration) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.state.lock().configuration = ice.clone();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            state.negotiation = NegotiationState::Closed;
            state.transport = TransportState::Closed;
            state.ice = IceConnectionState::Closed;
        }
        self.emit(LinkEvent::TransportStateChanged(TransportState::Closed));
    }
}

/// Media engine double
pub struct MockEngine {
    links: Mutex<Vec<Arc<MockPeerLink>>>,
    link_attempts: Mutex<Vec<Instant>>,
    failing_links: AtomicUsize,
    capture_failures: Mutex<VecDeque<MediaError>>,
    screen_failures: Mutex<VecDeque<MediaError>>,
    capture_calls: AtomicUsize,
    capture_delay: Mutex<Duration>,
    track_counter: AtomicUsize,
    captured: Mutex<Vec<Arc<MockTrack>>>,
}

impl MockEngine {
    /// New engine with no scripted failures
    pub fn new() -> Self {
        Self {
            links: Mutex::new(Vec::new()),
            link_attempts: Mutex::new(Vec::new()),
            failing_links: AtomicUsize::new(0),
            capture_failures: Mutex::new(VecDeque::new()),
            screen_failures: Mutex::new(VecDeque::new()),
            capture_calls: AtomicUsize::new(0),
            capture_delay: Mutex::new(Duration::ZERO),
            track_counter: AtomicUsize::new(0),
            captured: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next captures with these errors, in order
    pub fn fail_next_captures(&self, errors: Vec<MediaError>) {
        self.capture_failures.lock().extend(errors);
    }

    /// Fail the next screen captures with these errors, in order
    pub fn fail_next_screen_captures(&self, errors: Vec<MediaError>) {
        self.screen_failures.lock().extend(errors);
    }

    /// Fail the next `count` link creations
    pub fn fail_next_links(&self, count: usize) {
        self.failing_links.store(count, Ordering::SeqCst);
    }

    /// Delay applied inside `capture_media`
    pub fn set_capture_delay(&self, delay: Duration) {
        *self.capture_delay.lock() = delay;
    }

    /// `capture_media` calls
    pub fn capture_calls(&self) -> usize {
        self.capture_calls.load(Ordering::SeqCst)
    }

    /// Links created, in order
    pub fn links(&self) -> Vec<Arc<MockPeerLink>> {
        self.links.lock().clone()
    }

    /// Most recently created link
    pub fn last_link(&self) -> Option<Arc<MockPeerLink>> {
        self.links.lock().last().cloned()
    }

    /// Times of every `create_peer_link` call, failed ones included
    pub fn link_attempts(&self) -> Vec<Instant> {
        self.link_attempts.lock().clone()
    }

    /// Every track handed out
    pub fn captured_tracks(&self) -> Vec<Arc<MockTrack>> {
        self.captured.lock().clone()
    }

    fn next_track(&self, prefix: &str, kind: MediaKind) -> Arc<MockTrack> {
        let n = self.track_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let track = MockTrack::new(format!("{prefix}-{n}"), kind);
        self.captured.lock().push(track.clone());
        track
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_peer_link(
        &self,
        ice: &IceConfiguration,
    ) -> Result<Arc<dyn PeerLinkHandle>, EngineError> {
        self.link_attempts.lock().push(Instant::now());
        let failing = self.failing_links.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_links.store(failing - 1, Ordering::SeqCst);
            return Err(EngineError::Other("link creation refused".to_string()));
        }
        let link = MockPeerLink::with_configuration(ice.clone());
        self.links.lock().push(link.clone());
        Ok(link as Arc<dyn PeerLinkHandle>)
    }

    async fn capture_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.capture_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.capture_failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(self.next_track("audio", MediaKind::Audio));
        }
        if constraints.video {
            tracks.push(self.next_track("camera", MediaKind::Video));
        }
        Ok(tracks)
    }

    async fn capture_screen(&self) -> Result<Arc<dyn LocalTrack>, MediaError> {
        let failure = self.screen_failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(self.next_track("screen", MediaKind::Video) as Arc<dyn LocalTrack>)
    }
}

/// Signaling transport double
///
/// Inbound frames are pushed by the test; outbound frames are recorded.
pub struct MockSignaling {
    inbound: Mutex<VecDeque<TransportFrame>>,
    notify: Notify,
    status: watch::Sender<bool>,
    sent: Mutex<Vec<String>>,
    failing_targets: Mutex<HashSet<PeerId>>,
    closed: AtomicBool,
}

impl MockSignaling {
    /// New connected transport
    pub fn new() -> Self {
        let (status, _) = watch::channel(true);
        Self {
            inbound: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            status,
            sent: Mutex::new(Vec::new()),
            failing_targets: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Deliver a raw frame
    pub fn push_frame(&self, frame: TransportFrame) {
        self.inbound.lock().push_back(frame);
        self.notify.notify_one();
    }

    /// Deliver a raw text frame
    pub fn push_text(&self, text: impl Into<String>) {
        self.push_frame(TransportFrame::Text(text.into()));
    }

    /// Deliver a typed message as the relay would encode it
    pub fn push_inbound(&self, signal: InboundSignal) {
        match serde_json::to_string(&signal) {
            Ok(text) => self.push_text(text),
            Err(e) => tracing::error!(error = %e, "Failed to encode inbound test frame"),
        }
    }

    /// Flip connectivity
    pub fn set_connected(&self, connected: bool) {
        self.status.send_replace(connected);
    }

    /// Make sends addressed to `peer` fail
    pub fn fail_sends_to(&self, peer: PeerId) {
        self.failing_targets.lock().insert(peer);
    }

    /// Stop failing sends
    pub fn clear_send_failures(&self) {
        self.failing_targets.lock().clear();
    }

    /// Shut the transport down
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Decoded outbound messages, in order
    pub fn sent(&self) -> Vec<(ChannelId, OutboundSignal)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| decode_outbound(text).ok())
            .collect()
    }

    /// Outbound messages addressed to one peer
    pub fn sent_to(&self, peer: &PeerId) -> Vec<OutboundSignal> {
        self.sent()
            .into_iter()
            .map(|(_, signal)| signal)
            .filter(|signal| signal.target() == Some(peer))
            .collect()
    }

    /// Raw outbound frames
    pub fn sent_raw(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Forget recorded frames
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }
}

impl Default for MockSignaling {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingTransport for MockSignaling {
    async fn send_text(&self, text: String) -> Result<(), SignalingError> {
        if !*self.status.borrow() {
            return Err(SignalingError::NotConnected);
        }
        let (_, signal) = decode_outbound(&text)?;
        if let Some(target) = signal.target() {
            if self.failing_targets.lock().contains(target) {
                return Err(SignalingError::TransportError(format!(
                    "send to {target} failed"
                )));
            }
        }
        self.sent.lock().push(text);
        Ok(())
    }

    async fn receive(&self) -> Result<TransportFrame, SignalingError> {
        loop {
            let frame = self.inbound.lock().pop_front();
            if let Some(frame) = frame {
                return Ok(frame);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(SignalingError::Closed);
            }
            self.notify.notified().await;
        }
    }

    fn connection_status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }
}
