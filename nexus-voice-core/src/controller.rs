//! Peer Lifecycle Controller
//!
//! Central orchestrator of a voice session. It owns the peer map, runs the
//! offer/answer state machine for every remote participant, fans local
//! video changes out through the [`TrackManager`] and reacts to transport
//! failures with the fallback ladder, the [`ReconnectionManager`] and the
//! health-check loop.
//!
//! # Examples
//!
//! ```rust,no_run
//! use nexus_voice_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     engine: Arc<dyn MediaEngine>,
//! #     transport: Arc<dyn SignalingTransport>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let controller = PeerLifecycleController::new(SessionConfig::default(), engine, transport)?;
//! let mut events = controller.subscribe();
//!
//! let roster = controller.join(ChannelId::new("general"), true).await?;
//! println!("connected to {} participants", roster.established.len());
//!
//! controller.toggle_video().await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! controller.leave().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigError, SessionConfig};
use crate::engine::{find_sender, EngineError, LinkEvent, LocalTrack, MediaEngine, PeerLinkHandle};
use crate::events::{ErrorSeverity, EventBus, RecommendedAction, SessionEvent};
use crate::health::{assess_peer, HealthExpectations, HealthRecommendation, HealthReport};
use crate::ice::{FallbackStage, IceConfiguration, IceRecoveryRecord};
use crate::media::{acquire_local_media, CaptureConstraints, LocalMedia, MediaError};
use crate::monitor::ConnectionMonitor;
use crate::peer::PeerLink;
use crate::reconnection::{PeerReconnector, ReconnectionError, ReconnectionManager};
use crate::session::Session;
use crate::signaling::{
    InboundSignal, OutboundSignal, RosterEntry, SignalingError, SignalingEvent, SignalingHandler,
    SignalingTransport,
};
use crate::sync::{StateSynchronizer, SyncReport};
use crate::track_manager::{OperationKind, TrackError, TrackManager, TrackState, TrackStateSnapshot};
use crate::types::{
    ChannelId, IceCandidate, IceConnectionState, MediaKind, NegotiationState, NetworkStatus,
    PeerId, SessionDescription, TransportState, VideoSource,
};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

/// Controller errors
#[derive(Error, Debug)]
pub enum ControllerError {
    /// No channel joined
    #[error("Not in a voice channel")]
    NoSession,

    /// A channel is already joined
    #[error("Already in voice channel {0}")]
    AlreadyJoined(ChannelId),

    /// Another join is still capturing media or announcing presence
    #[error("A join is already in progress")]
    JoinInProgress,

    /// Message or operation for a peer without a link
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// Offer/answer step rejected
    #[error("Negotiation with {peer_id} failed in state {state}: {source}")]
    Negotiation {
        /// Peer
        peer_id: PeerId,
        /// State when the step failed
        state: NegotiationState,
        /// Engine error
        #[source]
        source: EngineError,
    },

    /// Negotiation did not settle in time
    #[error("Timed out waiting for stable negotiation with {0}")]
    StableTimeout(PeerId),

    /// Leave did not release everything
    #[error("Teardown left state behind: {0}")]
    InconsistentTeardown(String),

    /// Media acquisition failed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Engine call failed
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Signaling failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Track operation failed
    #[error("Track operation error: {0}")]
    Track(#[from] TrackError),
}

/// Outcome of connecting to the roster received after joining
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterReport {
    /// Peers an offer was sent to
    pub established: Vec<PeerId>,
    /// Peers that failed, with the reason; they are retried in the background
    pub failed: Vec<(PeerId, String)>,
}

/// Status update broadcast by a remote participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Microphone muted or unmuted
    Muted(bool),
    /// Video switched on or off
    Video(bool),
}

struct ControllerInner {
    config: SessionConfig,
    ice: IceConfiguration,
    engine: Arc<dyn MediaEngine>,
    signaling: Arc<SignalingHandler>,
    events: EventBus,
    tracks: TrackManager,
    monitor: ConnectionMonitor,
    reconnection: ReconnectionManager,
    sync: StateSynchronizer,
    session: RwLock<Option<Session>>,
    peers: RwLock<HashMap<PeerId, PeerLink>>,
    ice_recovery: Mutex<HashMap<PeerId, IceRecoveryRecord>>,
    roster: Mutex<Option<oneshot::Sender<RosterReport>>>,
    video_intent: Mutex<bool>,
    joining: AtomicBool,
}

/// Orchestrates one participant's side of a full-mesh voice session
#[derive(Clone)]
pub struct PeerLifecycleController {
    inner: Arc<ControllerInner>,
}

impl PeerLifecycleController {
    /// Create a controller
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is out of range
    pub fn new(
        config: SessionConfig,
        engine: Arc<dyn MediaEngine>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ice = config.ice_configuration();
        let events = EventBus::new();

        let inner = Arc::new_cyclic(|weak: &Weak<ControllerInner>| {
            let rebuilder: Arc<dyn PeerReconnector> = Arc::new(LinkRebuilder {
                inner: weak.clone(),
            });
            ControllerInner {
                ice,
                engine,
                signaling: Arc::new(SignalingHandler::new(transport)),
                tracks: TrackManager::new(config.track.clone()),
                monitor: ConnectionMonitor::new(config.monitor.clone(), events.clone()),
                reconnection: ReconnectionManager::new(
                    config.reconnection.clone(),
                    events.clone(),
                    rebuilder,
                ),
                sync: StateSynchronizer::new(events.clone()),
                session: RwLock::new(None),
                peers: RwLock::new(HashMap::new()),
                ice_recovery: Mutex::new(HashMap::new()),
                roster: Mutex::new(None),
                video_intent: Mutex::new(false),
                joining: AtomicBool::new(false),
                events,
                config,
            }
        });

        Ok(Self { inner })
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Event registry
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Track Manager owning the local video track
    #[must_use]
    pub fn track_manager(&self) -> &TrackManager {
        &self.inner.tracks
    }

    /// Connection Monitor
    #[must_use]
    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.inner.monitor
    }

    /// Reconnection Manager
    #[must_use]
    pub fn reconnection(&self) -> &ReconnectionManager {
        &self.inner.reconnection
    }

    // ---- queries ----

    /// Whether a channel is joined
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.inner.session.read().is_some()
    }

    /// Joined channel
    #[must_use]
    pub fn channel(&self) -> Option<ChannelId> {
        self.inner
            .session
            .read()
            .as_ref()
            .map(|s| s.channel_id().clone())
    }

    /// Microphone track of the session
    #[must_use]
    pub fn local_audio(&self) -> Option<Arc<dyn LocalTrack>> {
        self.inner
            .session
            .read()
            .as_ref()
            .and_then(|s| s.audio().cloned())
    }

    /// Whether the microphone is muted; `None` without a microphone
    #[must_use]
    pub fn is_muted(&self) -> Option<bool> {
        self.local_audio().map(|t| !t.is_enabled())
    }

    /// Local video intent
    #[must_use]
    pub fn video_state(&self) -> TrackState {
        self.inner.tracks.current_track_state()
    }

    /// Whether the application is backgrounded
    #[must_use]
    pub fn is_background(&self) -> bool {
        self.inner
            .session
            .read()
            .as_ref()
            .is_some_and(Session::is_background)
    }

    /// Remote participants with a link, sorted
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.inner.peers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of peer links
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    /// Engine handle of a peer's link
    #[must_use]
    pub fn link_handle(&self, peer_id: &PeerId) -> Option<Arc<dyn PeerLinkHandle>> {
        self.inner
            .peers
            .read()
            .get(peer_id)
            .map(|l| l.handle.clone())
    }

    /// Copy of a peer's link record
    #[must_use]
    pub fn peer_link(&self, peer_id: &PeerId) -> Option<PeerLink> {
        self.inner.peers.read().get(peer_id).cloned()
    }

    /// Negotiation state of a peer's link
    #[must_use]
    pub fn negotiation_state(&self, peer_id: &PeerId) -> Option<NegotiationState> {
        self.link_handle(peer_id).map(|h| h.negotiation_state())
    }

    /// Transport state of a peer's link
    #[must_use]
    pub fn transport_state(&self, peer_id: &PeerId) -> Option<TransportState> {
        self.link_handle(peer_id).map(|h| h.transport_state())
    }

    /// Whether the relay-only fallback is engaged for a peer
    #[must_use]
    pub fn is_relay_only(&self, peer_id: &PeerId) -> bool {
        self.inner
            .peers
            .read()
            .get(peer_id)
            .is_some_and(|l| l.relay_only)
    }

    /// ICE recovery bookkeeping of a peer
    #[must_use]
    pub fn ice_recovery(&self, peer_id: &PeerId) -> Option<IceRecoveryRecord> {
        self.inner.ice_recovery.lock().get(peer_id).cloned()
    }

    fn link_handles(&self) -> Vec<(PeerId, Arc<dyn PeerLinkHandle>)> {
        self.inner
            .peers
            .read()
            .iter()
            .map(|(id, link)| (id.clone(), link.handle.clone()))
            .collect()
    }

    fn local_tracks(&self) -> Vec<Arc<dyn LocalTrack>> {
        let mut tracks: Vec<Arc<dyn LocalTrack>> = self.local_audio().into_iter().collect();
        let video = self.inner.tracks.current_track_state();
        if let (true, Some(track)) = (video.active, video.track) {
            tracks.push(track);
        }
        tracks
    }

    fn set_relay_flag(&self, peer_id: &PeerId, relay_only: bool) {
        if let Some(link) = self.inner.peers.write().get_mut(peer_id) {
            link.relay_only = relay_only;
        }
    }

    fn set_resume_camera(&self, resume: bool) {
        if let Some(session) = self.inner.session.write().as_mut() {
            session.set_resume_camera(resume);
        }
    }

    fn resume_camera(&self) -> bool {
        self.inner
            .session
            .read()
            .as_ref()
            .is_some_and(Session::resume_camera)
    }

    fn sync_video_intent(&self) {
        *self.inner.video_intent.lock() = self.inner.tracks.is_video_active();
    }

    /// An operation cut off mid fan-out may have left senders on a track
    /// that is no longer held; queue a pass that re-applies the held state
    fn settle_failed_operation(&self, error: &TrackError) {
        self.sync_video_intent();
        if !matches!(error, TrackError::Timeout { .. }) {
            return;
        }
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.synchronize_video_state().await {
                tracing::warn!(error = %e, "Resynchronization after timeout failed");
            }
        });
    }

    // ---- session lifecycle ----

    /// Join a channel
    ///
    /// Captures local media (with bounded retry), announces presence and
    /// waits up to the configured roster window for the participants already
    /// present. An empty channel yields an empty report.
    ///
    /// # Errors
    ///
    /// Returns error if a channel is already joined, media capture fails or
    /// the join announcement cannot be sent
    #[tracing::instrument(skip(self), fields(channel = %channel_id))]
    pub async fn join(
        &self,
        channel_id: ChannelId,
        video_requested: bool,
    ) -> Result<RosterReport, ControllerError> {
        let _reservation = {
            let session = self.inner.session.read();
            if let Some(current) = session.as_ref() {
                return Err(ControllerError::AlreadyJoined(current.channel_id().clone()));
            }
            JoinReservation::claim(&self.inner.joining).ok_or(ControllerError::JoinInProgress)?
        };

        let constraints = CaptureConstraints {
            audio: true,
            video: video_requested,
        };
        let media = match acquire_local_media(
            self.inner.engine.as_ref(),
            constraints,
            &self.inner.config.media_retry,
        )
        .await
        {
            Ok(media) => media,
            Err(e) => {
                self.inner.events.emit_error(
                    e.user_message(),
                    ErrorSeverity::Error,
                    e.recommended_action(),
                    None,
                );
                return Err(e.into());
            }
        };
        self.inner.events.emit(SessionEvent::LocalStreamReady {
            has_audio: media.audio.is_some(),
            has_video: media.video.is_some(),
        });

        let LocalMedia { audio, video } = media;
        *self.inner.video_intent.lock() = video.is_some();
        if let Some(video) = video {
            self.inner
                .tracks
                .update_track_state(VideoSource::Camera, Some(video), true);
        }

        let session = Session::new(channel_id.clone(), audio);
        let signal_token = session.task_token();
        let health_token = session.task_token();
        *self.inner.session.write() = Some(session);

        let (roster_tx, roster_rx) = oneshot::channel();
        *self.inner.roster.lock() = Some(roster_tx);
        self.spawn_signal_loop(signal_token);
        self.spawn_health_loop(health_token);

        if let Err(e) = self
            .inner
            .signaling
            .send(&channel_id, &OutboundSignal::Join)
            .await
        {
            self.inner.events.emit_error(
                "Could not reach the voice server.",
                ErrorSeverity::Error,
                RecommendedAction::Reconnect,
                None,
            );
            if let Err(cleanup) = self.leave().await {
                tracing::warn!(error = %cleanup, "Cleanup after failed join was incomplete");
            }
            return Err(e.into());
        }

        let report = match tokio::time::timeout(self.inner.config.roster_wait, roster_rx).await {
            Ok(Ok(report)) => report,
            _ => {
                self.inner.roster.lock().take();
                tracing::debug!("No roster received, channel is empty");
                RosterReport::default()
            }
        };

        tracing::info!(
            established = report.established.len(),
            failed = report.failed.len(),
            "Joined voice channel"
        );
        Ok(report)
    }

    /// Leave the channel and release everything
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::NoSession`] if not joined, or
    /// [`ControllerError::InconsistentTeardown`] if some state survived
    #[tracing::instrument(skip(self))]
    pub async fn leave(&self) -> Result<(), ControllerError> {
        let session = self
            .inner
            .session
            .write()
            .take()
            .ok_or(ControllerError::NoSession)?;
        let channel = session.dispose();
        self.inner.roster.lock().take();

        self.teardown_peers(true).await;
        self.inner.tracks.reset();
        *self.inner.video_intent.lock() = false;

        if let Err(e) = self
            .inner
            .signaling
            .send(&channel, &OutboundSignal::Leave)
            .await
        {
            tracing::warn!(error = %e, "Failed to announce departure");
        }

        self.verify_teardown()?;
        tracing::info!(channel = %channel, "Left voice channel");
        Ok(())
    }

    async fn teardown_peers(&self, notify: bool) {
        let links: Vec<PeerLink> = self
            .inner
            .peers
            .write()
            .drain()
            .map(|(_, link)| link)
            .collect();
        for link in &links {
            link.bindings().cancel();
        }
        self.inner.monitor.stop_all();
        self.inner.reconnection.cancel_all();
        self.inner.ice_recovery.lock().clear();

        for link in links {
            link.close().await;
            if notify {
                self.inner.events.emit(SessionEvent::PeerLeft {
                    peer_id: link.peer_id.clone(),
                });
            }
        }
    }

    fn verify_teardown(&self) -> Result<(), ControllerError> {
        let mut leftovers = Vec::new();
        let peers = self.peer_count();
        if peers > 0 {
            leftovers.push(format!("{peers} peer links"));
        }
        let monitored = self.inner.monitor.monitored_peers().len();
        if monitored > 0 {
            leftovers.push(format!("{monitored} monitored peers"));
        }
        let reconnecting = self.inner.reconnection.tracked_peers().len();
        if reconnecting > 0 {
            leftovers.push(format!("{reconnecting} reconnection records"));
        }
        let ice = self.inner.ice_recovery.lock().len();
        if ice > 0 {
            leftovers.push(format!("{ice} ICE recovery records"));
        }
        if self.inner.tracks.video_track().is_some() {
            leftovers.push("video track".to_string());
        }
        let pending = self.inner.tracks.pending_operations();
        if pending > 0 {
            leftovers.push(format!("{pending} queued track operations"));
        }

        if leftovers.is_empty() {
            Ok(())
        } else {
            tracing::error!(?leftovers, "Teardown left state behind");
            Err(ControllerError::InconsistentTeardown(leftovers.join(", ")))
        }
    }

    fn spawn_signal_loop(&self, token: CancellationToken) {
        let signaling = self.inner.signaling.clone();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    event = signaling.receive() => event,
                };
                let Some(inner) = weak.upgrade() else { return };
                let controller = Self { inner };

                match event {
                    Ok(SignalingEvent::Message(signal)) => {
                        if let Err(e) = controller.handle_signal(signal).await {
                            tracing::warn!(error = %e, "Failed to handle signaling message");
                        }
                    }
                    Ok(SignalingEvent::Reconnected) => {
                        if let Err(e) = controller.handle_signaling_reconnected().await {
                            tracing::warn!(error = %e, "Failed to rejoin after signaling reconnect");
                        }
                    }
                    Ok(SignalingEvent::Disconnected) => {
                        tracing::warn!("Signaling channel dropped");
                    }
                    Err(SignalingError::Closed) => {
                        tracing::warn!("Signaling channel closed, signal loop ends");
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Skipping signaling frame");
                    }
                }
            }
        });
    }

    fn spawn_health_loop(&self, token: CancellationToken) {
        let Some(period) = self.inner.config.health_check_interval else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { return };
                let controller = Self { inner };
                if controller.is_background() {
                    continue;
                }
                let report = controller.run_health_check();
                if !report.is_healthy() {
                    controller.auto_recover(&report).await;
                }
            }
        });
    }

    // ---- inbound signaling ----

    /// Dispatch one inbound message
    ///
    /// # Errors
    ///
    /// Returns the failure of the message-specific handler
    pub async fn handle_signal(&self, signal: InboundSignal) -> Result<(), ControllerError> {
        match signal {
            InboundSignal::ExistingUsers { users } => {
                self.handle_existing_users(users).await;
                Ok(())
            }
            InboundSignal::UserJoined {
                user_id, username, ..
            } => self.handle_user_joined(user_id, username).await,
            InboundSignal::UserLeft { user_id, .. } => {
                self.handle_user_left(&user_id).await;
                Ok(())
            }
            InboundSignal::Offer { user_id, offer } => self.handle_offer(&user_id, offer).await,
            InboundSignal::Answer { user_id, answer } => {
                self.handle_answer(&user_id, answer).await
            }
            InboundSignal::IceCandidate { user_id, candidate } => {
                self.handle_ice_candidate(&user_id, candidate).await
            }
            InboundSignal::MuteStatus {
                user_id, is_muted, ..
            } => {
                self.handle_remote_status(&user_id, RemoteStatus::Muted(is_muted));
                Ok(())
            }
            InboundSignal::VideoStatus {
                user_id,
                is_video_enabled,
                ..
            } => {
                self.handle_remote_status(&user_id, RemoteStatus::Video(is_video_enabled));
                Ok(())
            }
        }
    }

    /// Connect to every participant already in the channel
    ///
    /// Each peer is handled independently; failed peers are retried by the
    /// Reconnection Manager.
    #[tracing::instrument(skip_all, fields(peers = users.len()))]
    pub async fn handle_existing_users(&self, users: Vec<RosterEntry>) -> RosterReport {
        let mut report = RosterReport::default();

        for entry in users {
            let peer_id = entry.user_id;
            match self.connect_to_peer(&peer_id, entry.username, true).await {
                Ok(()) => report.established.push(peer_id),
                Err(e) => {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Failed to connect to participant");
                    self.inner.events.emit_error(
                        format!("Could not connect to {peer_id}, retrying."),
                        ErrorSeverity::Warning,
                        RecommendedAction::Retry,
                        Some(peer_id.clone()),
                    );
                    self.inner
                        .reconnection
                        .schedule_reconnection(peer_id.clone());
                    report.failed.push((peer_id, e.to_string()));
                }
            }
        }

        if let Some(tx) = self.inner.roster.lock().take() {
            let _ = tx.send(report.clone());
        }
        report
    }

    /// Connect to a participant who just joined
    ///
    /// # Errors
    ///
    /// Returns error if the link or the offer fails; the peer is then
    /// retried in the background
    pub async fn handle_user_joined(
        &self,
        peer_id: PeerId,
        username: Option<String>,
    ) -> Result<(), ControllerError> {
        if !self.is_joined() {
            tracing::debug!(peer_id = %peer_id, "Ignoring join outside a session");
            return Ok(());
        }
        tracing::info!(peer_id = %peer_id, ?username, "Participant joined");

        if let Err(e) = self.connect_to_peer(&peer_id, username, false).await {
            tracing::warn!(peer_id = %peer_id, error = %e, "Failed to connect to new participant");
            self.inner.reconnection.schedule_reconnection(peer_id);
            return Err(e);
        }
        Ok(())
    }

    /// Drop a participant who left
    pub async fn handle_user_left(&self, peer_id: &PeerId) {
        tracing::info!(peer_id = %peer_id, "Participant left");
        self.cleanup_peer(peer_id, true).await;
    }

    /// Answer a remote offer
    ///
    /// When the offer collides with one of ours, the polite side of the link
    /// rolls its offer back and answers; the impolite side ignores the
    /// remote offer and waits for the answer to its own.
    ///
    /// # Errors
    ///
    /// Returns error if a negotiation step fails or the answer cannot be sent
    #[tracing::instrument(skip(self, offer), fields(peer_id = %peer_id))]
    pub async fn handle_offer(
        &self,
        peer_id: &PeerId,
        offer: SessionDescription,
    ) -> Result<(), ControllerError> {
        if !self.is_joined() {
            return Err(ControllerError::NoSession);
        }
        let (handle, polite) = match self.peer_link(peer_id) {
            Some(link) => (link.handle, link.polite),
            None => (self.create_peer_link(peer_id, None, true, true).await?, true),
        };

        if handle.negotiation_state() == NegotiationState::HaveLocalOffer {
            if !polite {
                tracing::info!("Offer collision, keeping local offer");
                return Ok(());
            }
            tracing::warn!("Offer collision, rolling back local offer");
            handle
                .set_local_description(SessionDescription::rollback())
                .await
                .map_err(|e| negotiation_error(peer_id, handle.as_ref(), e))?;
        }

        handle
            .set_remote_description(offer)
            .await
            .map_err(|e| negotiation_error(peer_id, handle.as_ref(), e))?;
        let answer = handle
            .create_answer()
            .await
            .map_err(|e| negotiation_error(peer_id, handle.as_ref(), e))?;
        handle
            .set_local_description(answer.clone())
            .await
            .map_err(|e| negotiation_error(peer_id, handle.as_ref(), e))?;

        self.send_signal(OutboundSignal::Answer {
            target_user_id: peer_id.clone(),
            answer,
        })
        .await?;
        tracing::debug!("Answer sent");
        Ok(())
    }

    /// Apply a remote answer
    ///
    /// An answer outside `have-local-offer` is logged and dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::UnknownPeer`] for an answer without a link
    #[tracing::instrument(skip(self, answer), fields(peer_id = %peer_id))]
    pub async fn handle_answer(
        &self,
        peer_id: &PeerId,
        answer: SessionDescription,
    ) -> Result<(), ControllerError> {
        let Some(handle) = self.link_handle(peer_id) else {
            self.inner.events.emit_error(
                "Received an answer from an unknown participant.",
                ErrorSeverity::Warning,
                RecommendedAction::Reconnect,
                Some(peer_id.clone()),
            );
            return Err(ControllerError::UnknownPeer(peer_id.clone()));
        };

        let state = handle.negotiation_state();
        if state != NegotiationState::HaveLocalOffer {
            tracing::warn!(%state, "Answer received in wrong negotiation state, dropping");
            return Ok(());
        }

        handle
            .set_remote_description(answer)
            .await
            .map_err(|e| negotiation_error(peer_id, handle.as_ref(), e))?;
        tracing::debug!("Answer applied");
        Ok(())
    }

    /// Apply a remote candidate; candidates for unknown peers are dropped
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the candidate
    pub async fn handle_ice_candidate(
        &self,
        peer_id: &PeerId,
        candidate: IceCandidate,
    ) -> Result<(), ControllerError> {
        let Some(handle) = self.link_handle(peer_id) else {
            tracing::debug!(peer_id = %peer_id, "Dropping candidate for unknown peer");
            return Ok(());
        };
        tracing::trace!(peer_id = %peer_id, candidate = %candidate.candidate, "Remote candidate");
        handle.add_ice_candidate(candidate).await.map_err(|e| {
            tracing::warn!(peer_id = %peer_id, error = %e, "Candidate rejected");
            ControllerError::Engine(e)
        })
    }

    /// Republish a remote participant's status
    pub fn handle_remote_status(&self, peer_id: &PeerId, status: RemoteStatus) {
        let event = match status {
            RemoteStatus::Muted(muted) => SessionEvent::RemoteMuteChanged {
                peer_id: peer_id.clone(),
                muted,
            },
            RemoteStatus::Video(enabled) => SessionEvent::RemoteVideoChanged {
                peer_id: peer_id.clone(),
                enabled,
            },
        };
        self.inner.events.emit(event);
    }

    /// Tear every peer down and announce presence again
    ///
    /// # Errors
    ///
    /// Returns error if the join announcement cannot be sent
    #[tracing::instrument(skip(self))]
    pub async fn handle_signaling_reconnected(&self) -> Result<(), ControllerError> {
        let Some(channel) = self.channel() else {
            return Ok(());
        };
        tracing::info!("Signaling reconnected, re-establishing all peers");
        self.teardown_peers(true).await;
        self.inner
            .signaling
            .send(&channel, &OutboundSignal::Join)
            .await?;
        Ok(())
    }

    // ---- peer links ----

    async fn connect_to_peer(
        &self,
        peer_id: &PeerId,
        username: Option<String>,
        polite: bool,
    ) -> Result<(), ControllerError> {
        if !self.is_joined() {
            return Err(ControllerError::NoSession);
        }
        self.create_peer_link(peer_id, username, polite, true).await?;
        self.offer_to(peer_id, false).await?;
        Ok(())
    }

    async fn create_peer_link(
        &self,
        peer_id: &PeerId,
        username: Option<String>,
        polite: bool,
        announce: bool,
    ) -> Result<Arc<dyn PeerLinkHandle>, ControllerError> {
        let handle = self.inner.engine.create_peer_link(&self.inner.ice).await?;
        for track in self.local_tracks() {
            if let Err(e) = handle.add_track(track).await {
                handle.close().await;
                return Err(e.into());
            }
        }

        let mut link = PeerLink::new(peer_id.clone(), username.clone(), handle.clone());
        link.polite = polite;
        self.bind_link_events(peer_id.clone(), &handle, link.bindings());
        let previous = self.inner.peers.write().insert(peer_id.clone(), link);
        if let Some(previous) = previous {
            tracing::debug!(peer_id = %peer_id, "Replacing existing peer link");
            previous.close().await;
        }
        self.inner
            .ice_recovery
            .lock()
            .entry(peer_id.clone())
            .or_default();

        tracing::info!(peer_id = %peer_id, "Peer link created");
        if announce {
            self.inner.events.emit(SessionEvent::PeerJoined {
                peer_id: peer_id.clone(),
                username,
            });
        }
        Ok(handle)
    }

    async fn recreate_peer_link(&self, peer_id: &PeerId) -> Result<(), ControllerError> {
        if !self.is_joined() {
            return Err(ControllerError::NoSession);
        }
        let previous = self.inner.peers.write().remove(peer_id);
        let username = previous.as_ref().and_then(|l| l.username.clone());
        let polite = previous.as_ref().map_or(true, |l| l.polite);
        self.inner.monitor.stop_monitoring(peer_id);
        if let Some(previous) = previous {
            previous.close().await;
        }

        self.create_peer_link(peer_id, username, polite, false).await?;
        self.offer_to(peer_id, true).await?;
        Ok(())
    }

    async fn cleanup_peer(&self, peer_id: &PeerId, notify: bool) -> bool {
        let link = self.inner.peers.write().remove(peer_id);
        self.inner.monitor.stop_monitoring(peer_id);
        self.inner.reconnection.cancel_reconnection(peer_id);
        self.inner.ice_recovery.lock().remove(peer_id);

        let Some(link) = link else {
            return false;
        };
        link.close().await;
        tracing::info!(peer_id = %peer_id, "Peer link removed");
        if notify {
            self.inner.events.emit(SessionEvent::PeerLeft {
                peer_id: peer_id.clone(),
            });
        }
        true
    }

    fn bind_link_events(
        &self,
        peer_id: PeerId,
        handle: &Arc<dyn PeerLinkHandle>,
        token: CancellationToken,
    ) {
        let mut events = handle.subscribe();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { return };
                        Self { inner }.handle_link_event(&peer_id, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(peer_id = %peer_id, skipped, "Link events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn handle_link_event(&self, peer_id: &PeerId, event: LinkEvent) {
        match event {
            LinkEvent::NegotiationStateChanged(state) => {
                tracing::debug!(peer_id = %peer_id, %state, "Negotiation state changed");
            }
            LinkEvent::TransportStateChanged(state) => {
                self.handle_transport_state(peer_id, state).await;
            }
            LinkEvent::IceConnectionStateChanged(state) => {
                tracing::debug!(peer_id = %peer_id, ?state, "ICE state changed");
                if state == IceConnectionState::Failed {
                    if let Err(e) = self.handle_ice_failure(peer_id).await {
                        tracing::warn!(peer_id = %peer_id, error = %e, "ICE fallback failed");
                    }
                }
            }
            LinkEvent::IceCandidate(candidate) => {
                tracing::trace!(peer_id = %peer_id, candidate = %candidate.candidate, "Local candidate");
                if let Err(e) = self
                    .send_signal(OutboundSignal::IceCandidate {
                        target_user_id: peer_id.clone(),
                        candidate,
                    })
                    .await
                {
                    tracing::debug!(peer_id = %peer_id, error = %e, "Failed to send candidate");
                }
            }
            LinkEvent::NegotiationNeeded => {
                if let Err(e) = self.renegotiate(peer_id).await {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Renegotiation failed");
                }
            }
            LinkEvent::RemoteTrack { track_id, kind } => {
                tracing::info!(peer_id = %peer_id, %track_id, ?kind, "Remote track added");
                self.inner.events.emit(SessionEvent::RemoteStreamAdded {
                    peer_id: peer_id.clone(),
                    track_id,
                    kind,
                });
            }
        }
    }

    async fn handle_transport_state(&self, peer_id: &PeerId, state: TransportState) {
        self.inner.events.emit(SessionEvent::ConnectionStateChanged {
            peer_id: peer_id.clone(),
            state,
        });

        match state {
            TransportState::Connected => {
                let handle = self.inner.peers.write().get_mut(peer_id).map(|link| {
                    link.mark_established();
                    link.handle.clone()
                });
                let Some(handle) = handle else { return };
                tracing::info!(peer_id = %peer_id, "Peer connected");
                self.inner.reconnection.reset_reconnection_state(peer_id);
                if let Some(record) = self.inner.ice_recovery.lock().get_mut(peer_id) {
                    record.next_stage = FallbackStage::IceRestart;
                }
                self.inner.monitor.start_monitoring(peer_id.clone(), handle);
            }
            TransportState::Disconnected | TransportState::Failed => {
                tracing::warn!(peer_id = %peer_id, %state, "Peer transport lost");
                self.inner
                    .reconnection
                    .schedule_reconnection(peer_id.clone());
            }
            TransportState::Closed => {
                self.cleanup_peer(peer_id, true).await;
            }
            TransportState::New | TransportState::Connecting => {}
        }
    }

    // ---- negotiation ----

    /// Send a fresh offer if the link can take one
    ///
    /// Skipped (returns `false`) unless the negotiation state is `stable` or
    /// `have-local-offer` and no other cycle is in flight for the peer.
    ///
    /// # Errors
    ///
    /// Returns error if the peer is unknown or a negotiation step fails
    pub async fn renegotiate(&self, peer_id: &PeerId) -> Result<bool, ControllerError> {
        let claim = {
            let peers = self.inner.peers.read();
            let link = peers
                .get(peer_id)
                .ok_or_else(|| ControllerError::UnknownPeer(peer_id.clone()))?;
            let state = link.negotiation_state();
            if !state.allows_renegotiation() {
                tracing::debug!(peer_id = %peer_id, %state, "Renegotiation skipped");
                return Ok(false);
            }
            link.try_begin_negotiation()
                .map(|guard| (guard, link.handle.clone()))
        };

        let Some((_guard, handle)) = claim else {
            tracing::debug!(peer_id = %peer_id, "Negotiation already in flight");
            return Ok(false);
        };
        self.send_offer(peer_id, handle.as_ref(), false).await?;
        Ok(true)
    }

    async fn offer_to(&self, peer_id: &PeerId, ice_restart: bool) -> Result<bool, ControllerError> {
        let claim = {
            let peers = self.inner.peers.read();
            let link = peers
                .get(peer_id)
                .ok_or_else(|| ControllerError::UnknownPeer(peer_id.clone()))?;
            link.try_begin_negotiation()
                .map(|guard| (guard, link.handle.clone()))
        };

        let Some((_guard, handle)) = claim else {
            tracing::debug!(peer_id = %peer_id, ice_restart, "Negotiation already in flight");
            return Ok(false);
        };
        self.send_offer(peer_id, handle.as_ref(), ice_restart).await?;
        Ok(true)
    }

    async fn send_offer(
        &self,
        peer_id: &PeerId,
        handle: &dyn PeerLinkHandle,
        ice_restart: bool,
    ) -> Result<(), ControllerError> {
        let offer = handle
            .create_offer(ice_restart)
            .await
            .map_err(|e| negotiation_error(peer_id, handle, e))?;
        handle
            .set_local_description(offer.clone())
            .await
            .map_err(|e| negotiation_error(peer_id, handle, e))?;
        self.send_signal(OutboundSignal::Offer {
            target_user_id: peer_id.clone(),
            offer,
        })
        .await?;
        tracing::debug!(peer_id = %peer_id, ice_restart, "Offer sent");
        Ok(())
    }

    async fn send_signal(&self, signal: OutboundSignal) -> Result<(), ControllerError> {
        let channel = self.channel().ok_or(ControllerError::NoSession)?;
        self.inner.signaling.send(&channel, &signal).await?;
        Ok(())
    }

    /// Wait until a peer's negotiation settles
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::StableTimeout`] after the configured wait,
    /// or an engine error if the link closes
    pub async fn wait_for_stable(&self, peer_id: &PeerId) -> Result<(), ControllerError> {
        let handle = self
            .link_handle(peer_id)
            .ok_or_else(|| ControllerError::UnknownPeer(peer_id.clone()))?;
        self.wait_for_stable_link(peer_id, &handle).await
    }

    async fn wait_for_stable_link(
        &self,
        peer_id: &PeerId,
        handle: &Arc<dyn PeerLinkHandle>,
    ) -> Result<(), ControllerError> {
        let mut events = handle.subscribe();
        let settled = async {
            loop {
                match handle.negotiation_state() {
                    NegotiationState::Stable | NegotiationState::New => return Ok(()),
                    NegotiationState::Closed => return Err(EngineError::Closed),
                    _ => {}
                }
                match events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Err(EngineError::Closed),
                }
            }
        };

        match tokio::time::timeout(self.inner.config.stable_wait_timeout, settled).await {
            Ok(result) => result.map_err(ControllerError::from),
            Err(_) => {
                tracing::warn!(
                    peer_id = %peer_id,
                    state = %handle.negotiation_state(),
                    "Negotiation did not settle in time"
                );
                Err(ControllerError::StableTimeout(peer_id.clone()))
            }
        }
    }

    // ---- transport recovery ----

    async fn handle_ice_failure(&self, peer_id: &PeerId) -> Result<(), ControllerError> {
        let stage = self
            .inner
            .ice_recovery
            .lock()
            .entry(peer_id.clone())
            .or_default()
            .escalate(self.inner.ice.relay_available());
        tracing::warn!(peer_id = %peer_id, ?stage, "ICE failed, applying fallback");
        self.apply_fallback(peer_id, stage).await
    }

    async fn apply_fallback(
        &self,
        peer_id: &PeerId,
        stage: FallbackStage,
    ) -> Result<(), ControllerError> {
        let handle = self
            .link_handle(peer_id)
            .ok_or_else(|| ControllerError::UnknownPeer(peer_id.clone()))?;

        let (ice, relay_only) = match stage {
            FallbackStage::Reconnect => {
                self.inner
                    .reconnection
                    .schedule_reconnection(peer_id.clone());
                return Ok(());
            }
            FallbackStage::IceRestart => match self.inner.ice.relay_only() {
                Some(relay) if self.is_relay_only(peer_id) => (relay, true),
                _ => (self.inner.ice.clone(), false),
            },
            FallbackStage::RelayOnly => match self.inner.ice.relay_only() {
                Some(relay) => (relay, true),
                None => {
                    tracing::warn!(peer_id = %peer_id, "No relay configured, using STUN only");
                    (self.inner.ice.stun_only(), false)
                }
            },
            FallbackStage::StunOnly => (self.inner.ice.stun_only(), false),
        };

        tracing::info!(peer_id = %peer_id, ?stage, relay_only, "Applying transport fallback");
        handle.set_configuration(&ice).await?;
        self.set_relay_flag(peer_id, relay_only);
        self.offer_to(peer_id, true).await?;
        Ok(())
    }

    /// React to the host network going up or down
    ///
    /// On restore, links that can restart ICE do so; failed or never
    /// connected links go to full reconnection.
    #[tracing::instrument(skip(self))]
    pub async fn handle_network_change(&self, status: NetworkStatus) {
        self.inner.events.emit(SessionEvent::NetworkChanged(status));
        if status == NetworkStatus::Offline {
            tracing::warn!("Network lost");
            return;
        }
        tracing::info!("Network restored, restarting transports");

        for (peer_id, handle) in self.link_handles() {
            let state = handle.transport_state();
            if state.supports_ice_restart() {
                if let Some(record) = self.inner.ice_recovery.lock().get_mut(&peer_id) {
                    record.restarts += 1;
                }
                if let Err(e) = self.apply_fallback(&peer_id, FallbackStage::IceRestart).await {
                    tracing::warn!(peer_id = %peer_id, error = %e, "ICE restart failed, reconnecting");
                    self.inner
                        .reconnection
                        .schedule_reconnection(peer_id.clone());
                }
            } else if matches!(state, TransportState::Failed | TransportState::New) {
                self.inner.reconnection.schedule_reconnection(peer_id);
            }
        }
    }

    /// Record application backgrounding
    ///
    /// Coming back to the foreground runs an immediate health check with
    /// auto-recovery.
    pub async fn set_background_mode(&self, background: bool) {
        let previous = {
            let mut session = self.inner.session.write();
            match session.as_mut() {
                Some(session) => session.set_background(background),
                None => return,
            }
        };
        self.inner
            .events
            .emit(SessionEvent::BackgroundModeActive(background));

        if previous && !background {
            tracing::info!("Returned to foreground, checking peers");
            let report = self.run_health_check();
            self.auto_recover(&report).await;
        }
    }

    // ---- local media ----

    /// Flip the microphone's enabled flag and broadcast it
    ///
    /// Returns the new muted state.
    ///
    /// # Errors
    ///
    /// Returns error if not joined or the session has no microphone
    pub async fn toggle_mute(&self) -> Result<bool, ControllerError> {
        if !self.is_joined() {
            return Err(ControllerError::NoSession);
        }
        let audio = self.local_audio().ok_or(TrackError::NoTrack)?;
        let muted = audio.is_enabled();
        audio.set_enabled(!muted);
        tracing::info!(muted, "Microphone toggled");

        if let Err(e) = self
            .send_signal(OutboundSignal::MuteStatus { is_muted: muted })
            .await
        {
            tracing::warn!(error = %e, "Failed to broadcast mute status");
        }
        Ok(muted)
    }

    /// Switch the camera on or off
    ///
    /// The change is queued behind earlier track operations, so two quick
    /// toggles run one after the other and the second sees the first's
    /// result. Audio is never touched. Returns the new video state.
    ///
    /// # Errors
    ///
    /// Returns error if not joined or the operation fails
    pub async fn toggle_video(&self) -> Result<bool, ControllerError> {
        if !self.is_joined() {
            return Err(ControllerError::NoSession);
        }
        let enable = {
            let mut intent = self.inner.video_intent.lock();
            *intent = !*intent;
            *intent
        };

        let controller = self.clone();
        let operation = if enable {
            self.inner
                .tracks
                .queue_operation(OperationKind::AddVideo, move || async move {
                    controller.start_camera().await
                })
        } else {
            self.inner
                .tracks
                .queue_operation(OperationKind::RemoveVideo, move || async move {
                    controller.stop_video().await
                })
        };

        if let Err(e) = operation.wait().await {
            self.settle_failed_operation(&e);
            return Err(e.into());
        }
        Ok(enable)
    }

    /// Replace the outgoing video with a screen capture
    ///
    /// # Errors
    ///
    /// Returns error if not joined, capture fails or the switch fails
    pub async fn share_screen(&self) -> Result<(), ControllerError> {
        if !self.is_joined() {
            return Err(ControllerError::NoSession);
        }
        let controller = self.clone();
        let result = self
            .inner
            .tracks
            .queue_operation(OperationKind::StartScreenShare, move || async move {
                controller.start_screen_share().await
            })
            .wait()
            .await;
        match &result {
            Ok(()) => self.sync_video_intent(),
            Err(e) => self.settle_failed_operation(e),
        }
        result.map_err(ControllerError::from)
    }

    /// Stop screen sharing, restoring the camera if it was on before
    ///
    /// # Errors
    ///
    /// Returns error if not joined or the switch fails
    pub async fn stop_screen_share(&self) -> Result<(), ControllerError> {
        if !self.is_joined() {
            return Err(ControllerError::NoSession);
        }
        let controller = self.clone();
        let result = self
            .inner
            .tracks
            .queue_operation(OperationKind::StopScreenShare, move || async move {
                controller.end_screen_share().await
            })
            .wait()
            .await;
        match &result {
            Ok(()) => self.sync_video_intent(),
            Err(e) => self.settle_failed_operation(e),
        }
        result.map_err(ControllerError::from)
    }

    /// Re-apply the local video intent to every drifted peer
    ///
    /// Runs through the track queue so it never overlaps a video change.
    ///
    /// # Errors
    ///
    /// Returns error if the queued operation fails or is cancelled
    pub async fn synchronize_video_state(&self) -> Result<SyncReport, ControllerError> {
        let slot = Arc::new(Mutex::new(SyncReport::default()));
        let out = slot.clone();
        let controller = self.clone();
        self.inner
            .tracks
            .queue_operation(OperationKind::ReplaceTrack, move || async move {
                *out.lock() = controller.synchronize_now().await;
                Ok(())
            })
            .wait()
            .await?;
        let report = slot.lock().clone();
        Ok(report)
    }

    async fn synchronize_now(&self) -> SyncReport {
        let state = self.inner.tracks.current_track_state();
        self.inner
            .sync
            .synchronize_state(&self.link_handles(), state.track.as_ref(), state.active)
            .await
    }

    async fn capture_camera(&self) -> Result<Arc<dyn LocalTrack>, TrackError> {
        let media = acquire_local_media(
            self.inner.engine.as_ref(),
            CaptureConstraints::camera_only(),
            &self.inner.config.media_retry,
        )
        .await
        .map_err(|e| {
            self.inner.events.emit_error(
                e.user_message(),
                ErrorSeverity::Warning,
                e.recommended_action(),
                None,
            );
            e
        })?;
        media.video.ok_or(TrackError::NoTrack)
    }

    async fn start_camera(&self) -> Result<(), TrackError> {
        let state = self.inner.tracks.current_track_state();
        if state.active && state.source == VideoSource::Camera {
            return Ok(());
        }
        let camera = PendingTrack::new(self.capture_camera().await?);
        self.switch_video(VideoSource::Camera, camera).await
    }

    async fn stop_video(&self) -> Result<(), TrackError> {
        if !self.inner.tracks.is_video_active() {
            return Ok(());
        }
        self.set_resume_camera(false);
        self.switch_video(VideoSource::None, PendingTrack::none()).await
    }

    async fn start_screen_share(&self) -> Result<(), TrackError> {
        let state = self.inner.tracks.current_track_state();
        if state.active && state.source == VideoSource::Screen {
            return Ok(());
        }
        let screen = self.inner.engine.capture_screen().await.map_err(|e| {
            self.inner.events.emit_error(
                e.user_message(),
                ErrorSeverity::Warning,
                e.recommended_action(),
                None,
            );
            e
        })?;
        let screen = PendingTrack::new(screen);
        self.set_resume_camera(state.active && state.source == VideoSource::Camera);
        self.switch_video(VideoSource::Screen, screen).await
    }

    async fn end_screen_share(&self) -> Result<(), TrackError> {
        if self.inner.tracks.current_track_state().source != VideoSource::Screen {
            return Ok(());
        }
        if self.resume_camera() {
            self.set_resume_camera(false);
            match self.capture_camera().await {
                Ok(camera) => {
                    return self
                        .switch_video(VideoSource::Camera, PendingTrack::new(camera))
                        .await
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Could not restore camera after screen share");
                }
            }
        }
        self.switch_video(VideoSource::None, PendingTrack::none()).await
    }

    /// Fan a new video track (or none) out to every link, then record it
    ///
    /// Per-peer failures get a targeted repair pass; if that fails too the
    /// previous state is restored, and as a last resort video is disabled.
    async fn switch_video(
        &self,
        source: VideoSource,
        track: PendingTrack,
    ) -> Result<(), TrackError> {
        let snapshot = self.inner.tracks.save_state_snapshot();
        let active = track.get().is_some();

        let failures = self.fan_out_video(track.get()).await;
        let mut outcome = Ok(());
        if failures.is_empty() {
            self.inner
                .tracks
                .update_track_state(source, track.commit(), active);
        } else {
            tracing::warn!(failed = failures.len(), "Video update failed on some peers, repairing");
            let repair = self
                .inner
                .sync
                .synchronize_state(&self.link_handles(), track.get(), active)
                .await;
            if repair.failed.is_empty() {
                self.inner
                    .tracks
                    .update_track_state(source, track.commit(), active);
            } else {
                drop(track);
                self.roll_back_video(snapshot).await;
                outcome = Err(TrackError::Failed(format!(
                    "video update failed for {} peers",
                    repair.failed.len()
                )));
            }
        }

        let state = self.inner.tracks.current_track_state();
        if let Err(e) = self
            .send_signal(OutboundSignal::VideoStatus {
                is_video_enabled: state.active,
            })
            .await
        {
            tracing::debug!(error = %e, "Failed to broadcast video status");
        }
        self.inner.events.emit(SessionEvent::VideoStateChanged {
            active: state.active,
            source: state.source,
        });
        outcome
    }

    async fn roll_back_video(&self, snapshot: TrackStateSnapshot) {
        let previous = snapshot.state().clone();
        self.inner.tracks.restore_state_snapshot(snapshot);
        let report = self
            .inner
            .sync
            .synchronize_state(&self.link_handles(), previous.track.as_ref(), previous.active)
            .await;
        if report.failed.is_empty() {
            tracing::info!("Previous video state restored");
            return;
        }

        tracing::warn!("Could not restore previous video state, disabling video");
        self.inner
            .sync
            .synchronize_state(&self.link_handles(), None, false)
            .await;
        self.inner
            .tracks
            .update_track_state(VideoSource::None, None, false);
        *self.inner.video_intent.lock() = false;
        self.inner.events.emit_error(
            "Video was turned off after a failure.",
            ErrorSeverity::Warning,
            RecommendedAction::Retry,
            None,
        );
    }

    /// Update every live link at once; a link still negotiating holds the
    /// fan-out for at most one stable-state wait
    async fn fan_out_video(&self, track: Option<&Arc<dyn LocalTrack>>) -> Vec<(PeerId, String)> {
        let updates = self
            .link_handles()
            .into_iter()
            .filter(|(_, handle)| !handle.transport_state().is_stale())
            .map(|(peer_id, handle)| async move {
                let result = match track {
                    Some(track) => {
                        self.attach_track(&peer_id, &handle, MediaKind::Video, track.clone())
                            .await
                    }
                    None => match find_sender(handle.as_ref(), MediaKind::Video) {
                        Some(sender) => {
                            sender.replace_track(None).await.map_err(ControllerError::from)
                        }
                        None => Ok(()),
                    },
                };
                result.map_err(|e| {
                    tracing::warn!(peer_id = %peer_id, error = %e, "Failed to update video sender");
                    (peer_id, e.to_string())
                })
            });

        join_all(updates)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }

    async fn attach_track(
        &self,
        peer_id: &PeerId,
        handle: &Arc<dyn PeerLinkHandle>,
        kind: MediaKind,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), ControllerError> {
        match find_sender(handle.as_ref(), kind) {
            Some(sender) => sender.replace_track(Some(track)).await?,
            None => {
                self.wait_for_stable_link(peer_id, handle).await?;
                handle.add_track(track).await?;
            }
        }
        Ok(())
    }

    // ---- health ----

    /// Assess every peer link and publish the report
    #[must_use]
    pub fn run_health_check(&self) -> HealthReport {
        let audio = self.local_audio();
        let video = self.inner.tracks.current_track_state();
        let expect = HealthExpectations {
            audio_track: audio.as_ref(),
            video_track: video.track.as_ref(),
            video_enabled: video.active,
            relay_available: self.inner.ice.relay_available(),
        };

        let links: Vec<(PeerId, Arc<dyn PeerLinkHandle>, bool)> = self
            .inner
            .peers
            .read()
            .iter()
            .map(|(id, link)| (id.clone(), link.handle.clone(), link.relay_only))
            .collect();
        let peers = links
            .iter()
            .map(|(peer_id, handle, relay_only)| {
                let quality = self.inner.monitor.quality(peer_id);
                assess_peer(peer_id, handle.as_ref(), *relay_only, quality.as_ref(), &expect)
            })
            .collect();

        let report = HealthReport::new(peers);
        tracing::debug!(
            peers = report.peers.len(),
            unhealthy = report.unhealthy().count(),
            "Health check completed"
        );
        self.inner
            .events
            .emit(SessionEvent::HealthCheckCompleted(report.clone()));
        report
    }

    /// Execute the recommendations of a health report
    ///
    /// Failures are published as warnings and never stop the remaining
    /// peers. Returns the number of actions that succeeded.
    pub async fn auto_recover(&self, report: &HealthReport) -> usize {
        let mut applied = 0;
        for peer in report.unhealthy() {
            for recommendation in &peer.recommendations {
                match self
                    .apply_recommendation(&peer.peer_id, *recommendation)
                    .await
                {
                    Ok(()) => {
                        tracing::info!(peer_id = %peer.peer_id, ?recommendation, "Recovery action applied");
                        applied += 1;
                    }
                    Err(e) => {
                        tracing::warn!(peer_id = %peer.peer_id, ?recommendation, error = %e, "Recovery action failed");
                        self.inner.events.emit_error(
                            format!("Automatic recovery for {} failed.", peer.peer_id),
                            ErrorSeverity::Warning,
                            RecommendedAction::Reconnect,
                            Some(peer.peer_id.clone()),
                        );
                    }
                }
            }
        }
        applied
    }

    async fn apply_recommendation(
        &self,
        peer_id: &PeerId,
        recommendation: HealthRecommendation,
    ) -> Result<(), ControllerError> {
        let handle = self
            .link_handle(peer_id)
            .ok_or_else(|| ControllerError::UnknownPeer(peer_id.clone()))?;

        match recommendation {
            HealthRecommendation::RecreateAudioSender => {
                let audio = self.live_audio().await?;
                self.attach_track(peer_id, &handle, MediaKind::Audio, audio)
                    .await
            }
            HealthRecommendation::RecreateVideoSender | HealthRecommendation::ReplaceVideoTrack => {
                let video = self.inner.tracks.video_track().ok_or(TrackError::NoTrack)?;
                if video.is_live() {
                    self.attach_track(peer_id, &handle, MediaKind::Video, video)
                        .await
                } else {
                    self.recapture_video().await
                }
            }
            HealthRecommendation::TriggerRelayFallback => {
                self.apply_fallback(peer_id, FallbackStage::RelayOnly).await
            }
            HealthRecommendation::TriggerIceRestart => {
                self.apply_fallback(peer_id, FallbackStage::IceRestart).await
            }
            HealthRecommendation::TriggerReconnection => {
                self.inner
                    .reconnection
                    .schedule_reconnection(peer_id.clone());
                Ok(())
            }
        }
    }

    /// Replace a dead video track through the track queue
    async fn recapture_video(&self) -> Result<(), ControllerError> {
        let controller = self.clone();
        let result = self
            .inner
            .tracks
            .queue_operation(OperationKind::ReplaceTrack, move || async move {
                controller.replace_dead_video().await
            })
            .wait()
            .await;
        self.sync_video_intent();
        result.map_err(ControllerError::from)
    }

    async fn replace_dead_video(&self) -> Result<(), TrackError> {
        let state = self.inner.tracks.current_track_state();
        let Some(current) = state.track.filter(|_| state.active) else {
            return Ok(());
        };
        if current.is_live() {
            // an earlier peer's action already replaced it
            let report = self.synchronize_now().await;
            return match report.failed.len() {
                0 => Ok(()),
                n => Err(TrackError::Failed(format!("video sync failed for {n} peers"))),
            };
        }

        tracing::warn!(track_id = current.id(), source = ?state.source, "Video track ended");
        match state.source {
            VideoSource::Screen => self.end_screen_share().await,
            VideoSource::Camera => match self.capture_camera().await {
                Ok(camera) => {
                    tracing::info!(track_id = camera.id(), "Camera recaptured");
                    self.switch_video(VideoSource::Camera, PendingTrack::new(camera))
                        .await
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Could not recapture camera, disabling video");
                    self.switch_video(VideoSource::None, PendingTrack::none())
                        .await?;
                    self.inner.events.emit_error(
                        "Video was turned off after the camera stopped.",
                        ErrorSeverity::Warning,
                        RecommendedAction::CheckDevice,
                        None,
                    );
                    Ok(())
                }
            },
            VideoSource::None => Ok(()),
        }
    }

    /// Microphone track, recaptured if the current one died
    async fn live_audio(&self) -> Result<Arc<dyn LocalTrack>, ControllerError> {
        if let Some(audio) = self.local_audio().filter(|t| t.is_live()) {
            return Ok(audio);
        }
        let media = acquire_local_media(
            self.inner.engine.as_ref(),
            CaptureConstraints::audio_only(),
            &self.inner.config.media_retry,
        )
        .await?;
        let audio = media.audio.ok_or(TrackError::NoTrack)?;
        let muted = self.is_muted().unwrap_or(false);
        audio.set_enabled(!muted);

        let replaced = {
            let mut session = self.inner.session.write();
            let session = session.as_mut().ok_or(ControllerError::NoSession)?;
            session.replace_audio(audio.clone())
        };
        if let Some(old) = replaced {
            old.stop();
        }
        tracing::info!(track_id = audio.id(), "Microphone recaptured");
        Ok(audio)
    }
}

impl std::fmt::Debug for PeerLifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLifecycleController")
            .field("channel", &self.channel())
            .field("peers", &self.peer_ids())
            .field("video", &self.video_state())
            .finish()
    }
}

/// Exclusive claim on joining, released on drop
struct JoinReservation<'a>(&'a AtomicBool);

impl<'a> JoinReservation<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for JoinReservation<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Captured track not yet handed to the Track Manager
///
/// Stopped on drop unless committed, so a cancelled or timed-out operation
/// releases the device.
struct PendingTrack(Option<Arc<dyn LocalTrack>>);

impl PendingTrack {
    fn new(track: Arc<dyn LocalTrack>) -> Self {
        Self(Some(track))
    }

    fn none() -> Self {
        Self(None)
    }

    fn get(&self) -> Option<&Arc<dyn LocalTrack>> {
        self.0.as_ref()
    }

    fn commit(mut self) -> Option<Arc<dyn LocalTrack>> {
        self.0.take()
    }
}

impl Drop for PendingTrack {
    fn drop(&mut self) {
        if let Some(track) = self.0.take() {
            tracing::debug!(track_id = track.id(), "Releasing uncommitted track");
            track.stop();
        }
    }
}

fn negotiation_error(
    peer_id: &PeerId,
    handle: &dyn PeerLinkHandle,
    source: EngineError,
) -> ControllerError {
    let state = handle.negotiation_state();
    tracing::warn!(peer_id = %peer_id, %state, error = %source, "Negotiation step failed");
    ControllerError::Negotiation {
        peer_id: peer_id.clone(),
        state,
        source,
    }
}

/// Reconnection hook; holds the controller weakly
struct LinkRebuilder {
    inner: Weak<ControllerInner>,
}

impl LinkRebuilder {
    fn controller(&self) -> Option<PeerLifecycleController> {
        self.inner
            .upgrade()
            .map(|inner| PeerLifecycleController { inner })
    }
}

#[async_trait]
impl PeerReconnector for LinkRebuilder {
    async fn wait_for_signaling(&self, timeout: Duration) -> Result<(), SignalingError> {
        let controller = self.controller().ok_or(SignalingError::Closed)?;
        controller.inner.signaling.wait_for_connection(timeout).await
    }

    async fn recreate_peer_link(&self, peer_id: &PeerId) -> Result<(), ReconnectionError> {
        let controller = self.controller().ok_or(ReconnectionError::Cancelled)?;
        controller
            .recreate_peer_link(peer_id)
            .await
            .map_err(|e| ReconnectionError::RecreateFailed(e.to_string()))
    }

    async fn abandon_peer(&self, peer_id: &PeerId) {
        let Some(controller) = self.controller() else {
            return;
        };
        controller.cleanup_peer(peer_id, false).await;
        controller.inner.events.emit(SessionEvent::PeerLeft {
            peer_id: peer_id.clone(),
        });
        controller.inner.events.emit_error(
            format!("Lost connection to {peer_id}."),
            ErrorSeverity::Warning,
            RecommendedAction::Reconnect,
            Some(peer_id.clone()),
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{MockEngine, MockSignaling};

    fn controller() -> (PeerLifecycleController, Arc<MockEngine>, Arc<MockSignaling>) {
        let engine = Arc::new(MockEngine::new());
        let signaling = Arc::new(MockSignaling::new());
        let config = SessionConfig {
            health_check_interval: None,
            ..SessionConfig::default()
        };
        let controller =
            PeerLifecycleController::new(config, engine.clone(), signaling.clone()).unwrap();
        (controller, engine, signaling)
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_empty_channel() {
        let (controller, _engine, signaling) = controller();
        let report = controller
            .join(ChannelId::new("c"), false)
            .await
            .unwrap();
        assert_eq!(report, RosterReport::default());
        assert!(controller.is_joined());
        assert_eq!(
            signaling.sent(),
            vec![(ChannelId::new("c"), OutboundSignal::Join)]
        );
        assert!(matches!(
            controller.join(ChannelId::new("d"), false).await,
            Err(ControllerError::AlreadyJoined(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_joins_capture_once() {
        let (controller, engine, signaling) = controller();
        engine.set_capture_delay(Duration::from_millis(500));

        let (first, second) = tokio::join!(
            controller.join(ChannelId::new("c"), false),
            controller.join(ChannelId::new("d"), false),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(ControllerError::JoinInProgress)));
        assert_eq!(engine.capture_calls(), 1);
        assert_eq!(controller.channel(), Some(ChannelId::new("c")));
        assert_eq!(
            signaling.sent(),
            vec![(ChannelId::new("c"), OutboundSignal::Join)]
        );

        // the reservation is released once the join completes
        controller.leave().await.unwrap();
        controller.join(ChannelId::new("d"), false).await.unwrap();
        assert_eq!(controller.channel(), Some(ChannelId::new("d")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_fails_on_permission_denied() {
        let (controller, engine, _signaling) = controller();
        let mut events = controller.subscribe();
        engine.fail_next_captures(vec![MediaError::PermissionDenied("no".into())]);

        let res = controller.join(ChannelId::new("c"), true).await;
        assert!(matches!(
            res,
            Err(ControllerError::Media(MediaError::PermissionDenied(_)))
        ));
        assert!(!controller.is_joined());
        match events.recv().await.unwrap() {
            SessionEvent::Error(e) => {
                assert_eq!(e.severity, ErrorSeverity::Error);
                assert_eq!(e.action, RecommendedAction::CheckPermissions);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_from_unknown_peer() {
        let (controller, _engine, _signaling) = controller();
        controller.join(ChannelId::new("c"), false).await.unwrap();
        let res = controller
            .handle_answer(&PeerId::new("ghost"), SessionDescription::answer("v=0"))
            .await;
        assert!(matches!(res, Err(ControllerError::UnknownPeer(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidate_for_unknown_peer_is_dropped() {
        let (controller, _engine, _signaling) = controller();
        controller.join(ChannelId::new("c"), false).await.unwrap();
        controller
            .handle_ice_candidate(
                &PeerId::new("ghost"),
                IceCandidate {
                    candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_mute_broadcasts_status() {
        let (controller, _engine, signaling) = controller();
        controller.join(ChannelId::new("c"), false).await.unwrap();

        assert!(controller.toggle_mute().await.unwrap());
        assert_eq!(controller.is_muted(), Some(true));
        assert!(!controller.toggle_mute().await.unwrap());

        let statuses: Vec<_> = signaling
            .sent()
            .into_iter()
            .filter_map(|(_, s)| match s {
                OutboundSignal::MuteStatus { is_muted } => Some(is_muted),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_require_session() {
        let (controller, _engine, _signaling) = controller();
        assert!(matches!(controller.leave().await, Err(ControllerError::NoSession)));
        assert!(matches!(
            controller.toggle_video().await,
            Err(ControllerError::NoSession)
        ));
        assert!(matches!(
            controller.share_screen().await,
            Err(ControllerError::NoSession)
        ));
    }
}
