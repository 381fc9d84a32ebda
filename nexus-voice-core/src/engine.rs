//! Real-time media engine capability interface
//!
//! The peer lifecycle layer never creates sockets, gathers candidates or
//! encodes media itself. Everything it needs from the platform's media stack
//! is expressed by the traits in this module, so the same orchestration code
//! runs against a browser bridge, a native WebRTC stack or the in-memory
//! engine used in tests.

use crate::ice::IceConfiguration;
use crate::media::{CaptureConstraints, MediaError};
use crate::types::{
    IceCandidate, IceConnectionState, LinkStats, MediaKind, NegotiationState, SessionDescription,
    TransportState,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors reported by the media engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Operation not valid in the link's current negotiation state
    #[error("Invalid negotiation state: {0}")]
    InvalidState(String),

    /// Session description could not be parsed or applied
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// ICE candidate rejected
    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    /// Sender-level operation failed
    #[error("Sender operation failed: {0}")]
    SenderFailed(String),

    /// Link already closed
    #[error("Peer link closed")]
    Closed,

    /// Any other engine failure
    #[error("Engine error: {0}")]
    Other(String),
}

/// A locally captured media track
pub trait LocalTrack: Send + Sync {
    /// Stable track identifier
    fn id(&self) -> &str;

    /// Audio or video
    fn kind(&self) -> MediaKind;

    /// Whether the track currently produces media (mute flag)
    fn is_enabled(&self) -> bool;

    /// Toggle media production without releasing the device
    fn set_enabled(&self, enabled: bool);

    /// Whether the track is still attached to its capture device
    fn is_live(&self) -> bool;

    /// Release the capture device; the track is dead afterwards
    fn stop(&self);
}

impl std::fmt::Debug for dyn LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Whether two track handles refer to the same track
#[must_use]
pub fn same_track(a: &Arc<dyn LocalTrack>, b: &Arc<dyn LocalTrack>) -> bool {
    a.id() == b.id()
}

/// Outgoing-track slot of a peer link
#[async_trait]
pub trait RtpSender: Send + Sync {
    /// Media kind of the slot, independent of whether a track is attached
    fn kind(&self) -> MediaKind;

    /// Track currently attached, if any
    fn track(&self) -> Option<Arc<dyn LocalTrack>>;

    /// Swap the attached track without renegotiation
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the replacement
    async fn replace_track(&self, track: Option<Arc<dyn LocalTrack>>) -> Result<(), EngineError>;
}

/// Notifications emitted by a peer link
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Negotiation state changed
    NegotiationStateChanged(NegotiationState),
    /// Transport state changed
    TransportStateChanged(TransportState),
    /// ICE agent state changed
    IceConnectionStateChanged(IceConnectionState),
    /// A local candidate was gathered and must be sent to the remote side
    IceCandidate(IceCandidate),
    /// The local description needs to change (a track was added/removed)
    NegotiationNeeded,
    /// The remote side started sending a track
    RemoteTrack {
        /// Remote track identifier
        track_id: String,
        /// Media kind
        kind: MediaKind,
    },
}

/// Handle to one direct media connection
#[async_trait]
pub trait PeerLinkHandle: Send + Sync {
    /// Create an offer; `ice_restart` forces fresh ICE credentials
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError>;

    /// Create an answer for the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    /// Apply a local description (offer, answer or rollback)
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Add a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Attach a local track on a new sender slot
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<Arc<dyn RtpSender>, EngineError>;

    /// Detach a sender slot
    async fn remove_track(&self, sender: &Arc<dyn RtpSender>) -> Result<(), EngineError>;

    /// Current sender slots
    fn senders(&self) -> Vec<Arc<dyn RtpSender>>;

    /// Transport statistics snapshot
    async fn stats(&self) -> Result<LinkStats, EngineError>;

    /// Current negotiation state
    fn negotiation_state(&self) -> NegotiationState;

    /// Current transport state
    fn transport_state(&self) -> TransportState;

    /// Current ICE agent state
    fn ice_connection_state(&self) -> IceConnectionState;

    /// Replace the ICE server set/policy used for the next gathering
    async fn set_configuration(&self, ice: &IceConfiguration) -> Result<(), EngineError>;

    /// Subscribe to link notifications
    fn subscribe(&self) -> broadcast::Receiver<LinkEvent>;

    /// Close the link; further operations fail with [`EngineError::Closed`]
    async fn close(&self);
}

/// Factory for peer links and local capture
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a new peer link
    async fn create_peer_link(
        &self,
        ice: &IceConfiguration,
    ) -> Result<Arc<dyn PeerLinkHandle>, EngineError>;

    /// Capture microphone and/or camera
    async fn capture_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError>;

    /// Capture the screen as a video track
    async fn capture_screen(&self) -> Result<Arc<dyn LocalTrack>, MediaError>;
}

/// Find the first sender slot of the given kind
#[must_use]
pub fn find_sender(
    link: &dyn PeerLinkHandle,
    kind: MediaKind,
) -> Option<Arc<dyn RtpSender>> {
    link.senders().into_iter().find(|s| s.kind() == kind)
}
