//! Typed session events and the publish/subscribe registry

use crate::health::HealthReport;
use crate::sync::SyncReport;
use crate::types::{
    ConnectionQuality, MediaKind, NetworkStatus, PeerId, TransportState, VideoSource,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers lag rather than block
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Severity of a user-facing error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Informational
    Info,
    /// Degraded but usable
    Warning,
    /// Operation aborted
    Error,
}

/// What the user should do about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendedAction {
    /// Try the operation again
    Retry,
    /// Grant microphone/camera permission
    CheckPermissions,
    /// Check the capture device
    CheckDevice,
    /// Rejoin the channel
    Reconnect,
}

/// User-facing error payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionError {
    /// Human-readable message
    pub message: String,
    /// Severity
    pub severity: ErrorSeverity,
    /// Suggested action
    pub action: RecommendedAction,
    /// Peer concerned, if any
    pub peer_id: Option<PeerId>,
}

/// Events published to the application layer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Local capture finished
    LocalStreamReady {
        /// Microphone captured
        has_audio: bool,
        /// Camera captured
        has_video: bool,
    },
    /// A remote participant started sending media
    RemoteStreamAdded {
        /// Remote participant
        peer_id: PeerId,
        /// Remote track
        track_id: String,
        /// Media kind
        kind: MediaKind,
    },
    /// Peer link created for a participant
    PeerJoined {
        /// Remote participant
        peer_id: PeerId,
        /// Display name, when the relay provides one
        username: Option<String>,
    },
    /// Peer link destroyed
    PeerLeft {
        /// Remote participant
        peer_id: PeerId,
    },
    /// Transport state of a peer link changed
    ConnectionStateChanged {
        /// Remote participant
        peer_id: PeerId,
        /// New state
        state: TransportState,
    },
    /// Quality bucket or transport state of a link changed
    ConnectionQualityChanged {
        /// Remote participant
        peer_id: PeerId,
        /// New snapshot
        quality: ConnectionQuality,
    },
    /// A reconnection attempt was scheduled
    Reconnecting {
        /// Remote participant
        peer_id: PeerId,
        /// 1-based attempt number
        attempt: u32,
        /// Backoff before the attempt
        delay: Duration,
    },
    /// The peer was given up on
    ReconnectionFailed {
        /// Remote participant
        peer_id: PeerId,
        /// Attempts made
        attempts: u32,
    },
    /// Local video intent changed
    VideoStateChanged {
        /// Video on
        active: bool,
        /// Current source
        source: VideoSource,
    },
    /// Local video state was re-applied to drifted peers
    VideoStateSynchronized(SyncReport),
    /// A health check finished
    HealthCheckCompleted(HealthReport),
    /// Application moved to/from the background
    BackgroundModeActive(bool),
    /// Host network status changed
    NetworkChanged(NetworkStatus),
    /// Remote participant toggled mute
    RemoteMuteChanged {
        /// Remote participant
        peer_id: PeerId,
        /// Muted
        muted: bool,
    },
    /// Remote participant toggled video
    RemoteVideoChanged {
        /// Remote participant
        peer_id: PeerId,
        /// Video on
        enabled: bool,
    },
    /// Something went wrong
    Error(SessionError),
}

/// Publish/subscribe registry owned by the session
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; no subscriber is not an error
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish a user-facing error
    pub fn emit_error(
        &self,
        message: impl Into<String>,
        severity: ErrorSeverity,
        action: RecommendedAction,
        peer_id: Option<PeerId>,
    ) {
        let error = SessionError {
            message: message.into(),
            severity,
            action,
            peer_id,
        };
        match severity {
            ErrorSeverity::Error => tracing::error!(?error, "Session error"),
            ErrorSeverity::Warning => tracing::warn!(?error, "Session warning"),
            ErrorSeverity::Info => tracing::info!(?error, "Session notice"),
        }
        self.emit(SessionEvent::Error(error));
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(SessionEvent::BackgroundModeActive(true));

        assert!(matches!(a.recv().await.unwrap(), SessionEvent::BackgroundModeActive(true)));
        assert!(matches!(b.recv().await.unwrap(), SessionEvent::BackgroundModeActive(true)));
    }

    #[tokio::test]
    async fn test_emit_error_payload() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit_error(
            "camera lost",
            ErrorSeverity::Warning,
            RecommendedAction::CheckDevice,
            None,
        );
        match rx.recv().await.unwrap() {
            SessionEvent::Error(e) => {
                assert_eq!(e.message, "camera lost");
                assert_eq!(e.severity, ErrorSeverity::Warning);
                assert_eq!(e.action, RecommendedAction::CheckDevice);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(SessionEvent::NetworkChanged(NetworkStatus::Offline));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
