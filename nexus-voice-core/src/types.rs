//! Core types shared across the peer lifecycle layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a remote participant, as assigned by the signaling relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new peer identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a voice channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Create a new channel identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Offer/answer phase of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationState {
    /// No description applied yet
    New,
    /// A local offer has been applied and awaits an answer
    HaveLocalOffer,
    /// A remote offer has been applied and awaits a local answer
    HaveRemoteOffer,
    /// Offer/answer exchange complete
    Stable,
    /// Link closed
    Closed,
}

impl NegotiationState {
    /// Whether a new local offer may be produced without risking glare
    #[must_use]
    pub fn allows_renegotiation(self) -> bool {
        matches!(self, Self::Stable | Self::HaveLocalOffer)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Stable => "stable",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Connectivity status of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportState {
    /// Not started
    New,
    /// Establishing connectivity
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost connectivity
    Disconnected,
    /// Connectivity checks failed
    Failed,
    /// Link closed (terminal)
    Closed,
}

impl TransportState {
    /// States from which an in-place ICE restart is meaningful
    #[must_use]
    pub fn supports_ice_restart(self) -> bool {
        matches!(self, Self::Connected | Self::Connecting | Self::Disconnected)
    }

    /// States that should hand the peer to the reconnection manager
    #[must_use]
    pub fn needs_reconnection(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// Whether the link can no longer carry media without being rebuilt
    #[must_use]
    pub fn is_stale(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// ICE agent status of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IceConnectionState {
    /// Gathering not started
    New,
    /// Running connectivity checks
    Checking,
    /// A usable candidate pair was found
    Connected,
    /// All checks done
    Completed,
    /// Connectivity lost, may recover
    Disconnected,
    /// No usable candidate pair
    Failed,
    /// Agent shut down
    Closed,
}

/// Kind of media carried by a track or sender slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Camera or screen video
    Video,
}

/// Source of the single local video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoSource {
    /// Camera capture
    Camera,
    /// Screen capture
    Screen,
    /// No video
    None,
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
    /// Provisional answer
    Pranswer,
    /// Discard the pending local offer
    Rollback,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Build a rollback marker
    #[must_use]
    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

/// ICE candidate descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media id
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Whether this candidate routes through a relay server
    #[must_use]
    pub fn is_relay(&self) -> bool {
        self.candidate.contains(" typ relay")
    }
}

/// Raw transport statistics snapshot reported by the media engine
///
/// Time values use the engine's native unit (seconds), as in standard
/// `RTCStatsReport` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Inbound packets lost
    pub packets_lost: u64,
    /// Inbound packets received
    pub packets_received: u64,
    /// Inbound jitter, seconds
    pub jitter_seconds: f64,
    /// Current round-trip time of the selected candidate pair, seconds
    pub round_trip_time_seconds: Option<f64>,
    /// Bytes sent over the link
    pub bytes_sent: u64,
    /// Bytes received over the link
    pub bytes_received: u64,
}

/// Qualitative connection bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityBucket {
    /// No noticeable impairment
    Excellent,
    /// Minor impairment
    Good,
    /// Audible/visible degradation
    Poor,
    /// Call barely usable
    Critical,
}

/// Derived quality snapshot for one peer link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQuality {
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Packet loss ratio in `[0, 1]`
    pub packet_loss: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Qualitative bucket
    pub bucket: QualityBucket,
    /// Transport state when sampled
    pub transport_state: TransportState,
    /// Sample time
    pub sampled_at: DateTime<Utc>,
}

impl ConnectionQuality {
    /// Loss ratio above which a link is critical
    pub const CRITICAL_LOSS: f64 = 0.10;
    /// Latency above which a link is critical, ms
    pub const CRITICAL_RTT_MS: f64 = 500.0;
    /// Loss ratio above which a link is poor
    pub const POOR_LOSS: f64 = 0.05;
    /// Latency above which a link is poor, ms
    pub const POOR_RTT_MS: f64 = 300.0;
    /// Loss ratio above which a link is merely good
    pub const GOOD_LOSS: f64 = 0.01;
    /// Latency above which a link is merely good, ms
    pub const GOOD_RTT_MS: f64 = 150.0;

    /// Derive a quality snapshot from raw engine statistics
    #[must_use]
    pub fn from_stats(stats: &LinkStats, transport_state: TransportState) -> Self {
        let total = stats.packets_lost + stats.packets_received;
        let packet_loss = if total == 0 {
            0.0
        } else {
            stats.packets_lost as f64 / total as f64
        };
        let rtt_ms = stats.round_trip_time_seconds.unwrap_or(0.0) * 1000.0;
        let jitter_ms = stats.jitter_seconds * 1000.0;

        Self {
            rtt_ms,
            packet_loss,
            jitter_ms,
            bucket: Self::classify(packet_loss, rtt_ms),
            transport_state,
            sampled_at: Utc::now(),
        }
    }

    /// Map loss ratio and latency onto a bucket
    #[must_use]
    pub fn classify(packet_loss: f64, rtt_ms: f64) -> QualityBucket {
        if packet_loss > Self::CRITICAL_LOSS || rtt_ms > Self::CRITICAL_RTT_MS {
            QualityBucket::Critical
        } else if packet_loss > Self::POOR_LOSS || rtt_ms > Self::POOR_RTT_MS {
            QualityBucket::Poor
        } else if packet_loss > Self::GOOD_LOSS || rtt_ms > Self::GOOD_RTT_MS {
            QualityBucket::Good
        } else {
            QualityBucket::Excellent
        }
    }
}

/// Connectivity status reported by the host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    /// Network reachable again
    Online,
    /// Network lost
    Offline,
}
