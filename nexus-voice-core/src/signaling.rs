//! Signaling protocol
//!
//! The relay speaks JSON text frames tagged `voice:<kind>`. Frames are decoded
//! exactly once, here, into the closed [`InboundSignal`] enum; everything
//! above this module works with typed messages only.

use crate::types::{ChannelId, IceCandidate, PeerId, SessionDescription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;

/// Maximum signaling frame size (64KB)
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Underlying transport failed
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Transport is not connected
    #[error("Signaling channel not connected")]
    NotConnected,

    /// Frame could not be decoded
    #[error("Malformed signaling message: {0}")]
    Malformed(String),

    /// Frame carries a kind this client does not handle
    #[error("Unknown signaling message type: {0}")]
    UnknownMessage(String),

    /// Frame exceeds [`MAX_SIGNALING_MESSAGE_SIZE`]
    #[error("Signaling message too large: {0} bytes")]
    TooLarge(usize),

    /// Waiting for the channel timed out
    #[error("Timed out waiting for signaling channel")]
    Timeout,

    /// Transport shut down for good
    #[error("Signaling channel closed")]
    Closed,
}

/// Raw frame delivered by a [`SignalingTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// A text frame
    Text(String),
    /// The duplex channel dropped and came back
    Reconnected,
    /// The duplex channel dropped
    Disconnected,
}

/// Duplex text transport to the signaling relay
///
/// Implement this for the concrete channel (WebSocket, in-process relay...).
/// Delivery is not assumed reliable.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send a text frame
    async fn send_text(&self, text: String) -> Result<(), SignalingError>;

    /// Receive the next frame
    async fn receive(&self) -> Result<TransportFrame, SignalingError>;

    /// Connection status; `true` while the channel is usable
    fn connection_status(&self) -> watch::Receiver<bool>;
}

/// Roster entry in `voice:existing-users`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    /// Participant id
    pub user_id: PeerId,
    /// Display name
    #[serde(default)]
    pub username: Option<String>,
}

/// Messages received from the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundSignal {
    /// Participants already in the channel, sent after our join
    #[serde(rename = "voice:existing-users")]
    ExistingUsers {
        /// Current roster, excluding us
        #[serde(default)]
        users: Vec<RosterEntry>,
    },

    /// A participant joined
    #[serde(rename = "voice:user-joined", rename_all = "camelCase")]
    UserJoined {
        /// Participant id
        user_id: PeerId,
        /// Display name
        #[serde(default)]
        username: Option<String>,
        /// Channel
        #[serde(default)]
        channel_id: Option<ChannelId>,
    },

    /// A participant left
    #[serde(rename = "voice:user-left", rename_all = "camelCase")]
    UserLeft {
        /// Participant id
        user_id: PeerId,
        /// Channel
        #[serde(default)]
        channel_id: Option<ChannelId>,
    },

    /// Remote offer
    #[serde(rename = "voice:offer", rename_all = "camelCase")]
    Offer {
        /// Sender
        user_id: PeerId,
        /// Offer description
        offer: SessionDescription,
    },

    /// Remote answer
    #[serde(rename = "voice:answer", rename_all = "camelCase")]
    Answer {
        /// Sender
        user_id: PeerId,
        /// Answer description
        answer: SessionDescription,
    },

    /// Remote candidate
    #[serde(rename = "voice:ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        /// Sender
        user_id: PeerId,
        /// Candidate
        candidate: IceCandidate,
    },

    /// Remote mute toggle
    #[serde(rename = "voice:mute-status", rename_all = "camelCase")]
    MuteStatus {
        /// Sender
        user_id: PeerId,
        /// Muted
        is_muted: bool,
        /// Channel
        #[serde(default)]
        channel_id: Option<ChannelId>,
    },

    /// Remote video toggle
    #[serde(rename = "voice:video-status", rename_all = "camelCase")]
    VideoStatus {
        /// Sender
        user_id: PeerId,
        /// Video on
        is_video_enabled: bool,
        /// Channel
        #[serde(default)]
        channel_id: Option<ChannelId>,
    },
}

impl InboundSignal {
    /// Wire tags of every inbound kind
    pub const KINDS: [&'static str; 8] = [
        "voice:existing-users",
        "voice:user-joined",
        "voice:user-left",
        "voice:offer",
        "voice:answer",
        "voice:ice-candidate",
        "voice:mute-status",
        "voice:video-status",
    ];

    /// Originating participant, for per-peer messages
    #[must_use]
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::ExistingUsers { .. } => None,
            Self::UserJoined { user_id, .. }
            | Self::UserLeft { user_id, .. }
            | Self::Offer { user_id, .. }
            | Self::Answer { user_id, .. }
            | Self::IceCandidate { user_id, .. }
            | Self::MuteStatus { user_id, .. }
            | Self::VideoStatus { user_id, .. } => Some(user_id),
        }
    }
}

/// Messages sent to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OutboundSignal {
    /// Announce presence; the relay answers with the roster
    #[serde(rename = "voice:join")]
    Join,

    /// Announce departure
    #[serde(rename = "voice:leave")]
    Leave,

    /// Offer for one participant
    #[serde(rename = "voice:offer", rename_all = "camelCase")]
    Offer {
        /// Recipient
        target_user_id: PeerId,
        /// Offer description
        offer: SessionDescription,
    },

    /// Answer for one participant
    #[serde(rename = "voice:answer", rename_all = "camelCase")]
    Answer {
        /// Recipient
        target_user_id: PeerId,
        /// Answer description
        answer: SessionDescription,
    },

    /// Local candidate for one participant
    #[serde(rename = "voice:ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        /// Recipient
        target_user_id: PeerId,
        /// Candidate
        candidate: IceCandidate,
    },

    /// Broadcast mute state
    #[serde(rename = "voice:mute-status", rename_all = "camelCase")]
    MuteStatus {
        /// Muted
        is_muted: bool,
    },

    /// Broadcast video state
    #[serde(rename = "voice:video-status", rename_all = "camelCase")]
    VideoStatus {
        /// Video on
        is_video_enabled: bool,
    },
}

impl OutboundSignal {
    /// Recipient, for directed messages
    #[must_use]
    pub fn target(&self) -> Option<&PeerId> {
        match self {
            Self::Offer { target_user_id, .. }
            | Self::Answer { target_user_id, .. }
            | Self::IceCandidate { target_user_id, .. } => Some(target_user_id),
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope<'a> {
    #[serde(flatten)]
    signal: &'a OutboundSignal,
    channel_id: &'a ChannelId,
    timestamp: DateTime<Utc>,
}

/// Encode an outbound message as a relay frame
///
/// # Errors
///
/// Returns error if serialisation fails or the frame is too large
pub fn encode_outbound(channel: &ChannelId, signal: &OutboundSignal) -> Result<String, SignalingError> {
    let envelope = WireEnvelope {
        signal,
        channel_id: channel,
        timestamp: Utc::now(),
    };
    let text =
        serde_json::to_string(&envelope).map_err(|e| SignalingError::Malformed(e.to_string()))?;
    if text.len() > MAX_SIGNALING_MESSAGE_SIZE {
        return Err(SignalingError::TooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame produced by [`encode_outbound`]
///
/// Used by relays and test doubles.
///
/// # Errors
///
/// Returns error if the frame is not a valid outbound message
pub fn decode_outbound(text: &str) -> Result<(ChannelId, OutboundSignal), SignalingError> {
    let mut value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| SignalingError::Malformed("frame is not an object".to_string()))?;
    let channel = object
        .remove("channelId")
        .and_then(|v| v.as_str().map(ChannelId::from))
        .ok_or_else(|| SignalingError::Malformed("missing channelId".to_string()))?;
    object.remove("timestamp");
    let signal =
        serde_json::from_value(value).map_err(|e| SignalingError::Malformed(e.to_string()))?;
    Ok((channel, signal))
}

/// Decode a relay frame into a typed message
///
/// # Errors
///
/// Returns [`SignalingError::UnknownMessage`] for kinds this client does not
/// handle and [`SignalingError::Malformed`] for invalid payloads
pub fn decode_inbound(text: &str) -> Result<InboundSignal, SignalingError> {
    if text.len() > MAX_SIGNALING_MESSAGE_SIZE {
        return Err(SignalingError::TooLarge(text.len()));
    }
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| SignalingError::Malformed("missing type".to_string()))?;
    if !InboundSignal::KINDS.contains(&kind) {
        return Err(SignalingError::UnknownMessage(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| SignalingError::Malformed(e.to_string()))
}

/// Decoded signaling event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// A message from the relay
    Message(InboundSignal),
    /// Channel reconnected; peers must be re-established
    Reconnected,
    /// Channel dropped
    Disconnected,
}

/// Signaling handler with decoding and receive backoff
pub struct SignalingHandler {
    transport: Arc<dyn SignalingTransport>,
    error_count: Mutex<u32>,
}

impl SignalingHandler {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            transport,
            error_count: Mutex::new(0),
        }
    }

    /// Whether the channel is currently usable
    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.transport.connection_status().borrow()
    }

    /// Wait until the channel is usable
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Timeout`] if it does not come back in time
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), SignalingError> {
        let mut status = self.transport.connection_status();
        if *status.borrow() {
            return Ok(());
        }
        tracing::debug!(timeout_ms = timeout.as_millis(), "Waiting for signaling channel");
        let result =
            match tokio::time::timeout(timeout, status.wait_for(|connected| *connected)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(SignalingError::Closed),
                Err(_) => Err(SignalingError::Timeout),
            };
        result
    }

    /// Send a message for a channel
    ///
    /// # Errors
    ///
    /// Returns error if encoding or sending fails
    #[tracing::instrument(skip(self, signal), fields(channel = %channel, message_type = message_type(signal)))]
    pub async fn send(
        &self,
        channel: &ChannelId,
        signal: &OutboundSignal,
    ) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let text = encode_outbound(channel, signal)?;
        tracing::debug!("Sending signaling message");
        self.transport.send_text(text).await
    }

    /// Receive the next decoded event
    ///
    /// Transport errors are returned after a growing backoff so a caller
    /// looping on this method does not spin. Frames that fail to decode are
    /// returned as errors without backoff.
    ///
    /// # Errors
    ///
    /// Returns error if receiving or decoding fails
    pub async fn receive(&self) -> Result<SignalingEvent, SignalingError> {
        match self.transport.receive().await {
            Ok(frame) => {
                *self.error_count.lock().await = 0;
                match frame {
                    TransportFrame::Text(text) => {
                        let signal = decode_inbound(&text)?;
                        tracing::debug!(
                            peer = ?signal.peer_id(),
                            message_type = inbound_type(&signal),
                            "Received signaling message"
                        );
                        Ok(SignalingEvent::Message(signal))
                    }
                    TransportFrame::Reconnected => Ok(SignalingEvent::Reconnected),
                    TransportFrame::Disconnected => Ok(SignalingEvent::Disconnected),
                }
            }
            Err(SignalingError::Closed) => Err(SignalingError::Closed),
            Err(e) => {
                let mut error_count = self.error_count.lock().await;
                *error_count += 1;
                let count = *error_count;
                drop(error_count);

                let backoff_duration = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    error = %e,
                    "Error receiving signaling frame, backing off"
                );
                sleep(backoff_duration).await;
                Err(e)
            }
        }
    }
}

fn message_type(signal: &OutboundSignal) -> &'static str {
    match signal {
        OutboundSignal::Join => "join",
        OutboundSignal::Leave => "leave",
        OutboundSignal::Offer { .. } => "offer",
        OutboundSignal::Answer { .. } => "answer",
        OutboundSignal::IceCandidate { .. } => "ice-candidate",
        OutboundSignal::MuteStatus { .. } => "mute-status",
        OutboundSignal::VideoStatus { .. } => "video-status",
    }
}

fn inbound_type(signal: &InboundSignal) -> &'static str {
    match signal {
        InboundSignal::ExistingUsers { .. } => "existing-users",
        InboundSignal::UserJoined { .. } => "user-joined",
        InboundSignal::UserLeft { .. } => "user-left",
        InboundSignal::Offer { .. } => "offer",
        InboundSignal::Answer { .. } => "answer",
        InboundSignal::IceCandidate { .. } => "ice-candidate",
        InboundSignal::MuteStatus { .. } => "mute-status",
        InboundSignal::VideoStatus { .. } => "video-status",
    }
}
