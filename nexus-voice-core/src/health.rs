//! Peer link health assessment

use crate::engine::{find_sender, LocalTrack, PeerLinkHandle};
use crate::types::{
    ConnectionQuality, IceConnectionState, MediaKind, NegotiationState, PeerId, QualityBucket,
    TransportState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Problem found on a peer link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthIssue {
    /// Transport failed or closed
    TransportDown(TransportState),
    /// Transport dropped, may come back
    TransportDisconnected,
    /// Negotiation closed under an open transport
    NegotiationClosed,
    /// ICE agent failed
    IceFailed,
    /// No sender carries the microphone
    MissingAudioSender,
    /// Microphone track no longer live
    DeadAudioTrack,
    /// Video is on but no sender carries it
    MissingVideoSender,
    /// Video sender carries the wrong or a dead track
    VideoTrackMismatch,
    /// Last quality sample was critical
    CriticalQuality,
}

/// Recovery action for an unhealthy link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthRecommendation {
    /// Re-attach the microphone
    RecreateAudioSender,
    /// Re-attach the video track
    RecreateVideoSender,
    /// Swap the video sender's track for the intended one
    ReplaceVideoTrack,
    /// Restrict the link to TURN relays
    TriggerRelayFallback,
    /// Renegotiate with fresh ICE credentials
    TriggerIceRestart,
    /// Rebuild the link
    TriggerReconnection,
}

/// Health of one peer link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerHealth {
    /// Peer
    pub peer_id: PeerId,
    /// No issue found
    pub healthy: bool,
    /// Transport state at check time
    pub transport_state: TransportState,
    /// Negotiation state at check time
    pub negotiation_state: NegotiationState,
    /// Last quality bucket, if sampled
    pub quality: Option<QualityBucket>,
    /// Problems found
    pub issues: Vec<HealthIssue>,
    /// Actions that address them
    pub recommendations: Vec<HealthRecommendation>,
}

/// Result of a health check across all links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Per-peer results
    pub peers: Vec<PeerHealth>,
    /// Check time
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Build a report from per-peer results
    #[must_use]
    pub fn new(peers: Vec<PeerHealth>) -> Self {
        Self {
            peers,
            checked_at: Utc::now(),
        }
    }

    /// Whether every link is healthy
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.peers.iter().all(|p| p.healthy)
    }

    /// Links with at least one issue
    pub fn unhealthy(&self) -> impl Iterator<Item = &PeerHealth> {
        self.peers.iter().filter(|p| !p.healthy)
    }
}

/// What a healthy link should look like
#[derive(Clone, Copy)]
pub struct HealthExpectations<'a> {
    /// Microphone track, if the session has one
    pub audio_track: Option<&'a Arc<dyn LocalTrack>>,
    /// Intended video track
    pub video_track: Option<&'a Arc<dyn LocalTrack>>,
    /// Whether video is on
    pub video_enabled: bool,
    /// Whether a TURN relay is configured
    pub relay_available: bool,
}

/// Assess one link against the expectations
#[must_use]
pub fn assess_peer(
    peer_id: &PeerId,
    link: &dyn PeerLinkHandle,
    relay_active: bool,
    quality: Option<&ConnectionQuality>,
    expect: &HealthExpectations<'_>,
) -> PeerHealth {
    let transport_state = link.transport_state();
    let negotiation_state = link.negotiation_state();
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();
    let can_use_relay = expect.relay_available && !relay_active;

    match transport_state {
        TransportState::Failed | TransportState::Closed => {
            issues.push(HealthIssue::TransportDown(transport_state));
            push_unique(&mut recommendations, HealthRecommendation::TriggerReconnection);
        }
        TransportState::Disconnected => {
            issues.push(HealthIssue::TransportDisconnected);
            push_unique(&mut recommendations, HealthRecommendation::TriggerIceRestart);
        }
        _ => {}
    }

    if negotiation_state == NegotiationState::Closed && !transport_state.is_stale() {
        issues.push(HealthIssue::NegotiationClosed);
        push_unique(&mut recommendations, HealthRecommendation::TriggerReconnection);
    }

    if link.ice_connection_state() == IceConnectionState::Failed && !transport_state.is_stale() {
        issues.push(HealthIssue::IceFailed);
        if can_use_relay {
            push_unique(&mut recommendations, HealthRecommendation::TriggerRelayFallback);
        } else {
            push_unique(&mut recommendations, HealthRecommendation::TriggerIceRestart);
        }
    }

    if expect.audio_track.is_some() {
        match find_sender(link, MediaKind::Audio).and_then(|s| s.track()) {
            None => {
                issues.push(HealthIssue::MissingAudioSender);
                push_unique(&mut recommendations, HealthRecommendation::RecreateAudioSender);
            }
            Some(track) if !track.is_live() => {
                issues.push(HealthIssue::DeadAudioTrack);
                push_unique(&mut recommendations, HealthRecommendation::RecreateAudioSender);
            }
            Some(_) => {}
        }
    }

    if let (true, Some(expected)) = (expect.video_enabled, expect.video_track) {
        match find_sender(link, MediaKind::Video) {
            None => {
                issues.push(HealthIssue::MissingVideoSender);
                push_unique(&mut recommendations, HealthRecommendation::RecreateVideoSender);
            }
            Some(sender) => match sender.track() {
                None => {
                    issues.push(HealthIssue::MissingVideoSender);
                    push_unique(&mut recommendations, HealthRecommendation::ReplaceVideoTrack);
                }
                Some(track) if track.id() != expected.id() || !track.is_live() => {
                    issues.push(HealthIssue::VideoTrackMismatch);
                    push_unique(&mut recommendations, HealthRecommendation::ReplaceVideoTrack);
                }
                Some(_) => {}
            },
        }
    }

    let bucket = quality.map(|q| q.bucket);
    if bucket == Some(QualityBucket::Critical) && transport_state == TransportState::Connected {
        issues.push(HealthIssue::CriticalQuality);
        if can_use_relay {
            push_unique(&mut recommendations, HealthRecommendation::TriggerRelayFallback);
        }
    }

    PeerHealth {
        peer_id: peer_id.clone(),
        healthy: issues.is_empty(),
        transport_state,
        negotiation_state,
        quality: bucket,
        issues,
        recommendations,
    }
}

fn push_unique(list: &mut Vec<HealthRecommendation>, r: HealthRecommendation) {
    if !list.contains(&r) {
        list.push(r);
    }
}
