//! State Synchronization Manager
//!
//! Compares what every peer link actually sends against the local video
//! intent and repairs the drift.

use crate::engine::{find_sender, LocalTrack, PeerLinkHandle};
use crate::events::{EventBus, SessionEvent};
use crate::types::{MediaKind, PeerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of drift found on a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InconsistencyKind {
    /// No video sender, or a sender without a track
    MissingSender,
    /// Sender carries a track other than the intended one
    WrongTrack,
    /// Sender carries the intended track but it is disabled
    DisabledTrack,
    /// Link transport is failed or closed
    StaleConnection,
}

/// How bad the drift is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InconsistencySeverity {
    /// Cosmetic
    Low,
    /// Remote sees the wrong picture
    Medium,
    /// Remote sees nothing
    High,
}

/// Repair for one inconsistency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendedFix {
    /// Attach the track on a new sender
    AddTrack,
    /// Swap the track on the existing sender
    ReplaceTrack,
    /// Swap an enabled copy of the track onto the sender
    EnableTrack,
    /// Detach the track from the sender
    ClearTrack,
    /// Leave to the reconnection path
    Reconnect,
}

/// One detected drift
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inconsistency {
    /// Affected peer
    pub peer_id: PeerId,
    /// What is wrong
    pub kind: InconsistencyKind,
    /// How bad
    pub severity: InconsistencySeverity,
    /// Repair
    pub fix: RecommendedFix,
}

/// Outcome of a synchronisation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Inconsistencies detected
    pub detected: Vec<Inconsistency>,
    /// Peers repaired
    pub fixed: Vec<PeerId>,
    /// Peers whose repair failed, with the reason
    pub failed: Vec<(PeerId, String)>,
    /// Peers left for reconnection
    pub skipped: Vec<PeerId>,
}

impl SyncReport {
    /// Whether nothing was left broken
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Detects and repairs cross-peer video drift
#[derive(Clone)]
pub struct StateSynchronizer {
    events: EventBus,
}

impl StateSynchronizer {
    /// Create a synchronizer publishing to `events`
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    /// Find every link whose video sender disagrees with the local intent
    #[must_use]
    pub fn detect_inconsistencies(
        &self,
        peers: &[(PeerId, Arc<dyn PeerLinkHandle>)],
        expected_track: Option<&Arc<dyn LocalTrack>>,
        expected_enabled: bool,
    ) -> Vec<Inconsistency> {
        peers
            .iter()
            .filter_map(|(peer_id, link)| {
                inspect(link.as_ref(), expected_track, expected_enabled).map(
                    |(kind, severity, fix)| Inconsistency {
                        peer_id: peer_id.clone(),
                        kind,
                        severity,
                        fix,
                    },
                )
            })
            .collect()
    }

    /// Detect and repair drift on every link
    ///
    /// Stale links are skipped; a failure on one peer does not stop the
    /// others.
    #[tracing::instrument(skip_all, fields(peers = peers.len(), expected_enabled))]
    pub async fn synchronize_state(
        &self,
        peers: &[(PeerId, Arc<dyn PeerLinkHandle>)],
        expected_track: Option<&Arc<dyn LocalTrack>>,
        expected_enabled: bool,
    ) -> SyncReport {
        let detected = self.detect_inconsistencies(peers, expected_track, expected_enabled);
        let mut report = SyncReport::default();

        for inconsistency in &detected {
            let peer_id = &inconsistency.peer_id;
            let Some((_, link)) = peers.iter().find(|(p, _)| p == peer_id) else {
                continue;
            };

            if inconsistency.fix == RecommendedFix::Reconnect {
                tracing::debug!(peer_id = %peer_id, "Stale link left for reconnection");
                report.skipped.push(peer_id.clone());
                continue;
            }

            match apply_fix(link.as_ref(), inconsistency.fix, expected_track).await {
                Ok(()) => {
                    tracing::info!(peer_id = %peer_id, kind = ?inconsistency.kind, fix = ?inconsistency.fix, "Video state repaired");
                    report.fixed.push(peer_id.clone());
                }
                Err(reason) => {
                    tracing::warn!(peer_id = %peer_id, kind = ?inconsistency.kind, %reason, "Video state repair failed");
                    report.failed.push((peer_id.clone(), reason));
                }
            }
        }

        report.detected = detected;
        if !report.fixed.is_empty() {
            self.events
                .emit(SessionEvent::VideoStateSynchronized(report.clone()));
        }
        report
    }

    /// Whether every non-stale link matches the local intent
    #[must_use]
    pub fn verify_consistency(
        &self,
        peers: &[(PeerId, Arc<dyn PeerLinkHandle>)],
        expected_track: Option<&Arc<dyn LocalTrack>>,
        expected_enabled: bool,
    ) -> bool {
        self.detect_inconsistencies(peers, expected_track, expected_enabled)
            .iter()
            .all(|i| i.kind == InconsistencyKind::StaleConnection)
    }
}

fn inspect(
    link: &dyn PeerLinkHandle,
    expected_track: Option<&Arc<dyn LocalTrack>>,
    expected_enabled: bool,
) -> Option<(InconsistencyKind, InconsistencySeverity, RecommendedFix)> {
    if link.transport_state().is_stale() {
        return Some((
            InconsistencyKind::StaleConnection,
            InconsistencySeverity::High,
            RecommendedFix::Reconnect,
        ));
    }

    let sender = find_sender(link, MediaKind::Video);
    let attached = sender.as_ref().and_then(|s| s.track());

    if !expected_enabled {
        return attached.map(|_| {
            (
                InconsistencyKind::WrongTrack,
                InconsistencySeverity::Low,
                RecommendedFix::ClearTrack,
            )
        });
    }

    let expected = expected_track?;
    match (sender, attached) {
        (None, _) => Some((
            InconsistencyKind::MissingSender,
            InconsistencySeverity::High,
            RecommendedFix::AddTrack,
        )),
        (Some(_), None) => Some((
            InconsistencyKind::MissingSender,
            InconsistencySeverity::High,
            RecommendedFix::ReplaceTrack,
        )),
        (Some(_), Some(track)) if track.id() != expected.id() => Some((
            InconsistencyKind::WrongTrack,
            InconsistencySeverity::Medium,
            RecommendedFix::ReplaceTrack,
        )),
        (Some(_), Some(track)) if !track.is_enabled() => Some((
            InconsistencyKind::DisabledTrack,
            InconsistencySeverity::Low,
            RecommendedFix::EnableTrack,
        )),
        _ => None,
    }
}

async fn apply_fix(
    link: &dyn PeerLinkHandle,
    fix: RecommendedFix,
    expected_track: Option<&Arc<dyn LocalTrack>>,
) -> Result<(), String> {
    let sender = find_sender(link, MediaKind::Video);
    match fix {
        RecommendedFix::AddTrack => {
            let track = expected_track.ok_or("no local video track")?;
            let result = match sender {
                Some(sender) => sender.replace_track(Some(track.clone())).await,
                None => link.add_track(track.clone()).await.map(|_| ()),
            };
            result.map_err(|e| e.to_string())
        }
        RecommendedFix::ReplaceTrack => {
            let track = expected_track.ok_or("no local video track")?;
            let sender = sender.ok_or("video sender disappeared")?;
            sender
                .replace_track(Some(track.clone()))
                .await
                .map_err(|e| e.to_string())
        }
        RecommendedFix::EnableTrack => {
            let track = expected_track.ok_or("no local video track")?;
            let sender = sender.ok_or("video sender disappeared")?;
            if !track.is_enabled() {
                track.set_enabled(true);
            }
            sender
                .replace_track(Some(track.clone()))
                .await
                .map_err(|e| e.to_string())
        }
        RecommendedFix::ClearTrack => {
            let sender = sender.ok_or("video sender disappeared")?;
            sender.replace_track(None).await.map_err(|e| e.to_string())
        }
        RecommendedFix::Reconnect => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::RtpSender;
    use crate::testing::{MockPeerLink, MockTrack};
    use crate::types::TransportState;
    use pretty_assertions::assert_eq;

    fn peers(links: &[(&str, &Arc<MockPeerLink>)]) -> Vec<(PeerId, Arc<dyn PeerLinkHandle>)> {
        links
            .iter()
            .map(|(id, link)| (PeerId::new(*id), (*link).clone() as Arc<dyn PeerLinkHandle>))
            .collect()
    }

    #[tokio::test]
    async fn test_detect_each_kind() {
        let sync = StateSynchronizer::new(EventBus::new());
        let camera: Arc<dyn LocalTrack> = MockTrack::video("cam");
        let other: Arc<dyn LocalTrack> = MockTrack::video("old");
        let disabled: Arc<dyn LocalTrack> = MockTrack::video("cam");
        disabled.set_enabled(false);

        let ok = MockPeerLink::new();
        ok.add_track(camera.clone()).await.unwrap();
        let missing = MockPeerLink::new();
        let wrong = MockPeerLink::new();
        wrong.add_track(other.clone()).await.unwrap();
        let muted = MockPeerLink::new();
        muted.add_track(disabled.clone()).await.unwrap();
        let stale = MockPeerLink::new();
        stale.set_transport_state(TransportState::Failed);

        let all = peers(&[
            ("ok", &ok),
            ("missing", &missing),
            ("wrong", &wrong),
            ("muted", &muted),
            ("stale", &stale),
        ]);
        let found = sync.detect_inconsistencies(&all, Some(&camera), true);
        let kinds: Vec<_> = found.iter().map(|i| (i.peer_id.as_str(), i.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("missing", InconsistencyKind::MissingSender),
                ("wrong", InconsistencyKind::WrongTrack),
                ("muted", InconsistencyKind::DisabledTrack),
                ("stale", InconsistencyKind::StaleConnection),
            ]
        );
    }

    #[tokio::test]
    async fn test_synchronize_repairs_and_verifies() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let sync = StateSynchronizer::new(events);
        let camera: Arc<dyn LocalTrack> = MockTrack::video("cam");
        let other: Arc<dyn LocalTrack> = MockTrack::video("old");

        let missing = MockPeerLink::new();
        let wrong = MockPeerLink::new();
        wrong.add_track(other).await.unwrap();
        let all = peers(&[("missing", &missing), ("wrong", &wrong)]);

        assert!(!sync.verify_consistency(&all, Some(&camera), true));
        let report = sync.synchronize_state(&all, Some(&camera), true).await;
        assert_eq!(report.fixed.len(), 2);
        assert!(report.is_clean());
        assert!(sync.verify_consistency(&all, Some(&camera), true));
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::VideoStateSynchronized(_)
        ));
    }

    #[tokio::test]
    async fn test_disabled_copy_is_swapped_for_the_live_track() {
        let sync = StateSynchronizer::new(EventBus::new());
        let camera: Arc<dyn LocalTrack> = MockTrack::video("cam");
        let stale_copy: Arc<dyn LocalTrack> = MockTrack::video("cam");
        stale_copy.set_enabled(false);

        let link = MockPeerLink::new();
        link.add_track(stale_copy.clone()).await.unwrap();
        let all = peers(&[("p", &link)]);

        let report = sync.synchronize_state(&all, Some(&camera), true).await;
        assert_eq!(report.fixed, vec![PeerId::new("p")]);
        assert_eq!(report.detected[0].kind, InconsistencyKind::DisabledTrack);

        let sender = link.mock_senders()[0].clone();
        assert_eq!(sender.replace_calls(), 1);
        let attached = sender.track().unwrap();
        assert!(Arc::ptr_eq(&attached, &camera));
        assert!(attached.is_enabled());
        assert!(sync.verify_consistency(&all, Some(&camera), true));
    }

    #[tokio::test]
    async fn test_video_off_clears_leftover_track() {
        let sync = StateSynchronizer::new(EventBus::new());
        let camera: Arc<dyn LocalTrack> = MockTrack::video("cam");
        let link = MockPeerLink::new();
        link.add_track(camera).await.unwrap();
        let all = peers(&[("p", &link)]);

        let found = sync.detect_inconsistencies(&all, None, false);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fix, RecommendedFix::ClearTrack);

        sync.synchronize_state(&all, None, false).await;
        assert!(sync.verify_consistency(&all, None, false));
        assert!(find_sender(link.as_ref(), MediaKind::Video)
            .unwrap()
            .track()
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_links_are_skipped() {
        let sync = StateSynchronizer::new(EventBus::new());
        let camera: Arc<dyn LocalTrack> = MockTrack::video("cam");
        let stale = MockPeerLink::new();
        stale.set_transport_state(TransportState::Closed);
        let all = peers(&[("stale", &stale)]);

        let report = sync.synchronize_state(&all, Some(&camera), true).await;
        assert_eq!(report.skipped, vec![PeerId::new("stale")]);
        assert!(report.fixed.is_empty());
        assert!(sync.verify_consistency(&all, Some(&camera), true));
    }
}
