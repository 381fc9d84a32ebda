//! Negotiation gating, transport fallback, reconnection and health recovery

mod common;

use common::{harness, harness_with, peer, quiet_config, settle};
use nexus_voice_core::health::{HealthIssue, HealthRecommendation};
use nexus_voice_core::{
    ErrorSeverity, FallbackStage, IceConnectionState, IceServer, IceTransportPolicy, LinkStats,
    LocalTrack, MediaError, MediaKind, NegotiationState, NetworkStatus, PeerLinkHandle,
    QualityBucket, RecommendedAction, RtpSender, SessionConfig, SessionEvent, TransportState,
    VideoSource,
};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::Instant;

fn with_turn() -> SessionConfig {
    SessionConfig {
        ice_servers: vec![IceServer::turn("turn:relay.example.org:3478", "user", "secret")],
        ..quiet_config()
    }
}

#[tokio::test(start_paused = true)]
async fn only_one_negotiation_runs_per_peer() {
    let h = harness();
    h.join_stable(&["alice"], false).await;
    let link = h.link("alice");
    link.set_offer_delay(Duration::from_millis(100));

    let alice = peer("alice");
    let results =
        futures::future::join_all((0..5).map(|_| h.controller.renegotiate(&alice))).await;
    let started: Vec<bool> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(started.iter().filter(|s| **s).count(), 1);
    assert_eq!(link.max_concurrent_offers(), 1);
    assert_eq!(link.offers_created(), 2);

    // flag released once the cycle finished
    assert!(h.controller.renegotiate(&peer("alice")).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn renegotiation_skipped_while_answering() {
    let h = harness();
    h.join_stable(&["alice"], false).await;
    let link = h.link("alice");
    link.set_negotiation_state(NegotiationState::HaveRemoteOffer);
    settle().await;

    assert!(!h.controller.renegotiate(&peer("alice")).await.unwrap());
    assert_eq!(link.offers_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnection_follows_backoff_then_gives_up() {
    let mut h = harness();
    h.join_stable(&["alice"], false).await;
    h.drain_events();
    h.engine.fail_next_links(3);

    let failed_at = Instant::now();
    h.link("alice").set_transport_state(TransportState::Failed);
    tokio::time::sleep(Duration::from_secs(20)).await;

    let offsets: Vec<Duration> = h.engine.link_attempts()[1..]
        .iter()
        .map(|t| t.duration_since(failed_at))
        .collect();
    assert_eq!(
        offsets,
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(3000),
            Duration::from_millis(7000),
        ]
    );

    let events = h.drain_events();
    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ReconnectionFailed { attempts: 3, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::PeerLeft { peer_id } if *peer_id == peer("alice"))));
    assert!(h.controller.peer_ids().is_empty());
    assert!(h.controller.reconnection().tracked_peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnection_rebuilds_link_and_resets_on_connect() {
    let h = harness();
    h.join_stable(&["alice"], true).await;
    let old = h.link("alice");

    old.set_transport_state(TransportState::Disconnected);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(old.is_closed());
    let rebuilt = h.link("alice");
    assert_eq!(rebuilt.ice_restarts(), 1);
    assert_eq!(rebuilt.sent_track_id(MediaKind::Audio).as_deref(), Some("audio-1"));
    assert_eq!(rebuilt.sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));
    assert_eq!(h.controller.reconnection().attempts(&peer("alice")), 1);

    rebuilt.set_transport_state(TransportState::Connected);
    settle().await;
    assert_eq!(h.controller.reconnection().attempts(&peer("alice")), 0);
    assert!(h.controller.peer_link(&peer("alice")).unwrap().established_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn connected_peers_are_sampled_every_two_seconds() {
    let mut h = harness();
    h.join_stable(&["alice"], false).await;
    let link = h.link("alice");
    link.set_stats(LinkStats {
        packets_lost: 12,
        packets_received: 88,
        round_trip_time_seconds: Some(0.45),
        ..LinkStats::default()
    });
    h.drain_events();

    link.set_transport_state(TransportState::Connected);
    tokio::time::sleep(Duration::from_millis(9000)).await;

    assert_eq!(link.stats_calls(), 5);
    let quality = h.controller.monitor().quality(&peer("alice")).unwrap();
    assert_eq!(quality.bucket, QualityBucket::Critical);
    let changes = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::ConnectionQualityChanged { .. }))
        .count();
    assert_eq!(changes, 1);

    h.controller.handle_user_left(&peer("alice")).await;
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(link.stats_calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn ice_failures_walk_the_fallback_ladder() {
    let h = harness_with(with_turn());
    h.join_stable(&["alice"], false).await;
    let link = h.link("alice");
    link.set_transport_state(TransportState::Connected);
    settle().await;

    link.set_ice_connection_state(IceConnectionState::Failed);
    settle().await;
    assert_eq!(link.ice_restarts(), 1);
    assert_eq!(link.configuration().policy, IceTransportPolicy::All);
    assert!(!h.controller.is_relay_only(&peer("alice")));

    link.set_ice_connection_state(IceConnectionState::Failed);
    settle().await;
    assert_eq!(link.ice_restarts(), 2);
    assert_eq!(link.configuration().policy, IceTransportPolicy::Relay);
    assert!(link.configuration().servers.iter().all(IceServer::is_relay));
    assert!(h.controller.is_relay_only(&peer("alice")));

    link.set_ice_connection_state(IceConnectionState::Failed);
    settle().await;
    assert_eq!(link.ice_restarts(), 3);
    assert!(link.configuration().servers.iter().all(|s| !s.is_relay()));
    assert!(!h.controller.is_relay_only(&peer("alice")));

    let record = h.controller.ice_recovery(&peer("alice")).unwrap();
    assert_eq!(record.restarts, 3);
    assert_eq!(record.next_stage, FallbackStage::Reconnect);

    link.set_ice_connection_state(IceConnectionState::Failed);
    settle().await;
    assert!(h.controller.reconnection().is_in_flight(&peer("alice")));
}

#[tokio::test(start_paused = true)]
async fn ladder_skips_relay_without_turn() {
    let h = harness();
    h.join_stable(&["alice"], false).await;
    let link = h.link("alice");

    for _ in 0..2 {
        link.set_ice_connection_state(IceConnectionState::Failed);
        settle().await;
    }
    assert_eq!(link.ice_restarts(), 2);
    assert_eq!(link.configuration().policy, IceTransportPolicy::All);
    assert_eq!(
        h.controller.ice_recovery(&peer("alice")).unwrap().next_stage,
        FallbackStage::Reconnect
    );
}

#[tokio::test(start_paused = true)]
async fn network_restore_restarts_or_reconnects() {
    let mut h = harness();
    h.join_stable(&["alice", "bob"], false).await;
    h.link("alice").set_transport_state(TransportState::Connected);
    settle().await;
    h.drain_events();

    h.controller.handle_network_change(NetworkStatus::Offline).await;
    assert_eq!(h.link("alice").ice_restarts(), 0);

    h.controller.handle_network_change(NetworkStatus::Online).await;
    settle().await;
    assert_eq!(h.link("alice").ice_restarts(), 1);
    // bob never connected
    assert!(h.controller.reconnection().is_in_flight(&peer("bob")));
    assert!(!h.controller.reconnection().is_in_flight(&peer("alice")));

    let changes: Vec<NetworkStatus> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::NetworkChanged(status) => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![NetworkStatus::Offline, NetworkStatus::Online]);
}

#[tokio::test(start_paused = true)]
async fn health_check_restores_missing_audio_sender() {
    let h = harness();
    h.join_stable(&["alice"], false).await;
    let link = h.link("alice");
    link.set_transport_state(TransportState::Connected);
    settle().await;

    let audio = link
        .senders()
        .into_iter()
        .find(|s| s.kind() == MediaKind::Audio)
        .unwrap();
    audio.replace_track(None).await.unwrap();

    let report = h.controller.run_health_check();
    assert!(!report.is_healthy());
    assert_eq!(report.peers[0].issues, vec![HealthIssue::MissingAudioSender]);

    assert_eq!(h.controller.auto_recover(&report).await, 1);
    assert_eq!(link.sent_track_id(MediaKind::Audio).as_deref(), Some("audio-1"));
    assert!(h.controller.run_health_check().is_healthy());
}

#[tokio::test(start_paused = true)]
async fn dead_microphone_is_recaptured() {
    let h = harness();
    h.join_stable(&["alice"], false).await;
    let link = h.link("alice");
    link.set_transport_state(TransportState::Connected);
    settle().await;
    h.engine.captured_tracks()[0].stop();

    let report = h.controller.run_health_check();
    assert_eq!(report.peers[0].issues, vec![HealthIssue::DeadAudioTrack]);
    assert_eq!(h.controller.auto_recover(&report).await, 1);

    assert_eq!(link.sent_track_id(MediaKind::Audio).as_deref(), Some("audio-2"));
    assert_eq!(
        h.controller.local_audio().map(|t| t.id().to_string()),
        Some("audio-2".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn dead_camera_is_recaptured() {
    let h = harness();
    h.join_stable(&["alice"], true).await;
    let link = h.link("alice");
    link.set_transport_state(TransportState::Connected);
    settle().await;
    h.engine.captured_tracks()[1].stop();

    let report = h.controller.run_health_check();
    assert_eq!(report.peers[0].issues, vec![HealthIssue::VideoTrackMismatch]);
    assert_eq!(
        report.peers[0].recommendations,
        vec![HealthRecommendation::ReplaceVideoTrack]
    );
    assert_eq!(h.controller.auto_recover(&report).await, 1);

    assert_eq!(link.sent_track_id(MediaKind::Video).as_deref(), Some("camera-3"));
    assert_eq!(h.controller.video_state().track_id(), Some("camera-3"));
    assert!(h.controller.run_health_check().is_healthy());
}

#[tokio::test(start_paused = true)]
async fn camera_that_cannot_be_recaptured_turns_video_off() {
    let mut h = harness();
    h.join_stable(&["alice"], true).await;
    let link = h.link("alice");
    link.set_transport_state(TransportState::Connected);
    settle().await;
    h.drain_events();
    h.engine.captured_tracks()[1].stop();
    h.engine
        .fail_next_captures(vec![MediaError::DeviceNotFound("unplugged".into())]);

    let report = h.controller.run_health_check();
    assert_eq!(h.controller.auto_recover(&report).await, 1);

    let state = h.controller.video_state();
    assert!(!state.active);
    assert_eq!(state.source, VideoSource::None);
    assert_eq!(link.sent_track_id(MediaKind::Video), None);
    assert!(h.controller.run_health_check().is_healthy());
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        SessionEvent::Error(err)
            if err.severity == ErrorSeverity::Warning && err.action == RecommendedAction::CheckDevice
    )));

    // video intent follows: the next toggle turns the camera back on
    assert!(h.controller.toggle_video().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn returning_to_foreground_runs_a_health_check() {
    let mut h = harness();
    h.join_stable(&["alice"], false).await;
    h.drain_events();

    h.controller.set_background_mode(true).await;
    assert!(h.controller.is_background());
    h.controller.set_background_mode(false).await;

    let events = h.drain_events();
    let modes: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::BackgroundModeActive(b) => Some(*b),
            _ => None,
        })
        .collect();
    assert_eq!(modes, vec![true, false]);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::HealthCheckCompleted(_)))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn scheduled_health_checks_pause_in_background() {
    let mut h = harness_with(SessionConfig {
        health_check_interval: Some(Duration::from_secs(10)),
        ..SessionConfig::default()
    });
    h.join_stable(&["alice"], false).await;
    h.drain_events();

    let count = |events: Vec<SessionEvent>| {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::HealthCheckCompleted(_)))
            .count()
    };

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(count(h.drain_events()), 2);

    h.controller.set_background_mode(true).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(count(h.drain_events()), 0);
}
