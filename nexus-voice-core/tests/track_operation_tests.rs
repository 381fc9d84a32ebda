//! Camera, screen share and video synchronisation through the controller

mod common;

use common::{harness, harness_with, peer, quiet_config, settle};
use nexus_voice_core::signaling::OutboundSignal;
use nexus_voice_core::testing::MockPeerLink;
use nexus_voice_core::{
    ControllerError, LocalTrack, MediaError, MediaKind, NegotiationState, OperationKind,
    PeerLinkHandle, RtpSender, SessionEvent, TrackError, TransportState, VideoSource,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn audio_replacements(link: &MockPeerLink) -> usize {
    link.mock_senders()
        .iter()
        .filter(|s| s.kind() == MediaKind::Audio)
        .map(|s| s.replace_calls())
        .sum()
}

fn video_states(events: Vec<SessionEvent>) -> Vec<(bool, VideoSource)> {
    events
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::VideoStateChanged { active, source } => Some((active, source)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn camera_toggle_adds_then_clears_video_without_touching_audio() {
    let mut h = harness();
    h.join_stable(&["alice", "bob"], false).await;
    h.drain_events();

    assert!(h.controller.toggle_video().await.unwrap());
    settle().await;
    for id in ["alice", "bob"] {
        let link = h.link(id);
        assert_eq!(link.sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));
        assert_eq!(link.sent_track_id(MediaKind::Audio).as_deref(), Some("audio-1"));
        // adding a sender renegotiates the link
        assert_eq!(link.offers_created(), 2);
    }

    assert!(!h.controller.toggle_video().await.unwrap());
    for id in ["alice", "bob"] {
        let link = h.link(id);
        assert_eq!(link.sent_track_id(MediaKind::Video), None);
        assert_eq!(link.sent_track_id(MediaKind::Audio).as_deref(), Some("audio-1"));
        assert_eq!(audio_replacements(&link), 0);
    }
    assert!(h.engine.captured_tracks()[1].is_stopped());
    assert!(!h.engine.captured_tracks()[0].is_stopped());

    assert_eq!(
        video_states(h.drain_events()),
        vec![(true, VideoSource::Camera), (false, VideoSource::None)]
    );
    let statuses: Vec<bool> = h
        .signaling
        .sent()
        .into_iter()
        .filter_map(|(_, s)| match s {
            OutboundSignal::VideoStatus { is_video_enabled } => Some(is_video_enabled),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn rapid_toggles_run_in_submission_order() {
    let mut h = harness();
    h.join_stable(&["alice"], true).await;
    h.drain_events();

    let (first, second, third) = tokio::join!(
        h.controller.toggle_video(),
        h.controller.toggle_video(),
        h.controller.toggle_video(),
    );
    assert!(!first.unwrap());
    assert!(second.unwrap());
    assert!(!third.unwrap());

    assert_eq!(
        video_states(h.drain_events()),
        vec![
            (false, VideoSource::None),
            (true, VideoSource::Camera),
            (false, VideoSource::None),
        ]
    );
    assert!(!h.controller.video_state().active);
    assert_eq!(h.link("alice").sent_track_id(MediaKind::Video), None);
    assert_eq!(h.controller.track_manager().pending_operations(), 0);
    assert!(h
        .engine
        .captured_tracks()
        .iter()
        .filter(|t| t.kind() == MediaKind::Video)
        .all(|t| t.is_stopped()));
}

#[tokio::test(start_paused = true)]
async fn screen_share_replaces_camera_and_restores_it() {
    let h = harness();
    h.join_stable(&["alice"], true).await;
    let link = h.link("alice");
    assert_eq!(link.sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));

    h.controller.share_screen().await.unwrap();
    assert_eq!(link.sent_track_id(MediaKind::Video).as_deref(), Some("screen-3"));
    assert_eq!(h.controller.video_state().source, VideoSource::Screen);
    // replaced in place, no renegotiation
    assert_eq!(link.offers_created(), 1);

    h.controller.stop_screen_share().await.unwrap();
    assert_eq!(link.sent_track_id(MediaKind::Video).as_deref(), Some("camera-4"));
    assert_eq!(h.controller.video_state().source, VideoSource::Camera);

    let tracks = h.engine.captured_tracks();
    let stopped: Vec<(String, bool)> = tracks
        .iter()
        .map(|t| (t.id().to_string(), t.is_stopped()))
        .collect();
    assert_eq!(
        stopped,
        vec![
            ("audio-1".to_string(), false),
            ("camera-2".to_string(), true),
            ("screen-3".to_string(), true),
            ("camera-4".to_string(), false),
        ]
    );
    assert_eq!(audio_replacements(&link), 0);
}

#[tokio::test(start_paused = true)]
async fn screen_share_without_camera_ends_with_video_off() {
    let h = harness();
    h.join_stable(&["alice"], false).await;

    h.controller.share_screen().await.unwrap();
    settle().await;
    assert_eq!(h.link("alice").sent_track_id(MediaKind::Video).as_deref(), Some("screen-2"));

    h.controller.stop_screen_share().await.unwrap();
    assert!(!h.controller.video_state().active);
    assert_eq!(h.link("alice").sent_track_id(MediaKind::Video), None);
}

#[tokio::test(start_paused = true)]
async fn denied_screen_capture_leaves_camera_in_place() {
    let mut h = harness();
    h.join_stable(&["alice"], true).await;
    h.drain_events();
    h.engine
        .fail_next_screen_captures(vec![MediaError::PermissionDenied("picker closed".into())]);

    assert!(h.controller.share_screen().await.is_err());
    assert_eq!(h.controller.video_state().source, VideoSource::Camera);
    assert_eq!(h.link("alice").sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::Error(_))));
}

#[tokio::test(start_paused = true)]
async fn failed_replacement_rolls_back_to_previous_track() {
    let mut h = harness();
    h.join_stable(&["alice", "bob"], true).await;
    h.drain_events();
    let bob = h.link("bob");
    for sender in bob.mock_senders().iter().filter(|s| s.kind() == MediaKind::Video) {
        sender.set_fail_replace(true);
    }

    assert!(h.controller.share_screen().await.is_err());

    // camera kept; the abandoned screen capture released
    let state = h.controller.video_state();
    assert_eq!(state.source, VideoSource::Camera);
    assert_eq!(state.track_id(), Some("camera-2"));
    assert_eq!(h.link("alice").sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));
    assert_eq!(bob.sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));
    let screen = h
        .engine
        .captured_tracks()
        .into_iter()
        .find(|t| t.id() == "screen-3")
        .unwrap();
    assert!(screen.is_stopped());
    assert_eq!(
        video_states(h.drain_events()),
        vec![(true, VideoSource::Camera)]
    );
}

#[tokio::test(start_paused = true)]
async fn video_added_to_unstable_link_waits_for_stable() {
    let h = harness();
    // alice's initial offer stays unanswered
    h.join_with(&["alice"], false).await;
    let link = h.link("alice");
    assert_eq!(link.negotiation_state(), NegotiationState::HaveLocalOffer);

    let toggle = {
        let controller = h.controller.clone();
        tokio::spawn(async move { controller.toggle_video().await })
    };
    settle().await;
    assert_eq!(link.sent_track_id(MediaKind::Video), None);

    h.controller
        .handle_answer(&peer("alice"), nexus_voice_core::SessionDescription::answer("v=0"))
        .await
        .unwrap();
    assert!(toggle.await.unwrap().unwrap());
    assert_eq!(link.sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));
}

#[tokio::test(start_paused = true)]
async fn camera_reaches_unanswered_peers_within_one_stable_wait() {
    let h = harness();
    h.join_with(&["a", "b", "c"], false).await;

    let started = Instant::now();
    assert!(h.controller.toggle_video().await.unwrap());
    // the three stable-state waits overlap instead of adding up
    assert!(started.elapsed() < Duration::from_secs(6));

    for id in ["a", "b", "c"] {
        assert_eq!(h.link(id).sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));
    }
    assert_eq!(h.controller.video_state().track_id(), Some("camera-2"));
    assert!(!h.engine.captured_tracks()[1].is_stopped());
}

#[tokio::test(start_paused = true)]
async fn timed_out_camera_start_releases_the_capture() {
    let mut config = quiet_config();
    config.track.operation_timeout = Duration::from_secs(3);
    let h = harness_with(config);
    h.join_with(&["a", "b"], false).await;

    let res = h.controller.toggle_video().await;
    assert!(matches!(
        res,
        Err(ControllerError::Track(TrackError::Timeout {
            kind: OperationKind::AddVideo,
            ..
        }))
    ));
    settle().await;

    let camera = h
        .engine
        .captured_tracks()
        .into_iter()
        .find(|t| t.kind() == MediaKind::Video)
        .unwrap();
    assert!(camera.is_stopped());
    let state = h.controller.video_state();
    assert!(!state.active);
    assert!(state.track.is_none());
    for id in ["a", "b"] {
        assert_eq!(h.link(id).sent_track_id(MediaKind::Video), None);
    }
    assert_eq!(h.controller.track_manager().pending_operations(), 0);

    // the intent follows the held state, so the next toggle starts the camera again
    h.controller
        .handle_answer(&peer("a"), nexus_voice_core::SessionDescription::answer("v=0"))
        .await
        .unwrap();
    h.controller
        .handle_answer(&peer("b"), nexus_voice_core::SessionDescription::answer("v=0"))
        .await
        .unwrap();
    assert!(h.controller.toggle_video().await.unwrap());
    assert!(h.controller.video_state().active);
}

#[tokio::test(start_paused = true)]
async fn synchronisation_repairs_drifted_peers() {
    let mut h = harness();
    h.join_stable(&["alice", "bob"], true).await;
    let bob = h.link("bob");
    let video_sender = bob
        .senders()
        .into_iter()
        .find(|s| s.kind() == MediaKind::Video)
        .unwrap();
    video_sender.replace_track(None).await.unwrap();
    h.drain_events();

    let report = h.controller.synchronize_video_state().await.unwrap();
    assert_eq!(report.detected.len(), 1);
    assert_eq!(report.fixed, vec![peer("bob")]);
    assert!(report.failed.is_empty());
    assert_eq!(bob.sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::VideoStateSynchronized(r) if r.fixed == vec![peer("bob")])));

    // consistent state: nothing to do
    let report = h.controller.synchronize_video_state().await.unwrap();
    assert!(report.detected.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_links_are_skipped_by_video_fan_out() {
    let h = harness();
    h.join_stable(&["alice", "bob"], false).await;
    h.link("bob").set_transport_state(TransportState::Failed);
    settle().await;
    let bob: Arc<MockPeerLink> = h.link("bob");

    assert!(h.controller.toggle_video().await.unwrap());
    assert_eq!(h.link("alice").sent_track_id(MediaKind::Video).as_deref(), Some("camera-2"));
    assert_eq!(bob.sent_track_id(MediaKind::Video), None);
}

#[tokio::test(start_paused = true)]
async fn mute_flips_the_audio_track_only() {
    let h = harness();
    h.join_stable(&["alice"], true).await;
    let link = h.link("alice");

    assert!(h.controller.toggle_mute().await.unwrap());
    let audio = h.controller.local_audio().unwrap();
    assert!(!audio.is_enabled());
    assert_eq!(link.sent_track_id(MediaKind::Audio).as_deref(), Some("audio-1"));
    assert_eq!(audio_replacements(&link), 0);
    assert!(h.controller.video_state().active);
}
