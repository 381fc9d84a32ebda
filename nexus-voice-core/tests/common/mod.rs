//! Shared harness for controller integration tests

#![allow(dead_code)]

use nexus_voice_core::signaling::{InboundSignal, RosterEntry};
use nexus_voice_core::testing::{MockEngine, MockPeerLink, MockSignaling};
use nexus_voice_core::{
    ChannelId, PeerId, PeerLifecycleController, RosterReport, SessionConfig, SessionDescription,
    SessionEvent,
};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::broadcast;

static TRACING: Once = Once::new();

/// Route library logs to the test output, filtered by `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Harness {
    pub controller: PeerLifecycleController,
    pub engine: Arc<MockEngine>,
    pub signaling: Arc<MockSignaling>,
    pub events: broadcast::Receiver<SessionEvent>,
}

/// Configuration with the scheduled health loop off
pub fn quiet_config() -> SessionConfig {
    SessionConfig {
        health_check_interval: None,
        ..SessionConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(quiet_config())
}

pub fn harness_with(config: SessionConfig) -> Harness {
    init_tracing();
    let engine = Arc::new(MockEngine::new());
    let signaling = Arc::new(MockSignaling::new());
    let controller = PeerLifecycleController::new(config, engine.clone(), signaling.clone())
        .expect("valid config");
    let events = controller.subscribe();
    Harness {
        controller,
        engine,
        signaling,
        events,
    }
}

pub fn channel() -> ChannelId {
    ChannelId::new("general")
}

pub fn peer(id: &str) -> PeerId {
    PeerId::new(id)
}

pub fn roster(ids: &[&str]) -> InboundSignal {
    InboundSignal::ExistingUsers {
        users: ids
            .iter()
            .map(|id| RosterEntry {
                user_id: PeerId::new(*id),
                username: Some(format!("user {id}")),
            })
            .collect(),
    }
}

/// Let spawned tasks run without moving the paused clock noticeably
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

impl Harness {
    /// Join with the given participants already present
    pub async fn join_with(&self, ids: &[&str], video: bool) -> RosterReport {
        if !ids.is_empty() {
            self.signaling.push_inbound(roster(ids));
        }
        self.controller
            .join(channel(), video)
            .await
            .expect("join succeeds")
    }

    /// Join, then answer every initial offer so each link is stable
    pub async fn join_stable(&self, ids: &[&str], video: bool) -> RosterReport {
        let report = self.join_with(ids, video).await;
        for id in ids {
            self.controller
                .handle_answer(&peer(id), SessionDescription::answer("v=0 remote-answer"))
                .await
                .expect("answer applies");
        }
        settle().await;
        report
    }

    /// Mock link currently bound to a peer
    pub fn link(&self, id: &str) -> Arc<MockPeerLink> {
        let handle = self.controller.link_handle(&peer(id)).expect("peer has a link");
        self.engine
            .links()
            .into_iter()
            .find(|l| {
                Arc::as_ptr(l).cast::<()>() == Arc::as_ptr(&handle).cast::<()>()
            })
            .expect("link created by the mock engine")
    }

    /// Drain every event published so far
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
