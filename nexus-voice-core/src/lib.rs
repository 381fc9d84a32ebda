//! Nexus Voice - peer connection lifecycle for full-mesh voice/video channels
//!
//! This library drives one participant's side of a voice channel in which
//! every participant holds a direct media link to every other. It features:
//!
//! - **Offer/Answer Orchestration**: Per-peer negotiation with glare rollback
//!   and at most one negotiation in flight
//! - **Serialized Track Operations**: Camera, screen share and sync changes
//!   queued and applied one at a time, never touching audio
//! - **Transport Recovery**: ICE restart, relay-only and STUN-only fallback,
//!   then bounded exponential-backoff reconnection
//! - **Health Monitoring**: Periodic quality sampling, inconsistency repair
//!   and automatic recovery
//!
//! The media stack and the signaling socket are supplied by the host through
//! the [`MediaEngine`] and [`SignalingTransport`] traits.
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
//! let config = SessionConfig::from_json(r#"{"ice_servers": []}"#)?;
//! let controller = PeerLifecycleController::new(config, engine, transport)?;
//!
//! // Join with camera on
//! let roster = controller.join(ChannelId::new("general"), true).await?;
//! for peer in &roster.failed {
//!     println!("{} is retried in the background", peer.0);
//! }
//!
//! // Share the screen; the camera comes back afterwards
//! controller.share_screen().await?;
//! controller.stop_screen_share().await?;
//! controller.leave().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core identifiers, states and descriptions
pub mod types;

/// Session configuration
pub mod config;

/// Media engine abstraction
pub mod engine;

/// ICE server configuration and fallback ladder
pub mod ice;

/// Local media acquisition
pub mod media;

/// Event registry
pub mod events;

/// Signaling wire format and handler
pub mod signaling;

/// Serialized track operation queue
pub mod track_manager;

/// Connection quality monitoring
pub mod monitor;

/// Peer reconnection with backoff
pub mod reconnection;

/// Video state inconsistency detection and repair
pub mod sync;

/// Peer link health assessment
pub mod health;

/// Peer link records
pub mod peer;

/// Session lifetime
pub mod session;

/// Peer lifecycle orchestration
pub mod controller;

/// In-memory engine and signaling doubles
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use config::{ConfigError, SessionConfig};
pub use controller::{ControllerError, PeerLifecycleController, RemoteStatus, RosterReport};
pub use engine::{EngineError, LinkEvent, LocalTrack, MediaEngine, PeerLinkHandle, RtpSender};
pub use events::{ErrorSeverity, EventBus, RecommendedAction, SessionError, SessionEvent};
pub use health::{HealthIssue, HealthRecommendation, HealthReport, PeerHealth};
pub use ice::{FallbackStage, IceConfiguration, IceServer, IceTransportPolicy};
pub use media::{CaptureConstraints, LocalMedia, MediaError, MediaRetryConfig};
pub use monitor::{ConnectionMonitor, MonitorConfig};
pub use peer::PeerLink;
pub use reconnection::{ReconnectionConfig, ReconnectionError, ReconnectionManager};
pub use signaling::{
    InboundSignal, OutboundSignal, RosterEntry, SignalingError, SignalingHandler,
    SignalingTransport, TransportFrame,
};
pub use sync::{Inconsistency, InconsistencyKind, StateSynchronizer, SyncReport};
pub use track_manager::{OperationKind, TrackError, TrackManager, TrackManagerConfig, TrackState};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::controller::{ControllerError, PeerLifecycleController, RosterReport};
    pub use crate::engine::{LocalTrack, MediaEngine, PeerLinkHandle};
    pub use crate::events::SessionEvent;
    pub use crate::signaling::{SignalingTransport, TransportFrame};
    pub use crate::types::{ChannelId, NetworkStatus, PeerId, VideoSource};
}
