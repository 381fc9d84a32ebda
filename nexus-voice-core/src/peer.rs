//! Per-participant peer link record

use crate::engine::PeerLinkHandle;
use crate::types::{NegotiationState, PeerId, TransportState};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One direct media connection to a remote participant
#[derive(Clone)]
pub struct PeerLink {
    /// Remote participant
    pub peer_id: PeerId,
    /// Display name, when known
    pub username: Option<String>,
    /// Engine handle
    pub handle: Arc<dyn PeerLinkHandle>,
    /// Set once the relay-only fallback is engaged
    pub relay_only: bool,
    /// Whether this side yields when both sides offer at once
    ///
    /// The participant who joined later is polite toward everyone already
    /// present, so the two ends of a link always disagree.
    pub polite: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// First time the transport reached `connected`
    pub established_at: Option<DateTime<Utc>>,
    bindings: CancellationToken,
    negotiating: Arc<AtomicBool>,
}

impl PeerLink {
    /// Wrap a freshly created engine handle
    #[must_use]
    pub fn new(peer_id: PeerId, username: Option<String>, handle: Arc<dyn PeerLinkHandle>) -> Self {
        Self {
            peer_id,
            username,
            handle,
            relay_only: false,
            polite: true,
            created_at: Utc::now(),
            established_at: None,
            bindings: CancellationToken::new(),
            negotiating: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token owning the link's event bindings
    #[must_use]
    pub fn bindings(&self) -> CancellationToken {
        self.bindings.clone()
    }

    /// Current negotiation state
    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        self.handle.negotiation_state()
    }

    /// Current transport state
    #[must_use]
    pub fn transport_state(&self) -> TransportState {
        self.handle.transport_state()
    }

    /// Record the first successful connection
    pub fn mark_established(&mut self) {
        if self.established_at.is_none() {
            self.established_at = Some(Utc::now());
        }
    }

    /// Whether a local negotiation cycle is running
    #[must_use]
    pub fn is_negotiating(&self) -> bool {
        self.negotiating.load(Ordering::SeqCst)
    }

    /// Claim the link for a negotiation cycle
    ///
    /// Returns `None` if another cycle holds it. The claim is released when
    /// the guard drops.
    #[must_use]
    pub fn try_begin_negotiation(&self) -> Option<NegotiationGuard> {
        self.negotiating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| NegotiationGuard {
                flag: self.negotiating.clone(),
            })
    }

    /// Unbind events and close the engine link
    pub async fn close(&self) {
        self.bindings.cancel();
        self.handle.close().await;
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.peer_id)
            .field("negotiation_state", &self.negotiation_state())
            .field("transport_state", &self.transport_state())
            .field("relay_only", &self.relay_only)
            .field("polite", &self.polite)
            .field("created_at", &self.created_at)
            .field("established_at", &self.established_at)
            .finish()
    }
}

/// Exclusive claim on a link's negotiation
#[derive(Debug)]
pub struct NegotiationGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for NegotiationGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
