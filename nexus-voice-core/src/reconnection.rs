//! Reconnection Manager
//!
//! Rebuilds peer links whose transport failed, with a bounded attempt count
//! and an escalating backoff schedule. The actual rebuild is delegated to a
//! [`PeerReconnector`], normally the lifecycle controller.

use crate::events::{EventBus, SessionEvent};
use crate::signaling::SignalingError;
use crate::types::PeerId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Reconnection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionError {
    /// Attempt budget exhausted
    #[error("Maximum reconnection attempts ({attempts}) reached for {peer_id}")]
    MaxAttemptsReached {
        /// Peer
        peer_id: PeerId,
        /// Attempts made
        attempts: u32,
    },

    /// An attempt is already running for the peer
    #[error("Reconnection already in progress for {0}")]
    AlreadyInProgress(PeerId),

    /// Signaling did not come back in time
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(#[from] SignalingError),

    /// Rebuilding the link failed
    #[error("Failed to recreate peer link: {0}")]
    RecreateFailed(String),

    /// Attempt was cancelled
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Attempts before the peer is dropped
    pub max_attempts: u32,
    /// Delay before each attempt; the last entry repeats
    #[serde(with = "crate::config::millis_vec")]
    pub backoff: Vec<Duration>,
    /// How long an attempt waits for the signaling channel
    #[serde(with = "crate::config::millis")]
    pub signaling_wait: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
            signaling_wait: Duration::from_secs(10),
        }
    }
}

impl ReconnectionConfig {
    /// Backoff before the attempt with 0-based index `attempt`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(index).copied().unwrap_or_default()
    }
}

/// Performs the per-peer rebuild on behalf of the manager
#[async_trait]
pub trait PeerReconnector: Send + Sync {
    /// Wait until signaling is usable
    async fn wait_for_signaling(&self, timeout: Duration) -> Result<(), SignalingError>;

    /// Close the old link, create a fresh one with local tracks attached
    /// and send an ICE-restart offer
    async fn recreate_peer_link(&self, peer_id: &PeerId) -> Result<(), ReconnectionError>;

    /// Drop a peer whose attempts are exhausted
    async fn abandon_peer(&self, peer_id: &PeerId);
}

/// Per-peer reconnection bookkeeping
#[derive(Debug, Clone)]
pub struct ReconnectionRecord {
    /// Attempts started since the last reset
    pub attempts: u32,
    /// Whether an attempt is running
    pub in_flight: bool,
    /// Start of the last attempt
    pub last_attempt: Option<DateTime<Utc>>,
    token: CancellationToken,
}

impl Default for ReconnectionRecord {
    fn default() -> Self {
        Self {
            attempts: 0,
            in_flight: false,
            last_attempt: None,
            token: CancellationToken::new(),
        }
    }
}

/// Bounded, per-peer serialised reconnection
#[derive(Clone)]
pub struct ReconnectionManager {
    config: ReconnectionConfig,
    events: EventBus,
    reconnector: Arc<dyn PeerReconnector>,
    records: Arc<Mutex<HashMap<PeerId, ReconnectionRecord>>>,
}

impl ReconnectionManager {
    /// Create a manager delegating rebuilds to `reconnector`
    #[must_use]
    pub fn new(
        config: ReconnectionConfig,
        events: EventBus,
        reconnector: Arc<dyn PeerReconnector>,
    ) -> Self {
        Self {
            config,
            events,
            reconnector,
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Active policy
    #[must_use]
    pub fn config(&self) -> &ReconnectionConfig {
        &self.config
    }

    /// Run one reconnection attempt
    ///
    /// # Errors
    ///
    /// Returns [`ReconnectionError::MaxAttemptsReached`] without retrying
    /// once the budget is spent, [`ReconnectionError::AlreadyInProgress`] if
    /// another attempt is running, or the failure of this attempt
    #[tracing::instrument(skip(self), fields(peer_id = %peer_id))]
    pub async fn attempt_reconnection(&self, peer_id: &PeerId) -> Result<(), ReconnectionError> {
        let (attempt, token) = {
            let mut records = self.records.lock();
            let record = records.entry(peer_id.clone()).or_default();
            if record.attempts >= self.config.max_attempts {
                return Err(ReconnectionError::MaxAttemptsReached {
                    peer_id: peer_id.clone(),
                    attempts: record.attempts,
                });
            }
            if record.in_flight {
                return Err(ReconnectionError::AlreadyInProgress(peer_id.clone()));
            }
            let attempt = record.attempts;
            record.attempts += 1;
            record.in_flight = true;
            record.last_attempt = Some(Utc::now());
            (attempt, record.token.clone())
        };

        let delay = self.config.delay_for(attempt);
        tracing::info!(
            attempt = attempt + 1,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis(),
            "Scheduling reconnection attempt"
        );
        self.events.emit(SessionEvent::Reconnecting {
            peer_id: peer_id.clone(),
            attempt: attempt + 1,
            delay,
        });

        let result = tokio::select! {
            () = token.cancelled() => Err(ReconnectionError::Cancelled),
            res = self.run_attempt(peer_id, delay) => res,
        };

        if let Some(record) = self.records.lock().get_mut(peer_id) {
            record.in_flight = false;
        }

        match &result {
            Ok(()) => tracing::info!(attempt = attempt + 1, "Peer link recreated"),
            Err(e) => tracing::warn!(attempt = attempt + 1, error = %e, "Reconnection attempt failed"),
        }
        result
    }

    async fn run_attempt(&self, peer_id: &PeerId, delay: Duration) -> Result<(), ReconnectionError> {
        tokio::time::sleep(delay).await;
        self.reconnector
            .wait_for_signaling(self.config.signaling_wait)
            .await?;
        self.reconnector.recreate_peer_link(peer_id).await
    }

    /// Reconnect in the background until an attempt succeeds or the budget
    /// is spent; an exhausted peer is abandoned
    pub fn schedule_reconnection(&self, peer_id: PeerId) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match manager.attempt_reconnection(&peer_id).await {
                    Ok(()) | Err(ReconnectionError::Cancelled) => return,
                    Err(ReconnectionError::AlreadyInProgress(_)) => {
                        tracing::debug!(peer_id = %peer_id, "Reconnection already running");
                        return;
                    }
                    Err(ReconnectionError::MaxAttemptsReached { attempts, .. }) => {
                        tracing::warn!(peer_id = %peer_id, attempts, "Giving up on peer");
                        manager.cancel_reconnection(&peer_id);
                        manager.events.emit(SessionEvent::ReconnectionFailed {
                            peer_id: peer_id.clone(),
                            attempts,
                        });
                        manager.reconnector.abandon_peer(&peer_id).await;
                        return;
                    }
                    Err(_) => {}
                }
            }
        });
    }

    /// Clear the attempt counter after a successful connection
    pub fn reset_reconnection_state(&self, peer_id: &PeerId) {
        if let Some(record) = self.records.lock().get_mut(peer_id) {
            record.attempts = 0;
            record.last_attempt = None;
        }
    }

    /// Cancel any attempt for a peer and forget it
    pub fn cancel_reconnection(&self, peer_id: &PeerId) {
        if let Some(record) = self.records.lock().remove(peer_id) {
            record.token.cancel();
        }
    }

    /// Cancel every attempt and forget all peers
    pub fn cancel_all(&self) {
        let drained: Vec<ReconnectionRecord> =
            self.records.lock().drain().map(|(_, r)| r).collect();
        for record in drained {
            record.token.cancel();
        }
    }

    /// Attempts started for a peer since the last reset
    #[must_use]
    pub fn attempts(&self, peer_id: &PeerId) -> u32 {
        self.records.lock().get(peer_id).map_or(0, |r| r.attempts)
    }

    /// Whether an attempt is running for a peer
    #[must_use]
    pub fn is_in_flight(&self, peer_id: &PeerId) -> bool {
        self.records.lock().get(peer_id).is_some_and(|r| r.in_flight)
    }

    /// Peers with reconnection state
    #[must_use]
    pub fn tracked_peers(&self) -> Vec<PeerId> {
        self.records.lock().keys().cloned().collect()
    }
}
