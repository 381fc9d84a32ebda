//! Connection Monitor
//!
//! Polls each peer link's statistics on a fixed cadence and keeps the latest
//! [`ConnectionQuality`] snapshot per peer.

use crate::engine::{EngineError, PeerLinkHandle};
use crate::events::{EventBus, SessionEvent};
use crate::types::{ConnectionQuality, PeerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Connection Monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Statistics polling interval; at most 2 seconds
    #[serde(with = "crate::config::millis")]
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
        }
    }
}

struct MonitorEntry {
    epoch: u64,
    token: CancellationToken,
    quality: Option<ConnectionQuality>,
}

#[derive(Default)]
struct Entries {
    next_epoch: u64,
    peers: HashMap<PeerId, MonitorEntry>,
}

/// Per-peer link quality poller
#[derive(Clone)]
pub struct ConnectionMonitor {
    config: MonitorConfig,
    events: EventBus,
    entries: Arc<Mutex<Entries>>,
}

impl ConnectionMonitor {
    /// Create a monitor publishing to `events`
    #[must_use]
    pub fn new(config: MonitorConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            entries: Arc::new(Mutex::new(Entries::default())),
        }
    }

    /// Start polling a link
    ///
    /// An initial snapshot is taken immediately. Restarting monitoring for a
    /// peer replaces the previous poller.
    pub fn start_monitoring(&self, peer_id: PeerId, link: Arc<dyn PeerLinkHandle>) {
        let token = CancellationToken::new();
        let epoch = {
            let mut entries = self.entries.lock();
            entries.next_epoch += 1;
            let epoch = entries.next_epoch;
            let previous = entries.peers.insert(
                peer_id.clone(),
                MonitorEntry {
                    epoch,
                    token: token.clone(),
                    quality: None,
                },
            );
            if let Some(previous) = previous {
                previous.token.cancel();
            }
            epoch
        };

        tracing::debug!(peer_id = %peer_id, interval_ms = self.config.interval.as_millis(), "Starting connection monitoring");
        tokio::spawn(poll(
            self.clone(),
            peer_id,
            link,
            epoch,
            token,
        ));
    }

    /// Stop polling a peer and discard its snapshot
    pub fn stop_monitoring(&self, peer_id: &PeerId) {
        if let Some(entry) = self.entries.lock().peers.remove(peer_id) {
            entry.token.cancel();
            tracing::debug!(peer_id = %peer_id, "Stopped connection monitoring");
        }
    }

    /// Stop every poller
    pub fn stop_all(&self) {
        let drained: Vec<MonitorEntry> = {
            let mut entries = self.entries.lock();
            entries.peers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.token.cancel();
        }
    }

    /// Latest snapshot for a peer; `None` when unmonitored or not yet sampled
    #[must_use]
    pub fn quality(&self, peer_id: &PeerId) -> Option<ConnectionQuality> {
        self.entries
            .lock()
            .peers
            .get(peer_id)
            .and_then(|entry| entry.quality.clone())
    }

    /// Peers currently monitored
    #[must_use]
    pub fn monitored_peers(&self) -> Vec<PeerId> {
        self.entries.lock().peers.keys().cloned().collect()
    }

    /// Store a sample; returns whether it should be published, or `None` if
    /// the poller is stale
    fn record(&self, peer_id: &PeerId, epoch: u64, quality: &ConnectionQuality) -> Option<bool> {
        let mut entries = self.entries.lock();
        let entry = entries.peers.get_mut(peer_id)?;
        if entry.epoch != epoch {
            return None;
        }
        let changed = entry.quality.as_ref().map_or(true, |previous| {
            previous.bucket != quality.bucket || previous.transport_state != quality.transport_state
        });
        entry.quality = Some(quality.clone());
        Some(changed)
    }
}

async fn poll(
    monitor: ConnectionMonitor,
    peer_id: PeerId,
    link: Arc<dyn PeerLinkHandle>,
    epoch: u64,
    token: CancellationToken,
) {
    let period = monitor.config.interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let stats = tokio::select! {
            () = token.cancelled() => return,
            stats = link.stats() => stats,
        };

        match stats {
            Ok(stats) => {
                let quality = ConnectionQuality::from_stats(&stats, link.transport_state());
                tracing::trace!(
                    peer_id = %peer_id,
                    rtt_ms = quality.rtt_ms,
                    loss = quality.packet_loss,
                    jitter_ms = quality.jitter_ms,
                    bucket = ?quality.bucket,
                    "Connection quality sample"
                );
                match monitor.record(&peer_id, epoch, &quality) {
                    None => return,
                    Some(true) => {
                        tracing::debug!(peer_id = %peer_id, bucket = ?quality.bucket, "Connection quality changed");
                        monitor.events.emit(SessionEvent::ConnectionQualityChanged {
                            peer_id: peer_id.clone(),
                            quality,
                        });
                    }
                    Some(false) => {}
                }
            }
            Err(EngineError::Closed) => {
                tracing::debug!(peer_id = %peer_id, "Link closed, monitoring ends");
                return;
            }
            Err(e) => {
                tracing::trace!(peer_id = %peer_id, error = %e, "Statistics unavailable");
            }
        }

        tokio::select! {
            () = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
    }
}
