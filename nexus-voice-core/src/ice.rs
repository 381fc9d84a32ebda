//! ICE server configuration and the transport fallback ladder

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public STUN server always included in the configuration
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    /// Server URLs (`stun:`, `turn:` or `turns:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default)]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN-only server entry
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN server entry with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Whether any URL points at a relay server
    #[must_use]
    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }

    fn has_credentials(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.username) && filled(&self.credential)
    }
}

/// Candidate gathering policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// Host, server-reflexive and relay candidates
    All,
    /// Relay candidates only
    Relay,
}

/// Validated ICE configuration handed to the media engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfiguration {
    /// Usable servers
    pub servers: Vec<IceServer>,
    /// Gathering policy
    pub policy: IceTransportPolicy,
}

impl IceConfiguration {
    /// Validate a configured server list
    ///
    /// STUN is always present. Relay entries lacking a username or credential
    /// are dropped with a warning; if none survive the configuration degrades
    /// to STUN-only.
    #[must_use]
    pub fn from_servers(configured: &[IceServer]) -> Self {
        let mut servers = Vec::with_capacity(configured.len() + 1);
        let mut has_stun = false;

        for server in configured {
            if server.is_relay() {
                if server.has_credentials() {
                    servers.push(server.clone());
                } else {
                    tracing::warn!(
                        urls = ?server.urls,
                        "TURN server missing username or credential, relay unavailable for it"
                    );
                }
            } else if !server.urls.is_empty() {
                has_stun = true;
                servers.push(server.clone());
            }
        }

        if !has_stun {
            servers.insert(0, IceServer::stun(DEFAULT_STUN_URL));
        }

        let config = Self {
            servers,
            policy: IceTransportPolicy::All,
        };
        if !config.relay_available() {
            tracing::warn!("No valid TURN server configured, running STUN-only");
        }
        config
    }

    /// Whether at least one relay server is usable
    #[must_use]
    pub fn relay_available(&self) -> bool {
        self.servers.iter().any(IceServer::is_relay)
    }

    /// Relay-only variant, if a relay is available
    #[must_use]
    pub fn relay_only(&self) -> Option<Self> {
        if !self.relay_available() {
            return None;
        }
        Some(Self {
            servers: self.servers.iter().filter(|s| s.is_relay()).cloned().collect(),
            policy: IceTransportPolicy::Relay,
        })
    }

    /// STUN-only variant used as the last resort before reconnection
    #[must_use]
    pub fn stun_only(&self) -> Self {
        let mut servers: Vec<IceServer> =
            self.servers.iter().filter(|s| !s.is_relay()).cloned().collect();
        if servers.is_empty() {
            servers.push(IceServer::stun(DEFAULT_STUN_URL));
        }
        Self {
            servers,
            policy: IceTransportPolicy::All,
        }
    }
}

impl Default for IceConfiguration {
    fn default() -> Self {
        Self::from_servers(&[])
    }
}

/// Rungs of the transport fallback ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackStage {
    /// Renegotiate with fresh ICE credentials
    IceRestart,
    /// Restrict gathering to TURN relays
    RelayOnly,
    /// Drop relays and retry with STUN only
    StunOnly,
    /// Give up on in-place repair and rebuild the link
    Reconnect,
}

impl FallbackStage {
    /// Next rung; relay-only is skipped when no relay is configured
    #[must_use]
    pub fn next(self, relay_available: bool) -> Self {
        match self {
            Self::IceRestart if relay_available => Self::RelayOnly,
            Self::IceRestart | Self::RelayOnly => Self::StunOnly,
            Self::StunOnly | Self::Reconnect => Self::Reconnect,
        }
    }
}

/// Per-peer ICE recovery bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct IceRecoveryRecord {
    /// Rung to try on the next ICE failure
    pub next_stage: FallbackStage,
    /// ICE restarts issued for this peer
    pub restarts: u32,
    /// Last ICE failure
    pub last_failure: Option<DateTime<Utc>>,
}

impl Default for IceRecoveryRecord {
    fn default() -> Self {
        Self {
            next_stage: FallbackStage::IceRestart,
            restarts: 0,
            last_failure: None,
        }
    }
}

impl IceRecoveryRecord {
    /// Record a failure and return the rung to apply now
    pub fn escalate(&mut self, relay_available: bool) -> FallbackStage {
        let stage = self.next_stage;
        self.next_stage = stage.next(relay_available);
        self.last_failure = Some(Utc::now());
        if stage != FallbackStage::Reconnect {
            self.restarts += 1;
        }
        stage
    }
}
