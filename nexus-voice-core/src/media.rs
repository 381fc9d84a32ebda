//! Local media acquisition
//!
//! Capture goes through the [`MediaEngine`]; this module adds the error
//! taxonomy and the bounded retry policy around it.

use crate::engine::{LocalTrack, MediaEngine};
use crate::events::RecommendedAction;
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Media-acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or the platform denied access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No matching capture device
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device held by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Requested constraints cannot be satisfied
    #[error("Constraints not supported: {0}")]
    ConstraintsUnsupported(String),

    /// Transient capture failure
    #[error("Capture failed: {0}")]
    CaptureFailed(String),
}

impl MediaError {
    /// Whether another attempt may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceBusy(_) | Self::CaptureFailed(_))
    }

    /// Message suitable for display to the user
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => {
                "Microphone or camera access was denied. Allow access to join the call."
            }
            Self::DeviceNotFound(_) => "No microphone or camera was found.",
            Self::DeviceBusy(_) => "Your microphone or camera is in use by another application.",
            Self::ConstraintsUnsupported(_) => {
                "Your device does not support the requested media settings."
            }
            Self::CaptureFailed(_) => "Could not start capturing media.",
        }
    }

    /// Action the user should take
    #[must_use]
    pub fn recommended_action(&self) -> RecommendedAction {
        match self {
            Self::PermissionDenied(_) => RecommendedAction::CheckPermissions,
            Self::DeviceNotFound(_) | Self::DeviceBusy(_) | Self::ConstraintsUnsupported(_) => {
                RecommendedAction::CheckDevice
            }
            Self::CaptureFailed(_) => RecommendedAction::Retry,
        }
    }
}

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Capture microphone
    pub audio: bool,
    /// Capture camera
    pub video: bool,
}

impl CaptureConstraints {
    /// Microphone only
    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Camera only
    #[must_use]
    pub fn camera_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }

    /// Microphone and camera
    #[must_use]
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Retry policy for local media acquisition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt
    #[serde(with = "crate::config::millis")]
    pub base_delay: Duration,
}

impl Default for MediaRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl MediaRetryConfig {
    /// Delay before attempt number `attempt` (1-based, attempt 1 has none)
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.base_delay * 2u32.saturating_pow(attempt - 2)
        }
    }
}

/// Tracks captured for a session
#[derive(Clone, Default)]
pub struct LocalMedia {
    /// Microphone track
    pub audio: Option<Arc<dyn LocalTrack>>,
    /// Camera track
    pub video: Option<Arc<dyn LocalTrack>>,
}

impl LocalMedia {
    /// Split captured tracks by kind
    #[must_use]
    pub fn from_tracks(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        let mut media = Self::default();
        for track in tracks {
            match track.kind() {
                MediaKind::Audio if media.audio.is_none() => media.audio = Some(track),
                MediaKind::Video if media.video.is_none() => media.video = Some(track),
                _ => {
                    tracing::debug!(track_id = track.id(), "Releasing surplus captured track");
                    track.stop();
                }
            }
        }
        media
    }

    /// Stop every held track
    pub fn stop_all(&self) {
        for track in self.audio.iter().chain(self.video.iter()) {
            track.stop();
        }
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("audio", &self.audio.as_ref().map(|t| t.id().to_string()))
            .field("video", &self.video.as_ref().map(|t| t.id().to_string()))
            .finish()
    }
}

/// Capture local media with bounded retry
///
/// Non-retryable errors (permission, missing device, unsupported
/// constraints) abort on the first failure.
///
/// # Errors
///
/// Returns the last capture error once attempts are exhausted
#[tracing::instrument(skip(engine, retry), fields(audio = constraints.audio, video = constraints.video))]
pub async fn acquire_local_media(
    engine: &dyn MediaEngine,
    constraints: CaptureConstraints,
    retry: &MediaRetryConfig,
) -> Result<LocalMedia, MediaError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let delay = retry.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match engine.capture_media(&constraints).await {
            Ok(tracks) => {
                let media = LocalMedia::from_tracks(tracks);
                tracing::info!(attempt, media = ?media, "Local media acquired");
                return Ok(media);
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!(attempt, error = %e, "Local media acquisition failed, not retryable");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::warn!(attempt, error = %e, "Local media acquisition failed, giving up");
                return Err(e);
            }
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Local media acquisition failed, retrying");
                attempt += 1;
            }
        }
    }
}
