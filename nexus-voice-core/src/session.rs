//! Voice session lifetime

use crate::engine::LocalTrack;
use crate::types::ChannelId;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One joined channel
///
/// Created on join and consumed by [`Session::dispose`] on leave. The
/// session token parents every session-scoped background task.
pub struct Session {
    channel_id: ChannelId,
    audio: Option<Arc<dyn LocalTrack>>,
    created_at: DateTime<Utc>,
    token: CancellationToken,
    resume_camera: bool,
    background: bool,
}

impl Session {
    /// Start a session
    #[must_use]
    pub fn new(channel_id: ChannelId, audio: Option<Arc<dyn LocalTrack>>) -> Self {
        Self {
            channel_id,
            audio,
            created_at: Utc::now(),
            token: CancellationToken::new(),
            resume_camera: false,
            background: false,
        }
    }

    /// Joined channel
    #[must_use]
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Microphone track
    #[must_use]
    pub fn audio(&self) -> Option<&Arc<dyn LocalTrack>> {
        self.audio.as_ref()
    }

    /// Swap in a recaptured microphone; returns the old track
    pub fn replace_audio(&mut self, audio: Arc<dyn LocalTrack>) -> Option<Arc<dyn LocalTrack>> {
        self.audio.replace(audio)
    }

    /// Join time
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Child token for a session-scoped task
    #[must_use]
    pub fn task_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Whether the session is still live
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Whether the camera comes back when screen sharing stops
    #[must_use]
    pub fn resume_camera(&self) -> bool {
        self.resume_camera
    }

    /// Remember whether to restore the camera after screen sharing
    pub fn set_resume_camera(&mut self, resume: bool) {
        self.resume_camera = resume;
    }

    /// Whether the application is backgrounded
    #[must_use]
    pub fn is_background(&self) -> bool {
        self.background
    }

    /// Record background state; returns the previous value
    pub fn set_background(&mut self, background: bool) -> bool {
        std::mem::replace(&mut self.background, background)
    }

    /// Stop every session task and release the microphone
    pub fn dispose(self) -> ChannelId {
        self.token.cancel();
        if let Some(audio) = &self.audio {
            audio.stop();
        }
        tracing::debug!(channel = %self.channel_id, "Session disposed");
        self.channel_id
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("channel_id", &self.channel_id)
            .field("audio", &self.audio.as_ref().map(|t| t.id().to_string()))
            .field("created_at", &self.created_at)
            .field("active", &self.is_active())
            .finish()
    }
}
