//! Track Manager
//!
//! Owns the single local video track and serialises every mutation of it
//! through an ordered operation queue. One drain task runs operations one at
//! a time, each bounded by a timeout; a stuck operation fails with
//! [`TrackError::Timeout`] and the queue moves on.

use crate::engine::{same_track, EngineError, LocalTrack};
use crate::media::MediaError;
use crate::types::VideoSource;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Track operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    /// Operation exceeded the per-operation timeout
    #[error("{kind} operation timed out after {timeout:?}")]
    Timeout {
        /// Operation kind
        kind: OperationKind,
        /// Timeout applied
        timeout: Duration,
    },

    /// Operation was rejected by a reset
    #[error("Operation cancelled")]
    Cancelled,

    /// No video track is held
    #[error("No video track")]
    NoTrack,

    /// Engine rejected a sender operation
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Capture failed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Any other failure reported by an executor
    #[error("Operation failed: {0}")]
    Failed(String),
}

/// Kind of a queued track operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Start the camera
    AddVideo,
    /// Stop the camera
    RemoveVideo,
    /// Switch video to screen capture
    StartScreenShare,
    /// Switch back from screen capture
    StopScreenShare,
    /// Swap the video track on every sender
    ReplaceTrack,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AddVideo => "add-video",
            Self::RemoveVideo => "remove-video",
            Self::StartScreenShare => "start-screen-share",
            Self::StopScreenShare => "stop-screen-share",
            Self::ReplaceTrack => "replace-track",
        };
        f.write_str(s)
    }
}

/// Unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(pub Uuid);

impl OperationId {
    /// Generate a new random operation ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Track Manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackManagerConfig {
    /// Hard timeout applied to every queued operation
    #[serde(with = "crate::config::millis")]
    pub operation_timeout: Duration,
}

impl Default for TrackManagerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
        }
    }
}

/// Local video intent
#[derive(Clone)]
pub struct TrackState {
    /// Video source
    pub source: VideoSource,
    /// Held track
    pub track: Option<Arc<dyn LocalTrack>>,
    /// Whether video is on
    pub active: bool,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl TrackState {
    fn empty() -> Self {
        Self {
            source: VideoSource::None,
            track: None,
            active: false,
            updated_at: Utc::now(),
        }
    }

    /// Id of the held track
    #[must_use]
    pub fn track_id(&self) -> Option<&str> {
        self.track.as_ref().map(|t| t.id())
    }
}

impl Default for TrackState {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for TrackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackState")
            .field("source", &self.source)
            .field("track", &self.track_id())
            .field("active", &self.active)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Point-in-time copy of the track state
#[derive(Debug, Clone)]
pub struct TrackStateSnapshot(TrackState);

impl TrackStateSnapshot {
    /// Captured state
    #[must_use]
    pub fn state(&self) -> &TrackState {
        &self.0
    }
}

type OperationFuture = BoxFuture<'static, Result<(), TrackError>>;
type Executor = Box<dyn FnOnce() -> OperationFuture + Send>;

struct Operation {
    id: OperationId,
    kind: OperationKind,
    executor: Executor,
    done: oneshot::Sender<Result<(), TrackError>>,
}

/// Completion handle of a queued operation
#[derive(Debug)]
pub struct OperationHandle {
    id: OperationId,
    kind: OperationKind,
    rx: oneshot::Receiver<Result<(), TrackError>>,
}

impl OperationHandle {
    /// Operation identifier
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Operation kind
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Wait for the operation to finish
    ///
    /// # Errors
    ///
    /// Returns the executor's error, [`TrackError::Timeout`] or
    /// [`TrackError::Cancelled`]
    pub async fn wait(self) -> Result<(), TrackError> {
        self.rx.await.unwrap_or(Err(TrackError::Cancelled))
    }
}

struct Queue {
    pending: VecDeque<Operation>,
    processing: bool,
    generation: u64,
    current: Option<CancellationToken>,
}

struct Inner {
    config: TrackManagerConfig,
    queue: Mutex<Queue>,
    state: Mutex<TrackState>,
}

/// Serialised owner of the local video track
#[derive(Clone)]
pub struct TrackManager {
    inner: Arc<Inner>,
}

impl TrackManager {
    /// Create an idle manager
    #[must_use]
    pub fn new(config: TrackManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                queue: Mutex::new(Queue {
                    pending: VecDeque::new(),
                    processing: false,
                    generation: 0,
                    current: None,
                }),
                state: Mutex::new(TrackState::empty()),
            }),
        }
    }

    /// Append an operation to the queue
    ///
    /// The executor runs after every previously queued operation has
    /// finished. Must be called from within a tokio runtime.
    pub fn queue_operation<F, Fut>(&self, kind: OperationKind, executor: F) -> OperationHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TrackError>> + Send + 'static,
    {
        let id = OperationId::new();
        let (done, rx) = oneshot::channel();
        let operation = Operation {
            id,
            kind,
            executor: Box::new(move || Box::pin(executor()) as OperationFuture),
            done,
        };

        let spawn_generation = {
            let mut queue = self.inner.queue.lock();
            queue.pending.push_back(operation);
            tracing::debug!(
                operation_id = %id,
                kind = %kind,
                pending = queue.pending.len(),
                "Track operation queued"
            );
            if queue.processing {
                None
            } else {
                queue.processing = true;
                Some(queue.generation)
            }
        };

        if let Some(generation) = spawn_generation {
            tokio::spawn(drain(self.inner.clone(), generation));
        }

        OperationHandle { id, kind, rx }
    }

    /// Operations waiting behind the current one
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    /// Whether the drain task is running
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.inner.queue.lock().processing
    }

    /// Install a new video intent
    ///
    /// A previously held track that differs from `track` is stopped.
    pub fn update_track_state(
        &self,
        source: VideoSource,
        track: Option<Arc<dyn LocalTrack>>,
        active: bool,
    ) {
        let previous = {
            let mut state = self.inner.state.lock();
            let previous = state.track.take();
            *state = TrackState {
                source,
                track: track.clone(),
                active,
                updated_at: Utc::now(),
            };
            previous
        };

        if let Some(previous) = previous {
            let replaced = track.as_ref().map_or(true, |t| !same_track(t, &previous));
            if replaced {
                tracing::debug!(track_id = previous.id(), "Stopping replaced video track");
                previous.stop();
            }
        }
        tracing::debug!(?source, active, "Video track state updated");
    }

    /// Copy of the current intent
    #[must_use]
    pub fn current_track_state(&self) -> TrackState {
        self.inner.state.lock().clone()
    }

    /// Whether video is on
    #[must_use]
    pub fn is_video_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Held video track
    #[must_use]
    pub fn video_track(&self) -> Option<Arc<dyn LocalTrack>> {
        self.inner.state.lock().track.clone()
    }

    /// Capture the current intent for rollback
    #[must_use]
    pub fn save_state_snapshot(&self) -> TrackStateSnapshot {
        TrackStateSnapshot(self.current_track_state())
    }

    /// Roll back to a snapshot
    ///
    /// A track installed after the snapshot was taken is stopped.
    pub fn restore_state_snapshot(&self, snapshot: TrackStateSnapshot) {
        let restored = snapshot.0;
        let discarded = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut *state, restored.clone()).track
        };
        if let Some(discarded) = discarded {
            let kept = restored
                .track
                .as_ref()
                .is_some_and(|t| same_track(t, &discarded));
            if !kept {
                discarded.stop();
            }
        }
        tracing::debug!(state = ?restored, "Video track state restored from snapshot");
    }

    /// Stop the held track and abandon all queued work
    ///
    /// Queued operations complete with [`TrackError::Cancelled`]; the
    /// operation in flight, if any, is cancelled as well.
    pub fn reset(&self) {
        let (rejected, current) = {
            let mut queue = self.inner.queue.lock();
            queue.generation += 1;
            queue.processing = false;
            let rejected: Vec<Operation> = queue.pending.drain(..).collect();
            (rejected, queue.current.take())
        };

        if let Some(token) = current {
            token.cancel();
        }
        let count = rejected.len();
        for operation in rejected {
            let _ = operation.done.send(Err(TrackError::Cancelled));
        }

        let held = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut *state).track
        };
        if let Some(track) = held {
            track.stop();
        }
        tracing::info!(rejected = count, "Track manager reset");
    }
}

impl fmt::Debug for TrackManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackManager")
            .field("state", &self.current_track_state())
            .field("pending", &self.pending_operations())
            .finish()
    }
}

async fn drain(inner: Arc<Inner>, generation: u64) {
    let timeout = inner.config.operation_timeout;

    loop {
        let (operation, token) = {
            let mut queue = inner.queue.lock();
            if queue.generation != generation {
                return;
            }
            match queue.pending.pop_front() {
                Some(operation) => {
                    let token = CancellationToken::new();
                    queue.current = Some(token.clone());
                    (operation, token)
                }
                None => {
                    queue.processing = false;
                    queue.current = None;
                    return;
                }
            }
        };

        let Operation {
            id,
            kind,
            executor,
            done,
        } = operation;
        tracing::debug!(operation_id = %id, kind = %kind, "Running track operation");

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(TrackError::Cancelled),
            res = tokio::time::timeout(timeout, executor()) => {
                res.unwrap_or(Err(TrackError::Timeout { kind, timeout }))
            }
        };

        match &result {
            Ok(()) => tracing::debug!(operation_id = %id, kind = %kind, "Track operation completed"),
            Err(e) => tracing::warn!(operation_id = %id, kind = %kind, error = %e, "Track operation failed"),
        }
        let _ = done.send(result);
    }
}
