use std::fmt;

use thiserror::Error;

/// Errors from stream format handling and resampling.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("invalid stream format: {0}")]
    InvalidFormat(String),

    #[error("resample output buffer could not be allocated")]
    ResampleOverflow,
}

/// Errors from the long-form recorder. Any write failure here is fatal to the
/// owning session.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("long-form write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from segmenter configuration and voice-activity analysis.
#[derive(Debug, Error)]
pub enum SegmenterError {
    #[error("invalid segmenter config: {0}")]
    InvalidConfig(String),

    #[error("vad failure: {0}")]
    Vad(String),
}

/// Errors from chunk and session persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed audio file: {0}")]
    Malformed(String),

    #[error("chunk index gap: expected {expected}, got {got}")]
    IndexGap { expected: u64, got: u64 },

    #[error("no audio available for chunk {0}: sidecars deleted and no finalized recording")]
    MissingAudio(String),
}

/// Errors from recognizer implementations.
#[derive(Debug, Error)]
pub enum RecognizerError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("transcription failed: {0}")]
    Failed(String),

    #[error("recognizer produced no output for non-silent input")]
    EmptyOutput,
}

/// Why a transcription unit was abandoned without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled this chunk directly.
    Requested,
    /// The whole session's work was cancelled.
    SessionCancelled,
    /// A newer submission for the same chunk replaced this one.
    Superseded,
    /// The optional chunk watchdog expired.
    Timeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CancelReason::Requested => "requested",
            CancelReason::SessionCancelled => "session cancelled",
            CancelReason::Superseded => "superseded",
            CancelReason::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by the transcription scheduler.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),

    #[error("cancelled: {0}")]
    Cancelled(CancelReason),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("scheduler is shut down")]
    Shutdown,
}

/// Errors from session lifecycle operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a session is already active")]
    AlreadyActive,

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} is active; stop it first")]
    StillActive(String),

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Segmenter(#[from] SegmenterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invariant violated: {0}")]
    Bug(String),
}
