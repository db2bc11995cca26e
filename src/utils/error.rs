//! Error types and handling
//!
//! The pipeline's error taxonomy. Each kind maps to a distinct recovery
//! policy: config errors reject a start with no side effects, source and
//! backpressure errors degrade a single source, encode errors are fatal and
//! finalize errors are reported after stop.

use crate::capture::source::SourceId;
use crate::recorder::state::{LifecycleCommand, RecordingState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Rejected start request. Nothing has been opened or written when one of
/// these is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid preset: {0}")]
    InvalidPreset(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid output path: {0}")]
    InvalidOutput(String),

    #[error("Unsupported container: {0}")]
    UnsupportedContainer(String),

    #[error("Invalid webcam layout: {0}")]
    InvalidLayout(String),

    #[error("Invalid audio gain: {0} dB")]
    InvalidGain(f32),

    #[error("Encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("No capture source could be opened: {0}")]
    NoUsableSources(String),

    #[error("No capture source delivered a frame within {0:?}")]
    SourcesNotReady(Duration),

    #[error("Invalid tuning: {0}")]
    InvalidTuning(String),

    #[error("Pipeline setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Failure of a single capture adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Format unsupported: {0}")]
    FormatUnsupported(String),

    #[error("Device disconnected: {0}")]
    Disconnected(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Queue stalled: {0}")]
    Stalled(#[from] BackpressureError),

    #[error("Device overrun: {frames} frames lost")]
    Overrun { frames: u64 },

    #[error("All capture sources lost")]
    AllSourcesLost,
}

/// A bounded resource could not accept an item in time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackpressureError {
    #[error("Queue full for {waited:?}")]
    Timeout { waited: Duration },

    #[error("Queue closed")]
    Closed,
}

/// Which encoded stream an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

/// The encoder rejected input or faulted. Always fatal for the session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("Failed to start encoder: {0}")]
    Spawn(String),

    #[error("Failed to write {stream} data: {reason}")]
    Write { stream: StreamKind, reason: String },

    #[error("Out of order {stream} timestamp: {got:?} after {previous:?}")]
    OutOfOrder {
        stream: StreamKind,
        previous: Duration,
        got: Duration,
    },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Probe failed: {0}")]
    Probe(String),
}

/// Stop did not produce a complete file. `written` lists whatever is on
/// disk so the caller can decide what is recoverable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FinalizeError {
    #[error("No recording to stop")]
    NotActive,

    #[error("Container finalize failed: {reason}")]
    Container {
        reason: String,
        written: Vec<PathBuf>,
    },

    #[error("Recording failed: {cause}")]
    Failed {
        cause: String,
        written: Vec<PathBuf>,
    },
}

impl FinalizeError {
    /// Files left on disk by the failed session.
    pub fn written(&self) -> &[PathBuf] {
        match self {
            FinalizeError::NotActive => &[],
            FinalizeError::Container { written, .. } | FinalizeError::Failed { written, .. } => {
                written
            }
        }
    }
}

/// A lifecycle command that is not legal in the current state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Cannot {command} while {state}")]
pub struct TransitionError {
    pub state: RecordingState,
    pub command: LifecycleCommand,
}

/// Misuse of the session clock.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    #[error("Session clock already established")]
    AlreadyEstablished,

    #[error("Session clock not established")]
    NotEstablished,

    #[error("Session clock already paused")]
    AlreadyPaused,

    #[error("Session clock not paused")]
    NotPaused,

    #[error("Session clock frozen")]
    Frozen,
}

/// Unrecoverable error raised by a pipeline thread.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineFault {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("{source_id}: {error}")]
    Source {
        source_id: SourceId,
        error: SourceError,
    },
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Backpressure(#[from] BackpressureError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Finalize(#[from] FinalizeError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Error response for control surfaces
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        let code = match &error {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Source(_) => "SOURCE_ERROR",
            AppError::Backpressure(_) => "BACKPRESSURE_ERROR",
            AppError::Encode(_) => "ENCODE_ERROR",
            AppError::Finalize(_) => "FINALIZE_ERROR",
            AppError::Transition(_) => "INVALID_STATE",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_codes() {
        let response: ErrorResponse =
            AppError::from(ConfigError::DeviceNotFound("cam-9".into())).into();
        assert_eq!(response.code, "CONFIG_ERROR");
        assert_eq!(response.message, "Device not found: cam-9");

        let response: ErrorResponse = AppError::from(TransitionError {
            state: RecordingState::Idle,
            command: LifecycleCommand::Pause,
        })
        .into();
        assert_eq!(response.code, "INVALID_STATE");
        assert_eq!(response.message, "Cannot pause while idle");
    }

    #[test]
    fn finalize_error_reports_written_files() {
        let err = FinalizeError::Container {
            reason: "mux failed".into(),
            written: vec![PathBuf::from("/tmp/a.video.mkv")],
        };
        assert_eq!(err.written(), &[PathBuf::from("/tmp/a.video.mkv")]);
        assert!(FinalizeError::NotActive.written().is_empty());
    }
}
