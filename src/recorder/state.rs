//! Recording state management
//!
//! Defines the recording state machine and session tracking. Every legal
//! edge is listed in [`RecordingState::apply`]; anything else is rejected
//! with a [`TransitionError`].

use crate::config::preset::ResolvedPreset;
use crate::utils::error::TransitionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Current state of the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    #[default]
    Idle,
    /// Sources are being opened
    Starting,
    /// Currently recording
    Recording,
    /// Recording is paused
    Paused,
    /// Sources are being stopped and queues drained
    Stopping,
    /// Encoder is writing the container trailer
    Finalizing,
    /// An unrecoverable error ended the session
    Failed,
}

impl RecordingState {
    /// Whether capture output is currently being accepted or held.
    pub fn is_active(self) -> bool {
        matches!(self, RecordingState::Recording | RecordingState::Paused)
    }

    /// The transition table.
    pub fn apply(self, command: LifecycleCommand) -> Result<RecordingState, TransitionError> {
        use LifecycleCommand as C;
        use RecordingState as S;

        let next = match (self, command) {
            (S::Idle, C::Start) => S::Starting,
            (S::Starting, C::SourcesReady) => S::Recording,
            (S::Starting, C::Cancel) => S::Idle,
            (S::Recording, C::Pause) => S::Paused,
            (S::Paused, C::Resume) => S::Recording,
            (S::Recording | S::Paused, C::Stop) => S::Stopping,
            (S::Stopping, C::Drained) => S::Finalizing,
            (S::Finalizing, C::Finalized) => S::Idle,
            (S::Failed, C::Reset) => S::Idle,
            (state, C::Fail) if state != S::Failed => S::Failed,
            (state, command) => return Err(TransitionError { state, command }),
        };
        Ok(next)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordingState::Idle => "idle",
            RecordingState::Starting => "starting",
            RecordingState::Recording => "recording",
            RecordingState::Paused => "paused",
            RecordingState::Stopping => "stopping",
            RecordingState::Finalizing => "finalizing",
            RecordingState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleCommand {
    Start,
    SourcesReady,
    Cancel,
    Pause,
    Resume,
    Stop,
    Drained,
    Finalized,
    Fail,
    Reset,
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleCommand::Start => "start",
            LifecycleCommand::SourcesReady => "mark sources ready",
            LifecycleCommand::Cancel => "cancel",
            LifecycleCommand::Pause => "pause",
            LifecycleCommand::Resume => "resume",
            LifecycleCommand::Stop => "stop",
            LifecycleCommand::Drained => "mark drained",
            LifecycleCommand::Finalized => "mark finalized",
            LifecycleCommand::Fail => "fail",
            LifecycleCommand::Reset => "reset",
        };
        f.write_str(name)
    }
}

/// Information about a recording session
///
/// Created when start is accepted and archived once the file is finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    /// Session identifier
    pub id: Uuid,

    /// Final output file
    pub output_path: PathBuf,

    /// Preset resolved at start, never changed afterwards
    pub preset: ResolvedPreset,

    /// Lifecycle state as last observed by the controller
    pub state: RecordingState,

    /// Wall clock time the session was started
    pub started_at: DateTime<Utc>,

    /// Wall clock time the session was finalized or failed
    pub finished_at: Option<DateTime<Utc>>,
}

impl RecordingSession {
    /// Create a new session starting now
    pub fn new(output_path: PathBuf, preset: ResolvedPreset) -> Self {
        Self {
            id: Uuid::new_v4(),
            output_path,
            preset,
            state: RecordingState::Starting,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// End the session
    pub fn end(&mut self, state: RecordingState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleCommand as C;
    use RecordingState as S;

    #[test]
    fn full_lifecycle_is_legal() {
        let mut state = S::Idle;
        for command in [
            C::Start,
            C::SourcesReady,
            C::Pause,
            C::Resume,
            C::Pause,
            C::Stop,
            C::Drained,
            C::Finalized,
        ] {
            state = state.apply(command).unwrap();
        }
        assert_eq!(state, S::Idle);
    }

    #[test]
    fn illegal_commands_are_rejected() {
        assert_eq!(
            S::Idle.apply(C::Pause),
            Err(TransitionError {
                state: S::Idle,
                command: C::Pause
            })
        );
        assert!(S::Idle.apply(C::Stop).is_err());
        assert!(S::Recording.apply(C::Start).is_err());
        assert!(S::Recording.apply(C::Resume).is_err());
        assert!(S::Paused.apply(C::Pause).is_err());
        assert!(S::Stopping.apply(C::Pause).is_err());
        assert!(S::Finalizing.apply(C::Stop).is_err());
        assert!(S::Failed.apply(C::Start).is_err());
    }

    #[test]
    fn fail_is_reachable_from_every_other_state() {
        for state in [
            S::Idle,
            S::Starting,
            S::Recording,
            S::Paused,
            S::Stopping,
            S::Finalizing,
        ] {
            assert_eq!(state.apply(C::Fail), Ok(S::Failed));
        }
        assert!(S::Failed.apply(C::Fail).is_err());
        assert_eq!(S::Failed.apply(C::Reset), Ok(S::Idle));
    }

    #[test]
    fn start_validation_failure_returns_to_idle() {
        let starting = S::Idle.apply(C::Start).unwrap();
        assert_eq!(starting.apply(C::Cancel), Ok(S::Idle));
    }
}
