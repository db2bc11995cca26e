//! Status feed
//!
//! Events broadcast to every subscriber of the controller. Delivery is
//! best-effort: a slow subscriber may miss events, the pipeline never waits.

use crate::capture::source::SourceId;
use crate::recorder::state::RecordingState;
use crate::utils::error::{PipelineFault, StreamKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};

/// Events emitted during recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RecordingEvent {
    /// Lifecycle transition
    StateChanged {
        from: RecordingState,
        to: RecordingState,
    },
    /// Periodic progress (elapsed excludes paused time)
    Progress {
        elapsed_ms: f64,
        video_frames: u64,
        dropped_video_frames: u64,
        evicted_capture_frames: u64,
    },
    /// A source failed and is being substituted (frozen frame or silence)
    SourceDegraded { source: SourceId, reason: String },
    /// A degraded source is delivering again
    SourceRecovered { source: SourceId },
    /// A bounded resource in front of the encoder overflowed
    Backpressure { stream: StreamKind, detail: String },
    /// The session hit an unrecoverable error
    Failed { reason: String },
    /// The output file is complete
    Finalized {
        output_path: PathBuf,
        video_duration_ms: f64,
        audio_duration_ms: f64,
    },
}

pub type EventSender = broadcast::Sender<RecordingEvent>;

/// Capacity of the broadcast channel
pub const EVENT_CAPACITY: usize = 256;

pub fn channel() -> EventSender {
    broadcast::channel(EVENT_CAPACITY).0
}

/// Send without caring whether anyone is listening
pub fn emit(events: &EventSender, event: RecordingEvent) {
    if events.send(event).is_err() {
        tracing::trace!("No status subscribers");
    }
}

/// Pipeline threads report unrecoverable errors to the controller here
pub type FaultSender = mpsc::UnboundedSender<PipelineFault>;
pub type FaultReceiver = mpsc::UnboundedReceiver<PipelineFault>;

pub fn fault_channel() -> (FaultSender, FaultReceiver) {
    mpsc::unbounded_channel()
}

/// Report a fault; a controller that already went away is not an error
pub fn raise(faults: &FaultSender, fault: PipelineFault) {
    tracing::error!("Pipeline fault: {}", fault);
    if faults.send(fault).is_err() {
        tracing::debug!("Fault raised after controller shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::SourceKind;

    #[test]
    fn events_serialize_tagged() {
        let event = RecordingEvent::SourceDegraded {
            source: SourceId::new(SourceKind::Audio, "mic"),
            reason: "Permission denied: mic".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sourceDegraded");
        assert_eq!(json["source"]["kind"], "audio");
        assert_eq!(json["source"]["name"], "mic");

        let json = serde_json::to_value(RecordingEvent::Progress {
            elapsed_ms: 1.5,
            video_frames: 3,
            dropped_video_frames: 0,
            evicted_capture_frames: 2,
        })
        .unwrap();
        assert_eq!(json["elapsedMs"], 1.5);
        assert_eq!(json["videoFrames"], 3);
        assert_eq!(json["evictedCaptureFrames"], 2);
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let events = channel();
        emit(&events, RecordingEvent::Failed { reason: "x".into() });

        let mut rx = events.subscribe();
        emit(&events, RecordingEvent::Failed { reason: "y".into() });
        assert_eq!(
            rx.try_recv().unwrap(),
            RecordingEvent::Failed { reason: "y".into() }
        );
    }
}
