//! Recording controller
//!
//! The only component the control surface talks to. Owns the lifecycle
//! state and the running [`Pipeline`], and publishes every transition on
//! the status feed.

use crate::capture::source::SourceId;
use crate::capture::traits::DeviceCatalog;
use crate::config::preset::{Container, ResolvedPreset};
use crate::config::request::StartRequest;
use crate::config::tuning::PipelineTuning;
use crate::encoder::sink::SinkReport;
use crate::encoder::types::EncoderFactory;
use crate::recorder::events::{self, emit, EventSender, FaultReceiver, RecordingEvent};
use crate::recorder::pipeline::Pipeline;
use crate::recorder::state::{LifecycleCommand, RecordingSession, RecordingState};
use crate::sync::clock::SessionClock;
use crate::sync::synchronizer::{SyncReport, SyncStats};
use crate::utils::error::{ConfigError, FinalizeError, TransitionError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Returned by a successful start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub id: Uuid,
    pub output_path: PathBuf,
    pub preset: ResolvedPreset,
    pub started_at: DateTime<Utc>,
}

/// What a finished recording produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSummary {
    pub session_id: Uuid,
    pub output_path: PathBuf,
    pub container: Container,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
    pub video_frames: u64,
    pub video_duration_ms: f64,
    pub audio_frames: u64,
    pub audio_duration_ms: f64,
    /// Output ticks the encoder queue refused
    pub dropped_video_frames: u64,
    /// Captured frames evicted from full source queues
    pub evicted_capture_frames: u64,
    pub degraded_sources: Vec<SourceId>,
    pub paused_ms: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub bytes_written: u64,
}

struct ActiveSession {
    session: RecordingSession,
    pipeline: Pipeline,
    /// Dropping this ends the progress and fault tasks
    tasks: watch::Sender<bool>,
}

/// What is left of a pipeline once it has been wound down
struct WindDown {
    sync: SyncReport,
    degraded: Vec<SourceId>,
    paused: Duration,
    result: Result<SinkReport, FinalizeError>,
}

struct Inner {
    catalog: Arc<dyn DeviceCatalog>,
    encoders: Arc<dyn EncoderFactory>,
    tuning: PipelineTuning,
    events: EventSender,
    state: RwLock<RecordingState>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
    /// Clock of the current or most recent session
    clock: RwLock<Option<Arc<SessionClock>>>,
    /// Result handed out again by repeated stops
    last_result: Mutex<Option<Result<OutputSummary, FinalizeError>>>,
    last_failure: Mutex<Option<String>>,
}

impl Inner {
    fn state(&self) -> RecordingState {
        *self.state.read()
    }

    /// Apply a lifecycle command and publish the edge
    fn transition(&self, command: LifecycleCommand) -> Result<RecordingState, TransitionError> {
        let (from, to) = {
            let mut state = self.state.write();
            let from = *state;
            let to = from.apply(command)?;
            *state = to;
            (from, to)
        };
        tracing::debug!("Recording state {} -> {} ({})", from, to, command);
        emit(&self.events, RecordingEvent::StateChanged { from, to });
        Ok(to)
    }

    /// Same as [`transition`](Inner::transition) for edges the caller has
    /// already established are legal
    fn advance(&self, command: LifecycleCommand) {
        if let Err(e) = self.transition(command) {
            tracing::error!("Lifecycle out of step: {}", e);
        }
    }

    fn fail(&self, reason: &str) {
        self.advance(LifecycleCommand::Fail);
        *self.last_failure.lock() = Some(reason.to_string());
        emit(
            &self.events,
            RecordingEvent::Failed {
                reason: reason.to_string(),
            },
        );
    }
}

/// Drives a recording through its lifecycle
#[derive(Clone)]
pub struct RecordingController {
    inner: Arc<Inner>,
}

impl RecordingController {
    pub fn new(
        catalog: Arc<dyn DeviceCatalog>,
        encoders: Arc<dyn EncoderFactory>,
        tuning: PipelineTuning,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                encoders,
                tuning,
                events: events::channel(),
                state: RwLock::new(RecordingState::Idle),
                active: tokio::sync::Mutex::new(None),
                clock: RwLock::new(None),
                last_result: Mutex::new(None),
                last_failure: Mutex::new(None),
            }),
        }
    }

    /// Get the current recording state
    pub fn state(&self) -> RecordingState {
        self.inner.state()
    }

    /// Recorded time of the current or most recent session, pauses excluded
    pub fn elapsed(&self) -> Duration {
        self.inner
            .clock
            .read()
            .as_ref()
            .map(|c| c.elapsed())
            .unwrap_or_default()
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.inner.events.subscribe()
    }

    /// Cause of the most recent failed session
    pub fn last_failure(&self) -> Option<String> {
        self.inner.last_failure.lock().clone()
    }

    /// Snapshot of the session being recorded
    pub async fn session(&self) -> Option<RecordingSession> {
        let active = self.inner.active.lock().await;
        active.as_ref().map(|a| {
            let mut session = a.session.clone();
            session.state = self.inner.state();
            session
        })
    }

    /// Start recording.
    ///
    /// Returns once every source has delivered and the session clock runs.
    /// On error the controller is back in Idle and nothing was written.
    pub async fn start(&self, request: StartRequest) -> Result<SessionHandle, ConfigError> {
        let mut active = self.inner.active.lock().await;
        self.inner.transition(LifecycleCommand::Start)?;
        tracing::info!("Starting recording to: {}", request.output_path.display());

        match self.open_pipeline(&request).await {
            Ok(opened) => {
                let handle = self.go_live(&mut active, opened);
                tracing::info!("Recording started ({})", handle.id);
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!("Start rejected: {}", e);
                self.inner.advance(LifecycleCommand::Cancel);
                Err(e)
            }
        }
    }

    async fn open_pipeline(
        &self,
        request: &StartRequest,
    ) -> Result<(RecordingSession, Pipeline, FaultReceiver), ConfigError> {
        let preset = request.validate()?;
        let (faults, fault_rx) = events::fault_channel();
        let inner = self.inner.clone();
        let req = request.clone();
        let resolved = preset.clone();
        let pipeline = tokio::task::spawn_blocking(move || {
            Pipeline::open(
                &req,
                &resolved,
                inner.catalog.as_ref(),
                inner.encoders.as_ref(),
                &inner.tuning,
                &inner.events,
                &faults,
            )
        })
        .await
        .map_err(|e| ConfigError::Setup(e.to_string()))??;

        let session = RecordingSession::new(request.output_path.clone(), preset);
        Ok((session, pipeline, fault_rx))
    }

    /// The sources-ready edge: fix the clock origin and open the gate
    fn go_live(
        &self,
        active: &mut Option<ActiveSession>,
        (mut session, pipeline, faults): (RecordingSession, Pipeline, FaultReceiver),
    ) -> SessionHandle {
        if let Err(e) = pipeline.go_live() {
            tracing::error!("Session clock: {}", e);
        }
        *self.inner.clock.write() = Some(pipeline.clock().clone());
        self.inner.advance(LifecycleCommand::SourcesReady);
        session.state = RecordingState::Recording;

        let (tasks, cancel) = watch::channel(false);
        spawn_progress(
            self.inner.events.clone(),
            pipeline.clock().clone(),
            pipeline.sync_stats(),
            self.inner.tuning.progress_interval(),
            cancel.clone(),
        );
        spawn_fault_monitor(Arc::downgrade(&self.inner), session.id, faults, cancel);

        let handle = SessionHandle {
            id: session.id,
            output_path: session.output_path.clone(),
            preset: session.preset.clone(),
            started_at: session.started_at,
        };
        *active = Some(ActiveSession {
            session,
            pipeline,
            tasks,
        });
        handle
    }

    /// Pause recording. Sources keep running; their output is discarded.
    pub async fn pause(&self) -> Result<(), TransitionError> {
        let active = self.inner.active.lock().await;
        self.inner.transition(LifecycleCommand::Pause)?;
        if let Some(active) = active.as_ref() {
            if let Err(e) = active.pipeline.pause() {
                tracing::warn!("Pause: {}", e);
            }
        }
        tracing::info!("Recording paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), TransitionError> {
        let active = self.inner.active.lock().await;
        self.inner.transition(LifecycleCommand::Resume)?;
        if let Some(active) = active.as_ref() {
            if let Err(e) = active.pipeline.resume() {
                tracing::warn!("Resume: {}", e);
            }
        }
        tracing::info!("Recording resumed");
        Ok(())
    }

    /// Stop recording and finalize the output.
    ///
    /// Repeated calls return the previous outcome without touching the
    /// file. After a failure this reports the cause and returns the
    /// controller to Idle.
    pub async fn stop(&self) -> Result<OutputSummary, FinalizeError> {
        let mut guard = self.inner.active.lock().await;
        match self.inner.state() {
            RecordingState::Recording | RecordingState::Paused => {}
            RecordingState::Failed => {
                let result = self.cached_result();
                self.inner.advance(LifecycleCommand::Reset);
                return result;
            }
            _ => return self.cached_result(),
        }
        let Some(active) = guard.take() else {
            return Err(FinalizeError::NotActive);
        };

        tracing::info!("Stopping recording");
        self.inner.advance(LifecycleCommand::Stop);
        let ActiveSession {
            mut session,
            pipeline,
            tasks,
        } = active;
        drop(tasks);

        let WindDown {
            sync,
            degraded,
            paused,
            result,
        } = wind_down(&self.inner, pipeline, true).await;
        let result = match result {
            Ok(report) => {
                self.inner.advance(LifecycleCommand::Finalized);
                session.end(RecordingState::Idle);
                let summary = summarize(&session, &report, &sync, degraded, paused);
                emit(
                    &self.inner.events,
                    RecordingEvent::Finalized {
                        output_path: summary.output_path.clone(),
                        video_duration_ms: summary.video_duration_ms,
                        audio_duration_ms: summary.audio_duration_ms,
                    },
                );
                tracing::info!(
                    "Recording stopped. Duration: {}ms",
                    summary.video_duration_ms
                );
                Ok(summary)
            }
            Err(e) => {
                session.end(RecordingState::Failed);
                self.inner.fail(&e.to_string());
                self.inner.advance(LifecycleCommand::Reset);
                Err(e)
            }
        };
        *self.inner.last_result.lock() = Some(result.clone());
        result
    }

    fn cached_result(&self) -> Result<OutputSummary, FinalizeError> {
        self.inner
            .last_result
            .lock()
            .clone()
            .unwrap_or(Err(FinalizeError::NotActive))
    }
}

/// Stop every source, drain the synchronizer and finalize the encoder.
/// With `report_edges` the Drained edge is published between the two.
async fn wind_down(inner: &Inner, mut pipeline: Pipeline, report_edges: bool) -> WindDown {
    let drained = tokio::task::spawn_blocking(move || {
        let sync = pipeline.drain();
        (pipeline, sync)
    })
    .await;
    let (mut pipeline, sync) = match drained {
        Ok(drained) => drained,
        Err(e) => {
            return WindDown {
                sync: SyncReport::default(),
                degraded: Vec::new(),
                paused: Duration::ZERO,
                result: Err(FinalizeError::Failed {
                    cause: format!("drain panicked: {}", e),
                    written: Vec::new(),
                }),
            }
        }
    };
    if report_edges {
        inner.advance(LifecycleCommand::Drained);
    }

    let degraded = pipeline.degraded_sources();
    let paused = pipeline.clock().paused_total();
    let output = pipeline.output().clone();
    let result = tokio::task::spawn_blocking(move || pipeline.finalize())
        .await
        .unwrap_or_else(|e| {
            Err(FinalizeError::Container {
                reason: format!("finalize panicked: {}", e),
                written: [output].into_iter().filter(|p| p.exists()).collect(),
            })
        });
    WindDown {
        sync,
        degraded,
        paused,
        result,
    }
}

fn summarize(
    session: &RecordingSession,
    report: &SinkReport,
    sync: &SyncReport,
    degraded_sources: Vec<SourceId>,
    paused: Duration,
) -> OutputSummary {
    let preset = &session.preset;
    OutputSummary {
        session_id: session.id,
        output_path: report.output.output_path.clone(),
        container: preset.container,
        width: preset.width,
        height: preset.height,
        frame_rate: preset.frame_rate,
        sample_rate: preset.sample_rate,
        video_frames: report.output.video_frames,
        video_duration_ms: report.output.video_duration.as_secs_f64() * 1000.0,
        audio_frames: report.output.audio_frames,
        audio_duration_ms: report.output.audio_duration.as_secs_f64() * 1000.0,
        dropped_video_frames: sync.dropped_video_frames,
        evicted_capture_frames: sync.evicted_capture_frames,
        degraded_sources,
        paused_ms: paused.as_secs_f64() * 1000.0,
        started_at: session.started_at,
        finished_at: session.finished_at.unwrap_or_else(Utc::now),
        bytes_written: report.output.bytes_written,
    }
}

fn spawn_progress(
    events: EventSender,
    clock: Arc<SessionClock>,
    stats: Arc<SyncStats>,
    period: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if clock.is_frozen() {
                        break;
                    }
                    emit(&events, RecordingEvent::Progress {
                        elapsed_ms: clock.elapsed().as_secs_f64() * 1000.0,
                        video_frames: stats.video_frames(),
                        dropped_video_frames: stats.dropped_video_frames(),
                        evicted_capture_frames: stats.evicted_capture_frames(),
                    });
                }
                _ = cancel.changed() => break,
            }
        }
    });
}

/// Wait for the first fatal fault of a session and fail it. Later faults
/// of the same session only get logged by whoever raised them.
fn spawn_fault_monitor(
    inner: Weak<Inner>,
    session_id: Uuid,
    mut faults: FaultReceiver,
    mut cancel: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let fault = tokio::select! {
            fault = faults.recv() => fault,
            _ = cancel.changed() => None,
        };
        let (Some(fault), Some(inner)) = (fault, inner.upgrade()) else {
            return;
        };

        let mut guard = inner.active.lock().await;
        let current = guard.as_ref().map(|a| a.session.id);
        if current != Some(session_id) || !inner.state().is_active() {
            return;
        }
        let Some(ActiveSession {
            mut session,
            pipeline,
            tasks,
        }) = guard.take()
        else {
            return;
        };
        drop(tasks);

        let reason = fault.to_string();
        tracing::error!("Recording failed: {}", reason);
        inner.fail(&reason);

        // Best-effort finalize of what was captured so far
        let outcome = wind_down(&inner, pipeline, false).await;
        session.end(RecordingState::Failed);
        let written = match outcome.result {
            Ok(report) => vec![report.output.output_path],
            Err(e) => e.written().to_vec(),
        };
        *inner.last_result.lock() = Some(Err(FinalizeError::Failed {
            cause: reason,
            written,
        }));
    });
}
