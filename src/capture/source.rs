//! Source adapter plumbing
//!
//! Identity, health and lifecycle shared by the screen, webcam and audio
//! adapters. Each adapter runs on its own thread, opens its device there and
//! pushes into its own bounded queue.

use crate::capture::frame::{AudioChunk, CaptureFrame};
use crate::capture::pool::FramePool;
use crate::capture::queue::{AudioQueue, VideoQueue};
use crate::config::tuning::PipelineTuning;
use crate::recorder::events::{emit, EventSender, RecordingEvent};
use crate::utils::error::SourceError;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Kind of capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Screen,
    Webcam,
    Audio,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Screen => write!(f, "screen"),
            SourceKind::Webcam => write!(f, "webcam"),
            SourceKind::Audio => write!(f, "audio"),
        }
    }
}

/// Stable identity of one bound device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub kind: SourceKind,
    pub name: String,
}

impl SourceId {
    pub fn new(kind: SourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Identity of the synchronizer's mixed audio track
    pub fn mix() -> Self {
        Self::new(SourceKind::Audio, "mix")
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Health of a source as seen by the rest of the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum SourceHealth {
    /// Opened, no item delivered yet
    Starting,
    /// Delivering
    Live,
    /// Failed; downstream substitutes a frozen frame or silence
    Degraded { reason: String },
    /// Stopped cleanly
    Stopped,
}

/// Shared health record for one source
///
/// Degraded/recovered events are emitted on transitions only, so a source
/// that keeps failing produces a single degraded event.
pub struct SourceMonitor {
    id: SourceId,
    health: RwLock<SourceHealth>,
    first_capture: Mutex<Option<Instant>>,
    delivered: AtomicU64,
    discarded: AtomicU64,
    events: EventSender,
}

impl SourceMonitor {
    pub fn new(id: SourceId, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            id,
            health: RwLock::new(SourceHealth::Starting),
            first_capture: Mutex::new(None),
            delivered: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            events,
        })
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn health(&self) -> SourceHealth {
        self.health.read().clone()
    }

    /// Starting or live
    pub fn is_usable(&self) -> bool {
        matches!(
            *self.health.read(),
            SourceHealth::Starting | SourceHealth::Live
        )
    }

    pub fn is_degraded(&self) -> bool {
        matches!(*self.health.read(), SourceHealth::Degraded { .. })
    }

    /// Record a successful capture. The first one anchors readiness.
    pub fn note_capture(&self, at: Instant) {
        {
            let mut first = self.first_capture.lock();
            if first.is_none() {
                *first = Some(at);
            }
        }
        let mut health = self.health.write();
        if *health == SourceHealth::Starting {
            *health = SourceHealth::Live;
        }
    }

    pub fn first_capture(&self) -> Option<Instant> {
        *self.first_capture.lock()
    }

    pub fn note_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Leave the degraded state after a successful delivery. Returns `true`
    /// if this call made the transition.
    pub fn recover(&self) -> bool {
        {
            let mut health = self.health.write();
            if !matches!(*health, SourceHealth::Degraded { .. }) {
                return false;
            }
            *health = SourceHealth::Live;
        }
        tracing::info!("Source {} recovered", self.id);
        emit(
            &self.events,
            RecordingEvent::SourceRecovered {
                source: self.id.clone(),
            },
        );
        true
    }

    /// Mark the source degraded. Returns `true` if this call made the
    /// transition (and emitted the event).
    pub fn degrade(&self, error: &SourceError) -> bool {
        let reason = error.to_string();
        {
            let mut health = self.health.write();
            if matches!(
                *health,
                SourceHealth::Degraded { .. } | SourceHealth::Stopped
            ) {
                return false;
            }
            *health = SourceHealth::Degraded {
                reason: reason.clone(),
            };
        }
        tracing::warn!("Source {} degraded: {}", self.id, reason);
        emit(
            &self.events,
            RecordingEvent::SourceDegraded {
                source: self.id.clone(),
                reason,
            },
        );
        true
    }

    /// Stopped, unless the source already degraded (that is kept for the
    /// summary).
    pub fn mark_stopped(&self) {
        let mut health = self.health.write();
        if !matches!(*health, SourceHealth::Degraded { .. }) {
            *health = SourceHealth::Stopped;
        }
    }
}

impl fmt::Debug for SourceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceMonitor")
            .field("id", &self.id)
            .field("health", &self.health())
            .field("delivered", &self.delivered())
            .finish()
    }
}

/// Whether adapters hand their output downstream
///
/// Closed until the controller enters `Recording`, and again while paused.
/// Adapters keep capturing while the gate is closed and discard the output,
/// so no device is re-acquired on resume.
#[derive(Debug, Default)]
pub struct CaptureGate {
    accepting: AtomicBool,
}

impl CaptureGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// Everything an adapter thread needs besides its device
#[derive(Clone)]
pub struct SourceContext {
    pub gate: Arc<CaptureGate>,
    pub monitor: Arc<SourceMonitor>,
    pub pool: FramePool,
    pub tuning: PipelineTuning,
}

/// Queue an adapter delivers into
#[derive(Clone)]
pub enum SourceOutput {
    Video(Arc<VideoQueue>),
    Audio(Arc<AudioQueue>),
}

/// One item pulled from a source
#[derive(Debug)]
pub enum SourceItem {
    Video(CaptureFrame),
    Audio(AudioChunk),
}

impl SourceOutput {
    fn try_pop(&self) -> Option<SourceItem> {
        match self {
            SourceOutput::Video(q) => q.try_pop().map(SourceItem::Video),
            SourceOutput::Audio(q) => q.try_pop().map(SourceItem::Audio),
        }
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<SourceItem> {
        match self {
            SourceOutput::Video(q) => q.pop_timeout(timeout).map(SourceItem::Video),
            SourceOutput::Audio(q) => q.pop_timeout(timeout).map(SourceItem::Audio),
        }
    }

    fn close(&self) {
        match self {
            SourceOutput::Video(q) => q.close(),
            SourceOutput::Audio(q) => q.close(),
        }
    }

    fn is_drained(&self) -> bool {
        match self {
            SourceOutput::Video(q) => q.is_drained(),
            SourceOutput::Audio(q) => q.is_drained(),
        }
    }

    fn dropped(&self) -> u64 {
        match self {
            SourceOutput::Video(q) => q.dropped(),
            SourceOutput::Audio(_) => 0,
        }
    }
}

/// Consumer-side view of a running source
#[derive(Clone)]
pub struct SourceTap {
    pub id: SourceId,
    pub monitor: Arc<SourceMonitor>,
    output: SourceOutput,
}

impl SourceTap {
    pub fn new(monitor: Arc<SourceMonitor>, output: SourceOutput) -> Self {
        Self {
            id: monitor.id().clone(),
            monitor,
            output,
        }
    }

    /// Next item if one is queued
    pub fn poll(&self) -> Option<SourceItem> {
        self.output.try_pop()
    }

    /// Wait up to `timeout` for the next item
    pub fn blocking_next(&self, timeout: Duration) -> Option<SourceItem> {
        self.output.pop_timeout(timeout)
    }

    /// Stopped and fully consumed
    pub fn is_drained(&self) -> bool {
        self.output.is_drained()
    }

    /// Video frames evicted from this source's queue
    pub fn dropped(&self) -> u64 {
        self.output.dropped()
    }
}

/// Owner of a running adapter thread
pub struct SourceHandle {
    tap: SourceTap,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub fn id(&self) -> &SourceId {
        &self.tap.id
    }

    pub fn monitor(&self) -> &Arc<SourceMonitor> {
        &self.tap.monitor
    }

    pub fn tap(&self) -> SourceTap {
        self.tap.clone()
    }

    pub fn poll(&self) -> Option<SourceItem> {
        self.tap.poll()
    }

    pub fn blocking_next(&self, timeout: Duration) -> Option<SourceItem> {
        self.tap.blocking_next(timeout)
    }

    /// Signal the adapter, wait for it to release its device and close the
    /// queue. Items already queued stay readable.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Unblock a producer waiting on a full audio queue
        self.tap.output.close();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("Capture thread for {} panicked", self.tap.id);
            }
        }
        self.tap.monitor.mark_stopped();
        tracing::debug!("Source {} stopped", self.tap.id);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

/// Spawn an adapter thread.
///
/// `open` runs on the new thread and acquires the device; its result is
/// reported back before this returns. `run` then owns the device until
/// `running` clears. The queue is closed when the thread exits.
pub(crate) fn spawn_adapter<S, O, R>(
    ctx: &SourceContext,
    output: SourceOutput,
    open_timeout: Duration,
    open: O,
    run: R,
) -> Result<SourceHandle, SourceError>
where
    S: 'static,
    O: FnOnce() -> Result<S, SourceError> + Send + 'static,
    R: FnOnce(S, Arc<AtomicBool>) + Send + 'static,
{
    let id = ctx.monitor.id().clone();
    let running = Arc::new(AtomicBool::new(true));
    let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), SourceError>>(1);

    let thread = {
        let running = running.clone();
        let output = output.clone();
        let id = id.clone();
        std::thread::Builder::new()
            .name(format!("capture-{}", id))
            .spawn(move || {
                let stream = match open() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        output.close();
                        return;
                    }
                };
                tracing::info!("Capture thread for {} started", id);
                run(stream, running);
                output.close();
                tracing::info!("Capture thread for {} stopped", id);
            })
            .map_err(|e| SourceError::Capture(format!("failed to spawn thread: {}", e)))?
    };

    match ready_rx.recv_timeout(open_timeout) {
        Ok(Ok(())) => Ok(SourceHandle {
            tap: SourceTap::new(ctx.monitor.clone(), output),
            running,
            thread: Some(thread),
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            // Leave the thread to exit on its own once the open returns
            running.store(false, Ordering::SeqCst);
            output.close();
            Err(SourceError::DeviceUnavailable(format!(
                "{} did not open within {:?}",
                id, open_timeout
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::events;

    fn monitor() -> (Arc<SourceMonitor>, tokio::sync::broadcast::Receiver<RecordingEvent>) {
        let events = events::channel();
        let rx = events.subscribe();
        (
            SourceMonitor::new(SourceId::new(SourceKind::Audio, "mic"), events),
            rx,
        )
    }

    #[test]
    fn degraded_event_fires_once_per_transition() {
        let (monitor, mut rx) = monitor();
        let err = SourceError::PermissionDenied("mic".into());
        assert!(monitor.degrade(&err));
        assert!(!monitor.degrade(&err));
        assert!(!monitor.degrade(&SourceError::Disconnected("mic".into())));

        assert!(matches!(
            rx.try_recv(),
            Ok(RecordingEvent::SourceDegraded { source, .. }) if source.name == "mic"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn recovery_after_degrade_emits_recovered() {
        let (monitor, mut rx) = monitor();
        monitor.note_capture(Instant::now());
        assert_eq!(monitor.health(), SourceHealth::Live);
        assert!(!monitor.recover());
        monitor.degrade(&SourceError::Capture("glitch".into()));
        monitor.note_capture(Instant::now());
        assert!(monitor.is_degraded());
        assert!(monitor.recover());
        assert_eq!(monitor.health(), SourceHealth::Live);

        assert!(matches!(rx.try_recv(), Ok(RecordingEvent::SourceDegraded { .. })));
        assert!(matches!(rx.try_recv(), Ok(RecordingEvent::SourceRecovered { .. })));
    }

    #[test]
    fn first_capture_is_never_moved() {
        let (monitor, _rx) = monitor();
        let first = Instant::now();
        monitor.note_capture(first);
        monitor.note_capture(first + Duration::from_secs(1));
        assert_eq!(monitor.first_capture(), Some(first));
    }

    #[test]
    fn stopped_keeps_degraded_status() {
        let (monitor, _rx) = monitor();
        monitor.degrade(&SourceError::Disconnected("cam".into()));
        monitor.mark_stopped();
        assert!(monitor.is_degraded());
    }

    #[test]
    fn failed_open_is_reported_synchronously() {
        let (monitor, _rx) = monitor();
        let ctx = SourceContext {
            gate: CaptureGate::new(),
            monitor,
            pool: FramePool::new(1),
            tuning: PipelineTuning::default(),
        };
        let output = SourceOutput::Audio(Arc::new(AudioQueue::new(1)));
        let result = spawn_adapter::<(), _, _>(
            &ctx,
            output.clone(),
            Duration::from_secs(1),
            || Err(SourceError::PermissionDenied("mic".into())),
            |_, _| {},
        );
        assert_eq!(
            result.err(),
            Some(SourceError::PermissionDenied("mic".into()))
        );
        assert!(output.is_drained());
    }
}
