//! Webcam source
//!
//! Reads at the camera's own pace. A disconnect or a run of failed reads
//! degrades the source and releases the device; downstream keeps showing
//! the last good frame.

use crate::capture::frame::CaptureFrame;
use crate::capture::queue::VideoQueue;
use crate::capture::source::{spawn_adapter, SourceContext, SourceHandle, SourceOutput};
use crate::capture::traits::{CameraCapability, DeviceCatalog, WebcamBackend, WebcamStream};
use crate::utils::error::SourceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest a single read may block, so stop is observed promptly
const MAX_READ_WAIT: Duration = Duration::from_millis(100);

pub struct WebcamSource;

impl WebcamSource {
    pub fn start(
        backend: Box<dyn WebcamBackend>,
        ctx: SourceContext,
    ) -> Result<SourceHandle, SourceError> {
        let queue = Arc::new(VideoQueue::new(ctx.tuning.video_queue_capacity));
        let open_timeout = ctx.tuning.ready_timeout();
        let run_ctx = ctx.clone();
        let run_queue = queue.clone();

        spawn_adapter(
            &ctx,
            SourceOutput::Video(queue),
            open_timeout,
            move || backend.open(),
            move |stream, running| run(stream, running, run_ctx, run_queue),
        )
    }

    /// Modes a camera supports, for the settings layer
    pub fn capabilities(
        catalog: &dyn DeviceCatalog,
        id: &str,
    ) -> Result<Vec<CameraCapability>, SourceError> {
        catalog.camera_capabilities(id)
    }
}

fn run(
    mut stream: Box<dyn WebcamStream>,
    running: Arc<AtomicBool>,
    ctx: SourceContext,
    queue: Arc<VideoQueue>,
) {
    let id = ctx.monitor.id().clone();
    let max_errors = ctx.tuning.max_consecutive_errors.max(1);
    let fps = stream.frame_rate().max(1);
    let read_wait = Duration::from_secs_f64(2.0 / fps as f64).min(MAX_READ_WAIT);

    let mut sequence: u64 = 0;
    let mut captured: u64 = 0;
    let mut consecutive_misses: u32 = 0;
    let started = Instant::now();

    tracing::info!("Webcam {} reading at {}fps", id, fps);

    while running.load(Ordering::SeqCst) {
        let raw = match stream.read(&ctx.pool, read_wait) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                consecutive_misses += 1;
                if consecutive_misses >= max_errors
                    && ctx.monitor.degrade(&SourceError::Capture(format!(
                        "no frame for {} reads",
                        consecutive_misses
                    )))
                {
                    tracing::warn!("Webcam {} stalled, keeping last frame", id);
                }
                continue;
            }
            Err(SourceError::Disconnected(reason)) => {
                ctx.monitor.degrade(&SourceError::Disconnected(reason));
                break;
            }
            Err(e) => {
                consecutive_misses += 1;
                tracing::debug!("Failed to capture webcam frame: {}", e);
                if consecutive_misses >= max_errors {
                    ctx.monitor.degrade(&e);
                    break;
                }
                continue;
            }
        };
        consecutive_misses = 0;
        captured += 1;

        let captured_at = Instant::now();
        ctx.monitor.note_capture(captured_at);
        if !ctx.gate.is_open() {
            ctx.monitor.note_discarded();
            continue;
        }
        if queue.is_closed() {
            break;
        }

        let frame = CaptureFrame {
            source: id.clone(),
            sequence,
            width: raw.width,
            height: raw.height,
            format: raw.format,
            data: raw.data,
            timestamp: raw.timestamp,
            captured_at,
        };
        sequence += 1;
        drop(queue.push(frame));
        ctx.monitor.note_delivered();
        ctx.monitor.recover();
    }

    // Dropping the stream releases the camera
    drop(stream);

    let elapsed = started.elapsed().as_secs_f64();
    tracing::info!(
        "Webcam {} captured {} frames in {:.2}s ({:.1} fps actual)",
        id,
        captured,
        elapsed,
        if elapsed > 0.0 { captured as f64 / elapsed } else { 0.0 }
    );
}
