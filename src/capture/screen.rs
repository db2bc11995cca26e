//! Screen source
//!
//! Captures on a fixed tick at the configured rate, independent of the
//! display's own present rate: a tick with no newly presented image repeats
//! the previous one, and ticks missed because a grab ran long are skipped
//! rather than bursted.

use crate::capture::frame::CaptureFrame;
use crate::capture::queue::VideoQueue;
use crate::capture::source::{spawn_adapter, SourceContext, SourceHandle, SourceOutput};
use crate::capture::traits::{RawFrame, ScreenBackend, ScreenStream};
use crate::utils::error::SourceError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the screen adapter should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenFormat {
    pub frame_rate: u32,
    /// Crop rectangle (x, y, width, height)
    pub region: Option<(u32, u32, u32, u32)>,
}

pub struct ScreenSource;

impl ScreenSource {
    pub fn start(
        backend: Box<dyn ScreenBackend>,
        format: ScreenFormat,
        ctx: SourceContext,
    ) -> Result<SourceHandle, SourceError> {
        if format.frame_rate == 0 {
            return Err(SourceError::FormatUnsupported(
                "frame rate must be positive".to_string(),
            ));
        }
        let queue = Arc::new(VideoQueue::new(ctx.tuning.video_queue_capacity));
        let open_timeout = ctx.tuning.ready_timeout();
        let run_ctx = ctx.clone();
        let run_queue = queue.clone();

        spawn_adapter(
            &ctx,
            SourceOutput::Video(queue),
            open_timeout,
            move || backend.open(),
            move |stream, running| run(stream, running, format, run_ctx, run_queue),
        )
    }
}

fn run(
    mut stream: Box<dyn ScreenStream>,
    running: Arc<AtomicBool>,
    format: ScreenFormat,
    ctx: SourceContext,
    queue: Arc<VideoQueue>,
) {
    let interval = Duration::from_secs_f64(1.0 / format.frame_rate as f64);
    let max_errors = ctx.tuning.max_consecutive_errors.max(1);
    let id = ctx.monitor.id().clone();

    let mut last: Option<(CaptureFrame, Instant)> = None;
    let mut next_tick = Instant::now();
    let mut sequence: u64 = 0;
    let mut fresh_frames: u64 = 0;
    let mut repeated_frames: u64 = 0;
    let mut skipped_ticks: u64 = 0;
    let mut consecutive_errors: u32 = 0;

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now < next_tick {
            std::thread::sleep((next_tick - now).min(interval));
            continue;
        }
        let behind = now - next_tick;
        if behind >= interval {
            let missed = (behind.as_nanos() / interval.as_nanos().max(1)) as u32;
            skipped_ticks += missed as u64;
            next_tick += interval * missed;
        }
        next_tick += interval;

        match stream.grab(&ctx.pool) {
            Ok(Some(raw)) => {
                consecutive_errors = 0;
                let frame = to_frame(raw, &format, &ctx, sequence);
                last = Some((frame, Instant::now()));
                fresh_frames += 1;
                ctx.monitor.recover();
            }
            Ok(None) => {
                repeated_frames += 1;
            }
            Err(SourceError::Disconnected(reason)) => {
                ctx.monitor.degrade(&SourceError::Disconnected(reason));
                break;
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::debug!("Screen grab failed for {}: {}", id, e);
                if consecutive_errors >= max_errors {
                    ctx.monitor.degrade(&e);
                }
                continue;
            }
        }

        let Some((frame, grabbed_at)) = last.as_ref() else {
            continue;
        };

        let captured_at = Instant::now();
        ctx.monitor.note_capture(captured_at);
        if !ctx.gate.is_open() {
            ctx.monitor.note_discarded();
            continue;
        }

        // A repeated image is stamped as if the device clock had advanced
        let mut out = frame.clone();
        out.sequence = sequence;
        out.timestamp = frame.timestamp + captured_at.saturating_duration_since(*grabbed_at);
        out.captured_at = captured_at;
        sequence += 1;

        if queue.is_closed() {
            break;
        }
        // An evicted frame goes straight back to the pool
        drop(queue.push(out));
        ctx.monitor.note_delivered();
    }

    tracing::info!(
        "Screen capture {} done: {} fresh, {} repeated, {} skipped ticks, {} evicted",
        id,
        fresh_frames,
        repeated_frames,
        skipped_ticks,
        queue.dropped()
    );
}

fn to_frame(raw: RawFrame, format: &ScreenFormat, ctx: &SourceContext, sequence: u64) -> CaptureFrame {
    let frame = CaptureFrame {
        source: ctx.monitor.id().clone(),
        sequence,
        width: raw.width,
        height: raw.height,
        format: raw.format,
        data: raw.data,
        timestamp: raw.timestamp,
        captured_at: Instant::now(),
    };
    match format.region {
        Some((x, y, width, height)) => frame.crop(x, y, width, height, &ctx.pool),
        None => frame,
    }
}
