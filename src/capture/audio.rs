//! Audio source
//!
//! One adapter per bound device; chunks stay tagged with their device and
//! are only combined by the synchronizer's mixer. A full queue blocks the
//! adapter up to the configured timeout; a timeout degrades the source
//! instead of silently dropping audio.

use crate::capture::frame::AudioChunk;
use crate::capture::queue::AudioQueue;
use crate::capture::source::{spawn_adapter, SourceContext, SourceHandle, SourceOutput};
use crate::capture::traits::{AudioBackend, AudioStream};
use crate::utils::error::{BackpressureError, SourceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const READ_WAIT: Duration = Duration::from_millis(50);

pub struct AudioSource;

impl AudioSource {
    pub fn start(
        backend: Box<dyn AudioBackend>,
        ctx: SourceContext,
    ) -> Result<SourceHandle, SourceError> {
        let queue = Arc::new(AudioQueue::new(ctx.tuning.audio_queue_capacity));
        let open_timeout = ctx.tuning.ready_timeout();
        let run_ctx = ctx.clone();
        let run_queue = queue.clone();

        spawn_adapter(
            &ctx,
            SourceOutput::Audio(queue),
            open_timeout,
            move || backend.open(),
            move |stream, running| run(stream, running, run_ctx, run_queue),
        )
    }
}

fn run(
    mut stream: Box<dyn AudioStream>,
    running: Arc<AtomicBool>,
    ctx: SourceContext,
    queue: Arc<AudioQueue>,
) {
    let id = ctx.monitor.id().clone();
    let sample_rate = stream.sample_rate();
    let channels = stream.channels();
    let push_timeout = ctx.tuning.audio_push_timeout();
    let max_errors = ctx.tuning.max_consecutive_errors.max(1);

    let mut sequence: u64 = 0;
    let mut consecutive_errors: u32 = 0;
    let mut stalled_chunks: u64 = 0;
    let mut overrun_frames: u64 = 0;

    tracing::info!("Audio {} capturing at {}Hz, {}ch", id, sample_rate, channels);

    while running.load(Ordering::SeqCst) {
        let raw = match stream.read(READ_WAIT) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(SourceError::Disconnected(reason)) => {
                ctx.monitor.degrade(&SourceError::Disconnected(reason));
                break;
            }
            // The device kept running; audio resumes with the next block
            Err(SourceError::Overrun { frames }) => {
                overrun_frames += frames;
                ctx.monitor.degrade(&SourceError::Overrun { frames });
                continue;
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::debug!("Audio read failed for {}: {}", id, e);
                if consecutive_errors >= max_errors {
                    ctx.monitor.degrade(&e);
                    break;
                }
                continue;
            }
        };
        consecutive_errors = 0;

        let captured_at = Instant::now();
        ctx.monitor.note_capture(captured_at);
        if !ctx.gate.is_open() {
            ctx.monitor.note_discarded();
            continue;
        }

        let chunk = AudioChunk {
            source: id.clone(),
            sequence,
            samples: raw.samples,
            sample_rate,
            channels,
            timestamp: raw.timestamp,
            captured_at,
        };
        sequence += 1;

        match queue.push(chunk, push_timeout) {
            Ok(()) => {
                ctx.monitor.note_delivered();
                ctx.monitor.recover();
            }
            Err(BackpressureError::Closed) => break,
            Err(e @ BackpressureError::Timeout { .. }) => {
                stalled_chunks += 1;
                ctx.monitor.degrade(&SourceError::Stalled(e));
            }
        }
    }

    tracing::info!(
        "Audio {} done: {} chunks, {} lost to stalls, {} frames lost to overruns",
        id,
        sequence,
        stalled_chunks,
        overrun_frames
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pool::FramePool;
    use crate::capture::source::{CaptureGate, SourceHealth, SourceId, SourceKind, SourceMonitor};
    use crate::capture::traits::RawAudio;
    use crate::config::tuning::PipelineTuning;
    use crate::recorder::events::{self, RecordingEvent};

    struct Burst {
        position: u64,
    }

    impl AudioBackend for Burst {
        fn open(self: Box<Self>) -> Result<Box<dyn AudioStream>, SourceError> {
            Ok(self)
        }
    }

    impl AudioStream for Burst {
        fn sample_rate(&self) -> u32 {
            1000
        }

        fn channels(&self) -> u16 {
            1
        }

        fn read(&mut self, _timeout: Duration) -> Result<Option<RawAudio>, SourceError> {
            std::thread::sleep(Duration::from_millis(1));
            let timestamp = Duration::from_millis(self.position);
            self.position += 10;
            Ok(Some(RawAudio {
                samples: vec![0.25; 10],
                timestamp,
            }))
        }
    }

    fn context(events: crate::recorder::events::EventSender) -> SourceContext {
        SourceContext {
            gate: CaptureGate::new(),
            monitor: SourceMonitor::new(SourceId::new(SourceKind::Audio, "mic"), events),
            pool: FramePool::new(1),
            tuning: PipelineTuning {
                audio_queue_capacity: 4,
                audio_push_timeout_ms: 30,
                ..Default::default()
            },
        }
    }

    #[test]
    fn stalled_consumer_degrades_once_then_recovers() {
        let events = events::channel();
        let mut rx = events.subscribe();
        let ctx = context(events);
        ctx.gate.open();

        let mut handle = AudioSource::start(Box::new(Burst { position: 0 }), ctx.clone()).unwrap();

        // Nobody consumes: the queue fills and pushes start timing out
        std::thread::sleep(Duration::from_millis(200));
        assert!(matches!(ctx.monitor.health(), SourceHealth::Degraded { .. }));

        // Drain so the producer gets through again
        let deadline = Instant::now() + Duration::from_secs(2);
        while !matches!(ctx.monitor.health(), SourceHealth::Live) && Instant::now() < deadline {
            while handle.poll().is_some() {}
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.stop();

        let received: Vec<RecordingEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let degraded = received
            .iter()
            .filter(|e| matches!(e, RecordingEvent::SourceDegraded { .. }))
            .count();
        assert!(degraded >= 1);
        assert!(matches!(received[0], RecordingEvent::SourceDegraded { .. }));
        assert!(matches!(received[1], RecordingEvent::SourceRecovered { .. }));
    }

    /// Loses 20 frames before its fifth block
    struct Overrunning {
        position: u64,
        reads: u32,
    }

    impl AudioBackend for Overrunning {
        fn open(self: Box<Self>) -> Result<Box<dyn AudioStream>, SourceError> {
            Ok(self)
        }
    }

    impl AudioStream for Overrunning {
        fn sample_rate(&self) -> u32 {
            1000
        }

        fn channels(&self) -> u16 {
            1
        }

        fn read(&mut self, _timeout: Duration) -> Result<Option<RawAudio>, SourceError> {
            std::thread::sleep(Duration::from_millis(1));
            self.reads += 1;
            if self.reads == 5 {
                self.position += 20;
                return Err(SourceError::Overrun { frames: 20 });
            }
            let timestamp = Duration::from_millis(self.position);
            self.position += 10;
            Ok(Some(RawAudio {
                samples: vec![0.25; 10],
                timestamp,
            }))
        }
    }

    #[test]
    fn device_overrun_degrades_and_keeps_the_gap() {
        let events = events::channel();
        let mut rx = events.subscribe();
        let ctx = context(events);
        ctx.gate.open();

        let backend = Overrunning {
            position: 0,
            reads: 0,
        };
        let mut handle = AudioSource::start(Box::new(backend), ctx.clone()).unwrap();
        let mut chunks = Vec::new();
        while chunks.len() < 8 {
            if let Some(crate::capture::source::SourceItem::Audio(chunk)) =
                handle.blocking_next(Duration::from_secs(1))
            {
                chunks.push(chunk);
            }
        }
        handle.stop();

        let steps: Vec<Duration> = chunks
            .windows(2)
            .map(|w| w[1].timestamp - w[0].timestamp)
            .collect();
        assert_eq!(steps[3], Duration::from_millis(30));
        assert!(steps
            .iter()
            .enumerate()
            .all(|(i, step)| i == 3 || *step == Duration::from_millis(10)));

        let received: Vec<RecordingEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(
            &received[0],
            RecordingEvent::SourceDegraded { reason, .. } if reason.contains("20 frames lost")
        ));
        assert!(matches!(received[1], RecordingEvent::SourceRecovered { .. }));
    }

    #[test]
    fn chunks_are_tagged_and_ordered() {
        let ctx = context(events::channel());
        ctx.gate.open();
        let mut handle = AudioSource::start(Box::new(Burst { position: 0 }), ctx.clone()).unwrap();

        let mut chunks = Vec::new();
        while chunks.len() < 20 {
            if let Some(crate::capture::source::SourceItem::Audio(chunk)) =
                handle.blocking_next(Duration::from_secs(1))
            {
                chunks.push(chunk);
            }
        }
        handle.stop();

        assert!(chunks.iter().all(|c| c.source.name == "mic" && c.channels == 1));
        assert!(chunks.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
