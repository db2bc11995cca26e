//! Synchronizer
//!
//! Runs on one thread together with the compositor. It consumes every
//! source queue, maps native timestamps onto the session timeline, and
//! hands the encoder one composite frame per output tick plus fixed-size
//! blocks of mixed audio, ordered by timestamp with video first on ties.

use crate::capture::frame::{AudioChunk, CaptureFrame};
use crate::capture::pool::FramePool;
use crate::capture::queue::{SinkItem, SinkQueue};
use crate::capture::source::{SourceId, SourceItem, SourceKind, SourceTap};
use crate::compositor::{Compositor, WebcamLayout};
use crate::config::preset::ResolvedPreset;
use crate::config::tuning::PipelineTuning;
use crate::recorder::events::{emit, raise, EventSender, FaultSender, RecordingEvent};
use crate::sync::clock::SessionClock;
use crate::sync::drift::ClockMapper;
use crate::sync::mixer::AudioMixer;
use crate::utils::error::{BackpressureError, PipelineFault, SourceError, StreamKind};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Sleep between polls when no source had anything
const IDLE_WAIT: Duration = Duration::from_millis(2);

/// Items taken from one source per pass, so a busy source cannot starve
/// the others
const MAX_ITEMS_PER_PASS: usize = 32;

/// How long the drain waits for stopped sources to empty their queues
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything fixed for the session that the synchronizer needs
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub preset: ResolvedPreset,
    pub layout: WebcamLayout,
    pub gain_db: f32,
    pub tuning: PipelineTuning,
}

/// Counters shared with the controller for progress reporting
#[derive(Debug, Default)]
pub struct SyncStats {
    video_frames: AtomicU64,
    dropped_video_frames: AtomicU64,
    evicted_capture_frames: AtomicU64,
    audio_frames: AtomicU64,
    audio_stalls: AtomicU64,
}

impl SyncStats {
    /// Frames handed to the encoder
    pub fn video_frames(&self) -> u64 {
        self.video_frames.load(Ordering::Relaxed)
    }

    /// Output frames refused by a full encoder queue
    pub fn dropped_video_frames(&self) -> u64 {
        self.dropped_video_frames.load(Ordering::Relaxed)
    }

    /// Captured frames evicted from full source queues before compositing
    pub fn evicted_capture_frames(&self) -> u64 {
        self.evicted_capture_frames.load(Ordering::Relaxed)
    }

    /// Audio frames (per channel) handed to the encoder
    pub fn audio_frames(&self) -> u64 {
        self.audio_frames.load(Ordering::Relaxed)
    }

    pub fn audio_stalls(&self) -> u64 {
        self.audio_stalls.load(Ordering::Relaxed)
    }
}

/// What the synchronizer produced by the time it exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncReport {
    pub video_frames: u64,
    pub audio_frames: u64,
    pub dropped_video_frames: u64,
    pub evicted_capture_frames: u64,
    /// Session time both tracks run to
    pub end: Duration,
}

#[derive(Debug, Default)]
struct SyncControl {
    drain: AtomicBool,
    abort: AtomicBool,
}

/// Owner of the synchronizer thread
pub struct SyncHandle {
    control: Arc<SyncControl>,
    stats: Arc<SyncStats>,
    thread: Option<JoinHandle<SyncReport>>,
}

impl SyncHandle {
    pub fn stats(&self) -> Arc<SyncStats> {
        self.stats.clone()
    }

    /// Emit the tail up to the frozen clock, then exit. Call after every
    /// source has stopped.
    pub fn drain(mut self) -> SyncReport {
        self.control.drain.store(true, Ordering::SeqCst);
        self.join()
    }

    /// Exit without emitting a tail
    pub fn abort(mut self) -> SyncReport {
        self.control.abort.store(true, Ordering::SeqCst);
        self.join()
    }

    fn join(&mut self) -> SyncReport {
        match self.thread.take().map(|t| t.join()) {
            Some(Ok(report)) => report,
            Some(Err(_)) => {
                tracing::error!("Synchronizer thread panicked");
                SyncReport {
                    video_frames: self.stats.video_frames(),
                    audio_frames: self.stats.audio_frames(),
                    dropped_video_frames: self.stats.dropped_video_frames(),
                    evicted_capture_frames: self.stats.evicted_capture_frames(),
                    end: Duration::ZERO,
                }
            }
            None => SyncReport::default(),
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.control.abort.store(true, Ordering::SeqCst);
            self.join();
        }
    }
}

pub struct Synchronizer {
    taps: Vec<SourceTap>,
    clock: Arc<SessionClock>,
    sink: Arc<SinkQueue>,
    events: EventSender,
    faults: FaultSender,
    stats: Arc<SyncStats>,

    compositor: Compositor,
    mixer: AudioMixer,
    mappers: HashMap<SourceId, ClockMapper>,
    epoch: u64,

    /// Mapped frames, oldest first. The front is the frame currently shown;
    /// the last frame is never removed so a dead source stays frozen.
    screen_frames: VecDeque<(Duration, CaptureFrame)>,
    webcam_frames: VecDeque<(Duration, CaptureFrame)>,
    ring_capacity: usize,

    fps: u32,
    sample_rate: u32,
    channels: u16,
    block_frames: usize,
    video_latency: Duration,
    mix_latency: Duration,
    sink_audio_timeout: Duration,
    tuning: PipelineTuning,

    next_video: u64,
    audio_sequence: u64,
    last_video_ts: Option<Duration>,
    last_audio_ts: Option<Duration>,
    sink_closed: bool,
    /// The mixed track is degraded after an encoder audio timeout
    mix_stalled: bool,
    sources_lost: bool,
    end: Duration,
}

impl Synchronizer {
    pub fn new(
        settings: SyncSettings,
        taps: Vec<SourceTap>,
        clock: Arc<SessionClock>,
        sink: Arc<SinkQueue>,
        events: EventSender,
        faults: FaultSender,
    ) -> Self {
        let preset = &settings.preset;
        let tuning = settings.tuning;
        let pool = FramePool::new(tuning.frame_pool_size);
        let fps = preset.frame_rate.max(1);

        Self {
            taps,
            clock,
            sink,
            events,
            faults,
            stats: Arc::new(SyncStats::default()),
            compositor: Compositor::new(preset.width, preset.height, settings.layout, pool),
            mixer: AudioMixer::new(preset.sample_rate, settings.gain_db),
            mappers: HashMap::new(),
            epoch: 0,
            screen_frames: VecDeque::new(),
            webcam_frames: VecDeque::new(),
            ring_capacity: tuning.video_queue_capacity.max(1) * 2 + 2,
            fps,
            sample_rate: preset.sample_rate,
            channels: preset.channels,
            block_frames: tuning.audio_block_frames.max(1),
            video_latency: preset.frame_interval(),
            mix_latency: tuning.mix_latency(),
            sink_audio_timeout: tuning.sink_audio_timeout(),
            tuning,
            next_video: 0,
            audio_sequence: 0,
            last_video_ts: None,
            last_audio_ts: None,
            sink_closed: false,
            mix_stalled: false,
            sources_lost: false,
            end: Duration::ZERO,
        }
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        self.stats.clone()
    }

    /// Start the synchronizer thread
    pub fn spawn(self) -> Result<SyncHandle, SourceError> {
        let control = Arc::new(SyncControl::default());
        let stats = self.stats.clone();
        let thread = {
            let control = control.clone();
            std::thread::Builder::new()
                .name("synchronizer".to_string())
                .spawn(move || self.run(&control))
                .map_err(|e| SourceError::Capture(format!("failed to spawn synchronizer: {}", e)))?
        };
        Ok(SyncHandle {
            control,
            stats,
            thread: Some(thread),
        })
    }

    fn run(mut self, control: &SyncControl) -> SyncReport {
        tracing::info!(
            "Synchronizer started: {} sources, {}fps, {}Hz",
            self.taps.len(),
            self.fps,
            self.sample_rate
        );

        loop {
            if control.abort.load(Ordering::SeqCst) {
                tracing::info!("Synchronizer aborted");
                break;
            }
            if control.drain.load(Ordering::SeqCst) {
                self.drain();
                break;
            }

            let received = self.pump();
            if self.clock.is_established() && !self.clock.is_frozen() {
                let now = self.clock.elapsed();
                self.emit_live(now);
                self.check_sources();
            }
            if received == 0 {
                std::thread::sleep(IDLE_WAIT);
            }
        }

        self.count_evictions();
        let report = SyncReport {
            video_frames: self.stats.video_frames(),
            audio_frames: self.stats.audio_frames(),
            dropped_video_frames: self.stats.dropped_video_frames(),
            evicted_capture_frames: self.stats.evicted_capture_frames(),
            end: self.end,
        };
        tracing::info!(
            "Synchronizer done: {} video frames ({} dropped, {} evicted), {} audio frames, end {:?}",
            report.video_frames,
            report.dropped_video_frames,
            report.evicted_capture_frames,
            report.audio_frames,
            report.end
        );
        report
    }

    /// Move everything queued at the sources into the frame rings and the
    /// mixer. Returns the number of items taken.
    fn pump(&mut self) -> usize {
        let epoch = self.clock.epoch();
        if epoch != self.epoch {
            self.epoch = epoch;
            for mapper in self.mappers.values_mut() {
                mapper.reanchor_next();
            }
        }

        let mut received = 0;
        for i in 0..self.taps.len() {
            for _ in 0..MAX_ITEMS_PER_PASS {
                let Some(item) = self.taps[i].poll() else {
                    break;
                };
                received += 1;
                match item {
                    SourceItem::Video(frame) => self.accept_frame(frame),
                    SourceItem::Audio(chunk) => self.accept_chunk(chunk),
                }
            }
        }
        self.count_evictions();
        received
    }

    fn count_evictions(&self) {
        let evicted: u64 = self.taps.iter().map(SourceTap::dropped).sum();
        let before = self
            .stats
            .evicted_capture_frames
            .swap(evicted, Ordering::Relaxed);
        if evicted > before && (before == 0 || evicted / 100 > before / 100) {
            tracing::warn!("Compositing behind, {} captured frames evicted", evicted);
        }
    }

    fn mapper(&mut self, id: &SourceId) -> &mut ClockMapper {
        let tuning = &self.tuning;
        self.mappers
            .entry(id.clone())
            .or_insert_with(|| ClockMapper::from_tuning(tuning))
    }

    fn accept_frame(&mut self, frame: CaptureFrame) {
        let reference = self.clock.session_time(frame.captured_at);
        let ts = self.mapper(&frame.source).observe(frame.timestamp, reference);
        let capacity = self.ring_capacity;
        let ring = match frame.source.kind {
            SourceKind::Webcam => &mut self.webcam_frames,
            _ => &mut self.screen_frames,
        };
        // Keep the ring ordered if a mapped stamp ties with the newest
        let ts = ring.back().map(|(last, _)| ts.max(*last)).unwrap_or(ts);
        ring.push_back((ts, frame));
        while ring.len() > capacity {
            ring.pop_front();
        }
    }

    fn accept_chunk(&mut self, chunk: AudioChunk) {
        if chunk.samples.is_empty() || chunk.sample_rate == 0 {
            return;
        }
        // captured_at marks the end of the chunk
        let reference = self
            .clock
            .session_time(chunk.captured_at)
            .saturating_sub(chunk.duration());
        let mapper = self.mapper(&chunk.source);
        let start = mapper.observe(chunk.timestamp, reference);
        let effective_rate = chunk.sample_rate as f64 / mapper.slope();
        self.mixer.push(
            &chunk.source,
            start,
            &chunk.samples,
            chunk.channels,
            effective_rate,
        );
    }

    /// Advance `ring` so its front is the newest frame stamped at or before
    /// `at`. If every frame is newer, the oldest stays in front.
    fn advance(ring: &mut VecDeque<(Duration, CaptureFrame)>, at: Duration) {
        while ring.len() > 1 && ring.get(1).map(|(ts, _)| *ts <= at).unwrap_or(false) {
            ring.pop_front();
        }
    }

    fn next_video_ts(&self) -> Duration {
        Duration::from_secs_f64(self.next_video as f64 / self.fps as f64)
    }

    fn compose_next(&mut self) -> SinkItem {
        let ts = self.next_video_ts();
        Self::advance(&mut self.webcam_frames, ts);
        if let Some((_, webcam)) = self.webcam_frames.front() {
            self.compositor.update_webcam(webcam);
        }
        Self::advance(&mut self.screen_frames, ts);
        let screen = self.screen_frames.front().map(|(_, f)| f);
        let frame = self.compositor.compose(screen, self.next_video, ts);
        self.next_video += 1;
        SinkItem::Video(frame)
    }

    fn mix_next(&mut self, frames: usize) -> SinkItem {
        let timestamp = self.mixer.mixed_until();
        let samples = self.mixer.mix(frames);
        let chunk = AudioChunk {
            source: SourceId::mix(),
            sequence: self.audio_sequence,
            samples,
            sample_rate: self.sample_rate,
            channels: self.channels,
            timestamp,
            captured_at: Instant::now(),
        };
        self.audio_sequence += 1;
        SinkItem::Audio(chunk)
    }

    /// Emit every video tick and audio block that is due at session time
    /// `now`.
    fn emit_live(&mut self, now: Duration) {
        let mut batch = Vec::new();

        let video_due = now.saturating_sub(self.video_latency);
        while self.next_video_ts() <= video_due {
            batch.push(self.compose_next());
        }

        let audio_due = now.saturating_sub(self.mix_latency).as_secs_f64();
        let due_frames = (audio_due * self.sample_rate as f64) as u64;
        while self.mixer.mixed_frames() + self.block_frames as u64 <= due_frames {
            let block = self.block_frames;
            batch.push(self.mix_next(block));
        }

        self.dispatch(batch, false);
    }

    /// Stopped: consume what the sources left behind, then emit both tracks
    /// up to the frozen session time.
    fn drain(&mut self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let received = self.pump();
            if self.taps.iter().all(|t| t.is_drained()) {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Gave up waiting for source queues to drain");
                break;
            }
            if received == 0 {
                std::thread::sleep(IDLE_WAIT);
            }
        }

        let end = self.clock.elapsed();
        self.end = end;
        let total_video = (end.as_secs_f64() * self.fps as f64).round() as u64;
        let total_audio = (end.as_secs_f64() * self.sample_rate as f64).round() as u64;
        tracing::info!(
            "Draining to {:?}: {} video frames, {} audio frames",
            end,
            total_video,
            total_audio
        );

        // Bounded batches keep the tail's memory use flat
        loop {
            let mut batch = Vec::new();
            while self.next_video < total_video && batch.len() < self.ring_capacity {
                batch.push(self.compose_next());
            }
            let horizon = self.next_video_ts();
            while self.mixer.mixed_frames() < total_audio
                && (self.mixer.mixed_until() <= horizon || self.next_video >= total_video)
            {
                let frames = (total_audio - self.mixer.mixed_frames()).min(self.block_frames as u64);
                batch.push(self.mix_next(frames as usize));
            }
            if batch.is_empty() || self.sink_closed {
                break;
            }
            self.dispatch(batch, true);
        }
    }

    /// Hand a batch to the encoder in (timestamp, video first) order
    fn dispatch(&mut self, mut batch: Vec<SinkItem>, draining: bool) {
        batch.sort_by_key(|item| {
            let rank = match item {
                SinkItem::Video(_) => 0u8,
                SinkItem::Audio(_) => 1u8,
            };
            (item.timestamp(), rank)
        });

        for item in batch {
            if self.sink_closed {
                return;
            }
            match item {
                SinkItem::Video(frame) => {
                    debug_assert!(self.last_video_ts.map_or(true, |t| t < frame.timestamp));
                    self.last_video_ts = Some(frame.timestamp);
                    if draining {
                        self.deliver_blocking(SinkItem::Video(frame), StreamKind::Video);
                    } else if self.sink.offer_video(frame) {
                        self.stats.video_frames.fetch_add(1, Ordering::Relaxed);
                    } else if self.sink.is_closed() {
                        self.sink_closed = true;
                    } else {
                        let dropped = self.stats.dropped_video_frames.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped == 1 || dropped % 100 == 0 {
                            tracing::warn!("Encoder behind, {} output frames dropped", dropped);
                        }
                    }
                }
                SinkItem::Audio(chunk) => {
                    debug_assert!(self.last_audio_ts.map_or(true, |t| t <= chunk.timestamp));
                    self.last_audio_ts = Some(chunk.timestamp);
                    if draining {
                        self.deliver_blocking(SinkItem::Audio(chunk), StreamKind::Audio);
                        continue;
                    }
                    let frames = chunk.frames() as u64;
                    match self.sink.push_audio(chunk, self.sink_audio_timeout) {
                        Ok(()) => {
                            self.stats.audio_frames.fetch_add(frames, Ordering::Relaxed);
                            if std::mem::take(&mut self.mix_stalled) {
                                tracing::info!("Encoder accepting audio again");
                                emit(
                                    &self.events,
                                    RecordingEvent::SourceRecovered {
                                        source: SourceId::mix(),
                                    },
                                );
                            }
                        }
                        Err(BackpressureError::Closed) => self.sink_closed = true,
                        Err(e @ BackpressureError::Timeout { .. }) => {
                            self.stats.audio_stalls.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("Encoder not accepting audio: {}", e);
                            emit(
                                &self.events,
                                RecordingEvent::Backpressure {
                                    stream: StreamKind::Audio,
                                    detail: e.to_string(),
                                },
                            );
                            if !self.mix_stalled {
                                self.mix_stalled = true;
                                emit(
                                    &self.events,
                                    RecordingEvent::SourceDegraded {
                                        source: SourceId::mix(),
                                        reason: SourceError::Stalled(e).to_string(),
                                    },
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    fn deliver_blocking(&mut self, item: SinkItem, stream: StreamKind) {
        let frames = match &item {
            SinkItem::Audio(chunk) => chunk.frames() as u64,
            SinkItem::Video(_) => 1,
        };
        match self.sink.push_blocking(item) {
            Ok(()) => {
                let counter = match stream {
                    StreamKind::Video => &self.stats.video_frames,
                    StreamKind::Audio => &self.stats.audio_frames,
                };
                counter.fetch_add(frames, Ordering::Relaxed);
            }
            Err(_) => {
                tracing::warn!("Encoder closed during drain");
                self.sink_closed = true;
            }
        }
    }

    /// Escalate once when no source is left delivering
    fn check_sources(&mut self) {
        if self.sources_lost || self.taps.is_empty() {
            return;
        }
        if self.taps.iter().any(|t| t.monitor.is_usable()) {
            return;
        }
        self.sources_lost = true;
        let source_id = self.taps[0].id.clone();
        raise(
            &self.faults,
            PipelineFault::Source {
                source_id,
                error: SourceError::AllSourcesLost,
            },
        );
    }
}
