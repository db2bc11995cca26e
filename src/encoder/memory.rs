//! In-memory encoder
//!
//! Records what it is fed instead of encoding it. Used by dry runs and by
//! tests that need to look at the output stream without FFmpeg.

use crate::capture::frame::{AudioChunk, CompositeFrame};
use crate::encoder::types::{EncoderFactory, EncoderParams, FinalizeReport, MediaEncoder};
use crate::utils::error::{ConfigError, EncodeError, FinalizeError, StreamKind};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Failure to inject into encoders from a [`MemoryEncoderFactory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    /// `probe` reports the backend unavailable
    Unavailable,
    /// `open` fails
    Open,
    /// The nth video frame (0-based) is rejected
    VideoWrite(u64),
    /// `finalize` fails
    Finalize,
}

/// Everything one encoder received
#[derive(Debug, Clone, Default)]
pub struct MemoryRecording {
    pub output: PathBuf,
    pub params: Option<EncoderParams>,
    pub video_indices: Vec<u64>,
    pub video_timestamps: Vec<Duration>,
    /// RGBA values at the factory's probe points, one row per frame
    pub pixel_samples: Vec<Vec<[u8; 4]>>,
    pub audio_timestamps: Vec<Duration>,
    pub audio_frames: u64,
    /// Peak absolute sample value seen
    pub audio_peak: f32,
    pub finalized: bool,
    pub aborted: bool,
}

impl MemoryRecording {
    /// Output ticks covered, counting any the sink never received
    pub fn video_frames(&self) -> u64 {
        self.video_indices.last().map_or(0, |i| i + 1)
    }

    pub fn video_duration(&self) -> Duration {
        self.params
            .as_ref()
            .map(|p| p.video_duration(self.video_frames()))
            .unwrap_or_default()
    }

    pub fn audio_duration(&self) -> Duration {
        self.params
            .as_ref()
            .map(|p| p.audio_duration(self.audio_frames))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEncoderFactory {
    recordings: Arc<Mutex<Vec<Arc<Mutex<MemoryRecording>>>>>,
    probe_points: Vec<(u32, u32)>,
    fault: Option<MemoryFault>,
    /// Per-frame delay, to simulate a slow encoder
    frame_delay: Option<Duration>,
}

impl MemoryEncoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample these output pixels on every frame
    pub fn with_probe_points(mut self, points: Vec<(u32, u32)>) -> Self {
        self.probe_points = points;
        self
    }

    pub fn with_fault(mut self, fault: MemoryFault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// Snapshot of every encoder opened so far
    pub fn recordings(&self) -> Vec<MemoryRecording> {
        self.recordings.lock().iter().map(|r| r.lock().clone()).collect()
    }

    pub fn last_recording(&self) -> Option<MemoryRecording> {
        self.recordings.lock().last().map(|r| r.lock().clone())
    }
}

impl EncoderFactory for MemoryEncoderFactory {
    fn probe(&self) -> Result<(), ConfigError> {
        match self.fault {
            Some(MemoryFault::Unavailable) => Err(ConfigError::EncoderUnavailable(
                "memory encoder disabled".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn open(
        &self,
        params: &EncoderParams,
        output: &Path,
    ) -> Result<Box<dyn MediaEncoder>, EncodeError> {
        if self.fault == Some(MemoryFault::Open) {
            return Err(EncodeError::Spawn("memory encoder refused to open".to_string()));
        }
        let recording = Arc::new(Mutex::new(MemoryRecording {
            output: output.to_path_buf(),
            params: Some(params.clone()),
            ..Default::default()
        }));
        self.recordings.lock().push(recording.clone());
        tracing::debug!("Memory encoder opened for {}", output.display());

        Ok(Box::new(MemoryEncoder {
            params: params.clone(),
            recording,
            probe_points: self.probe_points.clone(),
            fault: self.fault,
            frame_delay: self.frame_delay,
        }))
    }
}

pub struct MemoryEncoder {
    params: EncoderParams,
    recording: Arc<Mutex<MemoryRecording>>,
    probe_points: Vec<(u32, u32)>,
    fault: Option<MemoryFault>,
    frame_delay: Option<Duration>,
}

impl MediaEncoder for MemoryEncoder {
    fn write_video(&mut self, frame: CompositeFrame) -> Result<(), EncodeError> {
        if let Some(delay) = self.frame_delay {
            std::thread::sleep(delay);
        }
        let mut recording = self.recording.lock();
        if self.fault == Some(MemoryFault::VideoWrite(recording.video_indices.len() as u64)) {
            return Err(EncodeError::Write {
                stream: StreamKind::Video,
                reason: "injected write failure".to_string(),
            });
        }
        if frame.width != self.params.width || frame.height != self.params.height {
            return Err(EncodeError::InvalidFrame(format!(
                "{}x{} frame for a {}x{} encoder",
                frame.width, frame.height, self.params.width, self.params.height
            )));
        }

        let samples = self
            .probe_points
            .iter()
            .map(|&(x, y)| {
                let i = (y as usize * frame.width as usize + x as usize) * 4;
                frame
                    .data
                    .get(i..i + 4)
                    .and_then(|p| p.try_into().ok())
                    .unwrap_or([0; 4])
            })
            .collect();
        recording.pixel_samples.push(samples);
        recording.video_indices.push(frame.index);
        recording.video_timestamps.push(frame.timestamp);
        Ok(())
    }

    fn write_audio(&mut self, chunk: AudioChunk) -> Result<(), EncodeError> {
        if chunk.sample_rate != self.params.sample_rate || chunk.channels != self.params.channels {
            return Err(EncodeError::InvalidFrame(format!(
                "{}Hz/{}ch audio for a {}Hz/{}ch encoder",
                chunk.sample_rate, chunk.channels, self.params.sample_rate, self.params.channels
            )));
        }
        let peak = chunk.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        let mut recording = self.recording.lock();
        recording.audio_timestamps.push(chunk.timestamp);
        recording.audio_frames += chunk.frames() as u64;
        recording.audio_peak = recording.audio_peak.max(peak);
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<FinalizeReport, FinalizeError> {
        if self.fault == Some(MemoryFault::Finalize) {
            return Err(FinalizeError::Container {
                reason: "injected finalize failure".to_string(),
                written: Vec::new(),
            });
        }
        let mut recording = self.recording.lock();
        recording.finalized = true;
        Ok(FinalizeReport {
            output_path: recording.output.clone(),
            video_frames: recording.video_frames(),
            audio_frames: recording.audio_frames,
            video_duration: recording.video_duration(),
            audio_duration: recording.audio_duration(),
            bytes_written: 0,
        })
    }

    fn abort(self: Box<Self>) -> Vec<PathBuf> {
        self.recording.lock().aborted = true;
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::pool::FrameBuffer;
    use crate::capture::source::SourceId;
    use crate::config::preset::{AudioQuality, Container, QualityPreset, VideoQuality};
    use std::time::Instant;

    fn params() -> EncoderParams {
        let mut preset = QualityPreset::new(VideoQuality::Low, AudioQuality::Low)
            .resolve(Container::Mkv, None)
            .unwrap();
        preset.width = 4;
        preset.height = 2;
        EncoderParams::from_preset(&preset)
    }

    fn frame(index: u64) -> CompositeFrame {
        CompositeFrame {
            index,
            timestamp: Duration::from_millis(index * 33),
            width: 4,
            height: 2,
            data: FrameBuffer::detached(vec![index as u8; 32]),
        }
    }

    #[test]
    fn records_frames_and_audio() {
        let factory = MemoryEncoderFactory::new().with_probe_points(vec![(1, 1)]);
        let mut encoder = factory.open(&params(), Path::new("/tmp/m.mkv")).unwrap();
        encoder.write_video(frame(0)).unwrap();
        encoder.write_video(frame(1)).unwrap();
        encoder
            .write_audio(AudioChunk {
                source: SourceId::mix(),
                sequence: 0,
                samples: vec![0.25; 2 * 2205],
                sample_rate: 22050,
                channels: 2,
                timestamp: Duration::ZERO,
                captured_at: Instant::now(),
            })
            .unwrap();
        let report = encoder.finalize().unwrap();

        assert_eq!(report.video_frames, 2);
        assert_eq!(report.audio_duration, Duration::from_millis(100));
        let recording = factory.last_recording().unwrap();
        assert!(recording.finalized);
        assert_eq!(recording.pixel_samples[1], vec![[1, 1, 1, 1]]);
        assert_eq!(recording.audio_peak, 0.25);
    }

    #[test]
    fn injected_faults() {
        let factory = MemoryEncoderFactory::new().with_fault(MemoryFault::VideoWrite(1));
        let mut encoder = factory.open(&params(), Path::new("/tmp/m.mkv")).unwrap();
        encoder.write_video(frame(0)).unwrap();
        assert!(matches!(
            encoder.write_video(frame(1)),
            Err(EncodeError::Write { stream: StreamKind::Video, .. })
        ));

        let factory = MemoryEncoderFactory::new().with_fault(MemoryFault::Unavailable);
        assert!(factory.probe().is_err());
        let factory = MemoryEncoderFactory::new().with_fault(MemoryFault::Open);
        assert!(factory.open(&params(), Path::new("/tmp/m.mkv")).is_err());
    }
}
