//! Encoder types
//!
//! Parameters an encoder is opened with, what it reports at finalize, and
//! the two seams a backend implements.

use crate::capture::frame::{AudioChunk, CompositeFrame};
use crate::config::preset::{AudioCodec, Container, ResolvedPreset};
use crate::utils::error::{ConfigError, EncodeError, FinalizeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Encoding parameters, fixed when the encoder is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub crf: u8,
    pub video_bitrate_kbps: u32,
    pub x264_preset: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub audio_codec: AudioCodec,
    pub container: Container,
}

impl EncoderParams {
    pub fn from_preset(preset: &ResolvedPreset) -> Self {
        Self {
            width: preset.width,
            height: preset.height,
            frame_rate: preset.frame_rate,
            crf: preset.crf,
            video_bitrate_kbps: preset.video_bitrate_kbps,
            x264_preset: preset.x264_preset.clone(),
            sample_rate: preset.sample_rate,
            channels: preset.channels,
            audio_codec: preset.audio_codec,
            container: preset.container,
        }
    }

    /// Bytes in one RGBA frame
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    pub fn video_duration(&self, frames: u64) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.frame_rate.max(1) as f64)
    }

    pub fn audio_duration(&self, frames: u64) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.sample_rate.max(1) as f64)
    }
}

/// What a successful finalize produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeReport {
    pub output_path: PathBuf,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub video_duration: Duration,
    pub audio_duration: Duration,
    /// Size of the finished file, 0 when nothing was written to disk
    pub bytes_written: u64,
}

/// An open encoder for one session
///
/// Items arrive in non-decreasing timestamp order per stream. `finalize`
/// flushes everything and leaves a complete file at the output path or an
/// error listing what is on disk instead.
pub trait MediaEncoder: Send {
    fn write_video(&mut self, frame: CompositeFrame) -> Result<(), EncodeError>;

    fn write_audio(&mut self, chunk: AudioChunk) -> Result<(), EncodeError>;

    fn finalize(self: Box<Self>) -> Result<FinalizeReport, FinalizeError>;

    /// Tear down without finalizing. Returns the files left behind.
    fn abort(self: Box<Self>) -> Vec<PathBuf>;
}

/// Creates encoders
pub trait EncoderFactory: Send + Sync {
    /// Check the backend is usable before anything is opened
    fn probe(&self) -> Result<(), ConfigError>;

    /// Open an encoder writing to `output`. A failed open leaves no files.
    fn open(&self, params: &EncoderParams, output: &Path)
        -> Result<Box<dyn MediaEncoder>, EncodeError>;
}

/// Stream details read back from a finished file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStreamInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamInfo {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration: Option<Duration>,
}

/// Metadata of a media file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub path: PathBuf,
    pub format: String,
    pub duration: Option<Duration>,
    pub size_bytes: u64,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
}

/// Sibling of `output` with `suffix` appended to its file name
pub fn sibling_path(output: &Path, suffix: &str) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording".to_string());
    output.with_file_name(format!("{}.{}", name, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::preset::{AudioQuality, QualityPreset, VideoQuality};

    #[test]
    fn params_follow_preset() {
        let preset = QualityPreset::new(VideoQuality::Medium, AudioQuality::Medium)
            .resolve(Container::Mp4, None)
            .unwrap();
        let params = EncoderParams::from_preset(&preset);
        assert_eq!(params.frame_len(), 1920 * 1080 * 4);
        assert_eq!(params.video_duration(45), Duration::from_millis(1500));
        assert_eq!(params.audio_duration(44100), Duration::from_secs(1));
        assert_eq!(params.audio_codec, AudioCodec::Aac { bitrate_kbps: 128 });
    }

    #[test]
    fn sibling_keeps_directory() {
        let path = sibling_path(Path::new("/tmp/take1.mp4"), "part");
        assert_eq!(path, PathBuf::from("/tmp/take1.mp4.part"));
    }
}
