//! Quality presets
//!
//! Named quality tiers and the concrete encoding parameters they resolve to.
//! A preset is resolved exactly once per session into a [`ResolvedPreset`].

use crate::utils::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Video quality tiers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

impl VideoQuality {
    /// Output resolution (width, height)
    pub fn resolution(&self) -> (u32, u32) {
        match self {
            VideoQuality::Low => (1280, 720),
            VideoQuality::Medium => (1920, 1080),
            VideoQuality::High => (1920, 1080),
            VideoQuality::Ultra => (2560, 1440),
        }
    }

    /// Default output frame rate
    pub fn frame_rate(&self) -> u32 {
        match self {
            VideoQuality::Low | VideoQuality::Medium => 30,
            VideoQuality::High | VideoQuality::Ultra => 60,
        }
    }

    /// Target video bitrate in kbps
    pub fn bitrate_kbps(&self) -> u32 {
        match self {
            VideoQuality::Low => 1000,
            VideoQuality::Medium => 2500,
            VideoQuality::High => 5000,
            VideoQuality::Ultra => 10000,
        }
    }

    /// Get the CRF value for H.264 encoding
    /// Lower values = higher quality, larger files
    pub fn crf(&self) -> u8 {
        match self {
            VideoQuality::Low => 28,
            VideoQuality::Medium => 23,
            VideoQuality::High => 20,
            VideoQuality::Ultra => 18,
        }
    }
}

impl std::str::FromStr for VideoQuality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(VideoQuality::Low),
            "medium" => Ok(VideoQuality::Medium),
            "high" => Ok(VideoQuality::High),
            "ultra" => Ok(VideoQuality::Ultra),
            other => Err(ConfigError::InvalidPreset(format!("unknown video tier '{other}'"))),
        }
    }
}

/// Audio quality tiers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Low,
    #[default]
    Medium,
    High,
    Lossless,
}

impl AudioQuality {
    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioQuality::Low => 22050,
            AudioQuality::Medium => 44100,
            AudioQuality::High => 48000,
            AudioQuality::Lossless => 96000,
        }
    }

    /// Target bitrate in kbps, `None` for lossless
    pub fn bitrate_kbps(&self) -> Option<u32> {
        match self {
            AudioQuality::Low => Some(64),
            AudioQuality::Medium => Some(128),
            AudioQuality::High => Some(256),
            AudioQuality::Lossless => None,
        }
    }
}

impl std::str::FromStr for AudioQuality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(AudioQuality::Low),
            "medium" => Ok(AudioQuality::Medium),
            "high" => Ok(AudioQuality::High),
            "lossless" => Ok(AudioQuality::Lossless),
            other => Err(ConfigError::InvalidPreset(format!("unknown audio tier '{other}'"))),
        }
    }
}

/// Output container, chosen by the output file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Mov,
    Mkv,
}

impl Container {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" => Ok(Container::Mp4),
            "mov" => Ok(Container::Mov),
            "mkv" => Ok(Container::Mkv),
            "" => Err(ConfigError::UnsupportedContainer(format!(
                "{} has no extension",
                path.display()
            ))),
            other => Err(ConfigError::UnsupportedContainer(other.to_string())),
        }
    }

    /// Get the file extension for this container
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mov => "mov",
            Container::Mkv => "mkv",
        }
    }

    /// FFmpeg muxer name
    pub fn muxer(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mov => "mov",
            Container::Mkv => "matroska",
        }
    }
}

/// Audio codec applied at mux time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "codec")]
pub enum AudioCodec {
    Aac { bitrate_kbps: u32 },
    Flac,
    Alac,
}

impl AudioCodec {
    /// FFmpeg encoder name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            AudioCodec::Aac { .. } => "aac",
            AudioCodec::Flac => "flac",
            AudioCodec::Alac => "alac",
        }
    }
}

/// A named video + audio tier pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QualityPreset {
    #[serde(default)]
    pub video: VideoQuality,
    #[serde(default)]
    pub audio: AudioQuality,
}

/// Output audio is always stereo.
pub const OUTPUT_CHANNELS: u16 = 2;

/// H.264 speed preset used for live capture
pub const X264_PRESET: &str = "veryfast";

/// Concrete encoding parameters, immutable for the session's lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPreset {
    pub video: VideoQuality,
    pub audio: AudioQuality,
    pub container: Container,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub video_bitrate_kbps: u32,
    pub crf: u8,
    pub x264_preset: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub audio_codec: AudioCodec,
}

impl QualityPreset {
    pub fn new(video: VideoQuality, audio: AudioQuality) -> Self {
        Self { video, audio }
    }

    /// Resolve to concrete parameters. `frame_rate` overrides the tier's
    /// default rate when given.
    pub fn resolve(
        &self,
        container: Container,
        frame_rate: Option<u32>,
    ) -> Result<ResolvedPreset, ConfigError> {
        let frame_rate = frame_rate.unwrap_or_else(|| self.video.frame_rate());
        if !(1..=240).contains(&frame_rate) {
            return Err(ConfigError::InvalidPreset(format!(
                "frame rate {frame_rate} outside 1..=240"
            )));
        }

        let (width, height) = self.video.resolution();
        let audio_codec = match (self.audio.bitrate_kbps(), container) {
            (Some(bitrate_kbps), _) => AudioCodec::Aac { bitrate_kbps },
            (None, Container::Mkv) => AudioCodec::Flac,
            (None, Container::Mp4 | Container::Mov) => AudioCodec::Alac,
        };

        Ok(ResolvedPreset {
            video: self.video,
            audio: self.audio,
            container,
            // Codecs want even dimensions
            width: width & !1,
            height: height & !1,
            frame_rate,
            video_bitrate_kbps: self.video.bitrate_kbps(),
            crf: self.video.crf(),
            x264_preset: X264_PRESET.to_string(),
            sample_rate: self.audio.sample_rate(),
            channels: OUTPUT_CHANNELS,
            audio_codec,
        })
    }
}

impl ResolvedPreset {
    /// Bytes in one RGBA output frame
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    /// Duration of one output frame
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.frame_rate as f64)
    }
}
