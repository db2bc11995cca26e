//! Start request
//!
//! The fully-resolved parameters a control surface hands to the controller.

use crate::compositor::WebcamLayout;
use crate::config::preset::{Container, QualityPreset, ResolvedPreset};
use crate::utils::error::ConfigError;
use chrono::Local;
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Accepted range for the mixed-track gain
pub const GAIN_RANGE_DB: std::ops::RangeInclusive<f32> = -30.0..=30.0;

/// Which part of which display to capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ScreenSelector {
    /// A whole display
    Display { id: String },
    /// A rectangle of a display, in display pixels
    Region {
        id: String,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
}

impl ScreenSelector {
    pub fn display_id(&self) -> &str {
        match self {
            ScreenSelector::Display { id } | ScreenSelector::Region { id, .. } => id,
        }
    }

    /// Crop rectangle (x, y, width, height), if any
    pub fn region(&self) -> Option<(u32, u32, u32, u32)> {
        match self {
            ScreenSelector::Display { .. } => None,
            ScreenSelector::Region {
                x,
                y,
                width,
                height,
                ..
            } => Some((*x, *y, *width, *height)),
        }
    }
}

/// Configuration for starting a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Screen to capture
    pub screen: ScreenSelector,

    /// Audio devices to bind; each becomes its own tagged source
    #[serde(default)]
    pub audio_devices: Vec<String>,

    /// Webcam device, if the overlay is enabled
    #[serde(default)]
    pub webcam: Option<String>,

    /// Overlay placement and treatment
    #[serde(default)]
    pub webcam_layout: WebcamLayout,

    /// Named quality tiers
    #[serde(default)]
    pub preset: QualityPreset,

    /// Output container path; its extension picks the container
    pub output_path: PathBuf,

    /// Output frame rate, overriding the video tier's default
    #[serde(default)]
    pub frame_rate: Option<u32>,

    /// Gain applied to the mixed audio track
    #[serde(default)]
    pub audio_gain_db: f32,
}

impl StartRequest {
    pub fn new(screen: ScreenSelector, output_path: impl Into<PathBuf>) -> Self {
        Self {
            screen,
            audio_devices: Vec::new(),
            webcam: None,
            webcam_layout: WebcamLayout::default(),
            preset: QualityPreset::default(),
            output_path: output_path.into(),
            frame_rate: None,
            audio_gain_db: 0.0,
        }
    }

    /// Check everything that can be checked without touching a device and
    /// resolve the preset.
    pub fn validate(&self) -> Result<ResolvedPreset, ConfigError> {
        validate_output_path(&self.output_path)?;
        let container = Container::from_path(&self.output_path)?;
        let preset = self.preset.resolve(container, self.frame_rate)?;

        if !self.audio_gain_db.is_finite() || !GAIN_RANGE_DB.contains(&self.audio_gain_db) {
            return Err(ConfigError::InvalidGain(self.audio_gain_db));
        }

        let mut seen = HashSet::new();
        for id in &self.audio_devices {
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::DeviceNotFound(format!(
                    "audio device '{id}' bound twice"
                )));
            }
        }

        if let Some((_, _, width, height)) = self.screen.region() {
            if width < 2 || height < 2 {
                return Err(ConfigError::InvalidPreset(format!(
                    "capture region {width}x{height} is too small"
                )));
            }
        }

        if self.webcam.is_some() {
            self.webcam_layout.validate()?;
        }

        Ok(preset)
    }
}

fn validate_output_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::InvalidOutput("empty path".to_string()));
    }
    if path.is_dir() {
        return Err(ConfigError::InvalidOutput(format!(
            "{} is a directory",
            path.display()
        )));
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            Err(ConfigError::InvalidOutput(format!(
                "directory {} does not exist",
                parent.display()
            )))
        }
        _ => Ok(()),
    }
}

/// Get the default output directory (system Videos folder or home).
pub fn default_output_dir() -> Option<PathBuf> {
    let user_dirs = UserDirs::new()?;

    let base = user_dirs
        .video_dir()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| user_dirs.home_dir().to_path_buf());
    Some(base.join("recordings"))
}

/// Timestamped file name inside the default output directory
pub fn default_output_path(container: Container) -> Option<PathBuf> {
    let timestamp = Local::now().format("%Y-%m-%d_%H%M%S");
    default_output_dir().map(|dir| {
        dir.join(format!("recording_{}.{}", timestamp, container.extension()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::preset::{AudioQuality, VideoQuality};

    fn request(dir: &Path) -> StartRequest {
        StartRequest::new(
            ScreenSelector::Display { id: "0".into() },
            dir.join("out.mp4"),
        )
    }

    #[test]
    fn valid_request_resolves_preset() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path());
        req.preset = QualityPreset::new(VideoQuality::High, AudioQuality::High);
        req.frame_rate = Some(50);

        let preset = req.validate().unwrap();
        assert_eq!(preset.frame_rate, 50);
        assert_eq!(preset.sample_rate, 48000);
        assert_eq!(preset.container, Container::Mp4);
    }

    #[test]
    fn rejects_missing_directory_and_bad_extension() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path());
        req.output_path = dir.path().join("missing").join("out.mp4");
        assert!(matches!(req.validate(), Err(ConfigError::InvalidOutput(_))));

        req.output_path = dir.path().join("out.gif");
        assert!(matches!(
            req.validate(),
            Err(ConfigError::UnsupportedContainer(_))
        ));

        req.output_path = dir.path().to_path_buf();
        assert!(matches!(req.validate(), Err(ConfigError::InvalidOutput(_))));
    }

    #[test]
    fn rejects_gain_out_of_range_and_duplicate_devices() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path());
        req.audio_gain_db = 42.0;
        assert_eq!(req.validate(), Err(ConfigError::InvalidGain(42.0)));

        req.audio_gain_db = -6.0;
        req.audio_devices = vec!["mic".into(), "mic".into()];
        assert!(matches!(req.validate(), Err(ConfigError::DeviceNotFound(_))));
    }

    #[test]
    fn parses_from_json_with_defaults() {
        let json = r#"{
            "screen": { "type": "region", "id": "1", "x": 10, "y": 20, "width": 640, "height": 480 },
            "audioDevices": ["mic"],
            "outputPath": "/tmp/out.mkv"
        }"#;
        let req: StartRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.screen.display_id(), "1");
        assert_eq!(req.screen.region(), Some((10, 20, 640, 480)));
        assert_eq!(req.preset, QualityPreset::default());
        assert!(req.webcam.is_none());
        assert_eq!(req.audio_gain_db, 0.0);
    }
}
