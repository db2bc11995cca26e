//! Capture trait definitions
//!
//! Platform-agnostic descriptions of capture devices and the seams a
//! platform backend implements. Backends are `Send` so they can be moved
//! onto an adapter thread; the streams they open are not, and live and die
//! on that thread.

use crate::capture::frame::PixelFormat;
use crate::capture::pool::{FrameBuffer, FramePool};
use crate::utils::error::{ConfigError, SourceError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Information about a display/screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    /// Unique display ID
    pub id: String,

    /// Display name
    pub name: String,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Scale factor (e.g., 2.0 for Retina)
    pub scale_factor: f64,

    /// Whether this is the primary display
    pub is_primary: bool,

    /// Refresh rate in Hz (if available)
    pub refresh_rate: Option<u32>,
}

/// Information about an audio device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Whether this is an input device (false for output loopback)
    pub is_input: bool,

    /// Whether this is the default device
    pub is_default: bool,

    /// Native sample rate
    pub sample_rate: u32,

    /// Native channel count
    pub channels: u16,
}

/// Information about a camera/webcam
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Supported resolutions
    pub supported_resolutions: Vec<Resolution>,
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// One mode a camera can be opened in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraCapability {
    pub resolution: Resolution,
    pub frame_rates: Vec<u32>,
    pub format: String,
}

/// An image as delivered by a platform primitive
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: FrameBuffer,
    /// Device clock time of the image
    pub timestamp: Duration,
}

/// A block of interleaved samples as delivered by a platform primitive
#[derive(Debug, Clone)]
pub struct RawAudio {
    pub samples: Vec<f32>,
    /// Device clock time of the first sample
    pub timestamp: Duration,
}

/// Opens a display for capture
pub trait ScreenBackend: Send {
    fn open(self: Box<Self>) -> Result<Box<dyn ScreenStream>, SourceError>;
}

/// An open display
pub trait ScreenStream {
    /// Return the image presented since the previous call, or `None` if the
    /// display has not presented a new one.
    fn grab(&mut self, pool: &FramePool) -> Result<Option<RawFrame>, SourceError>;
}

/// Opens an audio device for capture
pub trait AudioBackend: Send {
    fn open(self: Box<Self>) -> Result<Box<dyn AudioStream>, SourceError>;
}

/// An open audio device
pub trait AudioStream {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Wait up to `timeout` for the next block of samples.
    fn read(&mut self, timeout: Duration) -> Result<Option<RawAudio>, SourceError>;
}

/// Opens a camera for capture
pub trait WebcamBackend: Send {
    fn open(self: Box<Self>) -> Result<Box<dyn WebcamStream>, SourceError>;
}

/// An open camera
pub trait WebcamStream {
    /// Rate the device was opened at
    fn frame_rate(&self) -> u32;

    /// Wait up to `timeout` for the next frame. The camera sets the pace.
    fn read(&mut self, pool: &FramePool, timeout: Duration) -> Result<Option<RawFrame>, SourceError>;
}

/// Device enumeration and backend construction
///
/// The config layer uses the listing and capability queries; the controller
/// only asks for backends by id.
pub trait DeviceCatalog: Send + Sync {
    fn displays(&self) -> Vec<DisplayInfo>;

    fn audio_devices(&self) -> Vec<AudioDeviceInfo>;

    fn cameras(&self) -> Vec<CameraInfo>;

    fn camera_capabilities(&self, id: &str) -> Result<Vec<CameraCapability>, SourceError>;

    fn screen_backend(&self, id: &str) -> Result<Box<dyn ScreenBackend>, ConfigError>;

    fn audio_backend(&self, id: &str) -> Result<Box<dyn AudioBackend>, ConfigError>;

    fn webcam_backend(&self, id: &str) -> Result<Box<dyn WebcamBackend>, ConfigError>;
}
