//! Real device backends
//!
//! cpal for audio inputs (and WASAPI loopback on Windows), nokhwa for
//! cameras and screenshots for displays.

mod audio;
mod screen;
mod webcam;

use crate::capture::traits::{
    AudioBackend, AudioDeviceInfo, CameraCapability, CameraInfo, DeviceCatalog, DisplayInfo,
    ScreenBackend, WebcamBackend,
};
use crate::utils::error::{ConfigError, SourceError};

pub use audio::CpalBackend;
pub use screen::DisplayBackend;
pub use webcam::NokhwaBackend;

/// Catalog backed by the host's devices
#[derive(Debug, Default)]
pub struct NativeCatalog;

impl NativeCatalog {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceCatalog for NativeCatalog {
    fn displays(&self) -> Vec<DisplayInfo> {
        screen::list_displays()
    }

    fn audio_devices(&self) -> Vec<AudioDeviceInfo> {
        audio::list_devices()
    }

    fn cameras(&self) -> Vec<CameraInfo> {
        webcam::list_cameras()
    }

    fn camera_capabilities(&self, id: &str) -> Result<Vec<CameraCapability>, SourceError> {
        webcam::capabilities(id)
    }

    fn screen_backend(&self, id: &str) -> Result<Box<dyn ScreenBackend>, ConfigError> {
        if !self.displays().iter().any(|d| d.id == id) {
            return Err(ConfigError::DeviceNotFound(format!("display '{}'", id)));
        }
        Ok(Box::new(DisplayBackend::new(id)))
    }

    fn audio_backend(&self, id: &str) -> Result<Box<dyn AudioBackend>, ConfigError> {
        let device = self
            .audio_devices()
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| ConfigError::DeviceNotFound(format!("audio device '{}'", id)))?;
        Ok(Box::new(CpalBackend::new(&device.id, device.is_input)))
    }

    fn webcam_backend(&self, id: &str) -> Result<Box<dyn WebcamBackend>, ConfigError> {
        if !self.cameras().iter().any(|c| c.id == id) {
            return Err(ConfigError::DeviceNotFound(format!("camera '{}'", id)));
        }
        Ok(Box::new(NokhwaBackend::new(id)))
    }
}
