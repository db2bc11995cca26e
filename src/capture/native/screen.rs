//! Display capture through the screenshots crate

use crate::capture::frame::PixelFormat;
use crate::capture::pool::FramePool;
use crate::capture::traits::{DisplayInfo, RawFrame, ScreenBackend, ScreenStream};
use crate::utils::error::SourceError;
use screenshots::Screen;
use std::time::Instant;

pub fn list_displays() -> Vec<DisplayInfo> {
    match Screen::all() {
        Ok(screens) => screens
            .iter()
            .enumerate()
            .map(|(i, screen)| {
                let info = &screen.display_info;
                DisplayInfo {
                    id: info.id.to_string(),
                    name: format!("Display {}", i + 1),
                    width: (info.width as f32 * info.scale_factor) as u32,
                    height: (info.height as f32 * info.scale_factor) as u32,
                    scale_factor: info.scale_factor as f64,
                    is_primary: info.is_primary,
                    refresh_rate: None,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate displays: {}", e);
            Vec::new()
        }
    }
}

/// A display identified by its platform id
#[derive(Debug, Clone)]
pub struct DisplayBackend {
    id: String,
}

impl DisplayBackend {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl ScreenBackend for DisplayBackend {
    fn open(self: Box<Self>) -> Result<Box<dyn ScreenStream>, SourceError> {
        let screens = Screen::all().map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?;
        let screen = screens
            .into_iter()
            .find(|s| s.display_info.id.to_string() == self.id)
            .ok_or_else(|| SourceError::DeviceUnavailable(format!("display {}", self.id)))?;

        // A first capture surfaces a missing screen-recording permission
        screen.capture().map_err(|e| {
            let text = e.to_string();
            if text.to_lowercase().contains("permission") {
                SourceError::PermissionDenied(text)
            } else {
                SourceError::Capture(text)
            }
        })?;

        Ok(Box::new(DisplayStream {
            screen,
            opened: Instant::now(),
        }))
    }
}

struct DisplayStream {
    screen: Screen,
    opened: Instant,
}

impl ScreenStream for DisplayStream {
    fn grab(&mut self, pool: &FramePool) -> Result<Option<RawFrame>, SourceError> {
        let timestamp = self.opened.elapsed();
        let image = self
            .screen
            .capture()
            .map_err(|e| SourceError::Capture(e.to_string()))?;
        Ok(Some(RawFrame {
            width: image.width(),
            height: image.height(),
            format: PixelFormat::Rgba8,
            data: pool.copy_from(image.as_raw()),
            timestamp,
        }))
    }
}
