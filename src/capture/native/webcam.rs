//! nokhwa camera capture

use crate::capture::frame::PixelFormat;
use crate::capture::pool::FramePool;
use crate::capture::traits::{
    CameraCapability, CameraInfo, RawFrame, Resolution, WebcamBackend, WebcamStream,
};
use crate::utils::error::SourceError;
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::{Camera, NokhwaError};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

fn index_id(index: &CameraIndex) -> String {
    match index {
        CameraIndex::Index(i) => i.to_string(),
        CameraIndex::String(s) => s.to_string(),
    }
}

fn parse_index(id: &str) -> CameraIndex {
    match id.parse::<u32>() {
        Ok(i) => CameraIndex::Index(i),
        Err(_) => CameraIndex::String(id.to_string()),
    }
}

fn map_error(e: NokhwaError) -> SourceError {
    let text = e.to_string();
    if text.to_lowercase().contains("permission") || text.to_lowercase().contains("authoriz") {
        return SourceError::PermissionDenied(text);
    }
    match e {
        NokhwaError::OpenDeviceError(..) => SourceError::DeviceUnavailable(text),
        NokhwaError::GetPropertyError { .. } | NokhwaError::SetPropertyError { .. } => {
            SourceError::FormatUnsupported(text)
        }
        _ => SourceError::Capture(text),
    }
}

pub fn list_cameras() -> Vec<CameraInfo> {
    match nokhwa::query(ApiBackend::Auto) {
        Ok(cameras) => cameras
            .into_iter()
            .map(|info| {
                let id = index_id(info.index());
                let supported_resolutions = capabilities(&id)
                    .map(|modes| modes.into_iter().map(|m| m.resolution).collect())
                    .unwrap_or_default();
                CameraInfo {
                    id,
                    name: info.human_name(),
                    supported_resolutions,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate cameras: {:?}", e);
            Vec::new()
        }
    }
}

/// Query the modes a camera reports, largest resolution first
pub fn capabilities(id: &str) -> Result<Vec<CameraCapability>, SourceError> {
    let format = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::None);
    let mut camera = Camera::new(parse_index(id), format).map_err(map_error)?;
    let formats = camera.compatible_camera_formats().map_err(map_error)?;

    let mut modes: BTreeMap<(u32, u32), (Vec<u32>, String)> = BTreeMap::new();
    for f in formats {
        let key = (f.resolution().width(), f.resolution().height());
        let entry = modes
            .entry(key)
            .or_insert_with(|| (Vec::new(), format!("{:?}", f.format())));
        if !entry.0.contains(&f.frame_rate()) {
            entry.0.push(f.frame_rate());
        }
    }

    Ok(modes
        .into_iter()
        .rev()
        .map(|((width, height), (mut frame_rates, format))| {
            frame_rates.sort_unstable_by(|a, b| b.cmp(a));
            CameraCapability {
                resolution: Resolution { width, height },
                frame_rates,
                format,
            }
        })
        .collect())
}

/// A camera identified by its nokhwa index
#[derive(Debug, Clone)]
pub struct NokhwaBackend {
    id: String,
}

impl NokhwaBackend {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl WebcamBackend for NokhwaBackend {
    fn open(self: Box<Self>) -> Result<Box<dyn WebcamStream>, SourceError> {
        let format = RequestedFormat::new::<RgbAFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
        let mut camera = Camera::new(parse_index(&self.id), format).map_err(map_error)?;
        camera.open_stream().map_err(map_error)?;

        let camera_format = camera.camera_format();
        tracing::info!(
            "Webcam {} opened: {}x{} @ {}fps, format={:?}",
            self.id,
            camera_format.resolution().width(),
            camera_format.resolution().height(),
            camera_format.frame_rate(),
            camera_format.format()
        );

        Ok(Box::new(NokhwaStream {
            id: self.id,
            frame_rate: camera_format.frame_rate(),
            camera,
            opened: Instant::now(),
        }))
    }
}

struct NokhwaStream {
    id: String,
    frame_rate: u32,
    camera: Camera,
    opened: Instant,
}

impl WebcamStream for NokhwaStream {
    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    // nokhwa blocks until the camera delivers, so the timeout is not applied
    fn read(&mut self, pool: &FramePool, _timeout: Duration) -> Result<Option<RawFrame>, SourceError> {
        if !self.camera.is_stream_open() {
            return Err(SourceError::Disconnected(self.id.clone()));
        }
        let buffer = self.camera.frame().map_err(map_error)?;
        let timestamp = self.opened.elapsed();
        let image = buffer
            .decode_image::<RgbAFormat>()
            .map_err(|e| SourceError::Capture(format!("decode failed: {}", e)))?;

        Ok(Some(RawFrame {
            width: image.width(),
            height: image.height(),
            format: PixelFormat::Rgba8,
            data: pool.copy_from(image.as_raw()),
            timestamp,
        }))
    }
}

impl Drop for NokhwaStream {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            tracing::debug!("Failed to stop camera {}: {:?}", self.id, e);
        }
    }
}
