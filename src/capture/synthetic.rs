//! Synthetic capture devices
//!
//! A test-pattern display, a tone generator with a configurable clock skew
//! and a colour-bar camera. They run in real time so the whole pipeline can
//! be exercised headless, and each can be told to fail.

use crate::capture::frame::PixelFormat;
use crate::capture::pool::FramePool;
use crate::capture::traits::{
    AudioBackend, AudioDeviceInfo, AudioStream, CameraCapability, CameraInfo, DeviceCatalog,
    DisplayInfo, RawAudio, RawFrame, Resolution, ScreenBackend, ScreenStream, WebcamBackend,
    WebcamStream,
};
use crate::utils::error::{ConfigError, SourceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Failure injection shared by all synthetic devices
#[derive(Debug, Clone, Default)]
pub struct Fault {
    /// Returned from `open`
    pub deny_open: Option<SourceError>,
    /// Disconnect this long after opening
    pub disconnect_after: Option<Duration>,
    /// Disconnect as soon as this is set
    pub unplugged: Option<Arc<AtomicBool>>,
}

impl Fault {
    pub fn permission_denied(what: &str) -> Self {
        Self {
            deny_open: Some(SourceError::PermissionDenied(what.to_string())),
            ..Default::default()
        }
    }

    /// A fault triggered by setting the returned switch
    pub fn switch() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Self {
                unplugged: Some(flag.clone()),
                ..Default::default()
            },
            flag,
        )
    }

    fn check_open(&self) -> Result<(), SourceError> {
        match &self.deny_open {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn check_connected(&self, opened: Instant, name: &str) -> Result<(), SourceError> {
        let timed_out = self
            .disconnect_after
            .map(|after| opened.elapsed() >= after)
            .unwrap_or(false);
        let unplugged = self
            .unplugged
            .as_ref()
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false);
        if timed_out || unplugged {
            Err(SourceError::Disconnected(name.to_string()))
        } else {
            Ok(())
        }
    }
}

/// Sleep until `due`, but never longer than `limit`. Returns whether `due`
/// was reached.
fn wait_until(due: Instant, limit: Duration) -> bool {
    let now = Instant::now();
    if now >= due {
        return true;
    }
    let wait = due - now;
    if wait > limit {
        std::thread::sleep(limit);
        false
    } else {
        std::thread::sleep(wait);
        true
    }
}

/// Test-pattern display
#[derive(Debug, Clone)]
pub struct SyntheticDisplay {
    pub id: String,
    pub width: u32,
    pub height: u32,
    /// How often the display presents a new image
    pub present_rate: u32,
    pub fault: Fault,
}

impl SyntheticDisplay {
    pub fn new(id: &str, width: u32, height: u32) -> Self {
        Self {
            id: id.to_string(),
            width,
            height,
            present_rate: 60,
            fault: Fault::default(),
        }
    }
}

impl ScreenBackend for SyntheticDisplay {
    fn open(self: Box<Self>) -> Result<Box<dyn ScreenStream>, SourceError> {
        self.fault.check_open()?;
        if self.width == 0 || self.height == 0 || self.present_rate == 0 {
            return Err(SourceError::FormatUnsupported(format!(
                "{}x{}@{}",
                self.width, self.height, self.present_rate
            )));
        }
        let base = gradient(self.width, self.height);
        Ok(Box::new(DisplayStream {
            display: *self,
            base,
            opened: Instant::now(),
            last_present: None,
        }))
    }
}

struct DisplayStream {
    display: SyntheticDisplay,
    base: Vec<u8>,
    opened: Instant,
    last_present: Option<u64>,
}

impl ScreenStream for DisplayStream {
    fn grab(&mut self, pool: &FramePool) -> Result<Option<RawFrame>, SourceError> {
        self.display
            .fault
            .check_connected(self.opened, &self.display.id)?;

        let rate = self.display.present_rate as f64;
        let present = (self.opened.elapsed().as_secs_f64() * rate) as u64;
        if self.last_present == Some(present) {
            return Ok(None);
        }
        self.last_present = Some(present);

        let mut data = pool.copy_from(&self.base);
        draw_marker(&mut data, self.display.width, self.display.height, present);
        Ok(Some(RawFrame {
            width: self.display.width,
            height: self.display.height,
            format: PixelFormat::Rgba8,
            data,
            timestamp: Duration::from_secs_f64(present as f64 / rate),
        }))
    }
}

fn gradient(width: u32, height: u32) -> Vec<u8> {
    let mut data = vec![0u8; width as usize * height as usize * 4];
    for y in 0..height as usize {
        let g = (y * 255 / height.max(1) as usize) as u8;
        for x in 0..width as usize {
            let i = (y * width as usize + x) * 4;
            data[i] = (x * 255 / width.max(1) as usize) as u8;
            data[i + 1] = g;
            data[i + 2] = 96;
            data[i + 3] = 255;
        }
    }
    data
}

/// White square that moves one step per presented image
fn draw_marker(data: &mut [u8], width: u32, height: u32, step: u64) {
    let size = 32.min(width).min(height) as usize;
    let span = (width as usize).saturating_sub(size).max(1);
    let x0 = (step as usize * 8) % span;
    for y in 0..size {
        let row = (y * width as usize + x0) * 4;
        data[row..row + size * 4].fill(255);
    }
}

/// Sine-tone input device
#[derive(Debug, Clone)]
pub struct SyntheticAudio {
    pub id: String,
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frequency: f32,
    pub amplitude: f32,
    /// Relative speed of the device clock against the host clock; 0.001
    /// delivers samples 0.1 % faster than nominal
    pub skew: f64,
    pub chunk_frames: usize,
    pub is_input: bool,
    pub fault: Fault,
}

impl SyntheticAudio {
    pub fn new(id: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            id: id.to_string(),
            name: format!("Synthetic {}", id),
            sample_rate,
            channels,
            frequency: 440.0,
            amplitude: 0.25,
            skew: 0.0,
            chunk_frames: (sample_rate / 100).max(1) as usize,
            is_input: true,
            fault: Fault::default(),
        }
    }
}

impl AudioBackend for SyntheticAudio {
    fn open(self: Box<Self>) -> Result<Box<dyn AudioStream>, SourceError> {
        self.fault.check_open()?;
        if self.sample_rate == 0 || self.channels == 0 || self.chunk_frames == 0 {
            return Err(SourceError::FormatUnsupported(format!(
                "{}Hz {}ch",
                self.sample_rate, self.channels
            )));
        }
        Ok(Box::new(ToneStream {
            device: *self,
            opened: Instant::now(),
            chunk: 0,
        }))
    }
}

struct ToneStream {
    device: SyntheticAudio,
    opened: Instant,
    chunk: u64,
}

impl AudioStream for ToneStream {
    fn sample_rate(&self) -> u32 {
        self.device.sample_rate
    }

    fn channels(&self) -> u16 {
        self.device.channels
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<RawAudio>, SourceError> {
        self.device
            .fault
            .check_connected(self.opened, &self.device.id)?;

        let frames = self.device.chunk_frames as u64;
        let rate = self.device.sample_rate as f64;
        let first = self.chunk * frames;
        // The chunk is complete once its last sample has been "recorded"
        let due_secs = ((first + frames) as f64 / rate) / (1.0 + self.device.skew);
        if !wait_until(self.opened + Duration::from_secs_f64(due_secs), timeout) {
            return Ok(None);
        }

        let channels = self.device.channels as usize;
        let step = std::f64::consts::TAU * self.device.frequency as f64 / rate;
        let mut samples = Vec::with_capacity(frames as usize * channels);
        for n in first..first + frames {
            let value = (self.device.amplitude as f64 * (step * n as f64).sin()) as f32;
            samples.extend(std::iter::repeat(value).take(channels));
        }
        self.chunk += 1;

        Ok(Some(RawAudio {
            samples,
            timestamp: Duration::from_secs_f64(first as f64 / rate),
        }))
    }
}

/// Colour-bar camera
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub fault: Fault,
}

impl SyntheticCamera {
    pub fn new(id: &str, width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            id: id.to_string(),
            width,
            height,
            frame_rate,
            fault: Fault::default(),
        }
    }

    fn capabilities(&self) -> Vec<CameraCapability> {
        let mut modes = vec![CameraCapability {
            resolution: Resolution {
                width: self.width,
                height: self.height,
            },
            frame_rates: vec![self.frame_rate],
            format: "RGBA".to_string(),
        }];
        if self.width >= 4 && self.height >= 4 {
            modes.push(CameraCapability {
                resolution: Resolution {
                    width: self.width / 2,
                    height: self.height / 2,
                },
                frame_rates: vec![self.frame_rate, self.frame_rate / 2],
                format: "RGBA".to_string(),
            });
        }
        modes
    }
}

impl WebcamBackend for SyntheticCamera {
    fn open(self: Box<Self>) -> Result<Box<dyn WebcamStream>, SourceError> {
        self.fault.check_open()?;
        if self.width == 0 || self.height == 0 || self.frame_rate == 0 {
            return Err(SourceError::FormatUnsupported(format!(
                "{}x{}@{}",
                self.width, self.height, self.frame_rate
            )));
        }
        Ok(Box::new(CameraStream {
            camera: *self,
            opened: Instant::now(),
            frame: 0,
        }))
    }
}

struct CameraStream {
    camera: SyntheticCamera,
    opened: Instant,
    frame: u64,
}

const BARS: [[u8; 3]; 6] = [
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
];

impl WebcamStream for CameraStream {
    fn frame_rate(&self) -> u32 {
        self.camera.frame_rate
    }

    fn read(&mut self, pool: &FramePool, timeout: Duration) -> Result<Option<RawFrame>, SourceError> {
        self.camera
            .fault
            .check_connected(self.opened, &self.camera.id)?;

        let rate = self.camera.frame_rate as f64;
        let due = self.opened + Duration::from_secs_f64((self.frame + 1) as f64 / rate);
        if !wait_until(due, timeout) {
            return Ok(None);
        }

        let (width, height) = (self.camera.width as usize, self.camera.height as usize);
        let mut data = pool.acquire(width * height * 4);
        let bar_width = (width / BARS.len()).max(1);
        for y in 0..height {
            for x in 0..width {
                let bar = (x / bar_width + self.frame as usize) % BARS.len();
                let i = (y * width + x) * 4;
                data[i..i + 3].copy_from_slice(&BARS[bar]);
                data[i + 3] = 255;
            }
        }
        let timestamp = Duration::from_secs_f64(self.frame as f64 / rate);
        self.frame += 1;

        Ok(Some(RawFrame {
            width: self.camera.width,
            height: self.camera.height,
            format: PixelFormat::Rgba8,
            data,
            timestamp,
        }))
    }
}

/// A catalog of synthetic devices
#[derive(Debug, Clone, Default)]
pub struct SyntheticCatalog {
    displays: Vec<SyntheticDisplay>,
    audio: Vec<SyntheticAudio>,
    cameras: Vec<SyntheticCamera>,
}

impl SyntheticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// One display, a microphone, a loopback device and a camera
    pub fn standard() -> Self {
        let mut loopback = SyntheticAudio::new("synthetic-loopback", 44100, 2);
        loopback.frequency = 220.0;
        loopback.skew = 0.0005;
        loopback.is_input = false;
        loopback.name = "Synthetic output loopback".to_string();

        Self::new()
            .with_display(SyntheticDisplay::new("synthetic-0", 1920, 1080))
            .with_audio(SyntheticAudio::new("synthetic-mic", 48000, 1))
            .with_audio(loopback)
            .with_camera(SyntheticCamera::new("synthetic-cam", 320, 240, 30))
    }

    /// Add a display, replacing any with the same id
    pub fn with_display(mut self, display: SyntheticDisplay) -> Self {
        self.displays.retain(|d| d.id != display.id);
        self.displays.push(display);
        self
    }

    pub fn with_audio(mut self, audio: SyntheticAudio) -> Self {
        self.audio.retain(|d| d.id != audio.id);
        self.audio.push(audio);
        self
    }

    pub fn with_camera(mut self, camera: SyntheticCamera) -> Self {
        self.cameras.retain(|d| d.id != camera.id);
        self.cameras.push(camera);
        self
    }
}

impl DeviceCatalog for SyntheticCatalog {
    fn displays(&self) -> Vec<DisplayInfo> {
        self.displays
            .iter()
            .enumerate()
            .map(|(i, d)| DisplayInfo {
                id: d.id.clone(),
                name: format!("Synthetic display {}", i),
                width: d.width,
                height: d.height,
                scale_factor: 1.0,
                is_primary: i == 0,
                refresh_rate: Some(d.present_rate),
            })
            .collect()
    }

    fn audio_devices(&self) -> Vec<AudioDeviceInfo> {
        self.audio
            .iter()
            .enumerate()
            .map(|(i, a)| AudioDeviceInfo {
                id: a.id.clone(),
                name: a.name.clone(),
                is_input: a.is_input,
                is_default: i == 0,
                sample_rate: a.sample_rate,
                channels: a.channels,
            })
            .collect()
    }

    fn cameras(&self) -> Vec<CameraInfo> {
        self.cameras
            .iter()
            .map(|c| CameraInfo {
                id: c.id.clone(),
                name: format!("Synthetic camera {}", c.id),
                supported_resolutions: c.capabilities().iter().map(|m| m.resolution).collect(),
            })
            .collect()
    }

    fn camera_capabilities(&self, id: &str) -> Result<Vec<CameraCapability>, SourceError> {
        self.cameras
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.capabilities())
            .ok_or_else(|| SourceError::DeviceUnavailable(id.to_string()))
    }

    fn screen_backend(&self, id: &str) -> Result<Box<dyn ScreenBackend>, ConfigError> {
        self.displays
            .iter()
            .find(|d| d.id == id)
            .map(|d| Box::new(d.clone()) as Box<dyn ScreenBackend>)
            .ok_or_else(|| ConfigError::DeviceNotFound(format!("display '{}'", id)))
    }

    fn audio_backend(&self, id: &str) -> Result<Box<dyn AudioBackend>, ConfigError> {
        self.audio
            .iter()
            .find(|a| a.id == id)
            .map(|a| Box::new(a.clone()) as Box<dyn AudioBackend>)
            .ok_or_else(|| ConfigError::DeviceNotFound(format!("audio device '{}'", id)))
    }

    fn webcam_backend(&self, id: &str) -> Result<Box<dyn WebcamBackend>, ConfigError> {
        self.cameras
            .iter()
            .find(|c| c.id == id)
            .map(|c| Box::new(c.clone()) as Box<dyn WebcamBackend>)
            .ok_or_else(|| ConfigError::DeviceNotFound(format!("camera '{}'", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_only_presents_at_its_rate() {
        let pool = FramePool::new(2);
        let mut display = SyntheticDisplay::new("d", 64, 32);
        display.present_rate = 10;
        let mut stream = Box::new(display).open().unwrap();

        assert!(stream.grab(&pool).unwrap().is_some());
        assert!(stream.grab(&pool).unwrap().is_none());
        std::thread::sleep(Duration::from_millis(110));
        let frame = stream.grab(&pool).unwrap().unwrap();
        assert_eq!(frame.data.len(), 64 * 32 * 4);
        assert!(frame.timestamp >= Duration::from_millis(100));
    }

    #[test]
    fn tone_timestamps_follow_device_clock() {
        let mut device = SyntheticAudio::new("t", 8000, 2);
        device.chunk_frames = 80;
        let mut stream = Box::new(device).open().unwrap();
        let a = stream.read(Duration::from_secs(1)).unwrap().unwrap();
        let b = stream.read(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(a.samples.len(), 160);
        assert_eq!(a.timestamp, Duration::ZERO);
        assert_eq!(b.timestamp, Duration::from_millis(10));
        // Interleaved copies per channel
        assert_eq!(b.samples[2], b.samples[3]);
    }

    #[test]
    fn permission_fault_fails_open() {
        let mut device = SyntheticAudio::new("mic", 48000, 1);
        device.fault = Fault::permission_denied("microphone");
        assert!(matches!(
            Box::new(device).open().err(),
            Some(SourceError::PermissionDenied(_))
        ));
    }

    #[test]
    fn unplug_switch_disconnects_camera() {
        let pool = FramePool::new(2);
        let mut camera = SyntheticCamera::new("cam", 8, 4, 100);
        let (fault, unplug) = Fault::switch();
        camera.fault = fault;
        let mut stream = Box::new(camera).open().unwrap();
        assert!(stream.read(&pool, Duration::from_secs(1)).unwrap().is_some());
        unplug.store(true, Ordering::SeqCst);
        assert!(matches!(
            stream.read(&pool, Duration::from_secs(1)),
            Err(SourceError::Disconnected(_))
        ));
    }

    #[test]
    fn catalog_lookups() {
        let catalog = SyntheticCatalog::standard();
        assert_eq!(catalog.displays().len(), 1);
        assert_eq!(catalog.audio_devices().len(), 2);
        assert!(catalog.screen_backend("synthetic-0").is_ok());
        assert!(matches!(
            catalog.audio_backend("nope").err(),
            Some(ConfigError::DeviceNotFound(_))
        ));
        let modes = catalog.camera_capabilities("synthetic-cam").unwrap();
        assert_eq!(modes[0].resolution, Resolution { width: 320, height: 240 });
        assert!(catalog.camera_capabilities("other").is_err());
    }
}
