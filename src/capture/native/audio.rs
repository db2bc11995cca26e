//! cpal audio input
//!
//! The cpal callback runs on the host's audio thread; it only converts to
//! f32 and hands the block over a bounded channel. The device clock is the
//! running frame count kept by the callback, so blocks lost to a full
//! backlog leave a gap instead of shifting later timestamps.

use crate::capture::traits::{AudioBackend, AudioDeviceInfo, AudioStream, RawAudio};
use crate::utils::error::SourceError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

/// Blocks buffered between the callback and the adapter thread
const CALLBACK_BACKLOG: usize = 64;

pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());
    let mut devices = Vec::new();

    match host.input_devices() {
        Ok(inputs) => {
            for device in inputs {
                if let Some(info) = describe(&device, true, default_input.as_deref()) {
                    devices.push(info);
                }
            }
        }
        Err(e) => tracing::warn!("Failed to enumerate audio inputs: {}", e),
    }

    // Output devices can be captured as loopback on WASAPI only
    if cfg!(target_os = "windows") {
        if let Ok(outputs) = host.output_devices() {
            for device in outputs {
                if let Some(info) = describe(&device, false, default_output.as_deref()) {
                    devices.push(info);
                }
            }
        }
    }

    devices
}

fn describe(device: &Device, is_input: bool, default: Option<&str>) -> Option<AudioDeviceInfo> {
    let name = device.name().ok()?;
    let config = if is_input {
        device.default_input_config().ok()?
    } else {
        device.default_output_config().ok()?
    };
    Some(AudioDeviceInfo {
        id: name.clone(),
        is_default: default == Some(name.as_str()),
        name,
        is_input,
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
    })
}

/// A cpal device, identified by name
#[derive(Debug, Clone)]
pub struct CpalBackend {
    name: String,
    is_input: bool,
}

impl CpalBackend {
    pub fn new(name: &str, is_input: bool) -> Self {
        Self {
            name: name.to_string(),
            is_input,
        }
    }

    fn find_device(&self) -> Result<Device, SourceError> {
        let host = cpal::default_host();
        let devices = if self.is_input {
            host.input_devices()
        } else {
            host.output_devices()
        }
        .map_err(|e| SourceError::DeviceUnavailable(e.to_string()))?;

        devices
            .into_iter()
            .find(|d| d.name().map(|n| n == self.name).unwrap_or(false))
            .ok_or_else(|| SourceError::DeviceUnavailable(self.name.clone()))
    }
}

impl AudioBackend for CpalBackend {
    fn open(self: Box<Self>) -> Result<Box<dyn AudioStream>, SourceError> {
        let device = self.find_device()?;
        let supported = if self.is_input {
            device.default_input_config()
        } else {
            device.default_output_config()
        }
        .map_err(|e| SourceError::FormatUnsupported(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let config = supported.config();
        let (tx, rx) = mpsc::sync_channel(CALLBACK_BACKLOG);
        let lost = Arc::new(AtomicBool::new(false));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build::<f32>(&device, &config, tx, lost.clone()),
            SampleFormat::I16 => build::<i16>(&device, &config, tx, lost.clone()),
            SampleFormat::U16 => build::<u16>(&device, &config, tx, lost.clone()),
            other => {
                return Err(SourceError::FormatUnsupported(format!(
                    "sample format {:?}",
                    other
                )))
            }
        }?;
        stream
            .play()
            .map_err(|e| SourceError::Capture(format!("failed to start stream: {}", e)))?;

        tracing::info!(
            "Opened audio device '{}' at {}Hz, {}ch",
            self.name,
            sample_rate,
            channels
        );

        Ok(Box::new(CpalStream {
            name: self.name,
            _stream: stream,
            rx,
            lost,
            sample_rate,
            channels,
            clock: DeviceClock::new(sample_rate, channels),
            pending: None,
        }))
    }
}

/// Samples from one callback and the device frame they start at
struct Block {
    position: u64,
    samples: Vec<f32>,
}

fn build<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    tx: SyncSender<Block>,
    lost: Arc<AtomicBool>,
) -> Result<cpal::Stream, SourceError>
where
    T: SizedSample,
    f32: cpal::FromSample<T>,
{
    let on_error = {
        let lost = lost.clone();
        move |err: cpal::StreamError| {
            tracing::error!("Audio stream error: {}", err);
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                lost.store(true, Ordering::SeqCst);
            }
        }
    };

    let channels = config.channels.max(1) as u64;
    let mut position: u64 = 0;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let frames = data.len() as u64 / channels;
                let block = Block {
                    position,
                    samples: data.iter().map(|s| s.to_sample::<f32>()).collect(),
                };
                position += frames;
                if tx.try_send(block).is_err() {
                    tracing::trace!("Audio callback backlog full, {} frames lost", frames);
                }
            },
            on_error,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                SourceError::DeviceUnavailable(e.to_string())
            }
            cpal::BuildStreamError::StreamConfigNotSupported => {
                SourceError::FormatUnsupported(e.to_string())
            }
            other if other.to_string().to_lowercase().contains("permission") => {
                SourceError::PermissionDenied(other.to_string())
            }
            other => SourceError::Capture(other.to_string()),
        })
}

struct CpalStream {
    name: String,
    _stream: cpal::Stream,
    rx: Receiver<Block>,
    lost: Arc<AtomicBool>,
    sample_rate: u32,
    channels: u16,
    clock: DeviceClock,
    /// Held back while an overrun is reported
    pending: Option<RawAudio>,
}

/// Device frame position expected from the next block
struct DeviceClock {
    sample_rate: u32,
    channels: u16,
    next_position: u64,
}

impl DeviceClock {
    fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            next_position: 0,
        }
    }

    /// Timestamp a block; also returns the frames missing before it
    fn stamp(&mut self, block: Block) -> (RawAudio, u64) {
        let frames = (block.samples.len() / self.channels.max(1) as usize) as u64;
        let lost = block.position.saturating_sub(self.next_position);
        self.next_position = block.position + frames;
        let raw = RawAudio {
            timestamp: Duration::from_secs_f64(block.position as f64 / self.sample_rate as f64),
            samples: block.samples,
        };
        (raw, lost)
    }
}

impl AudioStream for CpalStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<RawAudio>, SourceError> {
        if let Some(raw) = self.pending.take() {
            return Ok(Some(raw));
        }
        if self.lost.load(Ordering::SeqCst) {
            return Err(SourceError::Disconnected(self.name.clone()));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(block) => match self.clock.stamp(block) {
                (raw, 0) => Ok(Some(raw)),
                (raw, frames) => {
                    self.pending = Some(raw);
                    Err(SourceError::Overrun { frames })
                }
            },
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SourceError::Disconnected(self.name.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn block(position: u64, frames: usize) -> Block {
        Block {
            position,
            samples: vec![0.1; frames * 2],
        }
    }

    #[test]
    fn dropped_blocks_leave_a_gap_on_the_device_clock() {
        let mut clock = DeviceClock::new(48000, 2);
        let (first, lost) = clock.stamp(block(0, 480));
        assert_eq!((first.timestamp, lost), (Duration::ZERO, 0));

        // Blocks at 480 and 960 never arrived
        let (late, lost) = clock.stamp(block(1440, 480));
        assert_eq!(lost, 960);
        assert_relative_eq!(late.timestamp.as_secs_f64(), 0.03, epsilon = 1e-9);

        let (next, lost) = clock.stamp(block(1920, 480));
        assert_eq!(lost, 0);
        assert_relative_eq!(next.timestamp.as_secs_f64(), 0.04, epsilon = 1e-9);
    }
}
