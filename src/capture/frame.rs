//! Captured and composed media units

use crate::capture::pool::{FrameBuffer, FramePool};
use crate::capture::source::SourceId;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Pixel layout of a video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }

    /// Read pixel `index` as RGBA
    #[inline]
    pub fn rgba_at(&self, data: &[u8], index: usize) -> [u8; 4] {
        match self {
            PixelFormat::Rgba8 => {
                let i = index * 4;
                [data[i], data[i + 1], data[i + 2], data[i + 3]]
            }
            PixelFormat::Bgra8 => {
                let i = index * 4;
                [data[i + 2], data[i + 1], data[i], data[i + 3]]
            }
            PixelFormat::Rgb8 => {
                let i = index * 3;
                [data[i], data[i + 1], data[i + 2], 255]
            }
        }
    }
}

/// A video frame from a capture source
///
/// `timestamp` is on the source's own clock; the synchronizer maps it onto
/// the session timeline.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub source: SourceId,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: FrameBuffer,
    pub timestamp: Duration,
    pub captured_at: Instant,
}

impl CaptureFrame {
    pub fn expected_len(width: u32, height: u32, format: PixelFormat) -> usize {
        width as usize * height as usize * format.bytes_per_pixel()
    }

    pub fn is_well_formed(&self) -> bool {
        self.data.len() == Self::expected_len(self.width, self.height, self.format)
    }

    /// Copy out a sub-rectangle, clamped to the frame bounds
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32, pool: &FramePool) -> CaptureFrame {
        let x = x.min(self.width.saturating_sub(1));
        let y = y.min(self.height.saturating_sub(1));
        let width = width.min(self.width - x);
        let height = height.min(self.height - y);
        let bpp = self.format.bytes_per_pixel();

        let mut data = pool.acquire(Self::expected_len(width, height, self.format));
        let row_len = width as usize * bpp;
        let src_stride = self.width as usize * bpp;
        for row in 0..height as usize {
            let src = (y as usize + row) * src_stride + x as usize * bpp;
            data[row * row_len..(row + 1) * row_len].copy_from_slice(&self.data[src..src + row_len]);
        }

        CaptureFrame {
            source: self.source.clone(),
            sequence: self.sequence,
            width,
            height,
            format: self.format,
            data,
            timestamp: self.timestamp,
            captured_at: self.captured_at,
        }
    }
}

/// A block of interleaved f32 samples
///
/// From a capture device `timestamp` is on the device clock. Once mixed, the
/// chunk belongs to the session timeline and `source` names the mix.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub source: SourceId,
    pub sequence: u64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp: Duration,
    pub captured_at: Instant,
}

impl AudioChunk {
    /// Samples per channel
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// A chunk of digital silence
    pub fn silence(
        source: SourceId,
        frames: usize,
        sample_rate: u32,
        channels: u16,
        timestamp: Duration,
    ) -> Self {
        Self {
            source,
            sequence: 0,
            samples: vec![0.0; frames * channels as usize],
            sample_rate,
            channels,
            timestamp,
            captured_at: Instant::now(),
        }
    }
}

/// One output video frame, RGBA at the output resolution
#[derive(Debug)]
pub struct CompositeFrame {
    /// Output tick number, starting at 0
    pub index: u64,
    /// Session time of the tick
    pub timestamp: Duration,
    pub width: u32,
    pub height: u32,
    pub data: FrameBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::SourceKind;

    fn frame(width: u32, height: u32) -> CaptureFrame {
        let data: Vec<u8> = (0..width * height).flat_map(|i| [i as u8, 0, 0, 255]).collect();
        CaptureFrame {
            source: SourceId::new(SourceKind::Screen, "test"),
            sequence: 7,
            width,
            height,
            format: PixelFormat::Rgba8,
            data: FrameBuffer::detached(data),
            timestamp: Duration::from_millis(5),
            captured_at: Instant::now(),
        }
    }

    #[test]
    fn crop_copies_rows() {
        let src = frame(4, 3);
        let out = src.crop(1, 1, 2, 2, &FramePool::new(1));
        assert_eq!((out.width, out.height), (2, 2));
        assert!(out.is_well_formed());
        // pixel (1,1) has index 5, pixel (2,2) has index 10
        assert_eq!(out.data[0], 5);
        assert_eq!(out.data[12], 10);
        assert_eq!(out.sequence, 7);
    }

    #[test]
    fn bgra_reads_as_rgba() {
        let data = [10, 20, 30, 40];
        assert_eq!(PixelFormat::Bgra8.rgba_at(&data, 0), [30, 20, 10, 40]);
        assert_eq!(PixelFormat::Rgb8.rgba_at(&data[..3], 0), [10, 20, 30, 255]);
    }

    #[test]
    fn chunk_duration_from_frames() {
        let chunk = AudioChunk::silence(
            SourceId::new(SourceKind::Audio, "mic"),
            441,
            44100,
            2,
            Duration::ZERO,
        );
        assert_eq!(chunk.frames(), 441);
        assert_eq!(chunk.samples.len(), 882);
        approx::assert_relative_eq!(chunk.duration().as_secs_f64(), 0.01, epsilon = 1e-9);
    }
}
