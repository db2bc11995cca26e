//! Raw PCM spool
//!
//! Interleaved signed 16-bit little-endian samples with no header, so the
//! spool has no size limit and stays readable after a crash. The muxer is
//! told the layout with `-f s16le -ar <rate> -ac <channels>`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const BYTES_PER_SAMPLE: u64 = 2;

/// Convert f32 samples to interleaved 16-bit PCM bytes
pub fn convert_to_int16_pcm(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = (clamped * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub struct PcmSpool {
    path: PathBuf,
    writer: BufWriter<File>,
    sample_rate: u32,
    channels: u16,
    data_bytes: u64,
}

impl PcmSpool {
    pub fn create(path: &Path, sample_rate: u32, channels: u16) -> std::io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(File::create(path)?),
            sample_rate,
            channels,
            data_bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn frame_bytes(&self) -> u64 {
        self.channels.max(1) as u64 * BYTES_PER_SAMPLE
    }

    /// Frames (samples per channel) written so far
    pub fn frames(&self) -> u64 {
        self.data_bytes / self.frame_bytes()
    }

    /// Demuxer arguments that describe this spool, placed before its `-i`
    pub fn input_args(&self) -> Vec<String> {
        vec![
            "-f".to_string(),
            "s16le".to_string(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-ac".to_string(),
            self.channels.to_string(),
        ]
    }

    /// Append interleaved samples in the spool's channel layout
    pub fn write_samples(&mut self, samples: &[f32]) -> std::io::Result<()> {
        let bytes = convert_to_int16_pcm(samples);
        self.writer.write_all(&bytes)?;
        self.data_bytes += bytes.len() as u64;
        Ok(())
    }

    pub fn write_silence(&mut self, frames: u64) -> std::io::Result<()> {
        const CHUNK: usize = 64 * 1024;
        let zeros = [0u8; CHUNK];
        let mut remaining = frames.saturating_mul(self.frame_bytes());
        while remaining > 0 {
            let len = remaining.min(CHUNK as u64) as usize;
            self.writer.write_all(&zeros[..len])?;
            self.data_bytes += len as u64;
            remaining -= len as u64;
        }
        Ok(())
    }

    /// Flush everything to disk
    pub fn finish(self) -> std::io::Result<PathBuf> {
        let file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_conversion_clamps() {
        let bytes = convert_to_int16_pcm(&[0.0, 1.0, -2.0]);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 0);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), -i16::MAX);
    }

    #[test]
    fn spool_is_raw_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pcm");
        let mut spool = PcmSpool::create(&path, 8000, 2).unwrap();
        spool.write_samples(&[0.5; 20]).unwrap();
        spool.write_silence(5).unwrap();
        assert_eq!(spool.frames(), 15);
        assert_eq!(spool.input_args().join(" "), "-f s16le -ar 8000 -ac 2");
        spool.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 60);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), (0.5 * i16::MAX as f32) as i16);
        assert!(bytes[40..].iter().all(|b| *b == 0));
    }

    #[test]
    fn long_sessions_finish_past_four_gib() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.pcm");
        let mut spool = PcmSpool::create(&path, 96_000, 2).unwrap();
        // 3.2 hours of 96 kHz stereo, more than a u32 byte count can hold
        let frames = 96_000u64 * 3 * 3600 + 96_000 * 720;
        spool.data_bytes = frames * 4;
        assert!(spool.data_bytes > u32::MAX as u64);
        assert_eq!(spool.frames(), frames);
        assert!(spool.finish().is_ok());
    }
}
