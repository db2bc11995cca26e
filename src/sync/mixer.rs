//! Audio mixer
//!
//! Every bound device gets its own track on the session timeline at the
//! output rate. Incoming chunks are converted to stereo, resampled by linear
//! interpolation and placed at the frame their session timestamp maps to;
//! gaps become silence and overlaps are trimmed. Blocks are mixed by summing
//! the tracks, applying gain and clamping.

use crate::capture::source::SourceId;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Placement error (in output frames) absorbed without padding or trimming
const SNAP_FRAMES: u64 = 2;

/// Convert interleaved samples to interleaved stereo. Mono is duplicated,
/// extra channels beyond the first two are discarded.
pub fn to_stereo(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n as usize)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

/// Linear interpolation resampling for interleaved stereo audio.
pub fn resample_stereo(samples: &[f32], source_rate: f64, target_rate: f64) -> Vec<f32> {
    if (source_rate - target_rate).abs() < 0.01 || samples.is_empty() || source_rate <= 0.0 {
        return samples.to_vec();
    }

    let frame_count = samples.len() / 2;
    let ratio = target_rate / source_rate;
    let output_frames = (frame_count as f64 * ratio).round() as usize;
    let mut output = vec![0.0f32; output_frames * 2];
    for i in 0..output_frames {
        let source_index = i as f64 / ratio;
        let index = source_index as usize;
        let fraction = (source_index - index as f64) as f32;

        for ch in 0..2usize {
            if index + 1 < frame_count {
                output[i * 2 + ch] = samples[index * 2 + ch] * (1.0 - fraction)
                    + samples[(index + 1) * 2 + ch] * fraction;
            } else if index < frame_count {
                output[i * 2 + ch] = samples[index * 2 + ch];
            } else if frame_count > 0 {
                output[i * 2 + ch] = samples[(frame_count - 1) * 2 + ch];
            }
        }
    }
    output
}

pub fn db_to_gain(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[derive(Debug, Default)]
struct Track {
    /// Stereo samples starting at output frame `base`
    buffer: VecDeque<f32>,
    base: u64,
    started: bool,
}

impl Track {
    fn end(&self) -> u64 {
        self.base + (self.buffer.len() / 2) as u64
    }

    /// Write `samples` at output frame `position`, never before `floor`.
    fn place(&mut self, position: u64, samples: &[f32], floor: u64) {
        if !self.started {
            self.base = position.max(floor);
            self.started = true;
        }
        if self.buffer.is_empty() && self.base < floor {
            self.base = floor;
        }

        let end = self.end();
        let mut position = if position.abs_diff(end) <= SNAP_FRAMES {
            end
        } else {
            position
        };
        let mut samples = samples;
        let limit = end.max(floor);
        if position < limit {
            let skip = ((limit - position) as usize * 2).min(samples.len());
            samples = &samples[skip..];
            position = limit;
        }
        if samples.is_empty() {
            return;
        }

        if self.buffer.is_empty() {
            self.base = position;
        } else {
            let gap = (position - end) as usize;
            self.buffer.extend(std::iter::repeat(0.0).take(gap * 2));
        }
        self.buffer.extend(samples.iter().copied());
    }

    /// Add this track's contribution to `[start, start + frames)` into `out`
    /// and discard everything before the block end.
    fn drain_into(&mut self, start: u64, frames: usize, out: &mut [f32]) {
        let block_end = start + frames as u64;
        if self.base < start {
            let skip = ((start - self.base) as usize * 2).min(self.buffer.len());
            self.buffer.drain(..skip);
            self.base = start;
        }
        while self.base < block_end {
            let Some(left) = self.buffer.pop_front() else {
                break;
            };
            let right = self.buffer.pop_front().unwrap_or(left);
            let i = (self.base - start) as usize * 2;
            out[i] += left;
            out[i + 1] += right;
            self.base += 1;
        }
        if self.buffer.is_empty() {
            self.base = self.base.max(block_end);
        }
    }
}

/// Mixes per-device tracks into one stereo stream
#[derive(Debug)]
pub struct AudioMixer {
    sample_rate: u32,
    gain: f32,
    tracks: HashMap<SourceId, Track>,
    /// Output frames already mixed
    mixed: u64,
}

impl AudioMixer {
    pub fn new(sample_rate: u32, gain_db: f32) -> Self {
        Self {
            sample_rate,
            gain: db_to_gain(gain_db),
            tracks: HashMap::new(),
            mixed: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Output frames mixed so far
    pub fn mixed_frames(&self) -> u64 {
        self.mixed
    }

    /// Session time up to which audio has been mixed
    pub fn mixed_until(&self) -> Duration {
        Duration::from_secs_f64(self.mixed as f64 / self.sample_rate as f64)
    }

    /// Place one device chunk. `source_rate` is the device's rate expressed
    /// in session time, i.e. already corrected for drift.
    pub fn push(
        &mut self,
        source: &SourceId,
        start: Duration,
        samples: &[f32],
        channels: u16,
        source_rate: f64,
    ) {
        let stereo = to_stereo(samples, channels);
        let resampled = resample_stereo(&stereo, source_rate, self.sample_rate as f64);
        let position = (start.as_secs_f64() * self.sample_rate as f64).round() as u64;
        let floor = self.mixed;
        self.tracks
            .entry(source.clone())
            .or_default()
            .place(position, &resampled, floor);
    }

    /// Mix the next `frames` output frames
    pub fn mix(&mut self, frames: usize) -> Vec<f32> {
        let start = self.mixed;
        let mut out = vec![0.0f32; frames * 2];
        for track in self.tracks.values_mut() {
            track.drain_into(start, frames, &mut out);
        }
        for sample in out.iter_mut() {
            *sample = (*sample * self.gain).clamp(-1.0, 1.0);
        }
        self.mixed += frames as u64;
        out
    }

    /// Frames buffered ahead of the mix position across all tracks
    pub fn buffered_frames(&self) -> u64 {
        self.tracks
            .values()
            .map(|t| t.end().saturating_sub(self.mixed))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::SourceKind;
    use approx::assert_relative_eq;

    fn mic() -> SourceId {
        SourceId::new(SourceKind::Audio, "mic")
    }

    fn at(frames: u64, rate: u32) -> Duration {
        Duration::from_secs_f64(frames as f64 / rate as f64)
    }

    #[test]
    fn mono_is_duplicated() {
        assert_eq!(to_stereo(&[0.1, 0.2], 1), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(to_stereo(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3), vec![1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn resample_halves_frame_count() {
        let input: Vec<f32> = (0..100).flat_map(|i| [i as f32, -(i as f32)]).collect();
        let out = resample_stereo(&input, 48000.0, 24000.0);
        assert_eq!(out.len(), 100);
        assert_relative_eq!(out[2], 2.0);
        assert_relative_eq!(out[3], -2.0);
    }

    #[test]
    fn gaps_are_filled_with_silence() {
        let mut mixer = AudioMixer::new(100, 0.0);
        mixer.push(&mic(), at(0, 100), &[0.5; 10], 1, 100.0);
        mixer.push(&mic(), at(10, 100), &[0.5; 5], 1, 100.0);
        // Lands 5 frames after the previous chunk ended
        mixer.push(&mic(), at(20, 100), &[0.5; 5], 1, 100.0);
        let out = mixer.mix(25);
        assert_relative_eq!(out[2 * 14], 0.5);
        assert_relative_eq!(out[2 * 15], 0.0);
        assert_relative_eq!(out[2 * 19], 0.0);
        assert_relative_eq!(out[2 * 20], 0.5);
    }

    #[test]
    fn small_jitter_snaps_and_overlap_is_trimmed() {
        let mut mixer = AudioMixer::new(100, 0.0);
        mixer.push(&mic(), at(0, 100), &[0.1; 10], 1, 100.0);
        // One frame early: snapped to the end of the previous chunk
        mixer.push(&mic(), at(9, 100), &[0.2; 10], 1, 100.0);
        assert_eq!(mixer.buffered_frames(), 20);
        // Five frames of overlap are dropped
        mixer.push(&mic(), at(15, 100), &[0.3; 10], 1, 100.0);
        assert_eq!(mixer.buffered_frames(), 25);
        let out = mixer.mix(25);
        assert_relative_eq!(out[2 * 19], 0.2);
        assert_relative_eq!(out[2 * 20], 0.3);
    }

    #[test]
    fn tracks_are_summed_with_gain_and_clamped() {
        let mut mixer = AudioMixer::new(100, 6.0206);
        let loopback = SourceId::new(SourceKind::Audio, "loopback");
        mixer.push(&mic(), at(0, 100), &[0.2; 4], 1, 100.0);
        mixer.push(&loopback, at(0, 100), &[0.1, 0.3, 0.1, 0.3], 2, 100.0);
        mixer.push(&loopback, at(2, 100), &[0.9, 0.9, 0.9, 0.9], 2, 100.0);
        let out = mixer.mix(4);
        assert_relative_eq!(out[0], 0.6, epsilon = 1e-3);
        assert_relative_eq!(out[1], 1.0, epsilon = 1e-3);
        assert_relative_eq!(out[4], 1.0, epsilon = 1e-3);
        assert_eq!(mixer.mixed_frames(), 4);
    }

    #[test]
    fn late_audio_before_mix_position_is_dropped() {
        let mut mixer = AudioMixer::new(100, 0.0);
        let silent = mixer.mix(10);
        assert!(silent.iter().all(|&s| s == 0.0));
        mixer.push(&mic(), at(5, 100), &[0.4; 10], 1, 100.0);
        let out = mixer.mix(10);
        assert_relative_eq!(out[0], 0.4);
        assert_relative_eq!(out[2 * 4], 0.4);
        assert_relative_eq!(out[2 * 5], 0.0);
    }
}
