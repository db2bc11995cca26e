//! Pipeline tuning
//!
//! Queue capacities, timeouts and clock-mapping parameters. Every field has
//! a default so a partial JSON file is enough to override one knob.

use crate::utils::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineTuning {
    /// Frames held per video source queue before the oldest is dropped
    pub video_queue_capacity: usize,

    /// Chunks held per audio source queue before producers block
    pub audio_queue_capacity: usize,

    /// How long an audio producer may block on a full queue
    pub audio_push_timeout_ms: u64,

    /// Items pending in front of the encoder
    pub sink_queue_capacity: usize,

    /// How long the synchronizer may block handing audio to the encoder
    pub sink_audio_timeout_ms: u64,

    /// Native time between drift re-estimates
    pub drift_reanchor_ms: u64,

    /// Number of recent (native, reference) pairs used in the fit
    pub drift_window: usize,

    /// Largest accepted deviation of a source clock rate from nominal
    pub max_drift_ratio: f64,

    /// Frames per mixed audio block
    pub audio_block_frames: usize,

    /// Time the mixer waits past a block's end before emitting it
    pub mix_latency_ms: u64,

    /// Time allowed for opened sources to deliver their first item
    pub ready_timeout_ms: u64,

    /// Consecutive capture errors before a source is marked degraded
    pub max_consecutive_errors: u32,

    /// Interval between progress events
    pub progress_interval_ms: u64,

    /// Idle buffers retained per frame pool
    pub frame_pool_size: usize,
}

impl Default for PipelineTuning {
    fn default() -> Self {
        Self {
            video_queue_capacity: 4,
            audio_queue_capacity: 64,
            audio_push_timeout_ms: 500,
            sink_queue_capacity: 8,
            sink_audio_timeout_ms: 1000,
            drift_reanchor_ms: 5000,
            drift_window: 32,
            max_drift_ratio: 0.05,
            audio_block_frames: 1024,
            mix_latency_ms: 200,
            ready_timeout_ms: 3000,
            max_consecutive_errors: 30,
            progress_interval_ms: 1000,
            frame_pool_size: 8,
        }
    }
}

impl PipelineTuning {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::InvalidTuning(format!("{}: {}", path.display(), e)))?;
        let tuning: PipelineTuning = serde_json::from_str(&content)
            .map_err(|e| ConfigError::InvalidTuning(format!("{}: {}", path.display(), e)))?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("videoQueueCapacity", self.video_queue_capacity),
            ("audioQueueCapacity", self.audio_queue_capacity),
            ("sinkQueueCapacity", self.sink_queue_capacity),
            ("audioBlockFrames", self.audio_block_frames),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::InvalidTuning(format!("{name} must be non-zero")));
            }
        }
        if self.drift_window < 2 {
            return Err(ConfigError::InvalidTuning(
                "driftWindow needs at least two samples".to_string(),
            ));
        }
        if !(0.0..0.5).contains(&self.max_drift_ratio) {
            return Err(ConfigError::InvalidTuning(format!(
                "maxDriftRatio {} outside [0, 0.5)",
                self.max_drift_ratio
            )));
        }
        Ok(())
    }

    pub fn audio_push_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_push_timeout_ms)
    }

    pub fn sink_audio_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_audio_timeout_ms)
    }

    pub fn drift_reanchor(&self) -> Duration {
        Duration::from_millis(self.drift_reanchor_ms)
    }

    pub fn mix_latency(&self) -> Duration {
        Duration::from_millis(self.mix_latency_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}
