//! Encoder sink and backends
//!
//! The sink thread feeds one [`MediaEncoder`] per session. The FFmpeg
//! backend writes real files; the memory backend only records what it saw.

pub mod ffmpeg;
pub mod memory;
pub mod pcm;
pub mod sink;
pub mod types;

pub use ffmpeg::{ensure_ffmpeg, probe_media, FfmpegEncoderFactory};
pub use memory::{MemoryEncoderFactory, MemoryFault, MemoryRecording};
pub use sink::{EncoderSink, SinkReport};
pub use types::{
    AudioStreamInfo, EncoderFactory, EncoderParams, FinalizeReport, MediaEncoder, MediaMetadata,
    VideoStreamInfo,
};
