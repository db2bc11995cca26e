//! Session configuration
//!
//! Quality presets, the start request handed in by the control surface and
//! the pipeline's tunable limits.

pub mod preset;
pub mod request;
pub mod tuning;

pub use preset::{
    AudioCodec, AudioQuality, Container, QualityPreset, ResolvedPreset, VideoQuality,
};
pub use request::{ScreenSelector, StartRequest};
pub use tuning::PipelineTuning;
