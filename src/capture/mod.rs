//! Capture sources
//!
//! Screen, webcam and audio adapters, the bounded queues they deliver into
//! and the device seams platform backends implement.

pub mod audio;
pub mod frame;
pub mod pool;
pub mod queue;
pub mod screen;
pub mod source;
pub mod synthetic;
pub mod traits;
pub mod webcam;

#[cfg(feature = "native")]
pub mod native;

pub use audio::AudioSource;
pub use frame::{AudioChunk, CaptureFrame, CompositeFrame, PixelFormat};
pub use pool::{FrameBuffer, FramePool};
pub use queue::{AudioQueue, SinkItem, SinkQueue, VideoQueue};
pub use screen::{ScreenFormat, ScreenSource};
pub use source::{
    CaptureGate, SourceContext, SourceHandle, SourceHealth, SourceId, SourceItem, SourceKind,
    SourceMonitor, SourceTap,
};
pub use synthetic::SyntheticCatalog;
pub use traits::{
    AudioDeviceInfo, CameraCapability, CameraInfo, DeviceCatalog, DisplayInfo, Resolution,
};
pub use webcam::WebcamSource;
