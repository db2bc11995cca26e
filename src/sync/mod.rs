//! Clock & synchronization
//!
//! The session clock, per-source clock mapping, the audio mixer and the
//! synchronizer thread that ties them to the compositor.

pub mod clock;
pub mod drift;
pub mod mixer;
pub mod synchronizer;

pub use clock::SessionClock;
pub use drift::ClockMapper;
pub use mixer::AudioMixer;
pub use synchronizer::{SyncHandle, SyncReport, SyncSettings, SyncStats, Synchronizer};
