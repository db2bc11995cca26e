//! Recording system module
//!
//! - [`RecordingController`] drives the lifecycle and is the control surface
//! - [`Pipeline`] owns the sources, synchronizer and encoder sink of one session
//! - [`RecordingState`] is the transition table every command goes through

pub mod controller;
pub mod events;
pub mod pipeline;
pub mod state;

pub use controller::{OutputSummary, RecordingController, SessionHandle};
pub use events::{EventSender, RecordingEvent};
pub use pipeline::Pipeline;
pub use state::{LifecycleCommand, RecordingSession, RecordingState};
