//! Open Screenrecorder - screen, webcam and audio capture into one file.
//!
//! The library is the capture-and-encode pipeline. A control surface talks
//! to it only through [`recorder::RecordingController`] and its status feed.

pub mod capture;
pub mod compositor;
pub mod config;
pub mod encoder;
pub mod recorder;
pub mod sync;
pub mod utils;

pub use recorder::{OutputSummary, RecordingController, RecordingEvent, RecordingState};
pub use utils::error::{AppError, AppResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "open_screenrecorder=debug,screenrecorder=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
