//! Utility modules

pub mod error;

pub use error::{
    AppError, AppResult, BackpressureError, ClockError, ConfigError, EncodeError, ErrorResponse,
    FinalizeError, PipelineFault, SourceError, StreamKind, TransitionError,
};
