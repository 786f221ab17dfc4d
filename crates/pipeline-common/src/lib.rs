//! # Pipeline Common
//!
//! Shared abstractions for the synchronous transmux pipelines: the
//! [`Stage`] trait every pipeline stage implements, the common
//! [`PipelineError`] type, and the per-instance [`StreamerContext`]
//! used for log attribution.

use thiserror::Error;

pub mod context;
pub mod stage;
pub mod test_utils;

pub use context::StreamerContext;
pub use stage::Stage;
pub use test_utils::init_tracing;

/// Common error type for pipeline operations.
///
/// Recoverable wire-level noise (bad sync bytes, short sections) is handled
/// inside the stages and never surfaces here; a `PipelineError` means the
/// instance hit an invariant violation and must be reset.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("unsupported codec: stream_type {0:#04x}")]
    UnsupportedCodec(u8),
}
