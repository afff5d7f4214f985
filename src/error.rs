//! Typed error hierarchy for the injection core (spec §7).
//!
//! The teacher's binary never needed a public error surface and used
//! `anyhow` throughout; this crate is a library, so its failure modes are
//! named explicitly and `anyhow::Context` is reserved for the CLI boundary
//! in `main.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to grab device node {path}: {source}")]
    GrabFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse macro '{source_text}': {reason}")]
    ParseError { source_text: String, reason: String },

    #[error("device disappeared: {0}")]
    DeviceDisappeared(String),

    #[error("failed to write event to virtual device: {0}")]
    WriteFailed(#[source] std::io::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
