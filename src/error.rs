//! Error types shared across the crate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for llamactl operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A required binary or model file is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller supplied an unusable configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The server subprocess exited before reporting readiness.
    #[error("llama-server exited before becoming ready (exit code {code:?})")]
    StartFailed {
        code: Option<i32>,
        /// Combined stdout/stderr captured up to the exit.
        output: String,
    },

    /// A bounded wait elapsed (server start or completion request).
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The HTTP response did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An installation directory holds a different build than requested.
    #[error("installation is build {found}, requested build {expected}")]
    VersionMismatch { expected: u64, found: u64 },

    /// Version output or GGUF contents could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// True for failures the detection engine treats as "config infeasible"
    /// rather than aborting the whole run.
    pub fn is_probe_failure(&self) -> bool {
        matches!(
            self,
            Error::StartFailed { .. } | Error::Timeout(_) | Error::Protocol(_) | Error::Http(_)
        )
    }
}
