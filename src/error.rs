use thiserror::Error;

/// Error taxonomy for the metering pipeline.
///
/// Validation and configuration failures are surfaced synchronously to the
/// caller; I/O failures during background flushes and sweeps are logged and
/// retried (buffered metrics) or dropped (passthrough metrics) without
/// propagating here.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or inconsistent report: bad encoding, name mismatch,
    /// value type mismatch, or start time after end time.
    #[error("invalid report: {0}")]
    Validation(String),

    /// Report named a metric that is not configured.
    #[error("unknown metric: {0}")]
    UnknownMetric(String),

    /// Invalid declarative configuration. Fatal at agent construction;
    /// no partial agent is returned.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure writing a report or state file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Report submitted after shutdown began.
    #[error("agent is stopped")]
    Stopped,
}

impl Error {
    /// Builds a validation error from anything displayable.
    pub fn validation(msg: impl std::fmt::Display) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Builds a configuration error from anything displayable.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}
