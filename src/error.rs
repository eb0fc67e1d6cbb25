//! Error handling for the stockpile producer.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the producer service.
///
/// Variants are split between fatal conditions (which terminate the producer
/// with a non-zero exit) and degradable ones (`Retention`, which is logged
/// and retried on the next enforcement pass).
#[derive(Debug, Error)]
pub enum ProducerError {
    /// Invalid configuration, rejected before the producer starts running.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The output directory could not be listed. Fatal at startup.
    #[error("Cannot list directory {path}: {source}")]
    DirectoryUnreadable {
        /// Directory that could not be listed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An artifact already exists at the path we were about to create.
    ///
    /// This signals external interference or an allocator bug. The producer
    /// refuses to overwrite and terminates.
    #[error("Artifact already exists at {path}, refusing to overwrite")]
    IndexCollision {
        /// Path of the colliding artifact.
        path: PathBuf,
    },

    /// Archive encoding failed. The codec never fails on the fixed, small
    /// entry content it is given, so a fault here indicates environment
    /// corruption and is fatal.
    #[error("Archive encoding failed: {0}")]
    Encoding(String),

    /// I/O error. Transient write failures get a bounded retry before this
    /// escalates to a fatal condition.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Retention enforcement failed. Non-fatal: production continues and the
    /// over-budget state is surfaced through the status endpoint.
    #[error("Retention failure: {0}")]
    Retention(String),

    /// The quota backpressure wait timed out without space being freed.
    #[error("Quota wait timed out after {waited_secs}s without space being freed")]
    QuotaDeadlock {
        /// Seconds spent waiting before giving up.
        waited_secs: u64,
    },
}

/// Result type alias for producer operations.
pub type Result<T> = std::result::Result<T, ProducerError>;
