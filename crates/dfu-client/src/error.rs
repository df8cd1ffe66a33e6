//! Error types for the download client.

use std::io;

use thiserror::Error;

use crate::session::DownloadStatus;

/// Result type for download client operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors raised by the transport adapter and the download engine.
#[derive(Debug, Error)]
pub enum DfuError {
    /// A required session field was empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Configuration values are inconsistent or unparsable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Host name resolution failed outright.
    #[error("could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but produced no address of the requested family.
    #[error("no usable address for {host}")]
    NoAddress { host: String },

    /// Every candidate address refused or failed the connection.
    #[error("connection to {host} failed: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    /// Socket read or write failed during a transfer.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The server closed the connection while a response was awaited.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// The server reported a different total size than earlier in the download.
    #[error("firmware size changed from {expected} to {actual} during download")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The resume offset lies past the end of the object the server has.
    #[error("resume offset {offset} is beyond firmware size {firmware_size}")]
    OffsetBeyondSize { offset: u64, firmware_size: u64 },

    /// The formatted request does not fit the request buffer.
    #[error("request of {needed} bytes exceeds request buffer of {capacity} bytes")]
    RequestTooLarge { needed: usize, capacity: usize },

    /// Operation called in the wrong state.
    #[error("operation requires status {expected:?}, session is {actual:?}")]
    InvalidState {
        expected: DownloadStatus,
        actual: DownloadStatus,
    },

    /// Operation needs a live connection and there is none.
    #[error("not connected")]
    NotConnected,
}

impl DfuError {
    /// Returns true if the download cannot continue within this session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DfuError::SizeMismatch { .. } | DfuError::OffsetBeyondSize { .. }
        )
    }

    /// Returns true if a disconnect, reconnect and restart may get past the error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DfuError::Resolve { .. }
                | DfuError::NoAddress { .. }
                | DfuError::Connect { .. }
                | DfuError::Transport(_)
                | DfuError::ConnectionClosed
        )
    }
}
