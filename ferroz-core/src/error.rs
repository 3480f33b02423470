//! Error types for Ferroz operations.
//!
//! A single error enum covers every failure mode of the engine: corrupt
//! bitstreams, invalid configuration, I/O failures from the byte source or
//! sink, and cooperative cancellation. Inner coding loops propagate these
//! with `?`; none of them allocate after encoder/decoder construction.

use std::io;
use thiserror::Error;

/// The main error type for Ferroz operations.
#[derive(Debug, Error)]
pub enum FerrozError {
    /// I/O error from the underlying byte source or sink.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid encoder or decoder configuration, rejected before any output.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the rejected parameter.
        message: String,
    },

    /// Malformed stream header (properties byte, dictionary size field).
    #[error("Invalid header: {message}")]
    InvalidHeader {
        /// Description of the header error.
        message: String,
    },

    /// Corrupted compressed data.
    #[error("Corrupted data at offset {offset}: {message}")]
    Corrupted {
        /// Uncompressed byte offset where corruption was detected.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A back-reference pointed outside the valid window history.
    #[error("Invalid match distance {distance} with {history} bytes of history")]
    InvalidDistance {
        /// The offending distance.
        distance: u64,
        /// Bytes of history available at that point.
        history: u64,
    },

    /// The byte source ended in the middle of a symbol or chunk.
    #[error("Unexpected end of stream: expected {expected} more bytes")]
    UnexpectedEof {
        /// Number of bytes that were expected but not available.
        expected: usize,
    },

    /// A chunk produced or consumed a different byte count than it declared.
    #[error("Size mismatch: declared {declared}, actual {actual}")]
    SizeMismatch {
        /// Size the stream declared.
        declared: u64,
        /// Size actually observed.
        actual: u64,
    },

    /// The operation was cancelled through a [`CancelToken`].
    ///
    /// [`CancelToken`]: crate::control::CancelToken
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for Ferroz operations.
pub type Result<T> = std::result::Result<T, FerrozError>;

impl FerrozError {
    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an invalid header error.
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            message: message.into(),
        }
    }

    /// Create a corrupted data error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }

    /// Create an invalid distance error.
    pub fn invalid_distance(distance: u64, history: u64) -> Self {
        Self::InvalidDistance { distance, history }
    }

    /// Create an unexpected EOF error.
    pub fn unexpected_eof(expected: usize) -> Self {
        Self::UnexpectedEof { expected }
    }

    /// Create a size mismatch error.
    pub fn size_mismatch(declared: u64, actual: u64) -> Self {
        Self::SizeMismatch { declared, actual }
    }

    /// Whether this error indicates unusable input data (as opposed to an
    /// environmental failure such as I/O or cancellation).
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidHeader { .. }
                | Self::Corrupted { .. }
                | Self::InvalidDistance { .. }
                | Self::UnexpectedEof { .. }
                | Self::SizeMismatch { .. }
        )
    }
}
