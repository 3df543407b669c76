//! IO error types.

/// Errors raised by buffer and serialization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    /// A read ran past the available bytes.
    #[error("unexpected end of input while reading {0}")]
    UnexpectedEof(&'static str),

    /// More bytes were requested from a buffer than it holds.
    #[error("buffer underflow: requested {requested}, available {available}")]
    BufferUnderflow {
        /// Bytes asked for.
        requested: usize,
        /// Bytes actually buffered.
        available: usize,
    },

    /// The bytes did not decode as the expected value.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl IoError {
    /// Builds an [`IoError::InvalidData`] from any displayable message.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }
}

/// Result type for IO operations.
pub type IoResult<T> = Result<T, IoError>;
