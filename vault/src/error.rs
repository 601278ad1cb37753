//! Error types for the feed service.

use common::StorageError;

/// Broad classification of an [`Error`].
///
/// Everything except [`ErrorKind::Fatal`] is an expected, client-triggerable
/// condition answered with a `ReqDiscarded` envelope. `Fatal` means an
/// internal invariant broke and the process needs operator attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Storage,
    Malformed,
    Config,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Session ID 0 is reserved.
    #[error("invalid stream ID")]
    InvalidSessionId,

    /// No session with this ID exists on the connection.
    #[error("stream {0} is not open")]
    NotOpen(u64),

    /// The envelope carried an operation code the server does not accept.
    #[error("unsupported operation: {0}")]
    Unsupported(i32),

    #[error("feed is not writable")]
    NotWritable,

    /// Open, append or read failure reported by the storage layer.
    #[error("storage error: {0}")]
    Storage(String),

    /// A frame or nested payload could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// An internal invariant was violated.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidSessionId | Error::NotOpen(_) | Error::Unsupported(_) => {
                ErrorKind::Protocol
            }
            Error::NotWritable | Error::Storage(_) => ErrorKind::Storage,
            Error::Malformed(_) => ErrorKind::Malformed,
            Error::Config(_) => ErrorKind::Config,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotWritable => Error::NotWritable,
            StorageError::Storage(msg) => Error::Storage(msg),
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Malformed(format!("Invalid protobuf: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Malformed(format!("Invalid JSON: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
