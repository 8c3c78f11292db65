use std::fmt;
use std::io;

/// Unified error type for the storage engine.
///
/// Storage-layer failures travel up the stack as values, never as panics;
/// background jobs inspect them to decide between retry and abort.
#[derive(Debug)]
pub enum Error {
    /// IO error from local storage operations.
    Io(io::Error),
    /// Data corruption detected (CRC mismatch, bad footer/index, etc).
    Corruption(String),
    /// Key not found. A normal lookup result, not a failure.
    NotFound,
    /// A remote memory operation failed or timed out. Never conflated with
    /// NotFound: the bytes may exist, we just could not reach them.
    RemoteUnavailable(String),
    /// Malformed configuration or out-of-range request.
    InvalidArgument(String),
    /// Unimplemented comparator/filter/compression combination.
    NotSupported(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {e}"),
            Error::Corruption(msg) => write!(f, "Corruption: {msg}"),
            Error::NotFound => write!(f, "Not found"),
            Error::RemoteUnavailable(msg) => write!(f, "Remote unavailable: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            Error::NotSupported(msg) => write!(f, "Not supported: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// Whether a background job hitting this error should be retried on the
    /// next scheduling pass. Corruption and bad arguments never heal on
    /// their own; IO and transport failures might.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::RemoteUnavailable(_))
    }
}

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;
