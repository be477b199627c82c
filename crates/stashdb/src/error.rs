//! Error types for stashdb

use std::fmt;
use std::io;

/// Result type alias for stashdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug)]
pub enum Error {
    /// I/O error on a value file or directory
    Io(io::Error),

    /// Manifest (SQLite) error
    Sqlite(rusqlite::Error),

    /// Key is empty
    InvalidKey,

    /// Argument not valid for this storage type
    InvalidArgument(String),

    /// Storage has been closed
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Sqlite(e) => write!(f, "Manifest error: {}", e),
            Error::InvalidKey => write!(f, "Invalid key: must not be empty"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Closed => write!(f, "Storage is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Sqlite(err)
    }
}
