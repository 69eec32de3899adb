//! Error types and handling for regtriage.

use std::fmt;
use std::path::PathBuf;

use crate::types::HiveKind;

/// Custom error type for regtriage operations
#[derive(Debug)]
pub enum Error {
    /// I/O related errors
    Io(std::io::Error),
    /// CSV writing errors
    Csv(csv::Error),
    /// JSON serialization errors
    Json(serde_json::Error),
    /// Elevated rights are required but absent, or could not be requested
    Elevation(String),
    /// The external snapshot command failed
    Snapshot(SnapshotError),
    /// Malformed registry hive structure
    HiveFormat(String),
    /// Decoding a hive failed after `records` keys had been read
    Decode {
        hive: HiveKind,
        records: usize,
        reason: String,
    },
    /// A normalization assumption about the column schema was violated
    Schema(String),
    /// Writing a hive's output table failed
    OutputWrite { path: PathBuf, reason: String },
    /// Invalid configuration or input
    InvalidInput(String),
    /// The worker pool could not be built
    WorkerPool(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::Csv(err) => write!(f, "CSV error: {}", err),
            Error::Json(err) => write!(f, "JSON error: {}", err),
            Error::Elevation(msg) => write!(f, "Elevation error: {}", msg),
            Error::Snapshot(err) => write!(f, "Snapshot error: {}", err),
            Error::HiveFormat(msg) => write!(f, "Hive format error: {}", msg),
            Error::Decode { hive, records, reason } => write!(
                f,
                "Decode error in {} hive after {} record(s): {}",
                hive, records, reason
            ),
            Error::Schema(msg) => write!(f, "Schema error: {}", msg),
            Error::OutputWrite { path, reason } => {
                write!(f, "Failed to write {}: {}", path.display(), reason)
            }
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::WorkerPool(msg) => write!(f, "Worker pool error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Csv(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::Snapshot(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient conversion traits
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<csv::Error> for Error {
    fn from(err: csv::Error) -> Self {
        Error::Csv(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}

impl From<SnapshotError> for Error {
    fn from(err: SnapshotError) -> Self {
        Error::Snapshot(err)
    }
}

/// Failure kinds reported by the hive snapshot command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The snapshot program could not be found
    CommandNotFound(String),
    /// The caller lacks the rights to save the hive
    AccessDenied(String),
    /// The live registry key does not exist
    KeyNotFound(String),
    /// Any other non-zero exit of the snapshot program
    UnknownCommandFailure { code: Option<i32>, stderr: String },
    /// The configured snapshot timeout elapsed and the program was killed
    TimedOut { seconds: u64 },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::CommandNotFound(program) => {
                write!(f, "snapshot command not found: {}", program)
            }
            SnapshotError::AccessDenied(msg) => write!(f, "access denied: {}", msg),
            SnapshotError::KeyNotFound(key) => write!(f, "registry key not found: {}", key),
            SnapshotError::UnknownCommandFailure { code, stderr } => match code {
                Some(code) => write!(f, "snapshot command exited with {}: {}", code, stderr),
                None => write!(f, "snapshot command terminated by signal: {}", stderr),
            },
            SnapshotError::TimedOut { seconds } => {
                write!(f, "snapshot command did not finish within {}s", seconds)
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, Error>;
