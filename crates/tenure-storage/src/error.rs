//! Errors raised by stage storage, relocation and unit locks
//!
//! Lock failures carry the lockfile they concern and, once a wait has run
//! out, the holder that was in the way, so callers can report who to ask
//! without reopening the lockfile.

use crate::lock::LockHolder;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Directory creation failed for {path}: {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// File read/write failed
    #[error("IO error on {path} ({operation}): {source}")]
    IoError {
        path: PathBuf,
        operation: IoOperation,
        source: std::io::Error,
    },

    /// Stored document could not be parsed
    #[error("Failed to parse {path} as {format}: {message}")]
    ParseError {
        path: PathBuf,
        format: String,
        message: String,
    },

    /// Invalid identifier or argument
    #[error("Invalid value for {field}: {message}")]
    ValidationError { field: String, message: String },

    /// A write aimed at a unit tree that has since moved or been removed
    #[error("Unit tree {path} no longer exists")]
    UnitTreeMissing { path: PathBuf },

    /// Relocation failed
    #[error("Failed to relocate unit storage from {from} to {to}: {message}")]
    RelocationError {
        from: PathBuf,
        to: PathBuf,
        message: String,
    },

    /// The OS refused an operation on a lockfile
    #[error("Cannot {operation} lockfile {lock_file}: {source}")]
    LockFailed {
        lock_file: PathBuf,
        operation: LockOperation,
        source: std::io::Error,
    },

    /// The holder identity could not be written into a lockfile
    #[error("Cannot record lock holder in {lock_file}: {message}")]
    HolderRecord { lock_file: PathBuf, message: String },

    /// A bounded wait ran out while someone else kept the lock
    #[error("Gave up on {location} after {} ms; held by {holder}", .waited.as_millis())]
    LockTimeout {
        location: PathBuf,
        holder: LockHolder,
        waited: Duration,
    },

    /// Storage location missing or unreachable
    #[error("Storage unavailable at {path}: {message}")]
    StorageUnavailable { path: PathBuf, message: String },
}

/// IO operation type for error context
#[derive(Debug, Clone, Copy)]
pub enum IoOperation {
    Read,
    Write,
    Delete,
    Move,
}

impl std::fmt::Display for IoOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoOperation::Read => write!(f, "read"),
            IoOperation::Write => write!(f, "write"),
            IoOperation::Delete => write!(f, "delete"),
            IoOperation::Move => write!(f, "move"),
        }
    }
}

/// What was being done to a lockfile when the OS refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Acquire,
    Inspect,
    Release,
}

impl std::fmt::Display for LockOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockOperation::Acquire => write!(f, "acquire"),
            LockOperation::Inspect => write!(f, "inspect"),
            LockOperation::Release => write!(f, "release"),
        }
    }
}

impl StorageError {
    pub fn directory_creation_failed(path: PathBuf, source: std::io::Error) -> Self {
        StorageError::DirectoryCreationFailed { path, source }
    }

    pub fn io_error(path: PathBuf, operation: IoOperation, source: std::io::Error) -> Self {
        StorageError::IoError {
            path,
            operation,
            source,
        }
    }

    pub fn parse_error(
        path: PathBuf,
        format: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        StorageError::ParseError {
            path,
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn relocation_error(from: PathBuf, to: PathBuf, message: impl Into<String>) -> Self {
        StorageError::RelocationError {
            from,
            to,
            message: message.into(),
        }
    }

    /// Lockfile operation refused by the OS
    pub fn lock_failed(
        lock_file: PathBuf,
        operation: LockOperation,
        source: std::io::Error,
    ) -> Self {
        StorageError::LockFailed {
            lock_file,
            operation,
            source,
        }
    }

    /// Bounded wait on `location` expired with `holder` still in place
    pub fn lock_timeout(location: PathBuf, holder: LockHolder, waited: Duration) -> Self {
        StorageError::LockTimeout {
            location,
            holder,
            waited,
        }
    }

    pub fn storage_unavailable(path: PathBuf, message: impl Into<String>) -> Self {
        StorageError::StorageUnavailable {
            path,
            message: message.into(),
        }
    }

    /// Whether this error came from a relocation step
    pub fn is_relocation(&self) -> bool {
        matches!(self, StorageError::RelocationError { .. })
    }

    /// Holder that outlasted a bounded wait, if this is a lock timeout
    pub fn blocking_holder(&self) -> Option<&LockHolder> {
        match self {
            StorageError::LockTimeout { holder, .. } => Some(holder),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Actor;

    #[test]
    fn test_lock_timeout_names_holder_and_wait() {
        let holder = LockHolder {
            actor: Actor::new("alice"),
            pid: 4242,
            acquired_at: None,
        };
        let err = StorageError::lock_timeout(
            PathBuf::from("/srv/tfl/2_TFL_Working/TFL_49"),
            holder.clone(),
            Duration::from_millis(1500),
        );

        assert_eq!(
            err.to_string(),
            "Gave up on /srv/tfl/2_TFL_Working/TFL_49 after 1500 ms; held by alice (pid 4242)"
        );
        assert_eq!(err.blocking_holder(), Some(&holder));
    }

    #[test]
    fn test_lock_failed_names_operation() {
        let err = StorageError::lock_failed(
            PathBuf::from("TFL_49.lock"),
            LockOperation::Release,
            std::io::Error::new(std::io::ErrorKind::Other, "bad descriptor"),
        );

        assert_eq!(err.to_string(), "Cannot release lockfile TFL_49.lock: bad descriptor");
        assert!(err.blocking_holder().is_none());
        assert!(!err.is_relocation());
    }
}
