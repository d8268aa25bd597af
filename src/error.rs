//! Every fallible operation in this crate returns an [`Error`].  Lock
//! contention and integrity problems get their own variants so that
//! callers can tell a crashed writer apart from a plain I/O failure.
use std::path::PathBuf;

use crate::file_lock::LockMode;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Could not acquire a file lock within the manager's timeout.  The
    /// message names the competing holder when its lock info was
    /// readable.
    #[error("{message}")]
    LockTimeout { message: String, lock_file: PathBuf },

    /// The lock file's dirty bit is set: the previous writer did not
    /// finish its update.
    #[error("The file '{0}' was not unlocked cleanly")]
    FileIntegrityViolation(PathBuf),

    /// A write was attempted while only holding a shared lock.
    #[error("An exclusive lock is required for this operation")]
    InsufficientLockMode,

    /// A named indexed cache was requested again with incompatible
    /// parameters.
    #[error("Cache '{name}' couldn't be reused because of the following mismatch:\n{mismatches}")]
    InvalidCacheReuse { name: String, mismatches: String },

    /// A cache directory was opened again with different properties or
    /// lock options.
    #[error("Cache '{0}' is already open with different {1}.")]
    IncompatibleReuse(PathBuf, &'static str),

    /// Any failure while opening a cache directory or its initial lock.
    #[error("Could not open {display_name}: {source}")]
    CacheOpen {
        display_name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("No {0:?} mode lock implementation available.")]
    UnsupportedMode(LockMode),

    #[error("Cannot lock {0} as it has already been locked by this process.")]
    ConcurrentLock(String),

    #[error("This lock has been closed.")]
    LockClosed,

    #[error("{0}")]
    IllegalState(String),

    #[error("Unexpected lock protocol found in lock file. Expected {expected}, found {found}.")]
    UnexpectedLockProtocol { expected: u8, found: u8 },

    /// The on-disk store failed validation.  Readers recover from this
    /// by discarding the store's contents.
    #[error("{0} is corrupt: {1}")]
    CorruptStore(PathBuf, String),

    #[error("Could not serialize or deserialize cache entry: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn illegal_state(message: impl Into<String>) -> Error {
        Error::IllegalState(message.into())
    }

    /// Returns whether this error means the cache's data cannot be
    /// trusted, as opposed to being temporarily unreachable.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Error::FileIntegrityViolation(_) | Error::CorruptStore(..)
        )
    }
}

#[test]
fn test_timeout_message_is_verbatim() {
    let error = Error::LockTimeout {
        message: "Timeout waiting to lock foo.".to_owned(),
        lock_file: PathBuf::from("/tmp/foo.lock"),
    };

    assert_eq!(error.to_string(), "Timeout waiting to lock foo.");
}

#[test]
fn test_integrity_classification() {
    assert!(Error::FileIntegrityViolation(PathBuf::from("x")).is_integrity_violation());
    assert!(Error::CorruptStore(PathBuf::from("x"), "bad".to_owned()).is_integrity_violation());
    assert!(!Error::InsufficientLockMode.is_integrity_violation());
}
