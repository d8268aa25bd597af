//! Indexed caches touch their files through a [`FileAccess`], which
//! routes each read or write through the file lock held by the current
//! unit of work (if the cache is locked at all).
use std::sync::Arc;
use std::sync::Weak;

use crate::error::Error;
use crate::error::Result;
use crate::file_lock::FileLock;

/// Finds the file lock that guards the current thread's unit of work.
pub(crate) trait LockHolder: Send + Sync {
    fn file_lock_for_current_thread(&self) -> Result<Arc<FileLock>>;
}

#[derive(Clone)]
pub(crate) enum FileAccess {
    /// Unlocked caches: actions run directly.
    Transparent,
    /// Actions run under the lock of the calling thread's unit of work.
    UnitOfWork(Weak<dyn LockHolder>),
}

impl std::fmt::Debug for FileAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileAccess::Transparent => f.write_str("Transparent"),
            FileAccess::UnitOfWork(_) => f.write_str("UnitOfWork"),
        }
    }
}

impl FileAccess {
    fn lock(holder: &Weak<dyn LockHolder>) -> Result<Arc<FileLock>> {
        holder
            .upgrade()
            .ok_or_else(|| Error::illegal_state("The cache has been closed."))?
            .file_lock_for_current_thread()
    }

    pub fn read_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        match self {
            FileAccess::Transparent => action(),
            FileAccess::UnitOfWork(holder) => FileAccess::lock(holder)?.read_file(action),
        }
    }

    pub fn write_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        match self {
            FileAccess::Transparent => action(),
            FileAccess::UnitOfWork(holder) => FileAccess::lock(holder)?.write_file(action),
        }
    }
}

#[cfg(test)]
struct FixedHolder(Arc<FileLock>);

#[cfg(test)]
impl LockHolder for FixedHolder {
    fn file_lock_for_current_thread(&self) -> Result<Arc<FileLock>> {
        Ok(self.0.clone())
    }
}

#[test]
fn test_transparent_runs_directly() {
    let access = FileAccess::Transparent;

    assert_eq!(access.read_file(|| Ok(1)).expect("read must succeed"), 1);
    assert_eq!(access.write_file(|| Ok(2)).expect("write must succeed"), 2);
}

#[test]
fn test_unit_of_work_goes_through_the_lock() {
    use crate::file_lock::{FileLockManager, LockMode, LockOptions};

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let lock = FileLockManager::new()
        .lock(temp.path(), LockOptions::mode(LockMode::Exclusive), "test")
        .expect("lock must succeed");
    let holder: Arc<dyn LockHolder> = Arc::new(FixedHolder(Arc::new(lock)));
    let access = FileAccess::UnitOfWork(Arc::downgrade(&holder));

    // Fresh lock files are dirty until the first write.
    assert!(matches!(
        access.read_file(|| Ok(())),
        Err(Error::FileIntegrityViolation(_))
    ));
    access.write_file(|| Ok(())).expect("write must succeed");
    assert_eq!(access.read_file(|| Ok(3)).expect("read must succeed"), 3);

    drop(holder);
    assert!(matches!(
        access.read_file(|| Ok(())),
        Err(Error::IllegalState(_))
    ));
}
