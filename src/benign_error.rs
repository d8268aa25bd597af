/// Some [`std::io::Error`]s are expected while maintaining cache
/// directories: other processes delete files under our feet, and we
/// treat those races as no-ops.
use std::io::Error;
use std::io::ErrorKind;
use std::io::Result;
use std::path::Path;

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  A stale (NFS) handle means the inode we're trying to
/// reach isn't on the server anymore; for a cache directory shared
/// between hosts, that's just another process deleting the file first.
pub fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Removes the file at `path`.  Returns whether this call deleted it;
/// a file that is already gone is not an error.
pub(crate) fn remove_file_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if is_absent_file_error(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Removes the file or directory tree at `path`, ignoring entries that
/// disappear concurrently.
pub(crate) fn remove_path_if_present(path: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if is_absent_file_error(&e) => return Ok(()),
        Err(e) => return Err(e),
    };

    let ret = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match ret {
        Err(e) if is_absent_file_error(&e) => Ok(()),
        other => other,
    }
}

/// Removes `dir` if it is an empty directory.  Returns false when the
/// directory still has entries (or was already removed).
pub(crate) fn remove_dir_if_empty(dir: &Path) -> Result<bool> {
    let mut entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if is_absent_file_error(&e) => return Ok(false),
        Err(e) => return Err(e),
    };

    if entries.next().is_some() {
        return Ok(false);
    }

    match std::fs::remove_dir(dir) {
        Ok(()) => Ok(true),
        Err(e) if is_absent_file_error(&e) => Ok(false),
        // Someone raced us and added a file.
        Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => Ok(false),
        Err(e) => Err(e),
    }
}

// Mostly trivial, but let's at least make sure we didn't mess up raw_os_error
// and confirm that libc agrees with what we know to be true on Linux.
#[test]
fn test_getters() {
    assert_eq!(
        true,
        is_absent_file_error(&Error::new(ErrorKind::NotFound, "not found"))
    );
    assert_eq!(
        false,
        is_absent_file_error(&Error::new(ErrorKind::PermissionDenied, "bad"))
    );

    assert_eq!(
        true,
        is_absent_file_error(&Error::from_raw_os_error(libc::ESTALE))
    );
    assert_eq!(
        false,
        is_absent_file_error(&Error::from_raw_os_error(libc::EIO))
    );

    #[cfg(target_os = "linux")]
    assert_eq!(true, is_absent_file_error(&Error::from_raw_os_error(116))); // ESTALE
}

#[test]
fn test_remove_file_if_present() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache_file", FileType::ZeroFile(10));
    let path = temp.path("cache_file");

    assert!(remove_file_if_present(&path).expect("removal should succeed"));
    // The second removal finds nothing to do.
    assert!(!remove_file_if_present(&path).expect("removal should succeed"));
}

#[test]
fn test_remove_dir_if_empty() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("empty", FileType::Dir)
        .create("full", FileType::Dir)
        .create("full/file", FileType::ZeroFile(1));

    assert!(remove_dir_if_empty(&temp.path("empty")).expect("should succeed"));
    assert!(!temp.path("empty").exists());

    assert!(!remove_dir_if_empty(&temp.path("full")).expect("should succeed"));
    assert!(temp.path("full/file").exists());

    // Already gone.
    assert!(!remove_dir_if_empty(&temp.path("empty")).expect("should succeed"));
}

#[test]
fn test_remove_path_if_present() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("tree", FileType::Dir)
        .create("tree/a", FileType::ZeroFile(1))
        .create("file", FileType::ZeroFile(1));

    remove_path_if_present(&temp.path("tree")).expect("should succeed");
    remove_path_if_present(&temp.path("file")).expect("should succeed");
    remove_path_if_present(&temp.path("missing")).expect("should succeed");

    assert!(!temp.path("tree").exists());
    assert!(!temp.path("file").exists());
}
