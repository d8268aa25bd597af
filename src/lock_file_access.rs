//! Raw access to a lock file: advisory byte-range locks on its state
//! and information regions, and positioned reads and writes of their
//! contents.
//!
//! On Linux, region locks are open file description locks
//! (`F_OFD_SETLK`), so two independent opens of the same lock file
//! contend even inside one process.  Elsewhere we fall back to classic
//! POSIX record locks, which only exclude other processes.
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Result;
use crate::lock_state::LockInfo;
use crate::lock_state::LockState;
use crate::lock_state::LockStateProtocol;
use crate::lock_state::INFORMATION_REGION_SIZE;
use crate::lock_state::STATE_REGION_POS;

#[cfg(target_os = "linux")]
const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;

#[cfg(not(target_os = "linux"))]
const SET_LOCK: libc::c_int = libc::F_SETLK;

/// Attempts a non-blocking `fcntl` lock operation on `[start, start + len)`.
/// Returns `Ok(false)` when another holder conflicts.
fn set_region_lock(fd: RawFd, lock_type: libc::c_short, start: u64, len: u64) -> io::Result<bool> {
    // SAFETY: `flock` is a plain C struct, for which all zeroes is a
    // valid (unlocked, whole-file) value.  OFD locks require `l_pid == 0`.
    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = lock_type;
    flock.l_whence = libc::SEEK_SET as libc::c_short;
    flock.l_start = start as libc::off_t;
    flock.l_len = len as libc::off_t;
    flock.l_pid = 0;

    // SAFETY: `fd` is an open descriptor owned by the caller, and
    // `flock` outlives the call.
    let ret = unsafe { libc::fcntl(fd, SET_LOCK, &mut flock as *mut libc::flock) };
    if ret == 0 {
        return Ok(true);
    }

    let error = io::Error::last_os_error();
    match error.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EACCES) => Ok(false),
        _ => Err(error),
    }
}

/// A byte-range lock currently held on a [`LockFileAccess`]'s file.
///
/// Closing the underlying file releases every region lock, so a
/// `RegionLock` only needs an explicit `release` when the file stays
/// open.
#[derive(Debug)]
pub(crate) struct RegionLock {
    fd: RawFd,
    start: u64,
    len: u64,
    exclusive: bool,
}

impl RegionLock {
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn release(self) -> io::Result<()> {
        set_region_lock(self.fd, libc::F_UNLCK as libc::c_short, self.start, self.len).map(|_| ())
    }
}

/// An open lock file, with its state region encoded in `protocol`.
#[derive(Debug)]
pub(crate) struct LockFileAccess {
    file: File,
    path: PathBuf,
    protocol: LockStateProtocol,
}

impl LockFileAccess {
    /// Opens (and creates if needed) the lock file at `path`.
    pub fn open(path: &Path, protocol: LockStateProtocol) -> io::Result<LockFileAccess> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        Ok(LockFileAccess {
            file,
            path: path.to_owned(),
            protocol,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_lock(&self, start: u64, len: u64, exclusive: bool) -> io::Result<Option<RegionLock>> {
        let lock_type = if exclusive {
            libc::F_WRLCK
        } else {
            libc::F_RDLCK
        };

        let fd = self.file.as_raw_fd();
        if set_region_lock(fd, lock_type as libc::c_short, start, len)? {
            Ok(Some(RegionLock {
                fd,
                start,
                len,
                exclusive,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn try_lock_state(&self, exclusive: bool) -> io::Result<Option<RegionLock>> {
        self.try_lock(STATE_REGION_POS, self.protocol.region_size(), exclusive)
    }

    pub fn try_lock_information(&self, exclusive: bool) -> io::Result<Option<RegionLock>> {
        self.try_lock(
            self.protocol.information_region_pos(),
            INFORMATION_REGION_SIZE,
            exclusive,
        )
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Returns whether the state region has ever been written.
    pub fn has_state(&self) -> io::Result<bool> {
        Ok(self.len()? >= STATE_REGION_POS + self.protocol.region_size())
    }

    /// Reads the state region.  A lock file that was never written
    /// reads as the protocol's (dirty) initial state.
    pub fn read_state(&self) -> Result<LockState> {
        if !self.has_state()? {
            return Ok(self.protocol.initial_state());
        }

        let mut region = vec![0u8; self.protocol.region_size() as usize];
        self.file.read_exact_at(&mut region, STATE_REGION_POS)?;
        self.protocol.decode(&region)
    }

    /// Persists `state` to disk before returning.
    pub fn write_state(&self, state: &LockState) -> Result<()> {
        self.file
            .write_all_at(&self.protocol.encode(state), STATE_REGION_POS)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads the information region, defaulting to "unknown" when the
    /// region is missing.
    pub fn read_info(&self) -> Result<LockInfo> {
        let pos = self.protocol.information_region_pos();
        let available = self.len()?.saturating_sub(pos).min(INFORMATION_REGION_SIZE);
        if available == 0 {
            return Ok(LockInfo::default());
        }

        let mut region = vec![0u8; available as usize];
        self.file.read_exact_at(&mut region, pos)?;
        LockInfo::decode(&region)
    }

    pub fn write_info(&self, info: &LockInfo) -> Result<()> {
        self.file
            .write_all_at(&info.encode(), self.protocol.information_region_pos())?;
        Ok(())
    }

    /// Drops the information region, leaving only the state region.
    pub fn clear_info(&self) -> Result<()> {
        let pos = self.protocol.information_region_pos();
        if self.len()? > pos {
            self.file.set_len(pos)?;
        }

        Ok(())
    }
}

#[test]
fn test_exclusive_regions_conflict() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let path = temp.path().join("test.lock");

    let first = LockFileAccess::open(&path, LockStateProtocol::Default).expect("open must succeed");
    let second = LockFileAccess::open(&path, LockStateProtocol::Default).expect("open must succeed");

    let held = first
        .try_lock_state(true)
        .expect("lock must succeed")
        .expect("region must be free");
    assert!(held.is_exclusive());

    // Open file description locks exclude other opens in this process;
    // classic record locks do not.
    #[cfg(target_os = "linux")]
    {
        assert!(second.try_lock_state(false).expect("lock must succeed").is_none());
        assert!(second.try_lock_state(true).expect("lock must succeed").is_none());
    }

    // The information region is independent of the state region.
    let info = second
        .try_lock_information(true)
        .expect("lock must succeed")
        .expect("region must be free");
    info.release().expect("release must succeed");

    held.release().expect("release must succeed");
    let again = second
        .try_lock_state(true)
        .expect("lock must succeed")
        .expect("region must be free after release");
    again.release().expect("release must succeed");
}

#[cfg(target_os = "linux")]
#[test]
fn test_shared_regions_coexist() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let path = temp.path().join("test.lock");

    let first = LockFileAccess::open(&path, LockStateProtocol::Default).expect("open must succeed");
    let second = LockFileAccess::open(&path, LockStateProtocol::Default).expect("open must succeed");

    let _a = first
        .try_lock_state(false)
        .expect("lock must succeed")
        .expect("shared lock must be granted");
    let _b = second
        .try_lock_state(false)
        .expect("lock must succeed")
        .expect("shared locks must coexist");

    assert!(second.try_lock_state(true).expect("lock must succeed").is_none());
}

#[test]
fn test_state_and_info_regions() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let access = LockFileAccess::open(&temp.path().join("x.lock"), LockStateProtocol::Default)
        .expect("open must succeed");

    assert!(!access.has_state().expect("stat must succeed"));
    assert!(access.read_state().expect("read must succeed").is_dirty());
    assert_eq!(access.read_info().expect("read must succeed"), LockInfo::default());

    let clean = LockStateProtocol::Default
        .initial_state()
        .before_update()
        .complete_update();
    access.write_state(&clean).expect("write must succeed");
    assert_eq!(access.read_state().expect("read must succeed"), clean);

    let info = LockInfo {
        port: 4242,
        lock_id: 7,
        pid: "123".to_owned(),
        operation: "testing".to_owned(),
    };
    access.write_info(&info).expect("write must succeed");
    assert_eq!(access.read_info().expect("read must succeed"), info);

    access.clear_info().expect("clear must succeed");
    assert_eq!(access.read_info().expect("read must succeed"), LockInfo::default());
    // Clearing the information region keeps the state.
    assert!(!access.read_state().expect("read must succeed").is_dirty());
}
