//! Cross-process file locks with crash detection.
//!
//! A [`FileLockManager`] locks a *target* (a cache directory or a
//! single file) through a companion lock file.  Besides mutual
//! exclusion, the lock file carries a dirty bit: every mutation of the
//! target goes through [`FileLock::write_file`] or
//! [`FileLock::update_file`], which mark the lock file dirty before
//! running and clean after.  A process that dies mid-update leaves the
//! bit set, and the next holder sees [`FileLock::unlocked_cleanly`]
//! return false.
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use parking_lot::Mutex;

use crate::backoff::ExponentialBackoff;
use crate::contention::ContendedAction;
use crate::contention::DefaultFileLockContentionHandler;
use crate::contention::FileLockContentionHandler;
use crate::error::Error;
use crate::error::Result;
use crate::lock_file_access::LockFileAccess;
use crate::lock_file_access::RegionLock;
use crate::lock_state::LockInfo;
use crate::lock_state::LockState;
use crate::lock_state::LockStateProtocol;

/// Default time to wait for a contended lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Time to wait for the information region, which is only ever held
/// briefly.
const SHORT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Many readers, across processes.
    Shared,
    /// A single reader/writer.
    Exclusive,
    /// Exclusive, but only taken when needed and handed over to other
    /// processes that ask for it.  Cache coordinators implement this
    /// mode on top of exclusive locks.
    OnDemand,
    /// No locking at all.
    None,
}

/// How to lock a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockOptions {
    mode: LockMode,
    cross_version: bool,
}

impl LockOptions {
    pub fn mode(mode: LockMode) -> LockOptions {
        LockOptions {
            mode,
            cross_version: false,
        }
    }

    /// Switches to the legacy lock file layout, which only tracks a
    /// dirty flag but is understood by every implementation.
    pub fn use_cross_version_implementation(self) -> LockOptions {
        LockOptions {
            cross_version: true,
            ..self
        }
    }

    pub fn with_mode(self, mode: LockMode) -> LockOptions {
        LockOptions { mode, ..self }
    }

    pub fn lock_mode(&self) -> LockMode {
        self.mode
    }

    pub fn is_cross_version(&self) -> bool {
        self.cross_version
    }

    fn protocol(&self) -> LockStateProtocol {
        if self.cross_version {
            LockStateProtocol::CrossVersion
        } else {
            LockStateProtocol::Default
        }
    }
}

/// Returns the lock file for `target`: `d/d.lock` for a directory `d`,
/// and the sibling `f.lock` for anything else.
pub fn lock_file_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if target.is_dir() {
        target.join(format!("{}.lock", name))
    } else {
        target.with_file_name(format!("{}.lock", name))
    }
}

/// Canonicalises `path` as far as it exists.  Targets need not exist
/// yet when they are locked.
fn canonical_target(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return Ok(canonical);
    }

    let absolute = if path.is_absolute() {
        path.to_owned()
    } else {
        std::env::current_dir()?.join(path)
    };

    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => Ok(canonical_target(parent)?.join(name)),
        _ => Ok(absolute),
    }
}

#[derive(Debug)]
struct ManagerShared {
    locked_files: Mutex<HashSet<PathBuf>>,
    pid: String,
}

/// Hands out [`FileLock`]s, and remembers which targets this process
/// already locked.  Clones share that bookkeeping.
#[derive(Clone, Debug)]
pub struct FileLockManager {
    shared: Arc<ManagerShared>,
    lock_timeout: Duration,
    contention: Arc<dyn FileLockContentionHandler>,
}

impl Default for FileLockManager {
    fn default() -> FileLockManager {
        FileLockManager::new()
    }
}

impl FileLockManager {
    /// Returns a manager with the default timeout, listening for
    /// contention on a loopback UDP port.
    pub fn new() -> FileLockManager {
        FileLockManager {
            shared: Arc::new(ManagerShared {
                locked_files: Default::default(),
                pid: std::process::id().to_string(),
            }),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            contention: Arc::new(DefaultFileLockContentionHandler::new()),
        }
    }

    pub fn with_lock_timeout(self, lock_timeout: Duration) -> FileLockManager {
        FileLockManager {
            lock_timeout,
            ..self
        }
    }

    pub fn with_contention_handler(
        self,
        contention: Arc<dyn FileLockContentionHandler>,
    ) -> FileLockManager {
        FileLockManager { contention, ..self }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Locks `target` with `options`, without an operation description
    /// or contention action.
    pub fn lock(&self, target: &Path, options: LockOptions, display_name: &str) -> Result<FileLock> {
        self.lock_with(target, options, display_name, "", None)
    }

    /// Locks `target`, blocking up to the manager's timeout.
    ///
    /// `operation` is advertised to other processes waiting for the
    /// lock.  When `when_contended` is provided, it runs (on another
    /// thread) whenever a process asks for this lock.
    pub fn lock_with(
        &self,
        target: &Path,
        options: LockOptions,
        display_name: &str,
        operation: &str,
        when_contended: Option<ContendedAction>,
    ) -> Result<FileLock> {
        match options.lock_mode() {
            LockMode::Shared | LockMode::Exclusive => {}
            mode => return Err(Error::UnsupportedMode(mode)),
        }

        let target = canonical_target(target)?;
        if !self.shared.locked_files.lock().insert(target.clone()) {
            return Err(Error::ConcurrentLock(display_name.to_owned()));
        }

        let ret = self.acquire(&target, options, display_name, operation, when_contended);
        if ret.is_err() {
            self.shared.locked_files.lock().remove(&target);
        }

        ret
    }

    fn acquire(
        &self,
        target: &Path,
        options: LockOptions,
        display_name: &str,
        operation: &str,
        when_contended: Option<ContendedAction>,
    ) -> Result<FileLock> {
        let lock_file = lock_file_for(target);
        let protocol = options.protocol();
        let access = LockFileAccess::open(&lock_file, protocol).map_err(|e| {
            tracing::info!("couldn't create lock file for {}", lock_file.display());
            e
        })?;

        let lock_id = rand::random::<i64>();
        let port = self.contention.reserve_port();
        let contended = when_contended.is_some();
        if let Some(action) = when_contended {
            self.contention.start(lock_id, action);
        }

        let exclusive = options.lock_mode() == LockMode::Exclusive;
        let acquired = self.lock_state_region(&access, exclusive, port, display_name, operation);
        let (region, state) = match acquired {
            Ok(ret) => ret,
            Err(e) => {
                if contended {
                    self.contention.stop(lock_id);
                }
                return Err(e);
            }
        };

        let lock = FileLock {
            target: target.to_owned(),
            lock_file,
            display_name: display_name.to_owned(),
            mode: if region.is_exclusive() {
                LockMode::Exclusive
            } else {
                LockMode::Shared
            },
            lock_id,
            manager: self.shared.clone(),
            contention: self.contention.clone(),
            inner: Mutex::new(LockInner {
                access: Some(access),
                region: Some(region),
                state,
            }),
        };

        if exclusive {
            let info = LockInfo {
                port,
                lock_id,
                pid: self.shared.pid.clone(),
                operation: operation.to_owned(),
            };
            lock.write_info(&info)?;
        }

        tracing::debug!("Lock acquired on {}.", display_name);
        Ok(lock)
    }

    /// Waits for the state region, pinging the current holder if we
    /// are also able to listen for pings.  Returns the region lock and
    /// the current state.
    fn lock_state_region(
        &self,
        access: &LockFileAccess,
        exclusive: bool,
        port: i32,
        display_name: &str,
        operation: &str,
    ) -> Result<(RegionLock, LockState)> {
        tracing::debug!(
            "Waiting to acquire {} lock on {}.",
            if exclusive { "exclusive" } else { "shared" },
            display_name
        );

        let mut backoff = ExponentialBackoff::new(self.lock_timeout);
        let mut last_holder_port = -1;
        let mut last_ping: Option<Duration> = None;

        let region = backoff.retry_until(|backoff| {
            if let Some(region) = access.try_lock_state(exclusive)? {
                return Ok(Some(region));
            }

            if port == -1 {
                return Ok(None);
            }

            let info = read_information_region(access)?;
            if info.port == -1 {
                tracing::debug!(
                    "The file lock for {} is held by a different process. Unable to read its contention port.",
                    display_name
                );
                return Ok(None);
            }

            if info.port != last_holder_port {
                backoff.restart_timer();
                last_holder_port = info.port;
                last_ping = None;
            }

            let since_last_ping = match last_ping {
                Some(at) => backoff.elapsed().saturating_sub(at),
                None => Duration::MAX,
            };
            if self.contention.maybe_ping_owner(
                info.port,
                info.lock_id,
                display_name,
                since_last_ping,
                backoff.signal(),
            ) {
                last_ping = Some(backoff.elapsed());
                tracing::debug!(
                    "The file lock for {} is held by a different process (pid: {}, lock id: {}). Pinged owner at port {}.",
                    display_name,
                    info.pid,
                    info.lock_id,
                    info.port
                );
            }

            Ok(None)
        })?;

        let region = match region {
            Some(region) => region,
            None => {
                let owner = read_information_region(access)?;
                return Err(Error::LockTimeout {
                    message: format!(
                        "Timeout waiting to lock {}. It is currently in use by another process.\nOwner PID: {}\nOur PID: {}\nOwner Operation: {}\nOur operation: {}\nLock file: {}",
                        display_name,
                        owner.pid,
                        self.shared.pid,
                        owner.operation,
                        operation,
                        access.path().display()
                    ),
                    lock_file: access.path().to_owned(),
                });
            }
        };

        let state = if region.is_exclusive() {
            ensure_state(access)
        } else {
            access.read_state()
        };

        match state {
            Ok(state) => Ok((region, state)),
            Err(e) => {
                let _ = region.release();
                Err(e)
            }
        }
    }
}

/// Writes the initial state if the lock file is brand new.  Requires
/// an exclusive state region lock.
fn ensure_state(access: &LockFileAccess) -> Result<LockState> {
    if access.has_state()? {
        return access.read_state();
    }

    let state = access.read_state()?;
    access.write_state(&state)?;
    Ok(state)
}

/// Reads the holder's information, or defaults if the region stays
/// locked.
fn read_information_region(access: &LockFileAccess) -> Result<LockInfo> {
    let mut backoff = ExponentialBackoff::new(SHORT_TIMEOUT);
    let region = backoff.retry_until(|_| Ok(access.try_lock_information(false)?))?;

    match region {
        Some(region) => {
            let info = access.read_info();
            region.release()?;
            info
        }
        None => {
            tracing::debug!(
                "Could not lock information region for {}. Ignoring.",
                access.path().display()
            );
            Ok(LockInfo::default())
        }
    }
}

#[derive(Debug)]
struct LockInner {
    access: Option<LockFileAccess>,
    region: Option<RegionLock>,
    state: LockState,
}

/// A held lock on a target.  Closing (or dropping) the lock releases
/// it.
///
/// Every method takes `&self`, so a lock may be shared between the
/// threads of a cache coordinator; the coordinator serialises actual
/// accesses.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct FileLock {
    target: PathBuf,
    lock_file: PathBuf,
    display_name: String,
    mode: LockMode,
    lock_id: i64,
    #[derivative(Debug = "ignore")]
    manager: Arc<ManagerShared>,
    #[derivative(Debug = "ignore")]
    contention: Arc<dyn FileLockContentionHandler>,
    inner: Mutex<LockInner>,
}

impl FileLock {
    /// Either `Shared` or `Exclusive`.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    /// Returns whether `path` is this lock's lock file.
    pub fn is_lock_file(&self, path: &Path) -> bool {
        path == self.lock_file
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().access.is_some()
    }

    pub fn state(&self) -> Result<LockState> {
        let inner = self.inner.lock();
        if inner.access.is_none() {
            return Err(Error::LockClosed);
        }

        Ok(inner.state)
    }

    /// Returns false if the last writer did not finish its update.
    pub fn unlocked_cleanly(&self) -> Result<bool> {
        Ok(!self.state()?.is_dirty())
    }

    fn assert_integral(&self) -> Result<()> {
        if self.state()?.is_dirty() {
            return Err(Error::FileIntegrityViolation(self.target.clone()));
        }

        Ok(())
    }

    fn write_info(&self, info: &LockInfo) -> Result<()> {
        let inner = self.inner.lock();
        let access = inner.access.as_ref().ok_or(Error::LockClosed)?;

        let mut backoff = ExponentialBackoff::new(SHORT_TIMEOUT);
        let region = backoff
            .retry_until(|_| Ok(access.try_lock_information(true)?))?
            .ok_or_else(|| {
                Error::illegal_state(format!(
                    "Unable to lock the information region for {}",
                    self.display_name
                ))
            })?;

        let ret = access.write_info(info);
        region.release()?;
        ret
    }

    /// Persists `update(current state)` as the new state.
    fn transition(&self, update: impl FnOnce(&LockState) -> LockState) -> Result<()> {
        let mut inner = self.inner.lock();
        let next = update(&inner.state);
        inner
            .access
            .as_ref()
            .ok_or(Error::LockClosed)?
            .write_state(&next)?;
        inner.state = next;
        Ok(())
    }

    fn write_action<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.mode != LockMode::Exclusive {
            return Err(Error::InsufficientLockMode);
        }

        self.transition(LockState::before_update)?;
        // A failed action leaves the state dirty.
        let value = action()?;
        self.transition(LockState::complete_update)?;
        Ok(value)
    }

    /// Runs a read of the target.  Fails if the lock is closed or the
    /// last writer crashed.
    pub fn read_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.assert_integral()?;
        action()
    }

    /// Runs an update of existing, intact, contents.
    pub fn update_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.assert_integral()?;
        self.write_action(action)
    }

    /// Runs a write that does not care about the previous contents,
    /// e.g., reinitialisation after a crash.
    pub fn write_file<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.state()?;
        self.write_action(action)
    }

    /// Releases the lock.  Closing a closed lock is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let access = match inner.access.take() {
            Some(access) => access,
            None => return Ok(()),
        };

        tracing::debug!("Releasing lock on {}.", self.display_name);
        self.contention.stop(self.lock_id);
        self.manager.locked_files.lock().remove(&self.target);

        let region = inner.region.take();
        drop(inner);

        let mut ret = Ok(());
        if self.mode == LockMode::Exclusive {
            let mut backoff = ExponentialBackoff::new(SHORT_TIMEOUT);
            match backoff.retry_until(|_| Ok(access.try_lock_information(true)?)) {
                Ok(Some(info)) => {
                    ret = access.clear_info();
                    let _ = info.release();
                }
                Ok(None) => {}
                Err(e) => ret = Err(e),
            }
        }

        if let Some(region) = region {
            let _ = region.release();
        }

        // Dropping `access` closes the file, which releases anything left.
        drop(access);
        ret
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("failed to release lock on {}: {}", self.display_name, e);
        }
    }
}

#[cfg(test)]
fn test_manager() -> FileLockManager {
    FileLockManager::new().with_lock_timeout(Duration::from_millis(300))
}

#[test]
fn test_lock_file_location() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("cache", FileType::Dir)
        .create("data.bin", FileType::ZeroFile(1));

    assert_eq!(
        lock_file_for(&temp.path("cache")),
        temp.path("cache").join("cache.lock")
    );
    assert_eq!(lock_file_for(&temp.path("data.bin")), temp.path("data.bin.lock"));
}

#[test]
fn test_unsupported_modes() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let manager = test_manager();

    for mode in [LockMode::None, LockMode::OnDemand] {
        assert!(matches!(
            manager.lock(temp.path(), LockOptions::mode(mode), "test"),
            Err(Error::UnsupportedMode(m)) if m == mode
        ));
    }
}

/// A brand new lock file reads as dirty, and a clean write cycle fixes
/// that.  Dirty state persists across locks.
#[test]
fn test_dirty_bit_lifecycle() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let target = temp.path("cache");
    let manager = test_manager();

    let lock = manager
        .lock(&target, LockOptions::mode(LockMode::Exclusive), "cache")
        .expect("lock must succeed");
    assert_eq!(lock.mode(), LockMode::Exclusive);
    assert!(!lock.unlocked_cleanly().expect("lock is open"));
    assert!(matches!(
        lock.read_file(|| Ok(())),
        Err(Error::FileIntegrityViolation(_))
    ));

    lock.write_file(|| Ok(())).expect("write must succeed");
    assert!(lock.unlocked_cleanly().expect("lock is open"));
    assert_eq!(lock.read_file(|| Ok(5)).expect("read must succeed"), 5);
    lock.close().expect("close must succeed");
    lock.close().expect("second close is a no-op");
    assert!(matches!(lock.state(), Err(Error::LockClosed)));

    let lock = manager
        .lock(&target, LockOptions::mode(LockMode::Exclusive), "cache")
        .expect("lock must succeed");
    assert!(lock.unlocked_cleanly().expect("lock is open"));

    // A failing writer leaves the lock dirty for the next holder.
    assert!(lock
        .update_file(|| -> Result<()> { Err(Error::illegal_state("crash")) })
        .is_err());
    drop(lock);

    let lock = manager
        .lock(&target, LockOptions::mode(LockMode::Shared), "cache")
        .expect("lock must succeed");
    assert_eq!(lock.mode(), LockMode::Shared);
    assert!(!lock.unlocked_cleanly().expect("lock is open"));
}

#[test]
fn test_shared_lock_cannot_write() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let lock = test_manager()
        .lock(temp.path(), LockOptions::mode(LockMode::Shared), "test")
        .expect("lock must succeed");

    assert!(matches!(
        lock.write_file(|| Ok(())),
        Err(Error::InsufficientLockMode)
    ));
}

#[test]
fn test_concurrent_lock_in_same_manager() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let manager = test_manager();

    let lock = manager
        .lock(temp.path(), LockOptions::mode(LockMode::Exclusive), "test")
        .expect("lock must succeed");
    assert!(matches!(
        manager.lock(temp.path(), LockOptions::mode(LockMode::Shared), "test"),
        Err(Error::ConcurrentLock(_))
    ));

    lock.close().expect("close must succeed");
    manager
        .lock(temp.path(), LockOptions::mode(LockMode::Shared), "test")
        .expect("lock must succeed once released");
}

/// Two managers behave like two processes: an exclusive holder makes
/// the other time out with a message naming the owner.
#[cfg(target_os = "linux")]
#[test]
fn test_timeout_names_owner() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");

    let _held = test_manager()
        .lock_with(
            temp.path(),
            LockOptions::mode(LockMode::Exclusive),
            "test cache",
            "holding on",
            None,
        )
        .expect("lock must succeed");

    match test_manager().lock_with(
        temp.path(),
        LockOptions::mode(LockMode::Shared),
        "test cache",
        "waiting",
        None,
    ) {
        Err(Error::LockTimeout { message, lock_file }) => {
            assert!(message.starts_with("Timeout waiting to lock test cache."));
            assert!(message.contains(&format!("Owner PID: {}", std::process::id())));
            assert!(message.contains("Owner Operation: holding on"));
            assert!(message.contains("Our operation: waiting"));
            assert_eq!(lock_file, lock_file_for(temp.path()));
        }
        other => panic!("expected a lock timeout, got {:?}", other),
    }
}

/// A holder with a contention action releases on request, and the
/// waiter gets the lock well before its timeout.
#[cfg(target_os = "linux")]
#[test]
fn test_contended_lock_is_handed_over() {
    use crate::contention::FileLockReleasedSignal;

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let owner = FileLockManager::new();
    let slot: Arc<Mutex<Option<FileLock>>> = Default::default();

    let release = slot.clone();
    let lock = owner
        .lock_with(
            temp.path(),
            LockOptions::mode(LockMode::Exclusive),
            "handover",
            "owner",
            Some(Arc::new(move |signal: FileLockReleasedSignal| {
                if let Some(lock) = release.lock().take() {
                    let _ = lock.close();
                }
                signal.trigger();
            })),
        )
        .expect("lock must succeed");
    *slot.lock() = Some(lock);

    let waiter = FileLockManager::new().with_lock_timeout(Duration::from_secs(30));
    let started = std::time::Instant::now();
    let lock = waiter
        .lock_with(
            temp.path(),
            LockOptions::mode(LockMode::Exclusive),
            "handover",
            "waiter",
            Some(Arc::new(|_: FileLockReleasedSignal| {})),
        )
        .expect("lock must be handed over");

    assert_eq!(lock.mode(), LockMode::Exclusive);
    assert!(started.elapsed() < Duration::from_secs(20));
}
