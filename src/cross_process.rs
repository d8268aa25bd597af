//! How a cache coordinator holds its cross-process file lock.
//!
//! * No locking: actions run directly.
//! * Fixed (shared or exclusive): the lock is taken when the cache
//!   opens and released when it closes.
//! * On demand: an exclusive lock is taken the first time it is needed,
//!   and kept until another process asks for it.  The lock is then
//!   released as soon as no unit of work uses it anymore.
//!
//! Whichever strategy applies, the coordinator hears about every
//! acquisition and release through its [`LockListener`].
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::async_cache::AsyncIndexedCache;
use crate::contention::ContendedAction;
use crate::contention::FileLockReleasedSignal;
use crate::error::Error;
use crate::error::Result;
use crate::file_lock::FileLock;
use crate::file_lock::FileLockManager;
use crate::file_lock::LockMode;
use crate::file_lock::LockOptions;
use crate::indexed_cache::CacheKey;
use crate::indexed_cache::CacheValue;
use crate::indexed_cache::IndexedCache;
use crate::indexed_cache::UnitOfWorkParticipant;
use crate::lock_state::LockState;

/// Number of exclusive initialisation attempts before a shared open
/// gives up.
const SHARED_INIT_ATTEMPTS: usize = 3;

/// Prepares a cache directory's contents, e.g., after a crash left the
/// lock dirty or the directory was created from scratch.
pub trait CacheInitializationAction: Send + Sync {
    fn requires_initialization(&self, lock: &FileLock) -> Result<bool>;

    /// Runs under an exclusive lock, inside [`FileLock::write_file`].
    fn initialize(&self, lock: &FileLock) -> Result<()>;
}

/// For caches whose contents need no preparation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoInitialization;

impl CacheInitializationAction for NoInitialization {
    fn requires_initialization(&self, _lock: &FileLock) -> Result<bool> {
        Ok(false)
    }

    fn initialize(&self, _lock: &FileLock) -> Result<()> {
        Ok(())
    }
}

/// The coordinator's side of lock acquisition and release.
pub(crate) trait LockListener: Send + Sync {
    fn after_lock_acquire(&self, lock: &Arc<FileLock>) -> Result<()>;

    /// May refuse, e.g., when another thread owns the coordinator; the
    /// lock is then kept for now.  Once accepted, the release goes
    /// ahead, and the inner result reports whether pending work was
    /// flushed.
    fn before_lock_release(&self, lock: &Arc<FileLock>) -> Result<Result<()>>;

    /// Called when an unlocked cache closes.
    fn finish_work(&self) -> Result<()>;
}

fn initialize_if_needed(lock: &FileLock, initializer: &dyn CacheInitializationAction) -> Result<()> {
    if initializer.requires_initialization(lock)? {
        lock.write_file(|| initializer.initialize(lock))?;
    }

    Ok(())
}

pub(crate) struct LockContext {
    pub display_name: String,
    pub lock_target: PathBuf,
    pub lock_options: LockOptions,
    pub lock_manager: FileLockManager,
    pub initializer: Arc<dyn CacheInitializationAction>,
    pub listener: Weak<dyn LockListener>,
}

impl LockContext {
    fn listener(&self) -> Result<Arc<dyn LockListener>> {
        self.listener.upgrade().ok_or_else(|| {
            Error::illegal_state(format!("{} has been closed.", self.display_name))
        })
    }

    fn lock(&self, mode: LockMode, when_contended: Option<ContendedAction>) -> Result<FileLock> {
        self.lock_manager.lock_with(
            &self.lock_target,
            self.lock_options.with_mode(mode),
            &self.display_name,
            "",
            when_contended,
        )
    }

    /// Notifies the listener of a fresh lock.  The lock is closed if the
    /// listener fails.
    fn acquired(&self, lock: FileLock) -> Result<Arc<FileLock>> {
        let lock = Arc::new(lock);
        if let Err(e) = self.listener().and_then(|listener| listener.after_lock_acquire(&lock)) {
            let _ = lock.close();
            return Err(e);
        }

        Ok(lock)
    }
}

/// Keeps the lock for as long as the cache is open.
pub(crate) struct FixedLockAccess {
    context: LockContext,
    lock: Mutex<Option<Arc<FileLock>>>,
}

impl FixedLockAccess {
    pub fn new(context: LockContext) -> FixedLockAccess {
        FixedLockAccess {
            context,
            lock: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<()> {
        let mut slot = self.lock.lock();
        if slot.is_some() {
            return Err(Error::illegal_state(format!(
                "{} is already open.",
                self.context.display_name
            )));
        }

        let lock = match self.context.lock_options.lock_mode() {
            LockMode::Shared => self.open_shared()?,
            _ => {
                let lock = self.context.lock(LockMode::Exclusive, None)?;
                initialize_if_needed(&lock, self.context.initializer.as_ref())?;
                lock
            }
        };

        *slot = Some(self.context.acquired(lock)?);
        Ok(())
    }

    /// Takes a shared lock on initialised contents, upgrading to an
    /// exclusive lock for initialisation when needed.
    fn open_shared(&self) -> Result<FileLock> {
        let initializer = self.context.initializer.as_ref();
        let mut lock = self.context.lock(LockMode::Shared, None)?;

        for _ in 0..SHARED_INIT_ATTEMPTS {
            if !initializer.requires_initialization(&lock)? {
                return Ok(lock);
            }

            lock.close()?;
            let exclusive = self.context.lock(LockMode::Exclusive, None)?;
            initialize_if_needed(&exclusive, initializer)?;
            exclusive.close()?;

            lock = self.context.lock(LockMode::Shared, None)?;
        }

        if initializer.requires_initialization(&lock)? {
            return Err(Error::illegal_state(format!(
                "Failed to initialize {}",
                self.context.display_name
            )));
        }

        Ok(lock)
    }

    fn close(&self) -> Result<()> {
        let lock = match self.lock.lock().take() {
            Some(lock) => lock,
            None => return Ok(()),
        };

        let flushed = self
            .context
            .listener()
            .and_then(|listener| listener.before_lock_release(&lock))
            .and_then(|flushed| flushed);
        let closed = lock.close();
        flushed.and(closed)
    }
}

#[derive(Default)]
struct OnDemandState {
    lock: Option<Arc<FileLock>>,
    // Outstanding `FileLockRelease`s.
    usages: usize,
    // Another process asked for the lock while it was in use.
    contended: bool,
    release_signal: Option<FileLockReleasedSignal>,
}

/// Takes an exclusive lock on first use, and gives it up when another
/// process asks for it and nobody here is using it.
pub(crate) struct OnDemandLockAccess {
    context: LockContext,
    state: Mutex<OnDemandState>,
    me: Weak<OnDemandLockAccess>,
}

impl OnDemandLockAccess {
    pub fn new(context: LockContext) -> Arc<OnDemandLockAccess> {
        Arc::new_cyclic(|me| OnDemandLockAccess {
            context,
            state: Default::default(),
            me: me.clone(),
        })
    }

    fn acquire(&self) -> Result<FileLockRelease> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::illegal_state("lock access is shutting down"))?;
        let mut state = self.state.lock();

        if state.lock.is_none() {
            let weak = self.me.clone();
            let when_contended: ContendedAction = Arc::new(move |signal: FileLockReleasedSignal| {
                match weak.upgrade() {
                    Some(access) => access.when_contended(signal),
                    None => signal.trigger(),
                }
            });

            let lock = self.context.lock(LockMode::Exclusive, Some(when_contended))?;
            initialize_if_needed(&lock, self.context.initializer.as_ref())?;
            state.lock = Some(self.context.acquired(lock)?);
        }

        state.usages += 1;
        Ok(FileLockRelease(Some(me)))
    }

    fn release_usage(&self) {
        let mut state = self.state.lock();
        state.usages = state.usages.saturating_sub(1);

        if state.usages == 0 && state.contended {
            if let Err(e) = self.release_lock(&mut state, false) {
                self.log_release_failure(&state, &e);
            }
        }
    }

    fn log_release_failure(&self, state: &OnDemandState, error: &Error) {
        if state.lock.is_some() {
            tracing::debug!(
                "Cannot release lock on {} yet: {}",
                self.context.display_name,
                error
            );
        } else {
            tracing::warn!(
                "Released lock on {} with unflushed work: {}",
                self.context.display_name,
                error
            );
        }
    }

    /// Releases the lock if held.  Unless `force`d, a listener refusal
    /// keeps the lock.  A failure to flush does not keep the lock, but
    /// is still returned.
    fn release_lock(&self, state: &mut OnDemandState, force: bool) -> Result<()> {
        let lock = match &state.lock {
            Some(lock) => lock.clone(),
            None => return Ok(()),
        };

        let flushed = match self
            .context
            .listener()
            .and_then(|listener| listener.before_lock_release(&lock))
        {
            Ok(flushed) => flushed,
            Err(e) if !force => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "Failed to notify {} of lock release: {}",
                    self.context.display_name,
                    e
                );
                Ok(())
            }
        };

        state.lock = None;
        state.contended = false;
        let closed = lock.close();
        if let Some(signal) = state.release_signal.take() {
            signal.trigger();
        }

        flushed.and(closed)
    }

    fn when_contended(&self, signal: FileLockReleasedSignal) {
        let mut state = self.state.lock();

        if state.usages == 0 {
            tracing::debug!(
                "Lock on {} requested by another process - releasing lock.",
                self.context.display_name
            );
            let released = self.release_lock(&mut state, false);
            if let Err(e) = &released {
                self.log_release_failure(&state, e);
            }

            if state.lock.is_none() {
                signal.trigger();
                return;
            }
        } else {
            tracing::debug!(
                "Cache {} is currently in use by another thread. Will release lock later.",
                self.context.display_name
            );
        }

        state.contended = true;
        state.release_signal = Some(signal);
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let ret = self.release_lock(&mut state, true);
        state.usages = 0;
        ret
    }

    #[cfg(test)]
    fn is_locked(&self) -> bool {
        self.state.lock().lock.is_some()
    }
}

/// Gives back one use of an on-demand lock when dropped.  Releases of
/// fixed or absent locks do nothing.
#[must_use]
pub(crate) struct FileLockRelease(Option<Arc<OnDemandLockAccess>>);

impl FileLockRelease {
    fn noop() -> FileLockRelease {
        FileLockRelease(None)
    }
}

impl Drop for FileLockRelease {
    fn drop(&mut self) {
        if let Some(access) = self.0.take() {
            access.release_usage();
        }
    }
}

#[derive(Clone)]
pub(crate) enum CrossProcessCacheAccess {
    NoLocking(Weak<dyn LockListener>),
    Fixed(Arc<FixedLockAccess>),
    OnDemand(Arc<OnDemandLockAccess>),
}

impl CrossProcessCacheAccess {
    /// Picks the strategy for `context.lock_options`.
    pub fn new(context: LockContext) -> CrossProcessCacheAccess {
        match context.lock_options.lock_mode() {
            LockMode::None => CrossProcessCacheAccess::NoLocking(context.listener),
            LockMode::OnDemand => CrossProcessCacheAccess::OnDemand(OnDemandLockAccess::new(context)),
            LockMode::Shared | LockMode::Exclusive => {
                CrossProcessCacheAccess::Fixed(Arc::new(FixedLockAccess::new(context)))
            }
        }
    }

    pub fn open(&self) -> Result<()> {
        match self {
            CrossProcessCacheAccess::Fixed(access) => access.open(),
            _ => Ok(()),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            CrossProcessCacheAccess::NoLocking(listener) => match listener.upgrade() {
                Some(listener) => listener.finish_work(),
                None => Ok(()),
            },
            CrossProcessCacheAccess::Fixed(access) => access.close(),
            CrossProcessCacheAccess::OnDemand(access) => access.close(),
        }
    }

    /// Makes sure the lock is held until the returned guard drops.
    pub fn acquire_file_lock(&self) -> Result<FileLockRelease> {
        match self {
            CrossProcessCacheAccess::OnDemand(access) => access.acquire(),
            _ => Ok(FileLockRelease::noop()),
        }
    }

    pub fn with_file_lock<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        let _release = self.acquire_file_lock()?;
        action()
    }
}

/// The outermost layer of a decorated cache: every operation holds the
/// file lock, and writes keep holding it until the (possibly deferred)
/// write is done.
pub(crate) struct CrossProcessSynchronizingCache<K, V> {
    cross_process: CrossProcessCacheAccess,
    inner: Arc<dyn AsyncIndexedCache<K, V>>,
}

impl<K, V> CrossProcessSynchronizingCache<K, V> {
    pub fn new(
        cross_process: CrossProcessCacheAccess,
        inner: Arc<dyn AsyncIndexedCache<K, V>>,
    ) -> CrossProcessSynchronizingCache<K, V> {
        CrossProcessSynchronizingCache {
            cross_process,
            inner,
        }
    }
}

impl<K: CacheKey, V: CacheValue> IndexedCache<K, V> for CrossProcessSynchronizingCache<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        self.cross_process.with_file_lock(|| self.inner.get(key))
    }

    fn get_or_create(&self, key: &K, producer: &dyn Fn(&K) -> Result<V>) -> Result<V> {
        let release = self.cross_process.acquire_file_lock()?;
        self.inner.get_or_create(key, producer, release.into())
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        let release = self.cross_process.acquire_file_lock()?;
        self.inner.put_later(key, value, release.into())
    }

    fn remove(&self, key: &K) -> Result<()> {
        let release = self.cross_process.acquire_file_lock()?;
        self.inner.remove_later(key, release.into())
    }
}

impl<K, V> UnitOfWorkParticipant for CrossProcessSynchronizingCache<K, V> {
    fn after_lock_acquire(&self, current: &LockState) {
        self.inner.after_lock_acquire(current)
    }

    fn finish_work(&self) -> Result<()> {
        self.inner.finish_work()
    }

    fn before_lock_release(&self, current: &LockState) {
        self.inner.before_lock_release(current)
    }
}

#[cfg(test)]
#[derive(Default)]
struct RecordingListener {
    acquired: Mutex<Vec<LockMode>>,
    released: std::sync::atomic::AtomicUsize,
    finished: std::sync::atomic::AtomicUsize,
    fail_flush: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl LockListener for RecordingListener {
    fn after_lock_acquire(&self, lock: &Arc<FileLock>) -> Result<()> {
        self.acquired.lock().push(lock.mode());
        Ok(())
    }

    fn before_lock_release(&self, _lock: &Arc<FileLock>) -> Result<Result<()>> {
        self.released
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_flush.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(Err(Error::illegal_state("flush failed")));
        }

        Ok(Ok(()))
    }

    fn finish_work(&self) -> Result<()> {
        self.finished
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// Initialises dirty caches, and counts how often it did.
#[cfg(test)]
#[derive(Default)]
struct CountingInitializer(std::sync::atomic::AtomicUsize);

#[cfg(test)]
impl CacheInitializationAction for CountingInitializer {
    fn requires_initialization(&self, lock: &FileLock) -> Result<bool> {
        Ok(!lock.unlocked_cleanly()?)
    }

    fn initialize(&self, _lock: &FileLock) -> Result<()> {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
fn test_context(
    target: &std::path::Path,
    mode: LockMode,
    initializer: Arc<dyn CacheInitializationAction>,
    listener: &Arc<RecordingListener>,
) -> LockContext {
    let listener: Arc<dyn LockListener> = listener.clone();
    LockContext {
        display_name: "test cache".to_owned(),
        lock_target: target.to_owned(),
        lock_options: LockOptions::mode(mode),
        lock_manager: FileLockManager::new(),
        initializer,
        listener: Arc::downgrade(&listener),
    }
}

#[test]
fn test_fixed_exclusive_initializes_once() {
    use std::sync::atomic::Ordering;

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let listener = Arc::new(RecordingListener::default());
    let initializer = Arc::new(CountingInitializer::default());

    for _ in 0..2 {
        let access = CrossProcessCacheAccess::new(test_context(
            temp.path(),
            LockMode::Exclusive,
            initializer.clone(),
            &listener,
        ));
        access.open().expect("open must succeed");
        assert!(access.open().is_err());
        access.close().expect("close must succeed");
    }

    assert_eq!(initializer.0.load(Ordering::SeqCst), 1);
    assert_eq!(
        *listener.acquired.lock(),
        vec![LockMode::Exclusive, LockMode::Exclusive]
    );
    assert_eq!(listener.released.load(Ordering::SeqCst), 2);
}

/// A shared open of a dirty cache initialises under an exclusive lock,
/// then settles on a shared lock.
#[test]
fn test_fixed_shared_upgrades_to_initialize() {
    use std::sync::atomic::Ordering;

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let listener = Arc::new(RecordingListener::default());
    let initializer = Arc::new(CountingInitializer::default());

    let access = CrossProcessCacheAccess::new(test_context(
        temp.path(),
        LockMode::Shared,
        initializer.clone(),
        &listener,
    ));
    access.open().expect("open must succeed");

    assert_eq!(initializer.0.load(Ordering::SeqCst), 1);
    assert_eq!(*listener.acquired.lock(), vec![LockMode::Shared]);
    access.close().expect("close must succeed");
}

#[test]
fn test_no_locking_finishes_work_on_close() {
    use std::sync::atomic::Ordering;

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let listener = Arc::new(RecordingListener::default());
    let access = CrossProcessCacheAccess::new(test_context(
        temp.path(),
        LockMode::None,
        Arc::new(NoInitialization),
        &listener,
    ));

    access.open().expect("open must succeed");
    assert_eq!(access.with_file_lock(|| Ok(7)).expect("must succeed"), 7);
    access.close().expect("close must succeed");

    assert!(listener.acquired.lock().is_empty());
    assert_eq!(listener.finished.load(Ordering::SeqCst), 1);
    assert!(!crate::file_lock::lock_file_for(temp.path()).exists());
}

/// An on-demand lock survives the end of its use, and is only released
/// on close.
#[test]
fn test_on_demand_keeps_lock_until_close() {
    use std::sync::atomic::Ordering;

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let listener = Arc::new(RecordingListener::default());
    let access = OnDemandLockAccess::new(test_context(
        temp.path(),
        LockMode::OnDemand,
        Arc::new(NoInitialization),
        &listener,
    ));

    assert!(!access.is_locked());
    {
        let _outer = access.acquire().expect("acquire must succeed");
        let _inner = access.acquire().expect("nested acquire must succeed");
        assert!(access.is_locked());
    }

    assert!(access.is_locked());
    assert_eq!(*listener.acquired.lock(), vec![LockMode::Exclusive]);
    assert_eq!(listener.released.load(Ordering::SeqCst), 0);

    access.close().expect("close must succeed");
    assert!(!access.is_locked());
    assert_eq!(listener.released.load(Ordering::SeqCst), 1);
}

/// A failure to flush on release is reported, but the lock is released
/// regardless.
#[test]
fn test_flush_failure_is_reported_and_releases() {
    use std::sync::atomic::Ordering;

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let listener = Arc::new(RecordingListener::default());
    listener.fail_flush.store(true, Ordering::SeqCst);

    let on_demand = OnDemandLockAccess::new(test_context(
        temp.path(),
        LockMode::OnDemand,
        Arc::new(NoInitialization),
        &listener,
    ));
    drop(on_demand.acquire().expect("acquire must succeed"));
    assert!(on_demand.close().is_err());
    assert!(!on_demand.is_locked());

    let fixed = CrossProcessCacheAccess::new(test_context(
        temp.path(),
        LockMode::Exclusive,
        Arc::new(NoInitialization),
        &listener,
    ));
    fixed.open().expect("open must succeed");
    assert!(fixed.close().is_err());

    listener.fail_flush.store(false, Ordering::SeqCst);
    let reopened = CrossProcessCacheAccess::new(test_context(
        temp.path(),
        LockMode::Exclusive,
        Arc::new(NoInitialization),
        &listener,
    ));
    reopened.open().expect("the lock must have been released");
    reopened.close().expect("close must succeed");
    assert_eq!(listener.released.load(Ordering::SeqCst), 3);
}

/// Another process pinging for an idle on-demand lock gets it.
#[cfg(target_os = "linux")]
#[test]
fn test_on_demand_releases_when_contended() {
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let listener = Arc::new(RecordingListener::default());
    let access = OnDemandLockAccess::new(test_context(
        temp.path(),
        LockMode::OnDemand,
        Arc::new(NoInitialization),
        &listener,
    ));
    drop(access.acquire().expect("acquire must succeed"));
    assert!(access.is_locked());

    let started = Instant::now();
    let other = FileLockManager::new()
        .with_lock_timeout(Duration::from_secs(30))
        .lock_with(
            temp.path(),
            LockOptions::mode(LockMode::Exclusive),
            "test cache",
            "other process",
            Some(Arc::new(|_: FileLockReleasedSignal| {})),
        )
        .expect("lock must be handed over");

    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(!access.is_locked());
    assert_eq!(listener.released.load(Ordering::SeqCst), 1);
    drop(other);
}
