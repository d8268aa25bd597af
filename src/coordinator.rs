//! The per-directory cache coordinator.
//!
//! A [`CacheCoordinator`] owns everything about one cache directory
//! that is shared between threads: the cross-process file lock, the
//! background write worker, thread ownership, and the registry of named
//! indexed caches.  Threads do their work in units of work
//! ([`CacheCoordinator::use_cache`]); units of work are mutually
//! exclusive across threads and reentrant within one.
use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::async_cache::CacheAccessWorker;
use crate::async_cache::ExclusiveAccess;
use crate::cleanup::CacheCleanupExecutor;
use crate::cross_process::CacheInitializationAction;
use crate::cross_process::CrossProcessCacheAccess;
use crate::cross_process::FileLockRelease;
use crate::cross_process::LockContext;
use crate::cross_process::LockListener;
use crate::cross_process::NoInitialization;
use crate::decorator::CacheDecorator;
use crate::error::Error;
use crate::error::Result;
use crate::file_access::FileAccess;
use crate::file_access::LockHolder;
use crate::file_lock::FileLock;
use crate::file_lock::FileLockManager;
use crate::file_lock::LockMode;
use crate::file_lock::LockOptions;
use crate::indexed_cache::CacheKey;
use crate::indexed_cache::CacheValue;
use crate::indexed_cache::DefaultMultiProcessSafeIndexedCache;
use crate::indexed_cache::IndexedCacheParameters;
use crate::indexed_cache::MultiProcessSafeIndexedCache;
use crate::indexed_cache::Participant;
use crate::indexed_cache::PersistentIndexedCache;
use crate::indexed_cache::UnitOfWorkParticipant;
use crate::lock_state::LockState;
use crate::ownership::Ownership;
use crate::serializer::SerializerIdentity;

#[derive(Default)]
struct CoordinatorState {
    open: bool,
    // The lock use taken by the outermost `use_cache` of the owner.
    held_by_owner: Option<FileLockRelease>,
    closed_count: usize,
    already_cleaned: bool,
}

struct CurrentLock {
    lock: Arc<FileLock>,
    state_at_open: LockState,
}

fn decorator_name(decorator: Option<&CacheDecorator>) -> String {
    match decorator {
        Some(decorator) => decorator.to_string(),
        None => "none".to_owned(),
    }
}

/// A registered indexed cache, and the parameters it was created with.
struct CacheEntry {
    key_type: (TypeId, &'static str),
    value_type: (TypeId, &'static str),
    key_serializer: SerializerIdentity,
    value_serializer: SerializerIdentity,
    decorator: Option<CacheDecorator>,
    // An `Arc<dyn MultiProcessSafeIndexedCache<K, V>>`.
    cache: Box<dyn Any + Send + Sync>,
    participant: Arc<dyn UnitOfWorkParticipant>,
}

impl CacheEntry {
    fn new<K: CacheKey, V: CacheValue>(
        parameters: &IndexedCacheParameters<K, V>,
        cache: Arc<dyn MultiProcessSafeIndexedCache<K, V>>,
    ) -> CacheEntry {
        CacheEntry {
            key_type: (TypeId::of::<K>(), std::any::type_name::<K>()),
            value_type: (TypeId::of::<V>(), std::any::type_name::<V>()),
            key_serializer: parameters.key_serializer_identity(),
            value_serializer: parameters.value_serializer_identity(),
            decorator: parameters.cache_decorator().cloned(),
            participant: Arc::new(Participant(cache.clone())),
            cache: Box::new(cache),
        }
    }

    /// Returns the registered cache if `parameters` are compatible with
    /// the ones it was created with.
    fn reuse<K: CacheKey, V: CacheValue>(
        &self,
        parameters: &IndexedCacheParameters<K, V>,
    ) -> Result<PersistentIndexedCache<K, V>> {
        let mut mismatches = Vec::new();

        if self.key_type.0 != TypeId::of::<K>() {
            mismatches.push(format!(
                " * Requested key type ({}) doesn't match current cache type ({})",
                std::any::type_name::<K>(),
                self.key_type.1
            ));
        }
        if self.value_type.0 != TypeId::of::<V>() {
            mismatches.push(format!(
                " * Requested value type ({}) doesn't match current cache type ({})",
                std::any::type_name::<V>(),
                self.value_type.1
            ));
        }
        if self.key_serializer != parameters.key_serializer_identity() {
            mismatches.push(format!(
                " * Requested key serializer type ({}) doesn't match current cache type ({})",
                parameters.key_serializer_identity(),
                self.key_serializer
            ));
        }
        if self.value_serializer != parameters.value_serializer_identity() {
            mismatches.push(format!(
                " * Requested value serializer type ({}) doesn't match current cache type ({})",
                parameters.value_serializer_identity(),
                self.value_serializer
            ));
        }
        if self.decorator.as_ref() != parameters.cache_decorator() {
            mismatches.push(format!(
                " * Requested cache decorator type ({}) doesn't match current cache type ({})",
                decorator_name(parameters.cache_decorator()),
                decorator_name(self.decorator.as_ref())
            ));
        }

        if !mismatches.is_empty() {
            return Err(Error::InvalidCacheReuse {
                name: parameters.cache_name().to_owned(),
                mismatches: mismatches.join("\n"),
            });
        }

        self.cache
            .downcast_ref::<Arc<dyn MultiProcessSafeIndexedCache<K, V>>>()
            .map(|cache| PersistentIndexedCache::new(cache.clone()))
            .ok_or_else(|| {
                Error::illegal_state(format!(
                    "Cache '{}' is registered with another type",
                    parameters.cache_name()
                ))
            })
    }
}

pub(crate) struct CoordinatorInner {
    display_name: String,
    base_dir: PathBuf,
    ownership: Ownership,
    state: Mutex<CoordinatorState>,
    current_lock: Mutex<Option<CurrentLock>>,
    caches: Mutex<HashMap<String, CacheEntry>>,
    cross_process: CrossProcessCacheAccess,
    file_access: FileAccess,
    worker: Mutex<Option<Arc<CacheAccessWorker>>>,
    cleanup: Option<Arc<dyn CacheCleanupExecutor>>,
    me: Weak<CoordinatorInner>,
}

impl CoordinatorInner {
    fn use_cache<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        let _ownership = self.ownership.acquire();
        if !self.state.lock().open {
            return Err(Error::illegal_state(format!(
                "{} is not open.",
                self.display_name
            )));
        }

        let started = self.on_start_work()?;
        let _end = started.then(|| EndOfWork(self));
        action()
    }

    /// Takes a use of the file lock for the outermost unit of work.
    /// Only the owner calls this.
    fn on_start_work(&self) -> Result<bool> {
        if self.state.lock().held_by_owner.is_some() {
            return Ok(false);
        }

        let release = self.cross_process.acquire_file_lock()?;
        self.state.lock().held_by_owner = Some(release);
        Ok(true)
    }

    fn on_end_work(&self) {
        let release = self.state.lock().held_by_owner.take();
        // May release the lock, which calls back into `before_lock_release`.
        drop(release);
    }

    fn participants(&self) -> Vec<Arc<dyn UnitOfWorkParticipant>> {
        self.caches
            .lock()
            .values()
            .map(|entry| entry.participant.clone())
            .collect()
    }

    fn notify_finish(&self) -> Result<()> {
        let mut ret = Ok(());
        for participant in self.participants() {
            if let Err(e) = participant.finish_work() {
                tracing::warn!("{} failed to flush a cache: {}", self.display_name, e);
                if ret.is_ok() {
                    ret = Err(e);
                }
            }
        }

        ret
    }

    fn worker(&self) -> Result<Arc<CacheAccessWorker>> {
        let mut worker = self.worker.lock();
        if let Some(worker) = &*worker {
            return Ok(worker.clone());
        }

        let access: Weak<dyn ExclusiveAccess> = self.me.clone();
        let created = CacheAccessWorker::start(&self.display_name, access)?;
        *worker = Some(created.clone());
        Ok(created)
    }

    /// Runs the cleanup executor under the file lock, unless it already
    /// ran for this coordinator.
    fn clean_up_once(&self) -> Result<()> {
        let executor = match &self.cleanup {
            Some(executor) => executor,
            None => return Ok(()),
        };

        if self.state.lock().already_cleaned {
            return Ok(());
        }

        self.cross_process
            .with_file_lock(|| executor.clean_up())?;
        self.state.lock().already_cleaned = true;
        Ok(())
    }

    fn new_cache<K: CacheKey, V: CacheValue>(
        &self,
        parameters: &IndexedCacheParameters<K, V>,
    ) -> Result<PersistentIndexedCache<K, V>> {
        if let Some(entry) = self.caches.lock().get(parameters.cache_name()) {
            return entry.reuse(parameters);
        }

        let path = self.cache_file(parameters.cache_name());
        tracing::debug!(
            "Creating new cache for {}, path {}, access {}",
            parameters.cache_name(),
            path.display(),
            self.display_name
        );

        let base: Arc<dyn MultiProcessSafeIndexedCache<K, V>> = Arc::new(
            DefaultMultiProcessSafeIndexedCache::new(&path, parameters, self.file_access.clone()),
        );
        let cache = match parameters.cache_decorator() {
            None => base,
            Some(decorator) => {
                let worker = if decorator.needs_worker() {
                    Some(self.worker()?)
                } else {
                    None
                };
                let access: Weak<dyn ExclusiveAccess> = self.me.clone();
                let decorated = decorator.decorate(
                    &path.display().to_string(),
                    base,
                    access,
                    &self.cross_process,
                    worker.as_ref(),
                )?;

                // An empty unit of work takes the lock, so the new cache
                // starts from the current lock state.
                if self.current_lock.lock().is_none() {
                    self.use_cache(|| Ok(()))?;
                }
                decorated
            }
        };

        let entry = CacheEntry::new(parameters, cache.clone());
        let participant = entry.participant.clone();
        {
            let mut caches = self.caches.lock();
            if let Some(existing) = caches.get(parameters.cache_name()) {
                return existing.reuse(parameters);
            }
            caches.insert(parameters.cache_name().to_owned(), entry);
        }

        let state_at_open = self
            .current_lock
            .lock()
            .as_ref()
            .map(|current| current.state_at_open);
        if let Some(state) = state_at_open {
            participant.after_lock_acquire(&state);
        }

        Ok(PersistentIndexedCache::new(cache))
    }

    fn cache_file(&self, cache_name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.bin", cache_name))
    }
}

/// Gives back the outermost unit of work's lock use when dropped, even
/// if the work panicked.
struct EndOfWork<'a>(&'a CoordinatorInner);

impl Drop for EndOfWork<'_> {
    fn drop(&mut self) {
        self.0.on_end_work();
    }
}

impl ExclusiveAccess for CoordinatorInner {
    fn with_exclusive(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.use_cache(work)
    }

    fn is_owned_by_current_thread(&self) -> bool {
        self.ownership.is_owned_by_current_thread()
    }
}

impl LockHolder for CoordinatorInner {
    fn file_lock_for_current_thread(&self) -> Result<Arc<FileLock>> {
        let current = self.current_lock.lock();
        if !self.ownership.is_owned_by_current_thread() {
            return Err(Error::illegal_state(format!(
                "The {} has not been locked for this thread. File lock: {}, owner: {:?}",
                self.display_name,
                current.is_some(),
                self.ownership.owner()
            )));
        }

        current
            .as_ref()
            .map(|current| current.lock.clone())
            .ok_or_else(|| {
                Error::illegal_state(format!("The file lock for {} is not held.", self.display_name))
            })
    }
}

impl LockListener for CoordinatorInner {
    fn after_lock_acquire(&self, lock: &Arc<FileLock>) -> Result<()> {
        let state = lock.state()?;
        *self.current_lock.lock() = Some(CurrentLock {
            lock: lock.clone(),
            state_at_open: state,
        });

        for participant in self.participants() {
            participant.after_lock_acquire(&state);
        }

        Ok(())
    }

    fn before_lock_release(&self, lock: &Arc<FileLock>) -> Result<Result<()>> {
        let _ownership = self.ownership.acquire_now()?;
        self.state.lock().closed_count += 1;

        let finished = self.notify_finish();
        match lock.state() {
            Ok(state) => {
                for participant in self.participants() {
                    participant.before_lock_release(&state);
                }
            }
            Err(e) => tracing::warn!("{} lost its lock state: {}", self.display_name, e),
        }

        *self.current_lock.lock() = None;
        Ok(finished)
    }

    fn finish_work(&self) -> Result<()> {
        self.notify_finish()
    }
}

impl Drop for CoordinatorInner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.signal_stop();
        }
    }
}

/// Configures a [`CacheCoordinator`].  Locks default to
/// [`LockMode::OnDemand`] on the base directory.
pub struct CacheCoordinatorBuilder {
    display_name: String,
    base_dir: PathBuf,
    lock_manager: FileLockManager,
    lock_target: Option<PathBuf>,
    lock_options: LockOptions,
    initializer: Arc<dyn CacheInitializationAction>,
    cleanup: Option<Arc<dyn CacheCleanupExecutor>>,
}

impl CacheCoordinatorBuilder {
    pub fn with_lock_target(self, lock_target: &Path) -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder {
            lock_target: Some(lock_target.to_owned()),
            ..self
        }
    }

    pub fn with_lock_options(self, lock_options: LockOptions) -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder {
            lock_options,
            ..self
        }
    }

    pub fn with_initializer(
        self,
        initializer: Arc<dyn CacheInitializationAction>,
    ) -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder {
            initializer,
            ..self
        }
    }

    pub fn with_cleanup(self, cleanup: Arc<dyn CacheCleanupExecutor>) -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder {
            cleanup: Some(cleanup),
            ..self
        }
    }

    pub fn build(self) -> CacheCoordinator {
        let lock_target = self.lock_target.unwrap_or_else(|| self.base_dir.clone());
        let lock_options = self.lock_options;

        let inner = Arc::new_cyclic(|me: &Weak<CoordinatorInner>| {
            let listener: Weak<dyn LockListener> = me.clone();
            let holder: Weak<dyn LockHolder> = me.clone();
            let file_access = match lock_options.lock_mode() {
                LockMode::None => FileAccess::Transparent,
                _ => FileAccess::UnitOfWork(holder),
            };

            CoordinatorInner {
                ownership: Ownership::new(&self.display_name),
                state: Default::default(),
                current_lock: Mutex::new(None),
                caches: Default::default(),
                cross_process: CrossProcessCacheAccess::new(LockContext {
                    display_name: self.display_name.clone(),
                    lock_target,
                    lock_options,
                    lock_manager: self.lock_manager,
                    initializer: self.initializer,
                    listener,
                }),
                file_access,
                worker: Mutex::new(None),
                cleanup: self.cleanup,
                me: me.clone(),
                display_name: self.display_name,
                base_dir: self.base_dir,
            }
        });

        CacheCoordinator { inner }
    }
}

/// Coordinates access to one cache directory.  See the module
/// documentation.
pub struct CacheCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("display_name", &self.inner.display_name)
            .field("base_dir", &self.inner.base_dir)
            .finish()
    }
}

impl CacheCoordinator {
    pub fn builder(
        display_name: &str,
        base_dir: &Path,
        lock_manager: &FileLockManager,
    ) -> CacheCoordinatorBuilder {
        CacheCoordinatorBuilder {
            display_name: display_name.to_owned(),
            base_dir: base_dir.to_owned(),
            lock_manager: lock_manager.clone(),
            lock_target: None,
            lock_options: LockOptions::mode(LockMode::OnDemand),
            initializer: Arc::new(NoInitialization),
            cleanup: None,
        }
    }

    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    /// Opens the cache, taking fixed locks right away.  A failed open
    /// leaves the cache closed.
    pub fn open(&self) -> Result<()> {
        let inner = &self.inner;
        let _ownership = inner.ownership.acquire_now()?;
        if inner.state.lock().open {
            return Err(Error::illegal_state("Cache is already open."));
        }

        if let Err(e) = inner.cross_process.open() {
            if let Err(close) = inner.cross_process.close() {
                tracing::debug!("failed to close {} after a failed open: {}", inner.display_name, close);
            }
            return Err(e);
        }

        inner.state.lock().open = true;
        Ok(())
    }

    /// Stops the worker, runs cleanup if it has not run yet, and
    /// releases the file lock.  Cleanup failures are logged, not
    /// returned; the first failure of a deferred write is.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let mut ret = Ok(());

        let worker = inner.worker.lock().take();
        if let Some(worker) = worker {
            ret = worker.stop();
        }

        let _ownership = inner.ownership.acquire();
        let (held, was_open) = {
            let mut state = inner.state.lock();
            (state.held_by_owner.take(), std::mem::replace(&mut state.open, false))
        };
        drop(held);

        if was_open {
            if let Err(e) = inner.clean_up_once() {
                tracing::warn!("Cache {} could not run cleanup action: {}", inner.display_name, e);
            }
        }

        let closed = inner.cross_process.close();
        *inner.current_lock.lock() = None;
        match closed {
            Err(e) if ret.is_ok() => ret = Err(e),
            Err(e) => tracing::warn!("failed to release lock on {}: {}", inner.display_name, e),
            Ok(()) => {}
        }

        let closed_count = inner.state.lock().closed_count;
        if closed_count != 1 {
            tracing::debug!("Cache {} was closed {} times.", inner.display_name, closed_count);
        }

        ret
    }

    /// Runs `action` as a unit of work: waits until no other thread
    /// is in one, and holds the file lock throughout.  Nested calls on
    /// the same thread join the outer unit of work.
    pub fn use_cache<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.inner.use_cache(action)
    }

    /// Runs `action` while holding the file lock, without taking
    /// thread ownership.
    pub fn with_file_lock<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.inner.cross_process.with_file_lock(action)
    }

    /// Returns the named indexed cache, creating it on first request.
    /// A later request must use compatible parameters.
    pub fn new_cache<K: CacheKey, V: CacheValue>(
        &self,
        parameters: &IndexedCacheParameters<K, V>,
    ) -> Result<PersistentIndexedCache<K, V>> {
        self.inner.new_cache(parameters)
    }

    pub fn cache_exists<K: CacheKey, V: CacheValue>(&self, parameters: &IndexedCacheParameters<K, V>) -> bool {
        self.inner.cache_file(parameters.cache_name()).exists()
    }

    /// Runs the cleanup executor now, after pending writes.  A later
    /// close does not run it again.
    pub fn cleanup(&self) -> Result<()> {
        if self.inner.cleanup.is_none() {
            return Ok(());
        }

        let worker = self.inner.worker.lock().clone();
        if let Some(worker) = worker {
            worker.flush()?;
        }

        let _ownership = self.inner.ownership.acquire_now()?;
        self.inner.clean_up_once()
    }
}

#[cfg(test)]
fn test_coordinator(dir: &Path, mode: LockMode) -> CacheCoordinator {
    let coordinator = CacheCoordinator::builder("test cache", dir, &FileLockManager::new())
        .with_lock_options(LockOptions::mode(mode))
        .build();
    coordinator.open().expect("open must succeed");
    coordinator
}

#[cfg(test)]
fn string_parameters(name: &str) -> IndexedCacheParameters<String, String> {
    use crate::serializer::StringSerializer;

    IndexedCacheParameters::of(name, StringSerializer, StringSerializer)
}

/// Concurrent units of work never overlap.
#[test]
fn test_use_cache_is_mutually_exclusive() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let coordinator = Arc::new(test_coordinator(temp.path(), LockMode::OnDemand));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let coordinator = coordinator.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    coordinator
                        .use_cache(|| {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_active.fetch_max(now, Ordering::SeqCst);
                            std::thread::yield_now();
                            active.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .expect("use_cache must succeed");
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().expect("thread must not panic");
    }

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    coordinator.close().expect("close must succeed");
}

/// Nested units of work keep the outer unit's lock use until the
/// outermost call returns.
#[test]
fn test_use_cache_is_reentrant() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let coordinator = test_coordinator(temp.path(), LockMode::OnDemand);
    let inner = coordinator.inner.clone();

    coordinator
        .use_cache(|| {
            coordinator.use_cache(|| {
                assert!(inner.ownership.is_owned_by_current_thread());
                Ok(())
            })?;

            assert!(inner.state.lock().held_by_owner.is_some());
            assert!(inner.file_lock_for_current_thread().is_ok());
            Ok(())
        })
        .expect("use_cache must succeed");

    assert!(inner.state.lock().held_by_owner.is_none());
    assert_eq!(inner.ownership.owner(), None);
    coordinator.close().expect("close must succeed");
}

/// A unit of work that panics still gives back its lock use and the
/// coordinator.
#[test]
fn test_panicking_unit_of_work_releases() {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let coordinator = test_coordinator(temp.path(), LockMode::OnDemand);
    let inner = coordinator.inner.clone();

    let result = catch_unwind(AssertUnwindSafe(|| {
        coordinator.use_cache(|| -> Result<()> { panic!("unit of work failed") })
    }));
    assert!(result.is_err());
    assert!(inner.state.lock().held_by_owner.is_none());
    assert_eq!(inner.ownership.owner(), None);

    coordinator
        .use_cache(|| {
            assert!(inner.state.lock().held_by_owner.is_some());
            Ok(())
        })
        .expect("use_cache must succeed");
    assert!(inner.state.lock().held_by_owner.is_none());
    coordinator.close().expect("close must succeed");
}

/// Caches decorated without deferred writes still work outside a unit
/// of work: each operation runs as a unit of work of its own.
#[test]
fn test_synchronous_decorated_cache_outside_unit_of_work() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let coordinator = test_coordinator(temp.path(), LockMode::OnDemand);
    let cache = coordinator
        .new_cache(&string_parameters("sync").with_cache_decorator(CacheDecorator::new().in_memory(10)))
        .expect("new_cache must succeed");

    cache
        .put("k".to_owned(), "v".to_owned())
        .expect("put must succeed");
    cache
        .put("gone".to_owned(), "v".to_owned())
        .expect("put must succeed");
    cache.remove(&"gone".to_owned()).expect("remove must succeed");
    assert_eq!(
        cache.get(&"k".to_owned()).expect("get must succeed"),
        Some("v".to_owned())
    );
    assert_eq!(coordinator.inner.ownership.owner(), None);
    coordinator.close().expect("close must succeed");

    let reopened = test_coordinator(temp.path(), LockMode::OnDemand);
    let cache = reopened
        .new_cache(&string_parameters("sync"))
        .expect("new_cache must succeed");
    reopened
        .use_cache(|| {
            assert_eq!(cache.get(&"k".to_owned())?, Some("v".to_owned()));
            assert_eq!(cache.get(&"gone".to_owned())?, None);
            Ok(())
        })
        .expect("use_cache must succeed");
    reopened.close().expect("close must succeed");
}

#[test]
fn test_open_twice_fails() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let coordinator = test_coordinator(temp.path(), LockMode::Exclusive);

    match coordinator.open() {
        Err(Error::IllegalState(message)) => assert_eq!(message, "Cache is already open."),
        other => panic!("expected an illegal state, got {:?}", other),
    }

    coordinator.close().expect("close must succeed");
    assert!(coordinator.use_cache(|| Ok(())).is_err());
}

/// Undecorated caches only work inside a unit of work.
#[test]
fn test_file_access_requires_ownership() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let coordinator = test_coordinator(temp.path(), LockMode::Exclusive);
    let cache = coordinator
        .new_cache(&string_parameters("plain"))
        .expect("new_cache must succeed");

    match cache.put("k".to_owned(), "v".to_owned()) {
        Err(Error::IllegalState(message)) => {
            assert!(message.starts_with("The test cache has not been locked for this thread."))
        }
        other => panic!("expected an illegal state, got {:?}", other),
    }

    coordinator
        .use_cache(|| cache.put("k".to_owned(), "v".to_owned()))
        .expect("put must succeed");
    assert_eq!(
        coordinator
            .use_cache(|| cache.get(&"k".to_owned()))
            .expect("get must succeed"),
        Some("v".to_owned())
    );
    coordinator.close().expect("close must succeed");
}

#[test]
fn test_cache_reuse_checks_parameters() {
    use crate::serializer::{BytesSerializer, StringSerializer};

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let coordinator = test_coordinator(temp.path(), LockMode::OnDemand);

    let first = coordinator
        .new_cache(&string_parameters("foo"))
        .expect("new_cache must succeed");
    let again = coordinator
        .new_cache(&string_parameters("foo"))
        .expect("compatible reuse must succeed");
    assert!(first.ptr_eq(&again));

    let other: IndexedCacheParameters<String, String> =
        IndexedCacheParameters::of("foo", StringSerializer, StringSerializer)
            .with_cache_decorator(CacheDecorator::in_memory_cache(10));
    match coordinator.new_cache(&other) {
        Err(Error::InvalidCacheReuse { name, mismatches }) => {
            assert_eq!(name, "foo");
            assert_eq!(
                mismatches,
                " * Requested cache decorator type (CacheDecorator[asynchronous, in-memory(10)]) doesn't match current cache type (none)"
            );
        }
        other => panic!("expected invalid reuse, got {:?}", other.map(|_| ())),
    }

    let bytes: IndexedCacheParameters<String, Vec<u8>> =
        IndexedCacheParameters::of("foo", StringSerializer, BytesSerializer);
    match coordinator.new_cache(&bytes) {
        Err(e @ Error::InvalidCacheReuse { .. }) => {
            let message = e.to_string();
            assert!(message.starts_with(
                "Cache 'foo' couldn't be reused because of the following mismatch:\n"
            ));
            assert!(message.contains(" * Requested value type (alloc::vec::Vec<u8>)"));
            assert!(message.contains(" * Requested value serializer type ("));
        }
        other => panic!("expected invalid reuse, got {:?}", other.map(|_| ())),
    }

    coordinator.close().expect("close must succeed");
}

/// Deferred writes to the same key apply in order.
#[test]
fn test_deferred_writes_keep_submission_order() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let parameters =
        string_parameters("ordered").with_cache_decorator(CacheDecorator::in_memory_cache(10));

    let coordinator = test_coordinator(temp.path(), LockMode::OnDemand);
    let cache = coordinator
        .new_cache(&parameters)
        .expect("new_cache must succeed");
    cache
        .put("k".to_owned(), "v1".to_owned())
        .expect("put must succeed");
    cache
        .put("k".to_owned(), "v2".to_owned())
        .expect("put must succeed");
    assert_eq!(
        cache.get(&"k".to_owned()).expect("get must succeed"),
        Some("v2".to_owned())
    );
    coordinator.close().expect("close must succeed");

    // A fresh coordinator has no memory layer state to hide behind.
    let coordinator = test_coordinator(temp.path(), LockMode::OnDemand);
    let cache = coordinator
        .new_cache(&string_parameters("ordered"))
        .expect("new_cache must succeed");
    assert_eq!(
        coordinator
            .use_cache(|| cache.get(&"k".to_owned()))
            .expect("get must succeed"),
        Some("v2".to_owned())
    );
    assert!(coordinator.cache_exists(&string_parameters("ordered")));
    assert!(!coordinator.cache_exists(&string_parameters("missing")));
    coordinator.close().expect("close must succeed");
}

#[test]
fn test_unlocked_coordinator() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let coordinator = test_coordinator(temp.path(), LockMode::None);
    let cache = coordinator
        .new_cache(&string_parameters("free"))
        .expect("new_cache must succeed");

    // No lock means no ownership requirement either.
    cache
        .put("k".to_owned(), "v".to_owned())
        .expect("put must succeed");
    assert_eq!(
        cache.get(&"k".to_owned()).expect("get must succeed"),
        Some("v".to_owned())
    );
    coordinator.close().expect("close must succeed");
    assert!(!crate::file_lock::lock_file_for(temp.path()).exists());
}

/// Cleanup runs once, at close or when asked, and its failures do not
/// prevent closing.
#[test]
fn test_cleanup_runs_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize, bool);

    impl CacheCleanupExecutor for Counting {
        fn clean_up(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.1 {
                Err(Error::illegal_state("cleanup failed"))
            } else {
                Ok(())
            }
        }
    }

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let executor = Arc::new(Counting(AtomicUsize::new(0), false));
    let coordinator = CacheCoordinator::builder("test cache", temp.path(), &FileLockManager::new())
        .with_cleanup(executor.clone())
        .build();
    coordinator.open().expect("open must succeed");
    coordinator.cleanup().expect("cleanup must succeed");
    coordinator.close().expect("close must succeed");
    assert_eq!(executor.0.load(Ordering::SeqCst), 1);

    let failing = Arc::new(Counting(AtomicUsize::new(0), true));
    let coordinator = CacheCoordinator::builder("test cache", temp.path(), &FileLockManager::new())
        .with_cleanup(failing.clone())
        .build();
    coordinator.open().expect("open must succeed");
    coordinator.close().expect("close must succeed despite cleanup failure");
    assert_eq!(failing.0.load(Ordering::SeqCst), 1);
}
