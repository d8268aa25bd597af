//! Decorated indexed caches are built by stacking layers over the base
//! store-backed cache.  A [`CacheDecorator`] lists the layers, innermost
//! first; the result is always wrapped in a cross-process synchronising
//! layer that holds the file lock around each operation.  Operations that
//! reach the base cache synchronously run as units of work of their own.
use std::sync::Arc;
use std::sync::Weak;

use crate::async_cache::AsyncCacheAccessDecoratedCache;
use crate::async_cache::AsyncIndexedCache;
use crate::async_cache::CacheAccessWorker;
use crate::async_cache::ExclusiveAccess;
use crate::async_cache::OnComplete;
use crate::cross_process::CrossProcessCacheAccess;
use crate::cross_process::CrossProcessSynchronizingCache;
use crate::error::Error;
use crate::error::Result;
use crate::in_memory::InMemoryDecoratedCache;
use crate::indexed_cache::CacheKey;
use crate::indexed_cache::CacheValue;
use crate::indexed_cache::IndexedCache;
use crate::indexed_cache::MultiProcessSafeIndexedCache;
use crate::indexed_cache::UnitOfWorkParticipant;
use crate::lock_state::LockState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecoratorStep {
    /// Defer writes to the coordinator's worker thread.
    Asynchronous,
    /// Keep up to `max_entries` recently used entries in memory.
    InMemory { max_entries: usize },
}

impl std::fmt::Display for DecoratorStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecoratorStep::Asynchronous => f.write_str("asynchronous"),
            DecoratorStep::InMemory { max_entries } => write!(f, "in-memory({})", max_entries),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CacheDecorator {
    steps: Vec<DecoratorStep>,
}

impl CacheDecorator {
    pub fn new() -> CacheDecorator {
        CacheDecorator::default()
    }

    /// The usual decoration: deferred writes, with the most recently
    /// used entries kept in memory.
    pub fn in_memory_cache(max_entries: usize) -> CacheDecorator {
        CacheDecorator::new().asynchronous().in_memory(max_entries)
    }

    pub fn asynchronous(mut self) -> CacheDecorator {
        self.steps.push(DecoratorStep::Asynchronous);
        self
    }

    pub fn in_memory(mut self, max_entries: usize) -> CacheDecorator {
        self.steps.push(DecoratorStep::InMemory { max_entries });
        self
    }

    pub fn steps(&self) -> &[DecoratorStep] {
        &self.steps
    }

    pub(crate) fn needs_worker(&self) -> bool {
        self.steps.contains(&DecoratorStep::Asynchronous)
    }

    /// Stacks this decorator's layers over `base`.  `worker` is only
    /// consulted for asynchronous layers; `access` is the coordinator
    /// whose units of work wrap direct accesses to `base`.
    pub(crate) fn decorate<K: CacheKey, V: CacheValue>(
        &self,
        cache_id: &str,
        base: Arc<dyn MultiProcessSafeIndexedCache<K, V>>,
        access: Weak<dyn ExclusiveAccess>,
        cross_process: &CrossProcessCacheAccess,
        worker: Option<&Arc<CacheAccessWorker>>,
    ) -> Result<Arc<dyn MultiProcessSafeIndexedCache<K, V>>> {
        let mut cache: Arc<dyn AsyncIndexedCache<K, V>> = Arc::new(Immediate { base, access });

        for step in &self.steps {
            cache = match step {
                DecoratorStep::Asynchronous => {
                    let worker = worker.ok_or_else(|| {
                        Error::illegal_state(format!(
                            "No worker available for asynchronous cache {}",
                            cache_id
                        ))
                    })?;
                    Arc::new(AsyncCacheAccessDecoratedCache::new(worker.clone(), cache))
                }
                DecoratorStep::InMemory { max_entries } => {
                    Arc::new(InMemoryDecoratedCache::new(cache_id, *max_entries, cache))
                }
            };
        }

        Ok(Arc::new(CrossProcessSynchronizingCache::new(
            cross_process.clone(),
            cache,
        )))
    }
}

impl std::fmt::Display for CacheDecorator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CacheDecorator[")?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", step)?;
        }
        f.write_str("]")
    }
}

/// Adapts a synchronous cache to the deferred-write interface by
/// applying writes right away, each in a unit of work.
struct Immediate<K, V> {
    base: Arc<dyn MultiProcessSafeIndexedCache<K, V>>,
    access: Weak<dyn ExclusiveAccess>,
}

impl<K, V> Immediate<K, V> {
    /// Runs `action` owning the coordinator.  Nests when the current
    /// thread already owns it.
    fn exclusive<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        let access = self
            .access
            .upgrade()
            .ok_or_else(|| Error::illegal_state("The cache coordinator is closed."))?;

        let mut action = Some(action);
        let mut ret = None;
        access.with_exclusive(&mut || {
            if let Some(action) = action.take() {
                ret = Some(action()?);
            }

            Ok(())
        })?;

        ret.ok_or_else(|| Error::illegal_state("The unit of work did not run."))
    }
}

impl<K: CacheKey, V: CacheValue> AsyncIndexedCache<K, V> for Immediate<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        self.exclusive(|| self.base.get(key))
    }

    fn get_or_create(
        &self,
        key: &K,
        producer: &dyn Fn(&K) -> Result<V>,
        _completion: OnComplete,
    ) -> Result<V> {
        self.exclusive(|| self.base.get_or_create(key, producer))
    }

    fn put_later(&self, key: K, value: V, _completion: OnComplete) -> Result<()> {
        self.exclusive(|| self.base.put(key, value))
    }

    fn remove_later(&self, key: &K, _completion: OnComplete) -> Result<()> {
        self.exclusive(|| self.base.remove(key))
    }
}

impl<K, V> UnitOfWorkParticipant for Immediate<K, V> {
    fn after_lock_acquire(&self, current: &LockState) {
        self.base.after_lock_acquire(current)
    }

    fn finish_work(&self) -> Result<()> {
        self.base.finish_work()
    }

    fn before_lock_release(&self, current: &LockState) {
        self.base.before_lock_release(current)
    }
}

#[test]
fn test_display_lists_steps_in_order() {
    assert_eq!(CacheDecorator::new().to_string(), "CacheDecorator[]");
    assert_eq!(
        CacheDecorator::in_memory_cache(100).to_string(),
        "CacheDecorator[asynchronous, in-memory(100)]"
    );
    assert_ne!(
        CacheDecorator::in_memory_cache(100),
        CacheDecorator::new().in_memory(100).asynchronous()
    );
    assert!(CacheDecorator::in_memory_cache(1).needs_worker());
    assert!(!CacheDecorator::new().in_memory(1).needs_worker());
}

/// Without an asynchronous step, a decorated cache writes through
/// immediately.
#[test]
fn test_synchronous_decoration() {
    use crate::cross_process::LockListener;
    use crate::file_access::FileAccess;
    use crate::file_lock::FileLock;
    use crate::indexed_cache::{DefaultMultiProcessSafeIndexedCache, IndexedCacheParameters};
    use crate::serializer::StringSerializer;

    struct Unlistened;

    impl LockListener for Unlistened {
        fn after_lock_acquire(&self, _lock: &Arc<FileLock>) -> Result<()> {
            Ok(())
        }

        fn before_lock_release(&self, _lock: &Arc<FileLock>) -> Result<Result<()>> {
            Ok(Ok(()))
        }

        fn finish_work(&self) -> Result<()> {
            Ok(())
        }
    }

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let path = temp.path().join("decorated.bin");
    let parameters = IndexedCacheParameters::of("decorated", StringSerializer, StringSerializer);
    let base: Arc<dyn MultiProcessSafeIndexedCache<String, String>> = Arc::new(
        DefaultMultiProcessSafeIndexedCache::new(&path, &parameters, FileAccess::Transparent),
    );
    let listener: Weak<dyn LockListener> = Weak::<Unlistened>::new();
    let cross_process = CrossProcessCacheAccess::NoLocking(listener);
    let access = crate::async_cache::TestAccess::new();
    let weak: Weak<dyn ExclusiveAccess> = Arc::downgrade(&access) as Weak<dyn ExclusiveAccess>;

    let decorated = CacheDecorator::new()
        .in_memory(10)
        .decorate("decorated", base.clone(), weak.clone(), &cross_process, None)
        .expect("decorate must succeed");
    decorated
        .put("k".to_owned(), "v".to_owned())
        .expect("put must succeed");

    assert_eq!(base.get(&"k".to_owned()).expect("get must succeed"), Some("v".to_owned()));
    assert_eq!(
        decorated.get(&"k".to_owned()).expect("get must succeed"),
        Some("v".to_owned())
    );

    assert!(CacheDecorator::in_memory_cache(10)
        .decorate("decorated", base, weak, &cross_process, None)
        .is_err());
}
