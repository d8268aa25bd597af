//! Named key/value caches stored in a cache directory, one `<name>.bin`
//! store per cache.
//!
//! The base implementation, [`DefaultMultiProcessSafeIndexedCache`],
//! opens its store lazily and routes every access through the
//! coordinator's [`FileAccess`], so that each mutation of the store is
//! bracketed by the lock file's dirty bit.
use std::hash::Hash;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::MappedMutexGuard;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::decorator::CacheDecorator;
use crate::error::Error;
use crate::error::Result;
use crate::file_access::FileAccess;
use crate::lock_state::LockState;
use crate::serializer::Serializer;
use crate::serializer::SerializerIdentity;
use crate::store::Store;

/// Bounds for indexed cache keys.
pub trait CacheKey: Clone + Eq + Hash + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + 'static> CacheKey for T {}

/// Bounds for indexed cache values.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> CacheValue for T {}

/// Hooks into a coordinator's unit of work: caches use them to flush
/// pending state before the file lock is released, and to notice
/// whether another process changed the files while the lock was not
/// held.
pub trait UnitOfWorkParticipant: Send + Sync {
    /// Called once the file lock is acquired, with its state then.
    fn after_lock_acquire(&self, current: &LockState);

    /// Called before the file lock is released, while it is still held.
    fn finish_work(&self) -> Result<()>;

    /// Called right before the file lock is released.
    fn before_lock_release(&self, current: &LockState);
}

pub trait IndexedCache<K, V>: Send + Sync {
    /// Returns the value for `key`.  Entries lost to corruption read as
    /// absent.
    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Returns the value for `key`, producing and storing it on a miss.
    fn get_or_create(&self, key: &K, producer: &dyn Fn(&K) -> Result<V>) -> Result<V>;

    fn put(&self, key: K, value: V) -> Result<()>;

    fn remove(&self, key: &K) -> Result<()>;
}

/// An indexed cache that stays consistent with other processes
/// sharing the directory.
pub trait MultiProcessSafeIndexedCache<K, V>: IndexedCache<K, V> + UnitOfWorkParticipant {}

impl<K, V, T: IndexedCache<K, V> + UnitOfWorkParticipant> MultiProcessSafeIndexedCache<K, V> for T {}

/// Forwards lifecycle hooks to a cache held as a
/// `dyn MultiProcessSafeIndexedCache`.
pub(crate) struct Participant<K, V>(pub Arc<dyn MultiProcessSafeIndexedCache<K, V>>);

impl<K, V> UnitOfWorkParticipant for Participant<K, V> {
    fn after_lock_acquire(&self, current: &LockState) {
        self.0.after_lock_acquire(current)
    }

    fn finish_work(&self) -> Result<()> {
        self.0.finish_work()
    }

    fn before_lock_release(&self, current: &LockState) {
        self.0.before_lock_release(current)
    }
}

/// Everything needed to create (or look up) a named indexed cache.
pub struct IndexedCacheParameters<K, V> {
    cache_name: String,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
    key_serializer_identity: SerializerIdentity,
    value_serializer_identity: SerializerIdentity,
    cache_decorator: Option<CacheDecorator>,
}

impl<K, V> Clone for IndexedCacheParameters<K, V> {
    fn clone(&self) -> Self {
        IndexedCacheParameters {
            cache_name: self.cache_name.clone(),
            key_serializer: self.key_serializer.clone(),
            value_serializer: self.value_serializer.clone(),
            key_serializer_identity: self.key_serializer_identity,
            value_serializer_identity: self.value_serializer_identity,
            cache_decorator: self.cache_decorator.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for IndexedCacheParameters<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedCacheParameters")
            .field("cache_name", &self.cache_name)
            .field("key_serializer", &self.key_serializer_identity)
            .field("value_serializer", &self.value_serializer_identity)
            .field("cache_decorator", &self.cache_decorator)
            .finish()
    }
}

impl<K: 'static, V: 'static> IndexedCacheParameters<K, V> {
    pub fn of<KS, VS>(
        cache_name: impl Into<String>,
        key_serializer: KS,
        value_serializer: VS,
    ) -> IndexedCacheParameters<K, V>
    where
        KS: Serializer<K>,
        VS: Serializer<V>,
    {
        IndexedCacheParameters {
            cache_name: cache_name.into(),
            key_serializer: Arc::new(key_serializer),
            value_serializer: Arc::new(value_serializer),
            key_serializer_identity: SerializerIdentity::of::<KS>(),
            value_serializer_identity: SerializerIdentity::of::<VS>(),
            cache_decorator: None,
        }
    }

    pub fn with_cache_decorator(self, cache_decorator: CacheDecorator) -> IndexedCacheParameters<K, V> {
        IndexedCacheParameters {
            cache_decorator: Some(cache_decorator),
            ..self
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn key_serializer_identity(&self) -> SerializerIdentity {
        self.key_serializer_identity
    }

    pub fn value_serializer_identity(&self) -> SerializerIdentity {
        self.value_serializer_identity
    }

    pub fn cache_decorator(&self) -> Option<&CacheDecorator> {
        self.cache_decorator.as_ref()
    }

    pub(crate) fn key_serializer(&self) -> Arc<dyn Serializer<K>> {
        self.key_serializer.clone()
    }

    pub(crate) fn value_serializer(&self) -> Arc<dyn Serializer<V>> {
        self.value_serializer.clone()
    }
}

/// The undecorated indexed cache: every call goes straight to the
/// store, under the current unit of work's file lock.
pub(crate) struct DefaultMultiProcessSafeIndexedCache<K, V> {
    path: PathBuf,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
    file_access: FileAccess,
    // Opened on first use, closed by `finish_work`.
    store: Mutex<Option<Store>>,
}

impl<K: CacheKey, V: CacheValue> DefaultMultiProcessSafeIndexedCache<K, V> {
    pub fn new(
        path: &Path,
        parameters: &IndexedCacheParameters<K, V>,
        file_access: FileAccess,
    ) -> DefaultMultiProcessSafeIndexedCache<K, V> {
        DefaultMultiProcessSafeIndexedCache {
            path: path.to_owned(),
            key_serializer: parameters.key_serializer(),
            value_serializer: parameters.value_serializer(),
            file_access,
            store: Mutex::new(None),
        }
    }

    fn store(&self) -> Result<MappedMutexGuard<'_, Store>> {
        let mut guard = self.store.lock();
        if guard.is_none() {
            // Creating the store counts as a mutation.
            let store = self.file_access.write_file(|| Store::open(&self.path))?;
            *guard = Some(store);
        }

        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| Error::illegal_state(format!("{} is not open", self.path.display())))
    }

    fn encode_key(&self, key: &K) -> Result<Vec<u8>> {
        let mut encoded = Vec::new();
        self.key_serializer.write(key, &mut encoded)?;
        Ok(encoded)
    }
}

impl<K: CacheKey, V: CacheValue> IndexedCache<K, V> for DefaultMultiProcessSafeIndexedCache<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        let key = self.encode_key(key)?;
        let mut store = self.store()?;

        let bytes = match self.file_access.read_file(|| store.get(&key)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) if e.is_integrity_violation() => {
                tracing::debug!("reading {} as absent: {}", self.path.display(), e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match self.value_serializer.read(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(
                    "{} has an undecodable entry, treating it as absent: {}",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    fn get_or_create(&self, key: &K, producer: &dyn Fn(&K) -> Result<V>) -> Result<V> {
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }

        let value = producer(key)?;
        self.put(key.clone(), value.clone())?;
        Ok(value)
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        let key = self.encode_key(&key)?;
        let mut encoded = Vec::new();
        self.value_serializer.write(&value, &mut encoded)?;

        let mut store = self.store()?;
        self.file_access.write_file(|| store.put(&key, &encoded))
    }

    fn remove(&self, key: &K) -> Result<()> {
        let key = self.encode_key(key)?;
        let mut store = self.store()?;
        self.file_access.write_file(|| store.remove(&key))
    }
}

impl<K, V> UnitOfWorkParticipant for DefaultMultiProcessSafeIndexedCache<K, V> {
    fn after_lock_acquire(&self, _current: &LockState) {}

    fn finish_work(&self) -> Result<()> {
        let store = self.store.lock().take();
        match store {
            Some(store) => self.file_access.write_file(|| store.close()),
            None => Ok(()),
        }
    }

    fn before_lock_release(&self, _current: &LockState) {}
}

/// A handle on a named indexed cache.  Clones share the same cache.
pub struct PersistentIndexedCache<K, V> {
    cache: Arc<dyn MultiProcessSafeIndexedCache<K, V>>,
}

impl<K, V> Clone for PersistentIndexedCache<K, V> {
    fn clone(&self) -> Self {
        PersistentIndexedCache {
            cache: self.cache.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for PersistentIndexedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentIndexedCache")
            .field("cache", &Arc::as_ptr(&self.cache).cast::<()>())
            .finish()
    }
}

impl<K, V> PersistentIndexedCache<K, V> {
    pub(crate) fn new(cache: Arc<dyn MultiProcessSafeIndexedCache<K, V>>) -> PersistentIndexedCache<K, V> {
        PersistentIndexedCache { cache }
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.cache.get(key)
    }

    pub fn get_or_create(&self, key: &K, producer: impl Fn(&K) -> Result<V>) -> Result<V> {
        self.cache.get_or_create(key, &producer)
    }

    pub fn put(&self, key: K, value: V) -> Result<()> {
        self.cache.put(key, value)
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.cache.remove(key)
    }

    /// Returns whether both handles refer to the same underlying cache.
    pub fn ptr_eq(&self, other: &PersistentIndexedCache<K, V>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.cache).cast::<()>(),
            Arc::as_ptr(&other.cache).cast::<()>(),
        )
    }
}

#[cfg(test)]
fn string_cache(dir: &Path) -> DefaultMultiProcessSafeIndexedCache<String, String> {
    use crate::serializer::StringSerializer;

    let parameters = IndexedCacheParameters::of("strings", StringSerializer, StringSerializer);
    DefaultMultiProcessSafeIndexedCache::new(&dir.join("strings.bin"), &parameters, FileAccess::Transparent)
}

#[test]
fn test_put_get_remove() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let cache = string_cache(temp.path());

    assert_eq!(cache.get(&"k".to_owned()).expect("get must succeed"), None);
    cache
        .put("k".to_owned(), "v".to_owned())
        .expect("put must succeed");
    assert_eq!(
        cache.get(&"k".to_owned()).expect("get must succeed"),
        Some("v".to_owned())
    );

    cache.remove(&"k".to_owned()).expect("remove must succeed");
    assert_eq!(cache.get(&"k".to_owned()).expect("get must succeed"), None);
}

#[test]
fn test_store_is_lazy_and_reopened_after_finish() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let cache = string_cache(temp.path());

    assert!(!temp.path().join("strings.bin").exists());
    cache
        .put("a".to_owned(), "1".to_owned())
        .expect("put must succeed");
    assert!(temp.path().join("strings.bin").exists());

    cache.finish_work().expect("finish must succeed");
    cache.finish_work().expect("finish without a store is a no-op");

    let reopened = string_cache(temp.path());
    assert_eq!(
        reopened.get(&"a".to_owned()).expect("get must succeed"),
        Some("1".to_owned())
    );
}

#[test]
fn test_get_or_create_produces_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let cache = string_cache(temp.path());
    let calls = AtomicUsize::new(0);
    let producer = |key: &String| -> Result<String> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}!", key))
    };

    let key = "x".to_owned();
    assert_eq!(cache.get_or_create(&key, &producer).expect("must succeed"), "x!");
    assert_eq!(cache.get_or_create(&key, &producer).expect("must succeed"), "x!");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_undecodable_value_reads_as_absent() {
    use crate::serializer::{BytesSerializer, StringSerializer};

    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let path = temp.path().join("mixed.bin");

    let raw = IndexedCacheParameters::of("mixed", StringSerializer, BytesSerializer);
    let writer = DefaultMultiProcessSafeIndexedCache::new(&path, &raw, FileAccess::Transparent);
    writer
        .put("bad".to_owned(), vec![0xff, 0xfe])
        .expect("put must succeed");
    writer.finish_work().expect("finish must succeed");

    let typed = IndexedCacheParameters::of("mixed", StringSerializer, StringSerializer);
    let reader = DefaultMultiProcessSafeIndexedCache::new(&path, &typed, FileAccess::Transparent);
    assert_eq!(reader.get(&"bad".to_owned()).expect("get must succeed"), None);
}
