//! A bounded, least-recently-used, in-memory layer over an indexed
//! cache.  It remembers misses as well as hits, and drops everything
//! when the file lock reveals that another process may have written to
//! the cache since we last held it.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::async_cache::AsyncIndexedCache;
use crate::async_cache::OnComplete;
use crate::error::Result;
use crate::indexed_cache::CacheKey;
use crate::indexed_cache::CacheValue;
use crate::indexed_cache::UnitOfWorkParticipant;
use crate::lock_state::LockState;

struct Entries<K, V> {
    // Value (or known absence) and last access tick.
    values: HashMap<K, (Option<V>, u64)>,
    by_tick: BTreeMap<u64, K>,
    next_tick: u64,
}

impl<K: CacheKey, V: CacheValue> Entries<K, V> {
    fn new() -> Entries<K, V> {
        Entries {
            values: HashMap::new(),
            by_tick: BTreeMap::new(),
            next_tick: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    /// `Some(cached)` on a hit, where `cached` may be a known absence.
    fn get(&mut self, key: &K) -> Option<Option<V>> {
        let tick = self.tick();
        let (value, last) = self.values.get_mut(key)?;
        self.by_tick.remove(&*last);
        *last = tick;
        self.by_tick.insert(tick, key.clone());
        Some(value.clone())
    }

    fn insert(&mut self, key: K, value: Option<V>, max_entries: usize) {
        let tick = self.tick();
        if let Some((_, last)) = self.values.insert(key.clone(), (value, tick)) {
            self.by_tick.remove(&last);
        }
        self.by_tick.insert(tick, key);

        while self.values.len() > max_entries {
            let oldest = match self.by_tick.keys().next() {
                Some(oldest) => *oldest,
                None => break,
            };
            if let Some(evicted) = self.by_tick.remove(&oldest) {
                self.values.remove(&evicted);
            }
        }
    }

    fn clear(&mut self) {
        self.values.clear();
        self.by_tick.clear();
    }
}

pub(crate) struct InMemoryDecoratedCache<K, V> {
    cache_id: String,
    max_entries: usize,
    inner: Arc<dyn AsyncIndexedCache<K, V>>,
    entries: Mutex<Entries<K, V>>,
    // Lock state when we last released the lock.
    last_state: Mutex<Option<LockState>>,
}

impl<K: CacheKey, V: CacheValue> InMemoryDecoratedCache<K, V> {
    pub fn new(
        cache_id: &str,
        max_entries: usize,
        inner: Arc<dyn AsyncIndexedCache<K, V>>,
    ) -> InMemoryDecoratedCache<K, V> {
        InMemoryDecoratedCache {
            cache_id: cache_id.to_owned(),
            max_entries: max_entries.max(1),
            inner,
            entries: Mutex::new(Entries::new()),
            last_state: Mutex::new(None),
        }
    }

    fn remember(&self, key: K, value: Option<V>) {
        self.entries.lock().insert(key, value, self.max_entries);
    }
}

impl<K: CacheKey, V: CacheValue> AsyncIndexedCache<K, V> for InMemoryDecoratedCache<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        if let Some(cached) = self.entries.lock().get(key) {
            return Ok(cached);
        }

        let value = self.inner.get(key)?;
        self.remember(key.clone(), value.clone());
        Ok(value)
    }

    fn get_or_create(
        &self,
        key: &K,
        producer: &dyn Fn(&K) -> Result<V>,
        completion: OnComplete,
    ) -> Result<V> {
        if let Some(Some(value)) = self.entries.lock().get(key) {
            return Ok(value);
        }

        let value = self.inner.get_or_create(key, producer, completion)?;
        self.remember(key.clone(), Some(value.clone()));
        Ok(value)
    }

    fn put_later(&self, key: K, value: V, completion: OnComplete) -> Result<()> {
        self.inner.put_later(key.clone(), value.clone(), completion)?;
        self.remember(key, Some(value));
        Ok(())
    }

    fn remove_later(&self, key: &K, completion: OnComplete) -> Result<()> {
        self.inner.remove_later(key, completion)?;
        self.remember(key.clone(), None);
        Ok(())
    }
}

impl<K: CacheKey, V: CacheValue> UnitOfWorkParticipant for InMemoryDecoratedCache<K, V> {
    fn after_lock_acquire(&self, current: &LockState) {
        let out_of_date = match &*self.last_state.lock() {
            None => true,
            Some(previous) => {
                let updated = current.has_been_updated_since(previous);
                if updated {
                    tracing::info!("Invalidating in-memory cache of {}", self.cache_id);
                }
                updated
            }
        };

        if out_of_date {
            self.entries.lock().clear();
        }

        self.inner.after_lock_acquire(current)
    }

    fn finish_work(&self) -> Result<()> {
        self.inner.finish_work()
    }

    fn before_lock_release(&self, current: &LockState) {
        *self.last_state.lock() = Some(*current);
        self.inner.before_lock_release(current)
    }
}

/// Counts reads, so tests can tell memory hits from pass-throughs.
#[cfg(test)]
#[derive(Default)]
struct CountingCache {
    values: Mutex<HashMap<String, String>>,
    reads: std::sync::atomic::AtomicUsize,
    reject_writes: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl CountingCache {
    fn reads(&self) -> usize {
        self.reads.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<()> {
        if self.reject_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::error::Error::illegal_state("read only"));
        }

        Ok(())
    }
}

#[cfg(test)]
impl AsyncIndexedCache<String, String> for CountingCache {
    fn get(&self, key: &String) -> Result<Option<String>> {
        self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.values.lock().get(key).cloned())
    }

    fn get_or_create(
        &self,
        key: &String,
        producer: &dyn Fn(&String) -> Result<String>,
        _completion: OnComplete,
    ) -> Result<String> {
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }

        let value = producer(key)?;
        self.values.lock().insert(key.clone(), value.clone());
        Ok(value)
    }

    fn put_later(&self, key: String, value: String, _completion: OnComplete) -> Result<()> {
        self.check_writable()?;
        self.values.lock().insert(key, value);
        Ok(())
    }

    fn remove_later(&self, key: &String, _completion: OnComplete) -> Result<()> {
        self.check_writable()?;
        self.values.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
impl UnitOfWorkParticipant for CountingCache {
    fn after_lock_acquire(&self, _current: &LockState) {}

    fn finish_work(&self) -> Result<()> {
        Ok(())
    }

    fn before_lock_release(&self, _current: &LockState) {}
}

#[test]
fn test_hits_and_misses_are_remembered() {
    let backing = Arc::new(CountingCache::default());
    let cache = InMemoryDecoratedCache::new("test", 10, backing.clone());

    assert_eq!(cache.get(&"a".to_owned()).expect("get must succeed"), None);
    assert_eq!(cache.get(&"a".to_owned()).expect("get must succeed"), None);
    assert_eq!(backing.reads(), 1);

    cache
        .put_later("a".to_owned(), "1".to_owned(), OnComplete::noop())
        .expect("put must succeed");
    assert_eq!(
        cache.get(&"a".to_owned()).expect("get must succeed"),
        Some("1".to_owned())
    );
    assert_eq!(backing.reads(), 1);

    cache
        .remove_later(&"a".to_owned(), OnComplete::noop())
        .expect("remove must succeed");
    assert_eq!(cache.get(&"a".to_owned()).expect("get must succeed"), None);
    assert_eq!(backing.reads(), 1);
}

/// A write the backing cache rejects leaves the remembered entry alone.
#[test]
fn test_rejected_writes_are_not_remembered() {
    use std::sync::atomic::Ordering;

    let backing = Arc::new(CountingCache::default());
    let cache = InMemoryDecoratedCache::new("test", 10, backing.clone());
    cache
        .put_later("a".to_owned(), "1".to_owned(), OnComplete::noop())
        .expect("put must succeed");

    backing.reject_writes.store(true, Ordering::SeqCst);
    assert!(cache
        .put_later("a".to_owned(), "2".to_owned(), OnComplete::noop())
        .is_err());
    assert!(cache
        .put_later("b".to_owned(), "2".to_owned(), OnComplete::noop())
        .is_err());
    assert!(cache
        .remove_later(&"a".to_owned(), OnComplete::noop())
        .is_err());

    assert_eq!(
        cache.get(&"a".to_owned()).expect("get must succeed"),
        Some("1".to_owned())
    );
    assert_eq!(cache.get(&"b".to_owned()).expect("get must succeed"), None);
}

#[test]
fn test_least_recently_used_is_evicted() {
    let backing = Arc::new(CountingCache::default());
    let cache = InMemoryDecoratedCache::new("test", 2, backing.clone());

    for key in ["a", "b"] {
        cache
            .put_later(key.to_owned(), key.to_owned(), OnComplete::noop())
            .expect("put must succeed");
    }

    // Touch "a", so "b" is the oldest when "c" arrives.
    cache.get(&"a".to_owned()).expect("get must succeed");
    cache
        .put_later("c".to_owned(), "c".to_owned(), OnComplete::noop())
        .expect("put must succeed");
    assert_eq!(backing.reads(), 0);

    cache.get(&"a".to_owned()).expect("get must succeed");
    cache.get(&"c".to_owned()).expect("get must succeed");
    assert_eq!(backing.reads(), 0);
    assert_eq!(
        cache.get(&"b".to_owned()).expect("get must succeed"),
        Some("b".to_owned())
    );
    assert_eq!(backing.reads(), 1);
}

/// Entries survive a release and re-acquisition of an unchanged lock,
/// but not one that another process updated in between.
#[test]
fn test_invalidated_when_lock_state_changes() {
    use crate::lock_state::LockStateProtocol;

    let backing = Arc::new(CountingCache::default());
    let cache = InMemoryDecoratedCache::new("test", 10, backing.clone());
    let state = LockStateProtocol::Default
        .initial_state()
        .before_update()
        .complete_update();

    cache.after_lock_acquire(&state);
    cache.get(&"k".to_owned()).expect("get must succeed");
    cache.before_lock_release(&state);

    cache.after_lock_acquire(&state);
    cache.get(&"k".to_owned()).expect("get must succeed");
    assert_eq!(backing.reads(), 1);
    cache.before_lock_release(&state);

    let updated = state.before_update().complete_update();
    cache.after_lock_acquire(&updated);
    cache.get(&"k".to_owned()).expect("get must succeed");
    assert_eq!(backing.reads(), 2);
}
