//! Opens cache directories and keeps track of the open ones.
//!
//! A [`CacheFactory`] is the registry of open cache directories for one
//! [`FileLockManager`].  Opening a directory that is already open hands
//! out another reference to the same cache, provided the request agrees
//! on properties and lock options; the directory is closed when the
//! last reference is.
//!
//! ```no_run
//! # fn main() -> persistent_cache::Result<()> {
//! use persistent_cache::{CacheDecorator, CacheFactory, IndexedCacheParameters, StringSerializer};
//!
//! let factory = CacheFactory::new();
//! let cache = factory.cache("/tmp/my-cache".as_ref()).with_display_name("my cache").open()?;
//! let entries = cache.create_cache(
//!     &IndexedCacheParameters::of("entries", StringSerializer, StringSerializer)
//!         .with_cache_decorator(CacheDecorator::in_memory_cache(100)),
//! )?;
//! entries.put("key".to_owned(), "value".to_owned())?;
//! cache.close()?;
//! # Ok(())
//! # }
//! ```
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cleanup::CleanupAction;
use crate::cleanup::CleanupFrequency;
use crate::cross_process::CacheInitializationAction;
use crate::error::Error;
use crate::error::Result;
use crate::file_lock::FileLockManager;
use crate::file_lock::LockOptions;
use crate::indexed_cache::CacheKey;
use crate::indexed_cache::CacheValue;
use crate::indexed_cache::IndexedCacheParameters;
use crate::indexed_cache::PersistentIndexedCache;
use crate::persistent_cache::CacheSettings;
use crate::persistent_cache::CacheValidator;
use crate::persistent_cache::DirectoryCache;
use crate::properties::Properties;

struct DirCacheReference {
    cache: Arc<DirectoryCache>,
    references: usize,
}

#[derive(Default)]
struct Registry {
    dirs: Mutex<HashMap<PathBuf, DirCacheReference>>,
}

impl Registry {
    /// Drops one reference to the cache at `base_dir`, and closes the
    /// cache with the last one.
    fn release(&self, base_dir: &Path) -> Result<()> {
        let closing = {
            let mut dirs = self.dirs.lock();
            let last = match dirs.get_mut(base_dir) {
                Some(entry) => {
                    entry.references -= 1;
                    entry.references == 0
                }
                None => return Ok(()),
            };

            if last {
                dirs.remove(base_dir)
            } else {
                None
            }
        };

        match closing {
            Some(entry) => {
                tracing::debug!("Closing {}", entry.cache.display_name());
                entry.cache.close()
            }
            None => Ok(()),
        }
    }
}

/// The registry of open cache directories.
#[derive(Clone)]
pub struct CacheFactory {
    lock_manager: FileLockManager,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for CacheFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFactory")
            .field("open_dirs", &self.registry.dirs.lock().len())
            .finish()
    }
}

impl Default for CacheFactory {
    fn default() -> CacheFactory {
        CacheFactory::new()
    }
}

impl CacheFactory {
    pub fn new() -> CacheFactory {
        CacheFactory::with_lock_manager(FileLockManager::new())
    }

    pub fn with_lock_manager(lock_manager: FileLockManager) -> CacheFactory {
        CacheFactory {
            lock_manager,
            registry: Default::default(),
        }
    }

    pub fn lock_manager(&self) -> &FileLockManager {
        &self.lock_manager
    }

    /// Starts configuring the cache in `base_dir`.
    pub fn cache(&self, base_dir: &Path) -> CacheBuilder<'_> {
        CacheBuilder {
            factory: self,
            settings: CacheSettings::new(base_dir),
        }
    }

    fn open(&self, mut settings: CacheSettings) -> Result<PersistentCache> {
        std::fs::create_dir_all(&settings.base_dir)?;
        settings.base_dir = settings.base_dir.canonicalize()?;
        let base_dir = settings.base_dir.clone();

        let mut dirs = self.registry.dirs.lock();
        if let Some(entry) = dirs.get_mut(&base_dir) {
            if entry.cache.lock_options() != settings.lock_options {
                return Err(Error::IncompatibleReuse(base_dir, "lock options"));
            }
            if entry.cache.properties() != &settings.properties {
                return Err(Error::IncompatibleReuse(base_dir, "properties"));
            }

            entry.references += 1;
            return Ok(PersistentCache::new(entry.cache.clone(), self.registry.clone()));
        }

        // Opening may block on the file lock; the registry stays locked
        // so that concurrent opens of one directory wait for each other.
        let cache = Arc::new(DirectoryCache::open(settings, &self.lock_manager)?);
        dirs.insert(
            base_dir,
            DirCacheReference {
                cache: cache.clone(),
                references: 1,
            },
        );

        Ok(PersistentCache::new(cache, self.registry.clone()))
    }
}

/// Configures a cache directory before opening it with [`CacheBuilder::open`].
#[must_use]
pub struct CacheBuilder<'a> {
    factory: &'a CacheFactory,
    settings: CacheSettings,
}

impl CacheBuilder<'_> {
    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.settings.display_name = Some(display_name.to_owned());
        self
    }

    /// Properties that identify the cache's format.  A directory whose
    /// `cache.properties` do not match is wiped on open.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.settings.properties = properties;
        self
    }

    pub fn with_lock_target(mut self, lock_target: &Path) -> Self {
        self.settings.lock_target = Some(lock_target.to_owned());
        self
    }

    pub fn with_lock_options(mut self, lock_options: LockOptions) -> Self {
        self.settings.lock_options = lock_options;
        self
    }

    pub fn with_initializer(mut self, initializer: Arc<dyn CacheInitializationAction>) -> Self {
        self.settings.initializer = Some(initializer);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn CacheValidator>) -> Self {
        self.settings.validator = Some(validator);
        self
    }

    pub fn with_cleanup(mut self, action: Arc<dyn CleanupAction>, frequency: CleanupFrequency) -> Self {
        self.settings.cleanup = Some((action, frequency));
        self
    }

    pub fn open(self) -> Result<PersistentCache> {
        self.factory.open(self.settings)
    }
}

/// A reference to an open cache directory.  Dropping the reference
/// closes it, logging any failure; call [`PersistentCache::close`] to
/// see the failure instead.
pub struct PersistentCache {
    cache: Arc<DirectoryCache>,
    registry: Arc<Registry>,
    released: bool,
}

impl std::fmt::Debug for PersistentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PersistentCache").field(&self.cache).finish()
    }
}

impl PersistentCache {
    fn new(cache: Arc<DirectoryCache>, registry: Arc<Registry>) -> PersistentCache {
        PersistentCache {
            cache,
            registry,
            released: false,
        }
    }

    pub fn base_dir(&self) -> &Path {
        self.cache.base_dir()
    }

    pub fn display_name(&self) -> &str {
        self.cache.display_name()
    }

    /// The lock file, `cache.properties` and `gc.properties`: files
    /// that cleanup never deletes.
    pub fn reserved_files(&self) -> Vec<PathBuf> {
        self.cache.reserved_files().to_vec()
    }

    /// Runs `action` as a unit of work.  See [`crate::CacheCoordinator::use_cache`].
    pub fn use_cache<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.cache.coordinator().use_cache(action)
    }

    pub fn with_file_lock<T>(&self, action: impl FnOnce() -> Result<T>) -> Result<T> {
        self.cache.coordinator().with_file_lock(action)
    }

    pub fn create_cache<K: CacheKey, V: CacheValue>(
        &self,
        parameters: &IndexedCacheParameters<K, V>,
    ) -> Result<PersistentIndexedCache<K, V>> {
        self.cache.coordinator().new_cache(parameters)
    }

    pub fn cache_exists<K: CacheKey, V: CacheValue>(&self, parameters: &IndexedCacheParameters<K, V>) -> bool {
        self.cache.coordinator().cache_exists(parameters)
    }

    /// Runs cleanup now, if configured and due.
    pub fn cleanup(&self) -> Result<()> {
        self.cache.coordinator().cleanup()
    }

    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }

        self.registry.release(self.cache.base_dir())
    }
}

impl Drop for PersistentCache {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("failed to close {}: {}", self.cache.display_name(), e);
        }
    }
}

#[cfg(test)]
fn string_parameters(name: &str) -> IndexedCacheParameters<String, String> {
    use crate::serializer::StringSerializer;

    IndexedCacheParameters::of(name, StringSerializer, StringSerializer)
}

/// Entries written before a close are there after a reopen.
#[test]
fn test_entries_survive_reopen() {
    use crate::decorator::CacheDecorator;
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let factory = CacheFactory::new();
    let parameters =
        string_parameters("entries").with_cache_decorator(CacheDecorator::in_memory_cache(10));

    let cache = factory
        .cache(&temp.path("cache"))
        .open()
        .expect("open must succeed");
    let entries = cache.create_cache(&parameters).expect("create_cache must succeed");
    entries
        .put("k".to_owned(), "v".to_owned())
        .expect("put must succeed");
    cache.close().expect("close must succeed");

    let cache = factory
        .cache(&temp.path("cache"))
        .open()
        .expect("open must succeed");
    assert!(cache.cache_exists(&parameters));
    let entries = cache.create_cache(&parameters).expect("create_cache must succeed");
    assert_eq!(
        entries.get(&"k".to_owned()).expect("get must succeed"),
        Some("v".to_owned())
    );
    assert_eq!(
        entries
            .get_or_create(&"other".to_owned(), |key| Ok(format!("made {}", key)))
            .expect("get_or_create must succeed"),
        "made other"
    );
    cache.close().expect("close must succeed");
}

/// The same directory opened twice shares one cache, and stays open
/// until both references are closed.
#[test]
fn test_reuse_is_reference_counted() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let factory = CacheFactory::new();

    let first = factory
        .cache(&temp.path("cache"))
        .open()
        .expect("open must succeed");
    let second = factory
        .cache(&temp.path("cache/../cache"))
        .open()
        .expect("reopen must succeed");
    let entries = first
        .create_cache(&string_parameters("shared"))
        .expect("create_cache must succeed");
    assert!(entries.ptr_eq(
        &second
            .create_cache(&string_parameters("shared"))
            .expect("create_cache must succeed")
    ));

    first.close().expect("close must succeed");
    second
        .use_cache(|| entries.put("k".to_owned(), "v".to_owned()))
        .expect("use_cache must succeed on the remaining reference");
    second.close().expect("close must succeed");
    assert!(factory.registry.dirs.lock().is_empty());
}

#[test]
fn test_incompatible_reuse() {
    use crate::file_lock::LockMode;
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let factory = CacheFactory::new();
    let cache = factory
        .cache(&temp.path("cache"))
        .open()
        .expect("open must succeed");

    match factory
        .cache(&temp.path("cache"))
        .with_lock_options(LockOptions::mode(LockMode::Exclusive))
        .open()
    {
        Err(Error::IncompatibleReuse(_, what)) => assert_eq!(what, "lock options"),
        other => panic!("expected incompatible reuse, got {:?}", other),
    }

    let mut properties = Properties::new();
    properties.insert("version".to_owned(), "2".to_owned());
    match factory.cache(&temp.path("cache")).with_properties(properties).open() {
        Err(e @ Error::IncompatibleReuse(..)) => {
            assert!(e.to_string().ends_with("is already open with different properties."))
        }
        other => panic!("expected incompatible reuse, got {:?}", other),
    }

    cache.close().expect("close must succeed");
}

/// Two factories stand in for two processes: the second waits for the
/// first to hand over its on-demand lock.
#[cfg(target_os = "linux")]
#[test]
fn test_on_demand_handover_between_factories() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let first = CacheFactory::new();
    let second = CacheFactory::new();

    let one = first
        .cache(&temp.path("cache"))
        .open()
        .expect("open must succeed");
    let one_entries = one
        .create_cache(&string_parameters("entries"))
        .expect("create_cache must succeed");
    one.use_cache(|| one_entries.put("k".to_owned(), "from one".to_owned()))
        .expect("put must succeed");

    let two = second
        .cache(&temp.path("cache"))
        .open()
        .expect("open must succeed");
    let two_entries = two
        .create_cache(&string_parameters("entries"))
        .expect("create_cache must succeed");
    assert_eq!(
        two.use_cache(|| two_entries.get(&"k".to_owned()))
            .expect("get must succeed"),
        Some("from one".to_owned())
    );

    two.close().expect("close must succeed");
    one.close().expect("close must succeed");
}

/// Cleanup configured on the builder runs at close once due.
#[test]
fn test_cleanup_on_close() {
    use crate::cleanup::{FilesFinder, PolicyCleanup, GC_PROPERTIES};
    use crate::retention::FixedAge;
    use filetime::FileTime;
    use std::time::Duration;
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let factory = CacheFactory::new();
    let open = || {
        factory
            .cache(&temp.path("cache"))
            .with_cleanup(
                Arc::new(PolicyCleanup::new(
                    FilesFinder::AllFiles { max_depth: 2 },
                    Arc::new(FixedAge::new(Duration::from_secs(3600))),
                )),
                CleanupFrequency::Daily,
            )
            .open()
            .expect("open must succeed")
    };

    // The first close only starts the cleanup clock.
    open().close().expect("close must succeed");
    let base = temp.path("cache");
    assert!(base.join(GC_PROPERTIES).exists());

    let old = FileTime::from_unix_time(FileTime::now().unix_seconds() - 2 * 24 * 3600, 0);
    std::fs::create_dir_all(base.join("files")).expect("create_dir_all must succeed");
    std::fs::write(base.join("files/stale"), b"x").expect("write must succeed");
    std::fs::write(base.join("fresh"), b"x").expect("write must succeed");
    filetime::set_file_mtime(base.join("files/stale"), old).expect("set_file_mtime must succeed");

    let cache = open();
    let reserved = cache.reserved_files();
    for file in &reserved {
        if file.exists() {
            filetime::set_file_mtime(file, old).expect("set_file_mtime must succeed");
        }
    }
    cache.close().expect("close must succeed");

    assert!(!base.join("files").exists());
    assert!(base.join("fresh").exists());
    for file in &reserved {
        assert!(file.exists(), "{} must survive cleanup", file.display());
    }
}
