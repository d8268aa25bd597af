//! A cache directory: a coordinator over a base directory whose
//! contents are described by `cache.properties`.
//!
//! When the directory's lock was not released cleanly, its validator
//! rejects it, or its properties changed, the directory is wiped (all
//! but the lock file and `cache.properties`) and initialised again
//! before anyone gets to use it.
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::benign_error::remove_path_if_present;
use crate::cleanup::CacheCleanupExecutor;
use crate::cleanup::CleanableDirectory;
use crate::cleanup::CleanupAction;
use crate::cleanup::CleanupFrequency;
use crate::cleanup::GatedCleanupExecutor;
use crate::cleanup::GC_PROPERTIES;
use crate::coordinator::CacheCoordinator;
use crate::cross_process::CacheInitializationAction;
use crate::cross_process::NoInitialization;
use crate::error::Error;
use crate::error::Result;
use crate::file_lock::lock_file_for;
use crate::file_lock::FileLock;
use crate::file_lock::FileLockManager;
use crate::file_lock::LockMode;
use crate::file_lock::LockOptions;
use crate::properties;
use crate::properties::Properties;

pub const CACHE_PROPERTIES: &str = "cache.properties";

/// Decides whether a cache directory's contents can still be used.
pub trait CacheValidator: Send + Sync {
    fn is_valid(&self) -> bool;
}

/// Everything needed to open a cache directory.
#[derive(Clone)]
pub(crate) struct CacheSettings {
    pub base_dir: PathBuf,
    pub display_name: Option<String>,
    pub properties: Properties,
    pub lock_target: Option<PathBuf>,
    pub lock_options: LockOptions,
    pub initializer: Option<Arc<dyn CacheInitializationAction>>,
    pub validator: Option<Arc<dyn CacheValidator>>,
    pub cleanup: Option<(Arc<dyn CleanupAction>, CleanupFrequency)>,
}

impl CacheSettings {
    pub fn new(base_dir: &Path) -> CacheSettings {
        CacheSettings {
            base_dir: base_dir.to_owned(),
            display_name: None,
            properties: Properties::new(),
            lock_target: None,
            lock_options: LockOptions::mode(LockMode::OnDemand),
            initializer: None,
            validator: None,
            cleanup: None,
        }
    }
}

/// Wipes and re-initialises the directory when its contents cannot be
/// trusted.
struct DirectoryInitializer {
    display_name: String,
    base_dir: PathBuf,
    properties_file: PathBuf,
    properties: Properties,
    validator: Option<Arc<dyn CacheValidator>>,
    action: Arc<dyn CacheInitializationAction>,
}

impl DirectoryInitializer {
    fn properties_changed(&self) -> Result<bool> {
        let current = match properties::load(&self.properties_file)? {
            Some(current) => current,
            None => {
                tracing::debug!("Invalidating {} as its properties are missing.", self.display_name);
                return Ok(true);
            }
        };

        for (key, expected) in &self.properties {
            if current.get(key) != Some(expected) {
                tracing::debug!(
                    "Invalidating {} as cache property {} has changed from {:?} to {:?}.",
                    self.display_name,
                    key,
                    current.get(key),
                    expected
                );
                return Ok(true);
            }
        }

        Ok(false)
    }
}

impl CacheInitializationAction for DirectoryInitializer {
    fn requires_initialization(&self, lock: &FileLock) -> Result<bool> {
        if !lock.unlocked_cleanly()? {
            if lock.state()?.is_in_initial_state() {
                tracing::debug!("Creating new cache for {}", self.display_name);
            } else {
                tracing::warn!("Invalidating {} as it was not closed cleanly.", self.display_name);
            }
            return Ok(true);
        }

        if let Some(validator) = &self.validator {
            if !validator.is_valid() {
                tracing::debug!("Invalidating {} as cache validator return false.", self.display_name);
                return Ok(true);
            }
        }

        if self.properties_changed()? {
            return Ok(true);
        }

        self.action.requires_initialization(lock)
    }

    fn initialize(&self, lock: &FileLock) -> Result<()> {
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if lock.is_lock_file(&path) || path == self.properties_file {
                continue;
            }

            remove_path_if_present(&path)?;
        }

        self.action.initialize(lock)?;
        properties::store(&self.properties_file, &self.properties)
    }
}

/// An open cache directory.  The factory hands out references to it.
pub(crate) struct DirectoryCache {
    base_dir: PathBuf,
    display_name: String,
    properties: Properties,
    lock_options: LockOptions,
    reserved_files: Vec<PathBuf>,
    coordinator: CacheCoordinator,
}

impl std::fmt::Debug for DirectoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryCache")
            .field("base_dir", &self.base_dir)
            .field("display_name", &self.display_name)
            .field("lock_options", &self.lock_options)
            .finish()
    }
}

impl DirectoryCache {
    /// Creates the base directory if needed, and opens the cache.
    /// `settings.base_dir` should be canonical.
    pub fn open(settings: CacheSettings, lock_manager: &FileLockManager) -> Result<DirectoryCache> {
        let base_dir = settings.base_dir.clone();
        let display_name = settings.display_name.clone().unwrap_or_else(|| {
            let name = base_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("cache {} ({})", name, base_dir.display())
        });
        let properties = settings.properties.clone();
        let lock_options = settings.lock_options;

        let (coordinator, reserved_files) =
            DirectoryCache::open_coordinator(settings, &display_name, lock_manager).map_err(|e| {
                Error::CacheOpen {
                    display_name: display_name.clone(),
                    source: Box::new(e),
                }
            })?;

        Ok(DirectoryCache {
            base_dir,
            display_name,
            properties,
            lock_options,
            reserved_files,
            coordinator,
        })
    }

    fn open_coordinator(
        settings: CacheSettings,
        display_name: &str,
        lock_manager: &FileLockManager,
    ) -> Result<(CacheCoordinator, Vec<PathBuf>)> {
        let base_dir = settings.base_dir;
        std::fs::create_dir_all(&base_dir)?;

        let lock_target = settings.lock_target.unwrap_or_else(|| base_dir.clone());
        let properties_file = base_dir.join(CACHE_PROPERTIES);
        let reserved_files = vec![
            lock_file_for(&lock_target),
            properties_file.clone(),
            base_dir.join(GC_PROPERTIES),
        ];

        let initializer = DirectoryInitializer {
            display_name: display_name.to_owned(),
            base_dir: base_dir.clone(),
            properties_file,
            properties: settings.properties,
            validator: settings.validator,
            action: settings
                .initializer
                .unwrap_or_else(|| Arc::new(NoInitialization)),
        };

        let mut builder = CacheCoordinator::builder(display_name, &base_dir, lock_manager)
            .with_lock_target(&lock_target)
            .with_lock_options(settings.lock_options)
            .with_initializer(Arc::new(initializer));
        if let Some((action, frequency)) = settings.cleanup {
            let store = CleanableDirectory::new(display_name, &base_dir, reserved_files.clone());
            let executor: Arc<dyn CacheCleanupExecutor> =
                Arc::new(GatedCleanupExecutor::new(Arc::new(store), action, frequency));
            builder = builder.with_cleanup(executor);
        }

        let coordinator = builder.build();
        coordinator.open()?;
        Ok((coordinator, reserved_files))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn lock_options(&self) -> LockOptions {
        self.lock_options
    }

    /// Files in the directory that belong to the cache machinery itself.
    pub fn reserved_files(&self) -> &[PathBuf] {
        &self.reserved_files
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }

    pub fn close(&self) -> Result<()> {
        self.coordinator.close()
    }
}

#[cfg(test)]
fn test_settings(base_dir: &Path, mode: LockMode) -> CacheSettings {
    let mut settings = CacheSettings::new(base_dir);
    settings.lock_options = LockOptions::mode(mode);
    settings.properties.insert("version".to_owned(), "1".to_owned());
    settings
}

/// A new directory is initialised: properties written, nothing else
/// besides the lock file.
#[test]
fn test_new_directory_is_initialized() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let base = temp.path("cache").canonicalize().expect("canonicalize must succeed");
    let cache = DirectoryCache::open(test_settings(&base, LockMode::Exclusive), &FileLockManager::new())
        .expect("open must succeed");

    let stored = properties::load(&base.join(CACHE_PROPERTIES))
        .expect("load must succeed")
        .expect("properties must exist");
    assert_eq!(stored.get("version").map(String::as_str), Some("1"));
    assert!(cache.reserved_files()[0].exists());
    assert_eq!(cache.display_name(), format!("cache cache ({})", base.display()));
    cache.close().expect("close must succeed");
}

/// Changing a property wipes the directory on the next open; keeping
/// them keeps its contents.
#[test]
fn test_property_change_wipes_contents() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let base = temp.path("cache").canonicalize().expect("canonicalize must succeed");
    let manager = FileLockManager::new();

    DirectoryCache::open(test_settings(&base, LockMode::Exclusive), &manager)
        .expect("open must succeed")
        .close()
        .expect("close must succeed");
    std::fs::write(base.join("data"), b"payload").expect("write must succeed");

    DirectoryCache::open(test_settings(&base, LockMode::Exclusive), &manager)
        .expect("open must succeed")
        .close()
        .expect("close must succeed");
    assert!(base.join("data").exists());

    let mut settings = test_settings(&base, LockMode::Exclusive);
    settings.properties.insert("version".to_owned(), "2".to_owned());
    let cache = DirectoryCache::open(settings, &manager).expect("open must succeed");
    assert!(!base.join("data").exists());
    assert!(base.join(CACHE_PROPERTIES).exists());
    cache.close().expect("close must succeed");
}

/// A writer that died mid-update leaves the lock dirty; the next open
/// starts over.
#[test]
fn test_crash_recovery() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let base = temp.path("cache").canonicalize().expect("canonicalize must succeed");
    let manager = FileLockManager::new();

    DirectoryCache::open(test_settings(&base, LockMode::Exclusive), &manager)
        .expect("open must succeed")
        .close()
        .expect("close must succeed");
    std::fs::write(base.join("half-written"), b"junk").expect("write must succeed");

    let lock = manager
        .lock(&base, LockOptions::mode(LockMode::Exclusive), "crashing writer")
        .expect("lock must succeed");
    assert!(lock
        .write_file(|| -> Result<()> { Err(Error::illegal_state("crash")) })
        .is_err());
    assert!(!lock.unlocked_cleanly().expect("state must be readable"));
    lock.close().expect("close must succeed");

    let cache = DirectoryCache::open(test_settings(&base, LockMode::Exclusive), &manager)
        .expect("open must succeed");
    assert!(!base.join("half-written").exists());
    cache.close().expect("close must succeed");
}

#[test]
fn test_invalid_validator_wipes_contents() {
    use test_dir::{DirBuilder, FileType, TestDir};

    struct Invalid;

    impl CacheValidator for Invalid {
        fn is_valid(&self) -> bool {
            false
        }
    }

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let base = temp.path("cache").canonicalize().expect("canonicalize must succeed");
    let manager = FileLockManager::new();

    DirectoryCache::open(test_settings(&base, LockMode::Exclusive), &manager)
        .expect("open must succeed")
        .close()
        .expect("close must succeed");
    std::fs::write(base.join("data"), b"payload").expect("write must succeed");

    let mut settings = test_settings(&base, LockMode::Exclusive);
    settings.validator = Some(Arc::new(Invalid));
    DirectoryCache::open(settings, &manager)
        .expect("open must succeed")
        .close()
        .expect("close must succeed");
    assert!(!base.join("data").exists());
}

#[test]
fn test_open_failure_names_the_cache() {
    use test_dir::{DirBuilder, FileType, TestDir};

    struct Failing;

    impl CacheInitializationAction for Failing {
        fn requires_initialization(&self, _lock: &FileLock) -> Result<bool> {
            Ok(true)
        }

        fn initialize(&self, _lock: &FileLock) -> Result<()> {
            Err(Error::illegal_state("no room"))
        }
    }

    let temp = TestDir::temp().create("cache", FileType::Dir);
    let base = temp.path("cache").canonicalize().expect("canonicalize must succeed");
    let mut settings = test_settings(&base, LockMode::Exclusive);
    settings.display_name = Some("failing cache".to_owned());
    settings.initializer = Some(Arc::new(Failing));

    match DirectoryCache::open(settings, &FileLockManager::new()) {
        Err(e @ Error::CacheOpen { .. }) => {
            assert_eq!(e.to_string(), "Could not open failing cache: no room")
        }
        other => panic!("expected an open failure, got {:?}", other),
    }
}
