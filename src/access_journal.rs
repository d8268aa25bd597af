//! Journals of when cached files were last used, for least recently
//! used cleanup.
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use filetime::FileTime;

use crate::benign_error::is_absent_file_error;
use crate::decorator::CacheDecorator;
use crate::error::Result;
use crate::factory::CacheFactory;
use crate::factory::PersistentCache;
use crate::file_lock::LockMode;
use crate::file_lock::LockOptions;
use crate::indexed_cache::IndexedCacheParameters;
use crate::indexed_cache::PersistentIndexedCache;
use crate::properties;
use crate::properties::Properties;
use crate::serializer::PathSerializer;
use crate::serializer::U64Serializer;

/// Name of the indexed cache that maps files to access times.
pub const FILE_ACCESS_CACHE_NAME: &str = "file-access";

pub const FILE_ACCESS_PROPERTIES: &str = "file-access.properties";

const INCEPTION_TIMESTAMP_KEY: &str = "inceptionTimestamp";

const IN_MEMORY_ENTRIES: usize = 10_000;

/// Milliseconds since the Unix epoch; times before it map to 0.
pub fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

pub trait FileAccessTimeJournal: Send + Sync {
    fn set_last_access_time(&self, file: &Path, millis: u64) -> Result<()>;

    fn get_last_access_time(&self, file: &Path) -> Result<u64>;

    fn delete_last_access_time(&self, file: &Path) -> Result<()>;

    /// Looks up the access times of `files`, in order, as one snapshot.
    fn get_last_access_times(&self, files: &[&Path]) -> Result<Vec<u64>> {
        files
            .iter()
            .map(|file| self.get_last_access_time(file))
            .collect()
    }

    /// Forgets the access times of all of `files` at once.
    fn delete_last_access_times(&self, files: &[PathBuf]) -> Result<()> {
        for file in files {
            self.delete_last_access_time(file)?;
        }

        Ok(())
    }
}

/// Uses the files' own mtime as their access time.  Missing files were
/// last accessed at the epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModificationTimeFileAccessTimeJournal;

impl FileAccessTimeJournal for ModificationTimeFileAccessTimeJournal {
    fn set_last_access_time(&self, file: &Path, millis: u64) -> Result<()> {
        let time = FileTime::from_unix_time((millis / 1000) as i64, ((millis % 1000) * 1_000_000) as u32);
        match filetime::set_file_mtime(file, time) {
            Err(e) if is_absent_file_error(&e) => Ok(()),
            other => Ok(other?),
        }
    }

    fn get_last_access_time(&self, file: &Path) -> Result<u64> {
        match std::fs::metadata(file).and_then(|meta| meta.modified()) {
            Ok(mtime) => Ok(millis_since_epoch(mtime)),
            Err(e) if is_absent_file_error(&e) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_last_access_time(&self, _file: &Path) -> Result<()> {
        Ok(())
    }
}

/// Keeps access times in their own cache directory.  Files the journal
/// has never seen count as accessed when the journal was created.
pub struct PersistentFileAccessTimeJournal {
    entries: PersistentIndexedCache<PathBuf, u64>,
    inception_timestamp: u64,
    // Dropped last, after the indexed cache handle.
    cache: PersistentCache,
}

impl std::fmt::Debug for PersistentFileAccessTimeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentFileAccessTimeJournal")
            .field("base_dir", &self.cache.base_dir())
            .field("inception_timestamp", &self.inception_timestamp)
            .finish()
    }
}

impl PersistentFileAccessTimeJournal {
    pub fn open(factory: &CacheFactory, base_dir: &Path) -> Result<PersistentFileAccessTimeJournal> {
        let cache = factory
            .cache(base_dir)
            .with_display_name("file access time journal")
            .with_lock_options(LockOptions::mode(LockMode::OnDemand))
            .open()?;
        let entries = cache.create_cache(
            &IndexedCacheParameters::of(FILE_ACCESS_CACHE_NAME, PathSerializer, U64Serializer)
                .with_cache_decorator(CacheDecorator::in_memory_cache(IN_MEMORY_ENTRIES)),
        )?;
        let inception_timestamp = cache.use_cache(|| load_or_persist_inception(cache.base_dir()))?;

        Ok(PersistentFileAccessTimeJournal {
            entries,
            inception_timestamp,
            cache,
        })
    }

    pub fn inception_timestamp(&self) -> u64 {
        self.inception_timestamp
    }

    pub fn close(self) -> Result<()> {
        self.cache.close()
    }
}

/// Reads the journal's creation time, recording the current time if
/// there is none yet.
fn load_or_persist_inception(base_dir: &Path) -> Result<u64> {
    let path = base_dir.join(FILE_ACCESS_PROPERTIES);
    let recorded = properties::load(&path)?
        .and_then(|props| props.get(INCEPTION_TIMESTAMP_KEY).and_then(|value| value.parse().ok()));
    if let Some(timestamp) = recorded {
        return Ok(timestamp);
    }

    let now = millis_since_epoch(SystemTime::now());
    let mut props = Properties::new();
    props.insert(INCEPTION_TIMESTAMP_KEY.to_owned(), now.to_string());
    properties::store(&path, &props)?;
    Ok(now)
}

impl FileAccessTimeJournal for PersistentFileAccessTimeJournal {
    fn set_last_access_time(&self, file: &Path, millis: u64) -> Result<()> {
        self.entries.put(file.to_owned(), millis)
    }

    fn get_last_access_time(&self, file: &Path) -> Result<u64> {
        Ok(self
            .entries
            .get(&file.to_owned())?
            .unwrap_or(self.inception_timestamp))
    }

    fn delete_last_access_time(&self, file: &Path) -> Result<()> {
        self.entries.remove(&file.to_owned())
    }

    fn get_last_access_times(&self, files: &[&Path]) -> Result<Vec<u64>> {
        self.cache.use_cache(|| {
            files
                .iter()
                .map(|file| self.get_last_access_time(file))
                .collect()
        })
    }

    fn delete_last_access_times(&self, files: &[PathBuf]) -> Result<()> {
        self.cache.use_cache(|| {
            for file in files {
                self.entries.remove(file)?;
            }

            Ok(())
        })
    }
}

#[test]
fn test_modification_time_journal() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("file", FileType::ZeroFile(1));
    let journal = ModificationTimeFileAccessTimeJournal;

    journal
        .set_last_access_time(&temp.path("file"), 1_500_000_000_000)
        .expect("set must succeed");
    assert_eq!(
        journal
            .get_last_access_time(&temp.path("file"))
            .expect("get must succeed"),
        1_500_000_000_000
    );
    assert_eq!(
        journal
            .get_last_access_time(&temp.path("missing"))
            .expect("get must succeed"),
        0
    );
}

/// Access times survive a reopen; unknown files default to the
/// inception time, which is stable across reopens.
#[test]
fn test_persistent_journal() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("journal", FileType::Dir);
    let factory = CacheFactory::new();
    let seen = Path::new("/cache/seen");
    let unseen = Path::new("/cache/unseen");

    let journal = PersistentFileAccessTimeJournal::open(&factory, &temp.path("journal"))
        .expect("open must succeed");
    let inception = journal.inception_timestamp();
    assert!(inception > 0);
    journal
        .set_last_access_time(seen, 42)
        .expect("set must succeed");
    assert_eq!(journal.get_last_access_time(seen).expect("get must succeed"), 42);
    assert_eq!(
        journal.get_last_access_time(unseen).expect("get must succeed"),
        inception
    );
    journal.close().expect("close must succeed");

    let journal = PersistentFileAccessTimeJournal::open(&factory, &temp.path("journal"))
        .expect("reopen must succeed");
    assert_eq!(journal.inception_timestamp(), inception);
    assert_eq!(journal.get_last_access_time(seen).expect("get must succeed"), 42);

    journal
        .delete_last_access_time(seen)
        .expect("delete must succeed");
    assert_eq!(
        journal.get_last_access_time(seen).expect("get must succeed"),
        inception
    );
    journal.close().expect("close must succeed");
}

/// Bulk lookups and deletions see and forget several files in one go.
#[test]
fn test_persistent_journal_bulk_operations() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("journal", FileType::Dir);
    let factory = CacheFactory::new();
    let journal = PersistentFileAccessTimeJournal::open(&factory, &temp.path("journal"))
        .expect("open must succeed");
    let inception = journal.inception_timestamp();

    let files: Vec<PathBuf> = (0..3).map(|i| PathBuf::from(format!("/cache/{}", i))).collect();
    for (i, file) in files.iter().enumerate() {
        journal
            .set_last_access_time(file, 100 + i as u64)
            .expect("set must succeed");
    }

    let paths: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
    assert_eq!(
        journal
            .get_last_access_times(&paths)
            .expect("bulk get must succeed"),
        vec![100, 101, 102]
    );

    journal
        .delete_last_access_times(&files[..2])
        .expect("bulk delete must succeed");
    assert_eq!(
        journal
            .get_last_access_times(&paths)
            .expect("bulk get must succeed"),
        vec![inception, inception, 102]
    );
    journal.close().expect("close must succeed");
}
