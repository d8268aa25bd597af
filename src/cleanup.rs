//! Cleanup of cache directories.
//!
//! A [`CleanupAction`] removes stale files from a [`CleanableStore`].
//! The usual action is a [`PolicyCleanup`]: a [`FilesFinder`] lists
//! candidate files, a [`CleanupPolicy`] (see `retention`) picks the
//! ones to delete, and directories emptied by the deletions are removed
//! as well.
//!
//! Cleanup is expensive, so caches gate it with a [`CleanupFrequency`]
//! ([`GatedCleanupExecutor`]): the mtime of `gc.properties` in the
//! cache directory records when cleanup last ran.
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use filetime::FileTime;

use crate::benign_error::is_absent_file_error;
use crate::benign_error::remove_dir_if_empty;
use crate::benign_error::remove_file_if_present;
use crate::error::Result;

/// Name of the file whose mtime records the last cleanup.
pub const GC_PROPERTIES: &str = "gc.properties";

/// A directory that cleanup actions may delete files from.
pub trait CleanableStore: Send + Sync {
    fn base_dir(&self) -> &Path;

    /// Files that cleanup must never delete.
    fn reserved_files(&self) -> Vec<PathBuf>;

    fn display_name(&self) -> &str;
}

#[derive(Clone, Debug)]
pub struct CleanableDirectory {
    base_dir: PathBuf,
    display_name: String,
    reserved_files: Vec<PathBuf>,
}

impl CleanableDirectory {
    pub fn new(display_name: &str, base_dir: &Path, reserved_files: Vec<PathBuf>) -> CleanableDirectory {
        CleanableDirectory {
            base_dir: base_dir.to_owned(),
            display_name: display_name.to_owned(),
            reserved_files,
        }
    }
}

impl CleanableStore for CleanableDirectory {
    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn reserved_files(&self) -> Vec<PathBuf> {
        self.reserved_files.clone()
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Counts what a cleanup run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupProgressMonitor {
    deleted: u64,
    skipped: u64,
}

impl CleanupProgressMonitor {
    pub fn increment_deleted(&mut self) {
        self.deleted += 1;
    }

    pub fn increment_skipped(&mut self) {
        self.skipped += 1;
    }

    pub fn deleted(&self) -> u64 {
        self.deleted
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

pub trait CleanupAction: Send + Sync {
    fn clean(&self, store: &dyn CleanableStore, monitor: &mut CleanupProgressMonitor) -> Result<()>;
}

/// Runs several actions in order.  Every action runs even if an
/// earlier one fails; the first failure is returned.
#[derive(Default)]
pub struct CompositeCleanup {
    actions: Vec<Arc<dyn CleanupAction>>,
}

impl CompositeCleanup {
    pub fn new() -> CompositeCleanup {
        Default::default()
    }

    pub fn add(mut self, action: Arc<dyn CleanupAction>) -> CompositeCleanup {
        self.actions.push(action);
        self
    }
}

impl CleanupAction for CompositeCleanup {
    fn clean(&self, store: &dyn CleanableStore, monitor: &mut CleanupProgressMonitor) -> Result<()> {
        let mut ret = Ok(());

        for action in &self.actions {
            if let Err(e) = action.clean(store, monitor) {
                tracing::warn!("cleanup of {} failed: {}", store.display_name(), e);
                if ret.is_ok() {
                    ret = Err(e);
                }
            }
        }

        ret
    }
}

/// Lists the files under a base directory that a cleanup may consider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilesFinder {
    /// Every file at depth 1 through `max_depth`.
    AllFiles { max_depth: usize },
    /// Only the files at exactly this depth.
    SingleDepth(usize),
}

impl FilesFinder {
    pub fn find(&self, base_dir: &Path) -> Vec<PathBuf> {
        let (min_depth, max_depth) = match *self {
            FilesFinder::AllFiles { max_depth } => (1, max_depth),
            FilesFinder::SingleDepth(depth) => (depth, depth),
        };

        walkdir::WalkDir::new(base_dir)
            .min_depth(min_depth)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            // Entries vanish while we walk; that's fine.
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    }
}

/// A file that a [`CleanupPolicy`] may choose to delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub len: u64,
    pub modified: FileTime,
}

pub trait CleanupPolicy: Send + Sync {
    /// Picks the files to delete among `candidates`.
    fn select(&self, candidates: Vec<CandidateFile>) -> Result<Vec<CandidateFile>>;

    /// Called with the files that were actually deleted.
    fn after_deletion(&self, _deleted: &[PathBuf]) -> Result<()> {
        Ok(())
    }
}

/// Deletes the files picked by a policy among the files found by a
/// finder, then removes directories left empty up to the base
/// directory.
pub struct PolicyCleanup {
    finder: FilesFinder,
    policy: Arc<dyn CleanupPolicy>,
}

impl PolicyCleanup {
    pub fn new(finder: FilesFinder, policy: Arc<dyn CleanupPolicy>) -> PolicyCleanup {
        PolicyCleanup { finder, policy }
    }

    fn candidates(&self, store: &dyn CleanableStore) -> Result<Vec<CandidateFile>> {
        let reserved = store.reserved_files();
        let mut candidates = Vec::new();

        for path in self.finder.find(store.base_dir()) {
            if reserved.contains(&path) {
                continue;
            }

            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) if is_absent_file_error(&e) => continue,
                Err(e) => return Err(e.into()),
            };

            candidates.push(CandidateFile {
                path,
                len: meta.len(),
                modified: FileTime::from_last_modification_time(&meta),
            });
        }

        Ok(candidates)
    }

    /// Removes the now empty ancestors of `path`, stopping at `base_dir`.
    /// Returns the number of directories removed.
    fn remove_empty_parents(path: &Path, base_dir: &Path) -> u64 {
        let mut removed = 0;
        let mut dir = path.parent();

        while let Some(current) = dir {
            if current == base_dir || !current.starts_with(base_dir) {
                break;
            }

            match remove_dir_if_empty(current) {
                Ok(true) => removed += 1,
                _ => break,
            }
            dir = current.parent();
        }

        removed
    }
}

impl CleanupAction for PolicyCleanup {
    fn clean(&self, store: &dyn CleanableStore, monitor: &mut CleanupProgressMonitor) -> Result<()> {
        let candidates = self.candidates(store)?;
        let total = candidates.len();
        let selected = self.policy.select(candidates)?;
        for _ in selected.len()..total {
            monitor.increment_skipped();
        }

        let mut deleted = Vec::new();
        let mut deleted_count = 0;
        for candidate in selected {
            match remove_file_if_present(&candidate.path) {
                Ok(_) => {
                    deleted_count += 1 + Self::remove_empty_parents(&candidate.path, store.base_dir());
                    monitor.increment_deleted();
                    deleted.push(candidate.path);
                }
                Err(e) => {
                    tracing::warn!("failed to delete {}: {}", candidate.path.display(), e);
                    monitor.increment_skipped();
                }
            }
        }

        self.policy.after_deletion(&deleted)?;
        tracing::info!(
            "{} cleanup deleted {} files/directories.",
            store.display_name(),
            deleted_count
        );
        Ok(())
    }
}

/// How often a gated cleanup runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupFrequency {
    Daily,
    Weekly,
    Always,
    Never,
    Every(Duration),
}

impl CleanupFrequency {
    /// Whether cleanup is due, given when it last ran.  `None` means
    /// no cleanup has been recorded yet.
    pub fn should_clean_up(&self, last: Option<SystemTime>, now: SystemTime) -> bool {
        let period = match self {
            CleanupFrequency::Always => return true,
            CleanupFrequency::Never => return false,
            CleanupFrequency::Daily => Duration::from_secs(24 * 3600),
            CleanupFrequency::Weekly => Duration::from_secs(7 * 24 * 3600),
            CleanupFrequency::Every(period) => *period,
        };

        match last {
            None => false,
            // A last run in the future counts as just now.
            Some(last) => now.duration_since(last).map_or(false, |age| age >= period),
        }
    }
}

/// What a cache coordinator runs when closed, or on demand.
pub trait CacheCleanupExecutor: Send + Sync {
    /// Cleans up if due.  Deciding that nothing is due is not an error.
    fn clean_up(&self) -> Result<()>;
}

/// Runs a cleanup action when the frequency says it's due.
pub struct GatedCleanupExecutor {
    store: Arc<dyn CleanableStore>,
    action: Arc<dyn CleanupAction>,
    frequency: CleanupFrequency,
}

impl GatedCleanupExecutor {
    pub fn new(
        store: Arc<dyn CleanableStore>,
        action: Arc<dyn CleanupAction>,
        frequency: CleanupFrequency,
    ) -> GatedCleanupExecutor {
        GatedCleanupExecutor {
            store,
            action,
            frequency,
        }
    }

    fn gc_file(&self) -> PathBuf {
        self.store.base_dir().join(GC_PROPERTIES)
    }

    /// Whether cleanup is due.  Creates the marker file if it is
    /// missing, which starts the clock for the next cleanup.
    pub fn requires_cleanup(&self) -> Result<bool> {
        if self.frequency == CleanupFrequency::Never {
            return Ok(false);
        }

        let gc_file = self.gc_file();
        let last = match std::fs::metadata(&gc_file) {
            Ok(meta) => Some(meta.modified()?),
            Err(e) if is_absent_file_error(&e) => {
                std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&gc_file)?;
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(self.frequency.should_clean_up(last, SystemTime::now()))
    }

    fn mark_cleaned(&self) -> Result<()> {
        let gc_file = self.gc_file();
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&gc_file)?;
        filetime::set_file_mtime(&gc_file, FileTime::now())?;
        Ok(())
    }
}

impl CacheCleanupExecutor for GatedCleanupExecutor {
    fn clean_up(&self) -> Result<()> {
        if !self.requires_cleanup()? {
            return Ok(());
        }

        let start = std::time::Instant::now();
        let mut monitor = CleanupProgressMonitor::default();
        self.action.clean(&*self.store, &mut monitor)?;
        self.mark_cleaned()?;
        tracing::debug!(
            "{} cleaned up in {:?}: {} deleted, {} skipped",
            self.store.display_name(),
            start.elapsed(),
            monitor.deleted(),
            monitor.skipped()
        );
        Ok(())
    }
}

#[cfg(test)]
struct DeleteAll;

#[cfg(test)]
impl CleanupPolicy for DeleteAll {
    fn select(&self, candidates: Vec<CandidateFile>) -> Result<Vec<CandidateFile>> {
        Ok(candidates)
    }
}

#[test]
fn test_finders_respect_depth() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("a", FileType::ZeroFile(1))
        .create("sub", FileType::Dir)
        .create("sub/b", FileType::ZeroFile(1))
        .create("sub/deeper", FileType::Dir)
        .create("sub/deeper/c", FileType::ZeroFile(1));
    let base = temp.path(".");

    assert_eq!(
        FilesFinder::AllFiles { max_depth: 2 }.find(&base),
        vec![base.join("a"), base.join("sub/b")]
    );
    assert_eq!(
        FilesFinder::SingleDepth(3).find(&base),
        vec![base.join("sub/deeper/c")]
    );
}

/// Deleting files also deletes the directories they leave empty, but
/// never the base directory or reserved files.
#[test]
fn test_policy_cleanup_removes_empty_parents() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("base", FileType::Dir)
        .create("base/cache.properties", FileType::ZeroFile(1))
        .create("base/x", FileType::Dir)
        .create("base/x/y", FileType::Dir)
        .create("base/x/y/file", FileType::ZeroFile(10))
        .create("base/keep", FileType::Dir)
        .create("base/keep/file", FileType::ZeroFile(10))
        .create("base/keep/other", FileType::Dir);
    let base = temp.path("base");
    let store = CleanableDirectory::new(
        "test cache",
        &base,
        vec![base.join("cache.properties"), base.join("keep/file")],
    );

    let mut monitor = CleanupProgressMonitor::default();
    PolicyCleanup::new(FilesFinder::AllFiles { max_depth: 3 }, Arc::new(DeleteAll))
        .clean(&store, &mut monitor)
        .expect("cleanup must succeed");

    assert_eq!(monitor.deleted(), 1);
    assert!(!base.join("x").exists());
    assert!(base.join("cache.properties").exists());
    assert!(base.join("keep/file").exists());
    assert!(base.exists());
}

#[test]
fn test_frequency() {
    let now = SystemTime::now();
    let hour = Duration::from_secs(3600);

    assert!(CleanupFrequency::Always.should_clean_up(None, now));
    assert!(!CleanupFrequency::Never.should_clean_up(Some(now - 1000 * hour), now));
    assert!(!CleanupFrequency::Daily.should_clean_up(None, now));
    assert!(!CleanupFrequency::Daily.should_clean_up(Some(now - 23 * hour), now));
    assert!(CleanupFrequency::Daily.should_clean_up(Some(now - 25 * hour), now));
    assert!(!CleanupFrequency::Weekly.should_clean_up(Some(now - 25 * hour), now));
    assert!(CleanupFrequency::Every(hour).should_clean_up(Some(now - 2 * hour), now));
    assert!(!CleanupFrequency::Every(hour).should_clean_up(Some(now + hour), now));
}

/// The first check only creates the marker; cleanup runs once the
/// marker is old enough, and refreshes it.
#[test]
fn test_gated_executor() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_dir::{DirBuilder, FileType, TestDir};

    struct Counting(AtomicUsize);

    impl CleanupAction for Counting {
        fn clean(&self, _store: &dyn CleanableStore, monitor: &mut CleanupProgressMonitor) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            monitor.increment_deleted();
            Ok(())
        }
    }

    let temp = TestDir::temp().create("base", FileType::Dir);
    let base = temp.path("base");
    let action = Arc::new(Counting(AtomicUsize::new(0)));
    let executor = GatedCleanupExecutor::new(
        Arc::new(CleanableDirectory::new("test cache", &base, Vec::new())),
        action.clone(),
        CleanupFrequency::Daily,
    );

    executor.clean_up().expect("cleanup must succeed");
    assert_eq!(action.0.load(Ordering::SeqCst), 0);
    assert!(base.join(GC_PROPERTIES).exists());

    let two_days_ago = FileTime::from_unix_time(FileTime::now().unix_seconds() - 2 * 24 * 3600, 0);
    filetime::set_file_mtime(base.join(GC_PROPERTIES), two_days_ago).expect("set_file_mtime must succeed");
    assert!(executor.requires_cleanup().expect("requires_cleanup must succeed"));

    executor.clean_up().expect("cleanup must succeed");
    assert_eq!(action.0.load(Ordering::SeqCst), 1);
    assert!(!executor.requires_cleanup().expect("requires_cleanup must succeed"));
}
