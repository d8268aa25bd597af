//! Retention policies decide which cached files a
//! [`PolicyCleanup`](crate::cleanup::PolicyCleanup) deletes.
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::SystemTime;

use filetime::FileTime;

use crate::access_journal::millis_since_epoch;
use crate::access_journal::FileAccessTimeJournal;
use crate::cleanup::CandidateFile;
use crate::cleanup::CleanupPolicy;
use crate::error::Result;

const DAY: Duration = Duration::from_secs(24 * 3600);

/// Deletes files last modified more than `max_age` ago.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedAge {
    max_age: Duration,
}

impl FixedAge {
    pub fn new(max_age: Duration) -> FixedAge {
        FixedAge { max_age }
    }

    pub fn days(days: u32) -> FixedAge {
        FixedAge::new(days * DAY)
    }
}

impl CleanupPolicy for FixedAge {
    fn select(&self, candidates: Vec<CandidateFile>) -> Result<Vec<CandidateFile>> {
        let threshold = match SystemTime::now().checked_sub(self.max_age) {
            Some(threshold) => FileTime::from_system_time(threshold),
            None => return Ok(Vec::new()),
        };

        Ok(candidates
            .into_iter()
            .filter(|candidate| candidate.modified < threshold)
            .collect())
    }
}

/// Keeps the most recently modified files that fit in `max_bytes`,
/// and deletes the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedSize {
    max_bytes: u64,
}

impl FixedSize {
    pub fn bytes(max_bytes: u64) -> FixedSize {
        FixedSize { max_bytes }
    }

    pub fn megabytes(max_megabytes: u64) -> FixedSize {
        FixedSize::bytes(max_megabytes.saturating_mul(1024 * 1024))
    }
}

impl CleanupPolicy for FixedSize {
    fn select(&self, mut candidates: Vec<CandidateFile>) -> Result<Vec<CandidateFile>> {
        // Newest first; ties broken by path so runs are repeatable.
        candidates.sort_by(|x, y| {
            y.modified
                .cmp(&x.modified)
                .then_with(|| x.path.cmp(&y.path))
        });

        let mut total = 0u64;
        Ok(candidates
            .into_iter()
            .filter(|candidate| {
                total = total.saturating_add(candidate.len);
                total > self.max_bytes
            })
            .collect())
    }
}

/// Deletes files whose last recorded access is older than `max_age`.
/// Forgets the access times of deleted files.
pub struct LeastRecentlyUsed {
    journal: Arc<dyn FileAccessTimeJournal>,
    max_age: Duration,
}

impl LeastRecentlyUsed {
    pub fn new(journal: Arc<dyn FileAccessTimeJournal>, max_age: Duration) -> LeastRecentlyUsed {
        LeastRecentlyUsed { journal, max_age }
    }

    pub fn days(journal: Arc<dyn FileAccessTimeJournal>, days: u32) -> LeastRecentlyUsed {
        LeastRecentlyUsed::new(journal, days * DAY)
    }
}

impl CleanupPolicy for LeastRecentlyUsed {
    fn select(&self, candidates: Vec<CandidateFile>) -> Result<Vec<CandidateFile>> {
        let threshold = match SystemTime::now().checked_sub(self.max_age) {
            Some(threshold) => millis_since_epoch(threshold),
            None => return Ok(Vec::new()),
        };

        let paths: Vec<&Path> = candidates.iter().map(|candidate| candidate.path.as_path()).collect();
        let accessed = self.journal.get_last_access_times(&paths)?;

        Ok(candidates
            .into_iter()
            .zip(accessed)
            .filter(|(_, accessed)| *accessed < threshold)
            .map(|(candidate, _)| candidate)
            .collect())
    }

    fn after_deletion(&self, deleted: &[PathBuf]) -> Result<()> {
        if deleted.is_empty() {
            return Ok(());
        }

        self.journal.delete_last_access_times(deleted)
    }
}

#[cfg(test)]
fn candidate(name: &str, len: u64, age_secs: i64) -> CandidateFile {
    CandidateFile {
        path: PathBuf::from(name),
        len,
        modified: FileTime::from_unix_time(FileTime::now().unix_seconds() - age_secs, 0),
    }
}

#[cfg(test)]
fn names(files: &[CandidateFile]) -> Vec<&str> {
    files
        .iter()
        .map(|file| file.path.to_str().expect("test paths are utf-8"))
        .collect()
}

#[test]
fn test_fixed_age() {
    let day = 24 * 3600;
    let selected = FixedAge::days(7)
        .select(vec![
            candidate("fresh", 1, day),
            candidate("old", 1, 8 * day),
            candidate("borderline", 1, 6 * day),
        ])
        .expect("select must succeed");

    assert_eq!(names(&selected), vec!["old"]);
}

/// Three 4 MB files against a 10 MB target: only the oldest goes.
#[test]
fn test_fixed_size_deletes_oldest_over_target() {
    let mb = 1024 * 1024;
    let selected = FixedSize::megabytes(10)
        .select(vec![
            candidate("b", 4 * mb, 20),
            candidate("a", 4 * mb, 30),
            candidate("c", 4 * mb, 10),
        ])
        .expect("select must succeed");

    assert_eq!(names(&selected), vec!["a"]);

    let selected = FixedSize::megabytes(12)
        .select(vec![
            candidate("a", 4 * mb, 30),
            candidate("b", 4 * mb, 20),
            candidate("c", 4 * mb, 10),
        ])
        .expect("select must succeed");
    assert!(selected.is_empty());
}

/// Same thing, on actual files.
#[test]
fn test_fixed_size_cleanup() {
    use crate::cleanup::{CleanableDirectory, CleanupAction, CleanupProgressMonitor};
    use crate::cleanup::{FilesFinder, PolicyCleanup};
    use test_dir::{DirBuilder, FileType, TestDir};

    let mb = 1024 * 1024;
    let temp = TestDir::temp()
        .create("a", FileType::ZeroFile(4 * mb))
        .create("b", FileType::ZeroFile(4 * mb))
        .create("c", FileType::ZeroFile(4 * mb));
    let now = FileTime::now().unix_seconds();
    for (name, age) in [("a", 30), ("b", 20), ("c", 10)] {
        filetime::set_file_mtime(temp.path(name), FileTime::from_unix_time(now - age, 0))
            .expect("set_file_mtime must succeed");
    }

    let store = CleanableDirectory::new("test cache", &temp.path("."), Vec::new());
    let mut monitor = CleanupProgressMonitor::default();
    PolicyCleanup::new(
        FilesFinder::AllFiles { max_depth: 1 },
        Arc::new(FixedSize::megabytes(10)),
    )
    .clean(&store, &mut monitor)
    .expect("cleanup must succeed");

    assert!(!temp.path("a").exists());
    assert!(temp.path("b").exists());
    assert!(temp.path("c").exists());
    assert_eq!(monitor.deleted(), 1);
    assert_eq!(monitor.skipped(), 2);
}

#[cfg(test)]
#[derive(Default)]
struct MapJournal(
    parking_lot::Mutex<std::collections::HashMap<PathBuf, u64>>,
    std::sync::atomic::AtomicUsize,
);

#[cfg(test)]
impl FileAccessTimeJournal for MapJournal {
    fn set_last_access_time(&self, file: &std::path::Path, millis: u64) -> Result<()> {
        self.0.lock().insert(file.to_owned(), millis);
        Ok(())
    }

    fn get_last_access_time(&self, file: &std::path::Path) -> Result<u64> {
        Ok(self.0.lock().get(file).copied().unwrap_or(0))
    }

    fn delete_last_access_time(&self, file: &std::path::Path) -> Result<()> {
        self.0.lock().remove(file);
        Ok(())
    }

    fn delete_last_access_times(&self, files: &[PathBuf]) -> Result<()> {
        self.1.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut times = self.0.lock();
        for file in files {
            times.remove(file);
        }

        Ok(())
    }
}

/// Recent accesses keep a file alive regardless of its mtime, and
/// deleted files are forgotten.
#[test]
fn test_least_recently_used() {
    let day_millis = 24 * 3600 * 1000;
    let now = millis_since_epoch(SystemTime::now());
    let journal = Arc::new(MapJournal::default());
    journal
        .set_last_access_time("recent".as_ref(), now - day_millis)
        .expect("set must succeed");
    journal
        .set_last_access_time("stale".as_ref(), now - 10 * day_millis)
        .expect("set must succeed");

    let policy = LeastRecentlyUsed::days(journal.clone(), 7);
    let selected = policy
        .select(vec![
            candidate("recent", 1, 100 * 24 * 3600),
            candidate("stale", 1, 0),
        ])
        .expect("select must succeed");
    assert_eq!(names(&selected), vec!["stale"]);

    policy
        .after_deletion(&[PathBuf::from("stale")])
        .expect("after_deletion must succeed");
    assert_eq!(journal.0.lock().len(), 1);
    assert_eq!(journal.1.load(std::sync::atomic::Ordering::SeqCst), 1);

    policy.after_deletion(&[]).expect("after_deletion must succeed");
    assert_eq!(journal.1.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    proptest! {
        /// The files kept are the newest ones, they fit in the target,
        /// and keeping the newest deleted file as well would not.
        #[test]
        fn test_fixed_size_keeps_newest_prefix(sizes in vec((0..100u64, 0..1000i64), 0..20usize),
                                              max_bytes in 0..500u64) {
            let candidates: Vec<CandidateFile> = sizes
                .iter()
                .enumerate()
                .map(|(i, (len, age))| candidate(&format!("f{}", i), *len, *age))
                .collect();
            let selected = FixedSize::bytes(max_bytes)
                .select(candidates.clone())
                .expect("select must succeed");

            let kept: Vec<&CandidateFile> = candidates
                .iter()
                .filter(|c| !selected.contains(c))
                .collect();
            let kept_total: u64 = kept.iter().map(|c| c.len).sum();
            prop_assert!(kept_total <= max_bytes);

            if let (Some(newest_deleted), Some(oldest_kept)) = (
                selected.iter().max_by_key(|c| c.modified),
                kept.iter().min_by_key(|c| c.modified),
            ) {
                prop_assert!(newest_deleted.modified <= oldest_kept.modified);
            }

            if let Some(first_deleted) = selected.first() {
                prop_assert!(kept_total + first_deleted.len > max_bytes);
            }
        }
    }
}
