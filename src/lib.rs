//! A multiprocess-safe, crash-recoverable persistent cache stored in
//! filesystem directories.
//!
//! Each cache directory is guarded by a lock file.  Processes that
//! share a directory coordinate through byte-range locks on that file,
//! and a process that needs a lock another process holds asks for it
//! over a loopback UDP socket.  The lock file also carries a small
//! state region: writers mark it dirty before touching the data, and
//! clean again once done.  A process that finds a dirty state knows
//! the previous writer crashed, and wipes the directory before using
//! it.[^recompute]
//!
//! [^recompute]: Caches hold data that can be recomputed.  Throwing it
//! away is always safe, just slow.
//!
//! Within a process, a [`CacheCoordinator`] serialises access to one
//! directory: threads do their work in *units of work*
//! ([`CacheCoordinator::use_cache`]), which exclude each other and nest
//! on the same thread.  The lock is either held for as long as the
//! cache is open ([`LockMode::Shared`], [`LockMode::Exclusive`]),
//! taken on demand and handed over when another process asks
//! ([`LockMode::OnDemand`]), or not taken at all ([`LockMode::None`]).
//!
//! # Indexed caches
//!
//! A directory holds any number of named [`PersistentIndexedCache`]s,
//! typed key/value maps persisted in `<name>.bin` with a pair of
//! [`Serializer`]s.  A [`CacheDecorator`] stacks extra layers on top:
//! writes deferred to a background worker thread, and a bounded
//! in-memory LRU layer that is flushed whenever the lock state shows
//! that another process wrote to the directory in the meantime.
//! Decorated caches take the lock by themselves; undecorated ones must
//! be used inside a unit of work.
//!
//! # Cache directories
//!
//! Most users go through a [`CacheFactory`], which opens directories
//! as [`PersistentCache`]s.  A directory's `cache.properties` records
//! what its contents are; a mismatch with the requested properties, a
//! failed [`CacheValidator`], or a dirty lock wipes the directory on
//! open.  The factory also shares one open directory between all
//! requests in the process, and closes it with the last reference.
//!
//! # Cleanup
//!
//! Directories can carry a [`CleanupAction`], usually a
//! [`PolicyCleanup`] with one of the retention policies ([`FixedAge`],
//! [`FixedSize`], [`LeastRecentlyUsed`]).  Cleanup runs when the
//! directory closes, at most as often as its [`CleanupFrequency`]
//! allows; the mtime of `gc.properties` records the last run.
mod access_journal;
mod async_cache;
mod backoff;
mod benign_error;
mod cleanup;
mod contention;
mod coordinator;
mod cross_process;
mod decorator;
mod error;
mod factory;
mod file_access;
mod file_lock;
mod in_memory;
mod indexed_cache;
mod lock_file_access;
mod lock_state;
mod ownership;
mod persistent_cache;
pub mod properties;
mod retention;
mod serializer;
pub mod store;

pub use access_journal::millis_since_epoch;
pub use access_journal::FileAccessTimeJournal;
pub use access_journal::ModificationTimeFileAccessTimeJournal;
pub use access_journal::PersistentFileAccessTimeJournal;
pub use benign_error::is_absent_file_error;
pub use cleanup::CacheCleanupExecutor;
pub use cleanup::CandidateFile;
pub use cleanup::CleanableDirectory;
pub use cleanup::CleanableStore;
pub use cleanup::CleanupAction;
pub use cleanup::CleanupFrequency;
pub use cleanup::CleanupPolicy;
pub use cleanup::CleanupProgressMonitor;
pub use cleanup::CompositeCleanup;
pub use cleanup::FilesFinder;
pub use cleanup::GatedCleanupExecutor;
pub use cleanup::PolicyCleanup;
pub use cleanup::GC_PROPERTIES;
pub use contention::AwaitableFileLockReleasedSignal;
pub use contention::ContendedAction;
pub use contention::DefaultFileLockContentionHandler;
pub use contention::FileLockContentionHandler;
pub use contention::FileLockReleasedSignal;
pub use contention::NoOpContentionHandler;
pub use coordinator::CacheCoordinator;
pub use coordinator::CacheCoordinatorBuilder;
pub use cross_process::CacheInitializationAction;
pub use cross_process::NoInitialization;
pub use decorator::CacheDecorator;
pub use decorator::DecoratorStep;
pub use error::Error;
pub use error::Result;
pub use factory::CacheBuilder;
pub use factory::CacheFactory;
pub use factory::PersistentCache;
pub use file_lock::lock_file_for;
pub use file_lock::FileLock;
pub use file_lock::FileLockManager;
pub use file_lock::LockMode;
pub use file_lock::LockOptions;
pub use file_lock::DEFAULT_LOCK_TIMEOUT;
pub use indexed_cache::CacheKey;
pub use indexed_cache::CacheValue;
pub use indexed_cache::IndexedCache;
pub use indexed_cache::IndexedCacheParameters;
pub use indexed_cache::MultiProcessSafeIndexedCache;
pub use indexed_cache::PersistentIndexedCache;
pub use indexed_cache::UnitOfWorkParticipant;
pub use lock_state::LockInfo;
pub use lock_state::LockState;
pub use lock_state::LockStateProtocol;
pub use persistent_cache::CacheValidator;
pub use persistent_cache::CACHE_PROPERTIES;
pub use retention::FixedAge;
pub use retention::FixedSize;
pub use retention::LeastRecentlyUsed;
pub use serializer::BytesSerializer;
pub use serializer::PathSerializer;
pub use serializer::Serializer;
pub use serializer::SerializerIdentity;
pub use serializer::StringSerializer;
pub use serializer::U64Serializer;
