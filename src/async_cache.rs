//! Deferred cache writes.
//!
//! A [`CacheAccessWorker`] owns one background thread per coordinator.
//! Writers enqueue operations and return immediately; the worker
//! applies them in submission order, in batches that each run inside a
//! single unit of work of the coordinator.  The queue is bounded, so a
//! writer blocks when it gets too far ahead of the disk.
//!
//! Every operation carries an [`OnComplete`] guard.  The guard runs
//! when the operation is done with, whether it was applied, failed, or
//! never made it into the queue: callers use it to release the file
//! lock they took for the write.
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Weak;
use std::thread::JoinHandle;
use std::thread::ThreadId;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::cross_process::FileLockRelease;
use crate::error::Error;
use crate::error::Result;
use crate::indexed_cache::CacheKey;
use crate::indexed_cache::CacheValue;
use crate::indexed_cache::UnitOfWorkParticipant;
use crate::lock_state::LockState;

const MAX_QUEUE_LEN: usize = 200;

/// How long a batch waits for more work before giving up ownership.
const BATCH_WINDOW: Duration = Duration::from_millis(200);

/// A batch never holds the coordinator longer than this.
const MAX_BATCH_TIME: Duration = Duration::from_secs(5);

/// Runs its callback exactly once, when dropped.
#[must_use]
pub(crate) struct OnComplete(Option<Box<dyn FnOnce() + Send>>);

impl OnComplete {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> OnComplete {
        OnComplete(Some(Box::new(callback)))
    }

    pub fn noop() -> OnComplete {
        OnComplete(None)
    }
}

impl From<FileLockRelease> for OnComplete {
    fn from(release: FileLockRelease) -> OnComplete {
        OnComplete::new(move || drop(release))
    }
}

impl Drop for OnComplete {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

/// The coordinator, as seen by its worker.
pub(crate) trait ExclusiveAccess: Send + Sync {
    /// Runs `work` as one unit of work, owning the coordinator.
    fn with_exclusive(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    fn is_owned_by_current_thread(&self) -> bool;
}

enum WorkItem {
    Operation {
        op: Box<dyn FnOnce() -> Result<()> + Send>,
        done: OnComplete,
    },
    /// Reads and flush markers: they only need to run after everything
    /// queued before them.
    Task(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct WorkerState {
    queue: VecDeque<WorkItem>,
    stopping: bool,
    failure: Option<Error>,
}

pub(crate) struct CacheAccessWorker {
    display_name: String,
    access: Weak<dyn ExclusiveAccess>,
    state: Mutex<WorkerState>,
    // Signalled when work arrives or the worker is asked to stop.
    work_available: Condvar,
    // Signalled when the queue shrinks.
    space_available: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for CacheAccessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAccessWorker")
            .field("display_name", &self.display_name)
            .field("queued", &self.state.lock().queue.len())
            .finish()
    }
}

impl CacheAccessWorker {
    /// Spawns the worker thread for the coordinator behind `access`.
    pub fn start(display_name: &str, access: Weak<dyn ExclusiveAccess>) -> Result<Arc<CacheAccessWorker>> {
        let worker = Arc::new(CacheAccessWorker {
            display_name: display_name.to_owned(),
            access,
            state: Default::default(),
            work_available: Condvar::new(),
            space_available: Condvar::new(),
            thread: Mutex::new(None),
            thread_id: Mutex::new(None),
        });

        let runner = worker.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{} worker", display_name))
            .spawn(move || runner.run())?;
        *worker.thread_id.lock() = Some(handle.thread().id());
        *worker.thread.lock() = Some(handle);
        Ok(worker)
    }

    fn is_worker_thread(&self) -> bool {
        *self.thread_id.lock() == Some(std::thread::current().id())
    }

    /// Whether the calling thread owns the coordinator, in which case
    /// the worker cannot make progress until that thread lets go.
    fn caller_owns_coordinator(&self) -> bool {
        self.access
            .upgrade()
            .map_or(false, |access| access.is_owned_by_current_thread())
    }

    fn run(self: Arc<Self>) {
        loop {
            {
                let mut state = self.state.lock();
                while state.queue.is_empty() && !state.stopping {
                    self.work_available.wait(&mut state);
                }

                if state.queue.is_empty() {
                    self.space_available.notify_all();
                    return;
                }
            }

            let access = match self.access.upgrade() {
                Some(access) => access,
                None => {
                    self.abandon(Error::illegal_state(format!(
                        "{} was dropped with pending writes",
                        self.display_name
                    )));
                    continue;
                }
            };

            let ret = access.with_exclusive(&mut || {
                self.drain_batch();
                Ok(())
            });
            drop(access);

            if let Err(e) = ret {
                self.abandon(e);
            }
        }
    }

    /// Applies queued items until the queue stays empty for a batch
    /// window.  Runs as the coordinator's owner.
    fn drain_batch(&self) {
        let started = Instant::now();

        loop {
            let item = {
                let mut state = self.state.lock();
                loop {
                    if started.elapsed() >= MAX_BATCH_TIME {
                        break None;
                    }

                    if let Some(item) = state.queue.pop_front() {
                        self.space_available.notify_all();
                        break Some(item);
                    }

                    if state.stopping {
                        break None;
                    }

                    if self
                        .work_available
                        .wait_for(&mut state, BATCH_WINDOW)
                        .timed_out()
                        && state.queue.is_empty()
                    {
                        break None;
                    }
                }
            };

            match item {
                Some(item) => self.apply(item),
                None => return,
            }
        }
    }

    /// Applies everything currently queued on the calling thread, which
    /// must own the coordinator.
    fn drain_inline(&self) {
        loop {
            let item = {
                let mut state = self.state.lock();
                let item = state.queue.pop_front();
                if item.is_some() {
                    self.space_available.notify_all();
                }
                item
            };

            match item {
                Some(item) => self.apply(item),
                None => return,
            }
        }
    }

    fn apply(&self, item: WorkItem) {
        match item {
            WorkItem::Operation { op, done } => {
                if let Err(e) = op() {
                    self.record_failure(e);
                }
                drop(done);
            }
            WorkItem::Task(task) => task(),
        }
    }

    fn record_failure(&self, error: Error) {
        tracing::warn!("{} failed to apply a cache write: {}", self.display_name, error);
        let mut state = self.state.lock();
        if state.failure.is_none() {
            state.failure = Some(error);
        }
    }

    /// Drops every queued item, which runs their completions.
    fn abandon(&self, error: Error) {
        let dropped: Vec<WorkItem> = {
            let mut state = self.state.lock();
            self.space_available.notify_all();
            state.queue.drain(..).collect()
        };

        if !dropped.is_empty() {
            self.record_failure(error);
        }
    }

    fn take_failure(&self) -> Result<()> {
        match self.state.lock().failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn enqueue(&self, item: WorkItem) -> Result<()> {
        let owner = self.caller_owns_coordinator();
        let mut state = self.state.lock();

        loop {
            if state.stopping {
                drop(state);
                // Dropping the item runs its completion.
                drop(item);
                return Err(Error::illegal_state(format!(
                    "The worker for {} has been stopped.",
                    self.display_name
                )));
            }

            if state.queue.len() < MAX_QUEUE_LEN {
                state.queue.push_back(item);
                self.work_available.notify_all();
                return Ok(());
            }

            if owner {
                drop(state);
                self.drain_inline();
                state = self.state.lock();
            } else {
                self.space_available.wait(&mut state);
            }
        }
    }

    /// Queues `op` after every previously submitted operation.
    pub fn submit(
        &self,
        op: impl FnOnce() -> Result<()> + Send + 'static,
        done: OnComplete,
    ) -> Result<()> {
        self.enqueue(WorkItem::Operation {
            op: Box::new(op),
            done,
        })
    }

    /// Runs `task` once every pending write has been applied, and
    /// returns its result.
    pub fn read<T: Send + 'static>(&self, task: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
        if self.is_worker_thread() || self.caller_owns_coordinator() {
            self.drain_inline();
            return task();
        }

        let (sender, receiver) = mpsc::channel();
        self.enqueue(WorkItem::Task(Box::new(move || {
            let _ = sender.send(task());
        })))?;

        receiver.recv().map_err(|_| {
            Error::illegal_state(format!(
                "{} stopped before the read could run",
                self.display_name
            ))
        })?
    }

    /// Waits until every pending write is applied.  Returns the first
    /// write failure since the last flush.
    pub fn flush(&self) -> Result<()> {
        if self.is_worker_thread() || self.caller_owns_coordinator() {
            self.drain_inline();
        } else {
            let (sender, receiver) = mpsc::channel::<()>();
            self.enqueue(WorkItem::Task(Box::new(move || {
                let _ = sender.send(());
            })))?;
            // A disconnect means the task was abandoned; the failure is
            // recorded either way.
            let _ = receiver.recv();
        }

        self.take_failure()
    }

    /// Asks the worker to exit once the queue is empty, without waiting.
    pub fn signal_stop(&self) {
        self.state.lock().stopping = true;
        self.work_available.notify_all();
    }

    /// Applies every pending write, then stops the worker thread.
    /// Returns the first write failure since the last flush.
    pub fn stop(&self) -> Result<()> {
        let inline = self.is_worker_thread() || self.caller_owns_coordinator();
        if inline {
            self.drain_inline();
        }

        self.signal_stop();
        if !inline {
            if let Some(handle) = self.thread.lock().take() {
                if handle.join().is_err() {
                    tracing::warn!("{} worker thread panicked", self.display_name);
                }
            }
        }

        self.take_failure()
    }
}

/// An indexed cache that accepts writes for later application.  Layers
/// of decorated caches share this interface.
pub(crate) trait AsyncIndexedCache<K, V>: UnitOfWorkParticipant {
    fn get(&self, key: &K) -> Result<Option<V>>;

    /// Returns the value for `key`, producing it and storing it
    /// asynchronously on a miss.  `completion` runs once any such store
    /// is done.
    fn get_or_create(
        &self,
        key: &K,
        producer: &dyn Fn(&K) -> Result<V>,
        completion: OnComplete,
    ) -> Result<V>;

    fn put_later(&self, key: K, value: V, completion: OnComplete) -> Result<()>;

    fn remove_later(&self, key: &K, completion: OnComplete) -> Result<()>;
}

/// Hands writes to the coordinator's worker, and routes reads through
/// it so that they observe every pending write.
pub(crate) struct AsyncCacheAccessDecoratedCache<K, V> {
    worker: Arc<CacheAccessWorker>,
    inner: Arc<dyn AsyncIndexedCache<K, V>>,
}

impl<K, V> AsyncCacheAccessDecoratedCache<K, V> {
    pub fn new(
        worker: Arc<CacheAccessWorker>,
        inner: Arc<dyn AsyncIndexedCache<K, V>>,
    ) -> AsyncCacheAccessDecoratedCache<K, V> {
        AsyncCacheAccessDecoratedCache { worker, inner }
    }
}

impl<K: CacheKey, V: CacheValue> AsyncIndexedCache<K, V> for AsyncCacheAccessDecoratedCache<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        let inner = self.inner.clone();
        let key = key.clone();
        self.worker.read(move || inner.get(&key))
    }

    fn get_or_create(
        &self,
        key: &K,
        producer: &dyn Fn(&K) -> Result<V>,
        completion: OnComplete,
    ) -> Result<V> {
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }

        let value = producer(key)?;
        self.put_later(key.clone(), value.clone(), completion)?;
        Ok(value)
    }

    fn put_later(&self, key: K, value: V, completion: OnComplete) -> Result<()> {
        let inner = self.inner.clone();
        self.worker.submit(
            move || inner.put_later(key, value, OnComplete::noop()),
            completion,
        )
    }

    fn remove_later(&self, key: &K, completion: OnComplete) -> Result<()> {
        let inner = self.inner.clone();
        let key = key.clone();
        self.worker.submit(
            move || inner.remove_later(&key, OnComplete::noop()),
            completion,
        )
    }
}

impl<K, V> UnitOfWorkParticipant for AsyncCacheAccessDecoratedCache<K, V> {
    fn after_lock_acquire(&self, current: &LockState) {
        self.inner.after_lock_acquire(current)
    }

    fn finish_work(&self) -> Result<()> {
        self.inner.finish_work()
    }

    fn before_lock_release(&self, current: &LockState) {
        self.inner.before_lock_release(current)
    }
}

/// A stand-in coordinator that serialises units of work on an
/// ownership token, like the real one.
#[cfg(test)]
pub(crate) struct TestAccess {
    ownership: crate::ownership::Ownership,
}

#[cfg(test)]
impl TestAccess {
    pub fn new() -> Arc<TestAccess> {
        Arc::new(TestAccess {
            ownership: crate::ownership::Ownership::new("test cache"),
        })
    }

    pub fn use_cache<T>(&self, action: impl FnOnce() -> T) -> T {
        let _guard = self.ownership.acquire();
        action()
    }
}

#[cfg(test)]
impl ExclusiveAccess for TestAccess {
    fn with_exclusive(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let _guard = self.ownership.acquire();
        work()
    }

    fn is_owned_by_current_thread(&self) -> bool {
        self.ownership.is_owned_by_current_thread()
    }
}

#[cfg(test)]
fn test_worker(access: &Arc<TestAccess>) -> Arc<CacheAccessWorker> {
    let weak: Weak<dyn ExclusiveAccess> = Arc::downgrade(access) as Weak<dyn ExclusiveAccess>;
    CacheAccessWorker::start("test cache", weak).expect("worker must start")
}

#[test]
fn test_on_complete_runs_once_on_drop() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let done = OnComplete::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    drop(done);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    drop(OnComplete::noop());
}

/// Writes are applied in submission order, and reads observe them.
#[test]
fn test_writes_apply_in_order() {
    let access = TestAccess::new();
    let worker = test_worker(&access);
    let log = Arc::new(Mutex::new(Vec::new()));

    for i in 0..500 {
        let log = log.clone();
        worker
            .submit(
                move || {
                    log.lock().push(i);
                    Ok(())
                },
                OnComplete::noop(),
            )
            .expect("submit must succeed");
    }

    let seen = {
        let log = log.clone();
        worker
            .read(move || Ok(log.lock().len()))
            .expect("read must succeed")
    };
    assert_eq!(seen, 500);
    assert_eq!(*log.lock(), (0..500).collect::<Vec<_>>());

    worker.stop().expect("stop must succeed");
}

#[test]
fn test_completion_runs_after_apply_and_on_failure() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let access = TestAccess::new();
    let worker = test_worker(&access);
    let applied = Arc::new(AtomicBool::new(false));
    let completed_after_apply = Arc::new(AtomicBool::new(false));

    {
        let applied = applied.clone();
        let seen = applied.clone();
        let completed = completed_after_apply.clone();
        worker
            .submit(
                move || {
                    applied.store(true, Ordering::SeqCst);
                    Ok(())
                },
                OnComplete::new(move || completed.store(seen.load(Ordering::SeqCst), Ordering::SeqCst)),
            )
            .expect("submit must succeed");
    }

    let failed_completion = Arc::new(AtomicBool::new(false));
    {
        let completed = failed_completion.clone();
        worker
            .submit(
                || Err(Error::illegal_state("disk on fire")),
                OnComplete::new(move || completed.store(true, Ordering::SeqCst)),
            )
            .expect("submit must succeed");
    }

    let flushed = worker.flush();
    assert!(matches!(flushed, Err(Error::IllegalState(ref m)) if m == "disk on fire"));
    assert!(completed_after_apply.load(Ordering::SeqCst));
    assert!(failed_completion.load(Ordering::SeqCst));

    // The failure is only reported once.
    worker.flush().expect("flush must succeed");
    worker.stop().expect("stop must succeed");
}

#[test]
fn test_submit_after_stop_completes_and_fails() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let access = TestAccess::new();
    let worker = test_worker(&access);
    worker.stop().expect("stop must succeed");

    let completed = Arc::new(AtomicBool::new(false));
    let flag = completed.clone();
    let ret = worker.submit(
        || Ok(()),
        OnComplete::new(move || flag.store(true, Ordering::SeqCst)),
    );

    assert!(ret.is_err());
    assert!(completed.load(Ordering::SeqCst));
}

/// A thread that owns the coordinator cannot wait for the worker, so
/// its reads and overflowing writes are applied inline.
#[test]
fn test_owner_thread_drains_inline() {
    let access = TestAccess::new();
    let worker = test_worker(&access);
    let log = Arc::new(Mutex::new(Vec::new()));

    access.use_cache(|| {
        for i in 0..(MAX_QUEUE_LEN + 10) {
            let log = log.clone();
            worker
                .submit(
                    move || {
                        log.lock().push(i);
                        Ok(())
                    },
                    OnComplete::noop(),
                )
                .expect("submit must succeed");
        }

        let log = log.clone();
        let len = worker
            .read(move || Ok(log.lock().len()))
            .expect("read must succeed");
        assert_eq!(len, MAX_QUEUE_LEN + 10);
    });

    assert_eq!(*log.lock(), (0..(MAX_QUEUE_LEN + 10)).collect::<Vec<_>>());
    worker.stop().expect("stop must succeed");
}
