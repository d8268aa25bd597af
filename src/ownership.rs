//! Reentrant, thread-level ownership of a cache coordinator.
//!
//! At most one thread owns a coordinator at a time.  The owner may
//! acquire ownership again (e.g., a nested `use_cache`), and only gives
//! it up when the outermost [`OwnershipGuard`] drops.
use std::thread::ThreadId;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::error::Error;
use crate::error::Result;

#[derive(Debug, Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    // Number of live guards held by `owner`.
    depth: usize,
}

#[derive(Debug)]
pub(crate) struct Ownership {
    display_name: String,
    state: Mutex<OwnerState>,
    released: Condvar,
}

impl Ownership {
    pub fn new(display_name: &str) -> Ownership {
        Ownership {
            display_name: display_name.to_owned(),
            state: Default::default(),
            released: Condvar::new(),
        }
    }

    /// Blocks until the current thread owns the coordinator.
    pub fn acquire(&self) -> OwnershipGuard<'_> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();

        while matches!(state.owner, Some(owner) if owner != me) {
            self.released.wait(&mut state);
        }

        state.owner = Some(me);
        state.depth += 1;
        OwnershipGuard {
            ownership: self,
            outermost: state.depth == 1,
        }
    }

    /// Takes ownership without waiting, or fails if another thread
    /// currently owns the coordinator.
    pub fn acquire_now(&self) -> Result<OwnershipGuard<'_>> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();

        if matches!(state.owner, Some(owner) if owner != me) {
            return Err(Error::illegal_state(format!(
                "Cannot take ownership of {} as it is currently being used by another thread.",
                self.display_name
            )));
        }

        state.owner = Some(me);
        state.depth += 1;
        Ok(OwnershipGuard {
            ownership: self,
            outermost: state.depth == 1,
        })
    }

    pub fn is_owned_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(std::thread::current().id())
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_all();
        }
    }
}

/// Proof that the current thread owns the coordinator.  Dropping the
/// guard pops one level of ownership.
#[derive(Debug)]
#[must_use]
pub(crate) struct OwnershipGuard<'a> {
    ownership: &'a Ownership,
    outermost: bool,
}

impl OwnershipGuard<'_> {
    /// Whether this guard took ownership, rather than re-entering.
    pub fn is_outermost(&self) -> bool {
        self.outermost
    }
}

impl Drop for OwnershipGuard<'_> {
    fn drop(&mut self) {
        self.ownership.release();
    }
}

#[test]
fn test_reentrant_acquire() {
    let ownership = Ownership::new("test cache");

    assert_eq!(ownership.owner(), None);
    let outer = ownership.acquire();
    assert!(outer.is_outermost());
    assert!(ownership.is_owned_by_current_thread());

    let inner = ownership.acquire_now().expect("reentrant acquire must succeed");
    assert!(!inner.is_outermost());
    drop(inner);
    assert!(ownership.is_owned_by_current_thread());

    drop(outer);
    assert_eq!(ownership.owner(), None);
}

#[test]
fn test_acquire_now_fails_for_other_threads() {
    let ownership = std::sync::Arc::new(Ownership::new("test cache"));
    let _guard = ownership.acquire();

    let other = ownership.clone();
    let message = std::thread::spawn(move || match other.acquire_now() {
        Ok(_) => panic!("another thread owns the coordinator"),
        Err(e) => e.to_string(),
    })
    .join()
    .expect("thread must not panic");

    assert_eq!(
        message,
        "Cannot take ownership of test cache as it is currently being used by another thread."
    );
}

#[test]
fn test_acquire_waits_for_release() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    let ownership = Arc::new(Ownership::new("test cache"));
    let released = Arc::new(AtomicBool::new(false));
    let guard = ownership.acquire();

    let waiter = {
        let ownership = ownership.clone();
        let released = released.clone();
        std::thread::spawn(move || {
            let _guard = ownership.acquire();
            assert!(released.load(Ordering::SeqCst));
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    released.store(true, Ordering::SeqCst);
    drop(guard);
    waiter.join().expect("waiter must not panic");
}
