//! Randomised exponential backoff for lock acquisition.
//!
//! Each failed attempt waits for a random number of slots in
//! `[0, min(attempt, CAP_FACTOR))`.  The wait is interruptible: a
//! [`crate::contention::AwaitableFileLockReleasedSignal`] fired by the
//! lock's current holder wakes the waiter early and resets the attempt
//! counter.
use std::time::Duration;
use std::time::Instant;

use rand::Rng;

use crate::contention::AwaitableFileLockReleasedSignal;
use crate::error::Result;

const SLOT_TIME: Duration = Duration::from_millis(25);
const CAP_FACTOR: u32 = 100;

#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    timeout: Duration,
    started: Instant,
    attempt: u32,
    signal: AwaitableFileLockReleasedSignal,
}

impl ExponentialBackoff {
    pub fn new(timeout: Duration) -> ExponentialBackoff {
        ExponentialBackoff {
            timeout,
            started: Instant::now(),
            attempt: 0,
            signal: AwaitableFileLockReleasedSignal::default(),
        }
    }

    /// The signal that interrupts this backoff's waits.
    pub fn signal(&self) -> &AwaitableFileLockReleasedSignal {
        &self.signal
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Gives the query a fresh timeout, e.g., when the lock changed
    /// hands.
    pub fn restart_timer(&mut self) {
        self.started = Instant::now();
    }

    fn expired(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    fn backoff_period(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let upper = self.attempt.min(CAP_FACTOR);
        SLOT_TIME * rand::thread_rng().gen_range(0..upper)
    }

    /// Runs `query` until it returns `Some`, the timer expires, or the
    /// query fails.  Returns `Ok(None)` on timeout.
    pub fn retry_until<T>(
        &mut self,
        mut query: impl FnMut(&mut ExponentialBackoff) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        loop {
            if let Some(value) = query(self)? {
                return Ok(Some(value));
            }

            if self.expired() {
                return Ok(None);
            }

            let period = self.backoff_period();
            if self.signal.await_for(period) {
                self.attempt = 0;
            }
        }
    }
}

#[test]
fn test_retry_until_success() {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(10));
    let mut calls = 0;

    let ret = backoff
        .retry_until(|_| {
            calls += 1;
            Ok(if calls == 3 { Some(calls) } else { None })
        })
        .expect("query must not fail");

    assert_eq!(ret, Some(3));
}

#[test]
fn test_retry_until_timeout() {
    let mut backoff = ExponentialBackoff::new(Duration::from_millis(100));
    let started = Instant::now();

    let ret: Option<()> = backoff.retry_until(|_| Ok(None)).expect("query must not fail");

    assert_eq!(ret, None);
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_retry_until_propagates_errors() {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(10));

    let ret: Result<Option<()>> =
        backoff.retry_until(|_| Err(crate::error::Error::illegal_state("boom")));
    assert!(ret.is_err());
}

#[test]
fn test_backoff_period_is_capped() {
    let mut backoff = ExponentialBackoff::new(Duration::from_secs(10));

    for _ in 0..1000 {
        assert!(backoff.backoff_period() < SLOT_TIME * CAP_FACTOR);
    }
}
