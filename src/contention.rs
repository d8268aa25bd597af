//! Cross-process lock contention signalling.
//!
//! A process that holds a lock it could give up on demand listens on a
//! loopback UDP port, advertised in the lock file's information
//! region.  Waiters send that port an *unlock request*; the holder
//! confirms, runs its contention action, and eventually answers with
//! *lock released* so the waiter stops backing off and retries at once.
//!
//! Every datagram is `[version = 1][type][lock id: i64, big endian]`.
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::UdpSocket;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use derivative::Derivative;
use parking_lot::Condvar;
use parking_lot::Mutex;

const PROTOCOL_VERSION: u8 = 1;
const UNLOCK_REQUEST: u8 = 0;
const UNLOCK_REQUEST_CONFIRMATION: u8 = 1;
const LOCK_RELEASED: u8 = 2;
const MESSAGE_SIZE: usize = 10;

/// Minimum delay between two pings of the same owner.
pub(crate) const PING_DELAY: Duration = Duration::from_secs(1);

/// How long the listener blocks in `recv` before checking for shutdown.
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(200);

fn encode(kind: u8, lock_id: i64) -> [u8; MESSAGE_SIZE] {
    let mut out = [0u8; MESSAGE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1] = kind;
    out[2..].copy_from_slice(&lock_id.to_be_bytes());
    out
}

fn decode(message: &[u8]) -> Option<(u8, i64)> {
    if message.len() != MESSAGE_SIZE || message[0] != PROTOCOL_VERSION {
        return None;
    }

    let mut id = [0u8; 8];
    id.copy_from_slice(&message[2..]);
    Some((message[1], i64::from_be_bytes(id)))
}

/// Handed to a lock holder's contention action.  The holder triggers
/// it once it has actually released the lock, which notifies every
/// process that asked for the lock.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct FileLockReleasedSignal {
    lock_id: i64,
    #[derivative(Debug = "ignore")]
    socket: Option<Arc<UdpSocket>>,
    #[derivative(Debug = "ignore")]
    requesters: Arc<Mutex<HashSet<SocketAddr>>>,
}

impl FileLockReleasedSignal {
    /// A signal that notifies nobody.
    pub fn detached(lock_id: i64) -> FileLockReleasedSignal {
        FileLockReleasedSignal {
            lock_id,
            socket: None,
            requesters: Default::default(),
        }
    }

    pub fn trigger(&self) {
        let requesters: Vec<SocketAddr> = self.requesters.lock().drain().collect();
        let socket = match &self.socket {
            Some(socket) => socket,
            None => return,
        };

        let message = encode(LOCK_RELEASED, self.lock_id);
        for requester in requesters {
            if let Err(e) = socket.send_to(&message, requester) {
                tracing::debug!(%requester, lock_id = self.lock_id, "failed to send lock released message: {}", e);
            }
        }
    }
}

/// A waiter's side of [`FileLockReleasedSignal`]: backoff sleeps on it,
/// and a "lock released" message wakes them up.
#[derive(Clone, Debug, Default)]
pub struct AwaitableFileLockReleasedSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl AwaitableFileLockReleasedSignal {
    /// Waits up to `timeout`.  Returns true if the signal fired, either
    /// during the wait or since the last call.
    pub fn await_for(&self, timeout: Duration) -> bool {
        let (triggered, condvar) = &*self.inner;
        let mut triggered = triggered.lock();

        if !*triggered {
            condvar.wait_for(&mut triggered, timeout);
        }

        std::mem::replace(&mut *triggered, false)
    }

    pub fn trigger(&self) {
        let (triggered, condvar) = &*self.inner;
        *triggered.lock() = true;
        condvar.notify_all();
    }
}

/// The action a lock holder runs when another process asks for its
/// lock.
pub type ContendedAction = Arc<dyn Fn(FileLockReleasedSignal) + Send + Sync>;

/// Where file locks register their contention actions and where waiters
/// ping holders.
pub trait FileLockContentionHandler: Send + Sync + std::fmt::Debug {
    /// Returns the port to advertise in lock information regions, or -1
    /// if this handler does not listen.
    fn reserve_port(&self) -> i32;

    /// Starts listening for unlock requests for `lock_id`.
    fn start(&self, lock_id: i64, when_contended: ContendedAction);

    fn stop(&self, lock_id: i64);

    /// Asks the process listening on `port` to release `lock_id`, unless
    /// we already pinged less than `PING_DELAY` ago.  Returns whether
    /// a ping was sent.  `signal` fires when the owner reports back.
    fn maybe_ping_owner(
        &self,
        port: i32,
        lock_id: i64,
        display_name: &str,
        since_last_ping: Duration,
        signal: &AwaitableFileLockReleasedSignal,
    ) -> bool;
}

/// A contention handler that never listens nor pings.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpContentionHandler;

impl FileLockContentionHandler for NoOpContentionHandler {
    fn reserve_port(&self) -> i32 {
        -1
    }

    fn start(&self, _lock_id: i64, _when_contended: ContendedAction) {}

    fn stop(&self, _lock_id: i64) {}

    fn maybe_ping_owner(
        &self,
        _port: i32,
        _lock_id: i64,
        _display_name: &str,
        _since_last_ping: Duration,
        _signal: &AwaitableFileLockReleasedSignal,
    ) -> bool {
        false
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct ContendedLock {
    #[derivative(Debug = "ignore")]
    action: ContendedAction,
    requesters: Arc<Mutex<HashSet<SocketAddr>>>,
    running: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct HandlerInner {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    contended: Mutex<HashMap<i64, ContendedLock>>,
    // Lock ids we pinged, and the signals of the local waiters.
    waiting: Mutex<HashMap<i64, AwaitableFileLockReleasedSignal>>,
    confirmed: Mutex<HashSet<i64>>,
}

/// The default handler, over loopback UDP.  The socket and its listener
/// thread are created on first use.
#[derive(Clone, Debug, Default)]
pub struct DefaultFileLockContentionHandler {
    inner: Arc<HandlerInner>,
}

impl DefaultFileLockContentionHandler {
    pub fn new() -> DefaultFileLockContentionHandler {
        Default::default()
    }

    fn socket(&self) -> std::io::Result<Arc<UdpSocket>> {
        let mut slot = self.inner.socket.lock();
        if let Some(socket) = &*slot {
            return Ok(socket.clone());
        }

        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?);
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;

        let listener_socket = socket.clone();
        let weak = Arc::downgrade(&self.inner);
        std::thread::Builder::new()
            .name("file-lock-contention".to_owned())
            .spawn(move || listen(listener_socket, weak))?;

        tracing::debug!(port = ?socket.local_addr().ok(), "started file lock contention listener");
        *slot = Some(socket.clone());
        Ok(socket)
    }
}

/// Receive loop; exits once the handler is dropped.
fn listen(socket: Arc<UdpSocket>, handler: Weak<HandlerInner>) {
    let mut buf = [0u8; 64];

    loop {
        let received = socket.recv_from(&mut buf);
        let inner = match handler.upgrade() {
            Some(inner) => inner,
            None => return,
        };

        let (len, from) = match received {
            Ok(ret) => ret,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                tracing::debug!("file lock contention listener failed: {}", e);
                continue;
            }
        };

        match decode(&buf[..len]) {
            Some((UNLOCK_REQUEST, lock_id)) => handle_unlock_request(&socket, &inner, lock_id, from),
            Some((UNLOCK_REQUEST_CONFIRMATION, lock_id)) => {
                tracing::debug!(lock_id, "unlock request confirmed by owner");
                inner.confirmed.lock().insert(lock_id);
            }
            Some((LOCK_RELEASED, lock_id)) => {
                tracing::debug!(lock_id, "owner reported lock released");
                if let Some(signal) = inner.waiting.lock().get(&lock_id) {
                    signal.trigger();
                }
            }
            _ => tracing::debug!(%from, "ignoring malformed contention message"),
        }
    }
}

fn handle_unlock_request(socket: &Arc<UdpSocket>, inner: &HandlerInner, lock_id: i64, from: SocketAddr) {
    let contended = inner.contended.lock();
    let lock = match contended.get(&lock_id) {
        Some(lock) => lock,
        // Not ours, or already released.
        None => return,
    };

    lock.requesters.lock().insert(from);
    if let Err(e) = socket.send_to(&encode(UNLOCK_REQUEST_CONFIRMATION, lock_id), from) {
        tracing::debug!(%from, lock_id, "failed to confirm unlock request: {}", e);
    }

    if lock.running.swap(true, Ordering::AcqRel) {
        return;
    }

    let action = lock.action.clone();
    let running = lock.running.clone();
    let signal = FileLockReleasedSignal {
        lock_id,
        socket: Some(socket.clone()),
        requesters: lock.requesters.clone(),
    };

    // The action may block on the lock's owner; never run it on the
    // listener thread.
    let spawned = std::thread::Builder::new()
        .name("file-lock-release".to_owned())
        .spawn(move || {
            action(signal);
            running.store(false, Ordering::Release);
        });
    if let Err(e) = spawned {
        tracing::warn!(lock_id, "failed to run file lock contention action: {}", e);
        lock.running.store(false, Ordering::Release);
    }
}

impl FileLockContentionHandler for DefaultFileLockContentionHandler {
    fn reserve_port(&self) -> i32 {
        match self.socket().and_then(|socket| socket.local_addr()) {
            Ok(addr) => addr.port() as i32,
            Err(e) => {
                tracing::warn!("failed to reserve a file lock contention port: {}", e);
                -1
            }
        }
    }

    fn start(&self, lock_id: i64, when_contended: ContendedAction) {
        self.inner.contended.lock().insert(
            lock_id,
            ContendedLock {
                action: when_contended,
                requesters: Default::default(),
                running: Default::default(),
            },
        );
    }

    fn stop(&self, lock_id: i64) {
        self.inner.contended.lock().remove(&lock_id);
        self.inner.waiting.lock().remove(&lock_id);
        self.inner.confirmed.lock().remove(&lock_id);
    }

    fn maybe_ping_owner(
        &self,
        port: i32,
        lock_id: i64,
        display_name: &str,
        since_last_ping: Duration,
        signal: &AwaitableFileLockReleasedSignal,
    ) -> bool {
        if port <= 0 || port > u16::MAX as i32 || since_last_ping < PING_DELAY {
            return false;
        }

        let socket = match self.socket() {
            Ok(socket) => socket,
            Err(e) => {
                tracing::debug!("cannot ping owner of {}: {}", display_name, e);
                return false;
            }
        };

        self.inner.waiting.lock().insert(lock_id, signal.clone());
        let owner = SocketAddr::from((Ipv4Addr::LOCALHOST, port as u16));
        match socket.send_to(&encode(UNLOCK_REQUEST, lock_id), owner) {
            Ok(_) => {
                tracing::debug!(port, lock_id, "pinged owner of {}", display_name);
                true
            }
            Err(e) => {
                tracing::debug!(port, lock_id, "failed to ping owner of {}: {}", display_name, e);
                false
            }
        }
    }
}

#[test]
fn test_message_layout() {
    let message = encode(LOCK_RELEASED, 0x0102_0304_0506_0708);
    assert_eq!(message, [1, 2, 1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(decode(&message), Some((LOCK_RELEASED, 0x0102_0304_0506_0708)));

    assert_eq!(decode(&message[..5]), None);
    assert_eq!(decode(&[9, 0, 0, 0, 0, 0, 0, 0, 0, 0]), None);
}

#[test]
fn test_awaitable_signal() {
    let signal = AwaitableFileLockReleasedSignal::default();
    assert!(!signal.await_for(Duration::from_millis(10)));

    // A trigger before the wait is not lost.
    signal.trigger();
    assert!(signal.await_for(Duration::from_secs(10)));
    assert!(!signal.await_for(Duration::from_millis(10)));

    let remote = signal.clone();
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        remote.trigger();
    });
    assert!(signal.await_for(Duration::from_secs(10)));
    waker.join().expect("thread must not panic");
}

/// An owner registered for contention runs its action on ping, and
/// the waiter wakes up once the owner triggers the release signal.
#[test]
fn test_ping_and_release() {
    use std::sync::mpsc;

    let owner = DefaultFileLockContentionHandler::new();
    let waiter = DefaultFileLockContentionHandler::new();
    let port = owner.reserve_port();
    assert!(port > 0);

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    owner.start(
        42,
        Arc::new(move |signal: FileLockReleasedSignal| {
            signal.trigger();
            let _ = tx.lock().send(());
        }),
    );

    let signal = AwaitableFileLockReleasedSignal::default();
    assert!(waiter.maybe_ping_owner(port, 42, "test lock", PING_DELAY, &signal));
    rx.recv_timeout(Duration::from_secs(10))
        .expect("contention action must run");
    assert!(signal.await_for(Duration::from_secs(10)));

    // Pings are rate limited.
    assert!(!waiter.maybe_ping_owner(port, 42, "test lock", Duration::from_millis(10), &signal));
    owner.stop(42);
}
