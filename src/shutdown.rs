//! Process-wide cancellation token and the registry of live connections.

use crossbeam::channel::{self, Receiver, Sender};
use std::{
    collections::HashMap,
    net::{Shutdown as NetShutdown, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// A cloneable cancellation token.
///
/// Cancelling drops the only sender of an internal channel, so every
/// blocked [`Shutdown::wait`] and every `select!` over
/// [`Shutdown::receiver`] wakes up at once.
///
/// # Examples
/// ```
/// use kiln::Shutdown;
/// use std::time::Duration;
///
/// let token = Shutdown::new();
/// let waiter = token.clone();
///
/// assert!(!waiter.wait(Duration::from_millis(1)));
/// token.cancel();
/// assert!(waiter.wait(Duration::from_secs(60)));
/// assert!(waiter.is_cancelled());
/// ```
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
                rx,
            }),
        }
    }

    /// Requests shutdown. Calling it again has no effect.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            debug!("shutdown requested");
        }
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Blocks for up to `timeout`, returning `true` as soon as the token is cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.inner.rx.recv_timeout(timeout) {
            Err(channel::RecvTimeoutError::Disconnected) => true,
            _ => self.is_cancelled(),
        }
    }

    /// A receiver that becomes disconnected on cancellation, for `select!`.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.inner.rx
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Cloned handles of every connection currently owned by a worker.
///
/// Used by the drain phase to force-close whatever outlives the deadline.
#[derive(Default)]
pub(crate) struct Tracker {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, TcpStream>>,
}

impl Tracker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `stream` until the returned guard is dropped.
    ///
    /// A stream that cannot be cloned is simply not tracked.
    pub(crate) fn track(self: &Arc<Self>, stream: &TcpStream) -> Tracked {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match stream.try_clone() {
            Ok(clone) => {
                self.lock().insert(id, clone);
            }
            Err(e) => warn!(error = %e, "connection not tracked for forced close"),
        }

        Tracked {
            tracker: Arc::clone(self),
            id,
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.lock().len()
    }

    /// Waits until no connection is live or `deadline` passes; `true` when drained.
    pub(crate) fn drain_until(&self, deadline: Instant) -> bool {
        loop {
            if self.active() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Shuts down both directions of every live connection, returning how many were closed.
    pub(crate) fn close_all(&self) -> usize {
        let live = self.lock();
        for stream in live.values() {
            let _ = stream.shutdown(NetShutdown::Both);
        }
        live.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct Tracked {
    tracker: Arc<Tracker>,
    id: u64,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.tracker.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::select;
    use std::net::TcpListener;

    #[test]
    fn cancel_wakes_selectors() {
        let token = Shutdown::new();
        let remote = token.clone();

        let handle = thread::spawn(move || {
            select! {
                recv(remote.receiver()) -> msg => msg.is_err(),
                default(Duration::from_secs(10)) => false,
            }
        });

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn tracker_counts_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let tracker = Tracker::new();
        let guard = tracker.track(&server);
        assert_eq!(tracker.active(), 1);
        assert!(!tracker.drain_until(Instant::now()));

        assert_eq!(tracker.close_all(), 1);
        let mut buf = [0u8; 1];
        assert_eq!(std::io::Read::read(&mut &client, &mut buf).unwrap(), 0);

        drop(guard);
        assert_eq!(tracker.active(), 0);
        assert!(tracker.drain_until(Instant::now()));
    }
}
