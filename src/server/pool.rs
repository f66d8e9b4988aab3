use crate::shutdown::Shutdown;
use crossbeam::{
    channel::{self, Receiver, Sender, TrySendError},
    select,
};
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

/// Fixed set of worker threads fed through a bounded queue, plus burst
/// workers spawned while the queue is full.
///
/// Burst workers retire after staying idle for `burst_idle`. Every worker
/// stops once the shutdown token is cancelled; jobs still queued at that
/// point are dropped and counted in [`Stopped::discarded`].
pub(crate) struct Pool<T: Send + 'static> {
    tx: Option<Sender<T>>,
    shared: Arc<Shared<T>>,
}

/// Outcome of [`Pool::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stopped {
    /// Workers still running at the deadline, now detached.
    pub(crate) stuck: usize,
    /// Queued jobs dropped without being served.
    pub(crate) discarded: usize,
}

struct Shared<T> {
    rx: Receiver<T>,
    serve: Box<dyn Fn(T) + Send + Sync>,
    shutdown: Shutdown,

    live: AtomicUsize,
    discarded: AtomicUsize,
    next_id: AtomicUsize,
    max_workers: usize,
    burst_idle: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Decrements the live count even when `serve` unwinds.
struct Alive<'a>(&'a AtomicUsize);

impl Drop for Alive<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: Send + 'static> Pool<T> {
    pub(crate) fn start<F>(
        workers: usize,
        max_workers: usize,
        capacity: usize,
        burst_idle: Duration,
        shutdown: Shutdown,
        serve: F,
    ) -> io::Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (tx, rx) = channel::bounded(capacity);
        let shared = Arc::new(Shared {
            rx,
            serve: Box::new(serve),
            shutdown,
            live: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            max_workers: max_workers.max(workers),
            burst_idle,
            handles: Mutex::new(Vec::with_capacity(max_workers)),
        });

        for _ in 0..workers {
            shared.live.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = Shared::spawn(&shared, false, None) {
                shared.live.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        }
        debug!(workers, max_workers = shared.max_workers, capacity, "worker pool started");

        Ok(Self { tx: Some(tx), shared })
    }

    /// Queues `job`, or hands it to a fresh burst worker when the queue is
    /// full. The job comes back when neither is possible.
    pub(crate) fn submit(&self, job: T) -> Result<(), T> {
        let Some(tx) = &self.tx else {
            return Err(job);
        };

        let job = match tx.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => job,
        };

        let claimed = self
            .shared
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.shared.max_workers).then_some(live + 1)
            });
        if claimed.is_err() {
            return Err(job);
        }

        // A failed spawn drops the job together with the closure.
        if let Err(e) = Shared::spawn(&self.shared, true, Some(job)) {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
            warn!(error = %e, "failed to spawn burst worker");
        }
        Ok(())
    }

    /// Workers currently alive, burst workers included.
    pub(crate) fn live(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Stops accepting jobs and waits for workers until `deadline`.
    ///
    /// Workers still running at the deadline are detached. Jobs left in the
    /// queue are dropped.
    pub(crate) fn join(mut self, deadline: Instant) -> Stopped {
        self.tx.take();
        let handles = std::mem::take(&mut *self.shared.lock_handles());

        let mut stuck = 0;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            match handle.is_finished() {
                true => {
                    let _ = handle.join();
                }
                false => stuck += 1,
            }
        }

        if stuck > 0 {
            warn!(stuck, "workers still busy after the deadline, detaching");
        }

        let left = self.shared.rx.try_iter().count();
        let discarded = self.shared.discarded.fetch_add(left, Ordering::AcqRel) + left;
        if discarded > 0 {
            debug!(discarded, "queued jobs dropped at shutdown");
        }
        Stopped { stuck, discarded }
    }
}

impl<T: Send + 'static> Shared<T> {
    /// The caller has already counted the new worker in `live`.
    fn spawn(shared: &Arc<Self>, burst: bool, first: Option<T>) -> io::Result<()> {
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let name = match burst {
            true => format!("kiln-burst-{id}"),
            false => format!("kiln-worker-{id}"),
        };

        let worker = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker.work(burst, first))?;

        let mut handles = shared.lock_handles();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    fn work(&self, burst: bool, first: Option<T>) {
        let _alive = Alive(&self.live);
        if burst {
            trace!("burst worker started");
        }

        if let Some(job) = first {
            (self.serve)(job);
        }

        loop {
            let idle = match burst {
                true => channel::after(self.burst_idle),
                false => channel::never(),
            };

            let job = select! {
                recv(self.rx) -> job => match job {
                    Ok(job) => job,
                    Err(_) => break,
                },
                recv(self.shutdown.receiver()) -> _ => break,
                recv(idle) -> _ => {
                    trace!("burst worker retired");
                    break;
                }
            };

            if self.shutdown.is_cancelled() {
                drop(job);
                self.discarded.fetch_add(1, Ordering::AcqRel);
                break;
            }
            (self.serve)(job);
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    #[test]
    fn runs_every_queued_job() {
        let (done_tx, done_rx) = channel::unbounded();
        let pool = Pool::start(2, 2, 8, Duration::from_secs(1), Shutdown::new(), move |job: u32| {
            done_tx.send(job).unwrap();
        })
        .unwrap();

        for job in 0..8 {
            pool.submit(job).unwrap();
        }
        assert_eq!(pool.join(deadline()).stuck, 0);

        let mut done: Vec<u32> = done_rx.try_iter().collect();
        done.sort();
        assert_eq!(done, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn bursts_up_to_the_limit_then_rejects() {
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::unbounded();

        let pool = Pool::start(1, 2, 1, Duration::from_millis(50), Shutdown::new(), move |job: u32| {
            started_tx.send(job).unwrap();
            let _ = gate_rx.recv();
        })
        .unwrap();

        pool.submit(1).unwrap();
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)), Ok(1));

        // queued
        pool.submit(2).unwrap();
        // queue full, burst worker takes it
        pool.submit(3).unwrap();
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)), Ok(3));
        assert_eq!(pool.live(), 2);
        // queue full, no more workers allowed
        assert_eq!(pool.submit(4), Err(4));

        drop(gate_tx);
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)), Ok(2));

        let retired = (0..200).any(|_| {
            thread::sleep(Duration::from_millis(10));
            pool.live() == 1
        });
        assert!(retired, "burst worker should retire when idle");
        assert_eq!(pool.join(deadline()).stuck, 0);
    }

    #[test]
    fn shutdown_stops_workers() {
        let shutdown = Shutdown::new();
        let pool = Pool::start(3, 3, 4, Duration::from_secs(1), shutdown.clone(), |_: u32| {}).unwrap();
        assert_eq!(pool.live(), 3);

        shutdown.cancel();
        let stopped = (0..200).any(|_| {
            thread::sleep(Duration::from_millis(10));
            pool.live() == 0
        });
        assert!(stopped);
        assert_eq!(pool.join(deadline()).stuck, 0);
    }

    #[test]
    fn queued_jobs_left_at_shutdown_are_counted() {
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let (started_tx, started_rx) = channel::unbounded();
        let shutdown = Shutdown::new();
        let pool = Pool::start(1, 1, 4, Duration::from_secs(1), shutdown.clone(), move |job: u32| {
            started_tx.send(job).unwrap();
            let _ = gate_rx.recv();
        })
        .unwrap();

        pool.submit(1).unwrap();
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)), Ok(1));
        for job in 2..5 {
            pool.submit(job).unwrap();
        }

        shutdown.cancel();
        drop(gate_tx);
        let stopped = pool.join(deadline());

        assert_eq!(stopped, Stopped { stuck: 0, discarded: 3 });
        assert!(started_rx.try_recv().is_err());
    }

    #[test]
    fn join_detaches_stuck_workers() {
        let (gate_tx, gate_rx) = channel::bounded::<()>(0);
        let pool = Pool::start(1, 1, 1, Duration::from_secs(1), Shutdown::new(), move |_: u32| {
            let _ = gate_rx.recv();
        })
        .unwrap();

        pool.submit(1).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.join(Instant::now() + Duration::from_millis(50)).stuck, 1);
        drop(gate_tx);
    }
}
