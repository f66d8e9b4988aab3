//! Socket halves with deadlines, cancellation and graceful close.

use crate::{
    shutdown::Shutdown,
    stream::{closed_error, Sink, Source},
};
use std::{
    io::{self, BufRead, Read, Write},
    net::{Shutdown as NetShutdown, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Reads are cut into slices of this length while cancellation is watched.
const TICK: Duration = Duration::from_millis(100);

/// Bytes drained after the write side is shut down, before the full close.
const LINGER_BYTES: usize = 64 * 1024;
const LINGER_TIME: Duration = Duration::from_millis(200);

/// Buffered read half of a connection.
///
/// Every read is bounded by the current deadline; exceeding it yields
/// [`io::ErrorKind::TimedOut`]. While cancellation is watched, a cancelled
/// token aborts a pending read with [`io::ErrorKind::ConnectionAborted`].
/// A raised wake flag interrupts a pending read once with
/// [`io::ErrorKind::Interrupted`].
pub struct SocketReader {
    stream: TcpStream,
    buf: Box<[u8]>,
    pos: usize,
    filled: usize,

    deadline: Option<Instant>,
    shutdown: Shutdown,
    watch_shutdown: bool,
    wake: Option<Arc<AtomicBool>>,
    applied_timeout: Option<Duration>,
}

impl SocketReader {
    pub(crate) fn new(stream: TcpStream, shutdown: Shutdown, capacity: usize) -> Self {
        Self {
            stream,
            buf: vec![0; capacity.max(512)].into_boxed_slice(),
            pos: 0,
            filled: 0,
            deadline: None,
            shutdown,
            watch_shutdown: false,
            wake: None,
            applied_timeout: None,
        }
    }

    /// Sets the instant by which every following read must complete.
    pub(crate) fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Makes reads fail fast once shutdown is requested. Used while idle.
    pub(crate) fn watch_shutdown(&mut self, watch: bool) {
        self.watch_shutdown = watch;
    }

    /// Lets another thread interrupt a blocked read by raising `flag`.
    pub(crate) fn wake_on(&mut self, flag: Arc<AtomicBool>) {
        self.wake = Some(flag);
    }

    /// Bytes received but not yet consumed.
    #[inline]
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..self.filled]
    }

    pub(crate) fn into_parts(self) -> (TcpStream, Vec<u8>) {
        let rest = self.buf[self.pos..self.filled].to_vec();
        (self.stream, rest)
    }

    /// Performs one socket read into the free tail of the buffer, compacting
    /// first. Returns `0` on EOF.
    pub(crate) fn fill_more(&mut self) -> io::Result<usize> {
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }
        if self.filled == self.buf.len() {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "read buffer full"));
        }

        let n = self.read_socket(self.filled)?;
        self.filled += n;
        Ok(n)
    }

    fn read_socket(&mut self, offset: usize) -> io::Result<usize> {
        loop {
            if self.watch_shutdown && self.shutdown.is_cancelled() {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "shutting down"));
            }
            if self.wake.as_ref().is_some_and(|flag| flag.swap(false, Ordering::AcqRel)) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "woken"));
            }

            let remaining = match self.deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
                },
                None => None,
            };

            let watching = self.watch_shutdown || self.wake.is_some();
            let slice = match (remaining, watching) {
                (Some(left), true) => Some(left.min(TICK)),
                (None, true) => Some(TICK),
                (left, false) => left,
            };
            self.apply_timeout(slice)?;

            match self.stream.read(&mut self.buf[offset..]) {
                Ok(n) => return Ok(n),
                Err(e) => match e.kind() {
                    io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut => continue,
                    _ => return Err(e),
                },
            }
        }
    }

    fn apply_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if self.applied_timeout != timeout {
            self.stream.set_read_timeout(timeout)?;
            self.applied_timeout = timeout;
        }
        Ok(())
    }
}

impl Read for SocketReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl BufRead for SocketReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.pos == self.filled {
            self.pos = 0;
            self.filled = 0;
            self.filled = self.read_socket(0)?;
        }
        Ok(&self.buf[self.pos..self.filled])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.filled);
    }
}

impl Source for SocketReader {}

/// Write half of a connection.
///
/// `write` returns only once the whole buffer has been handed to the kernel.
pub struct SocketWriter {
    stream: TcpStream,
    closed: bool,
}

impl SocketWriter {
    pub(crate) fn new(stream: TcpStream, write_timeout: Duration) -> io::Result<Self> {
        stream.set_write_timeout(Some(write_timeout).filter(|t| !t.is_zero()))?;
        Ok(Self {
            stream,
            closed: false,
        })
    }

    pub(crate) fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl Write for SocketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }

        let mut written = 0;
        while written < buf.len() {
            match self.stream.write(&buf[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        self.stream.flush()
    }
}

impl Sink for SocketWriter {
    /// Sends FIN, drains what the peer still sends for a short while and
    /// then closes both directions, so unread input does not turn into an RST.
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.stream.shutdown(NetShutdown::Write)?;
        linger(&self.stream);
        match self.stream.shutdown(NetShutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

fn linger(mut stream: &TcpStream) {
    let deadline = Instant::now() + LINGER_TIME;
    let mut scratch = [0u8; 4096];
    let mut drained = 0;

    while drained < LINGER_BYTES {
        let Some(left) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
            break;
        };
        if stream.set_read_timeout(Some(left)).is_err() {
            break;
        }
        match stream.read(&mut scratch) {
            Ok(0) | Err(_) => break,
            Ok(n) => drained += n,
        }
    }
}
