//! Composable byte streams.
//!
//! Readable streams are [`Source`]s and writable streams are [`Sink`]s.
//! Both build on [`std::io::Read`] and [`std::io::Write`], so short reads,
//! `write_all` and `flush` keep their usual meaning; a sink adds an explicit
//! [`Sink::close`] that finalizes framing.
//!
//! Layers own their inner stream by value. Closing an outer layer closes the
//! inner one exactly once, a second close is a no-op and any read, write or
//! flush after close fails with [`io::ErrorKind::NotConnected`].
//!
//! ```text
//!  response body:  Encoder -> ChunkedEncoder -> KeepOpen -> SocketWriter
//!  request body:   Decoder <- ChunkedDecoder <- SocketReader
//! ```

pub(crate) mod chunked;
pub(crate) mod compress;
pub(crate) mod length;
pub(crate) mod socket;

use crate::http::header::HeaderMap;
use std::io::{self, Cursor, Read, Write};

/// A readable byte stream.
pub trait Source: Read {
    /// Trailer fields received after the body, once the body has been read to EOF.
    fn trailers(&self) -> Option<&HeaderMap> {
        None
    }
}

/// A writable byte stream with explicit termination.
pub trait Sink: Write {
    /// Flushes pending data, writes any terminating framing and closes the inner stream.
    fn close(&mut self) -> io::Result<()>;
}

impl Source for &[u8] {}
impl Source for io::Empty {}
impl<T: AsRef<[u8]>> Source for Cursor<T> {}

impl<S: Source + ?Sized> Source for Box<S> {
    fn trailers(&self) -> Option<&HeaderMap> {
        (**self).trailers()
    }
}

impl<S: Source + ?Sized> Source for &mut S {
    fn trailers(&self) -> Option<&HeaderMap> {
        (**self).trailers()
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl Sink for Vec<u8> {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[inline]
pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is closed")
}

/// Wraps a writer so that closing it only flushes.
///
/// A response body sits on top of the connection's socket; keep-alive
/// needs the socket to survive the body's close.
pub struct KeepOpen<W: Write> {
    inner: W,
    closed: bool,
}

impl<W: Write> KeepOpen<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for KeepOpen<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        self.inner.flush()
    }
}

impl<W: Write> Sink for KeepOpen<W> {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.flush()
    }
}

/// Reads `source` to EOF into a new buffer, failing once more than `limit` bytes arrive.
pub fn read_to_vec<S: Source + ?Sized>(source: &mut S, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let read = Read::take(&mut *source, limit as u64 + 1).read_to_end(&mut out)?;
    if read > limit {
        return Err(crate::errors::HttpError::BodyTooLarge.into());
    }
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::{testing::Recorder, *};

    #[test]
    fn keep_open_close_only_flushes() {
        let mut rec = Recorder::default();
        {
            let mut sink = KeepOpen::new(&mut rec);
            sink.write_all(b"abc").unwrap();
            sink.close().unwrap();
            sink.close().unwrap();

            assert_eq!(sink.write(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
            assert_eq!(sink.flush().unwrap_err().kind(), io::ErrorKind::NotConnected);
        }

        assert_eq!(rec.data, b"abc");
        assert_eq!(rec.flushes, 1);
        assert_eq!(rec.closes, 0);
    }

    #[test]
    fn read_to_vec_limit() {
        let mut src: &[u8] = b"hello";
        assert_eq!(read_to_vec(&mut src, 5).unwrap(), b"hello");

        let mut src: &[u8] = b"hello!";
        let err = read_to_vec(&mut src, 5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }
}
