//! Content-Length framing and the body-discarding sink used for HEAD.

use crate::stream::{closed_error, Sink, Source};
use std::io::{self, BufRead, Read, Write};

/// Yields exactly `length` bytes of the inner stream, then EOF.
///
/// A peer that closes early produces [`io::ErrorKind::UnexpectedEof`].
pub struct LengthReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: BufRead> LengthReader<R> {
    pub fn new(inner: R, length: u64) -> Self {
        Self {
            inner,
            remaining: length,
        }
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: BufRead> Read for LengthReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || out.is_empty() {
            return Ok(0);
        }

        let available = self.inner.fill_buf()?;
        if available.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "body shorter than Content-Length",
            ));
        }

        let n = available.len().min(out.len()).min(self.remaining as usize);
        out[..n].copy_from_slice(&available[..n]);
        self.inner.consume(n);
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl<R: BufRead> Source for LengthReader<R> {}

/// Passes through exactly `length` bytes.
///
/// Writing past the declared length fails with [`io::ErrorKind::InvalidInput`];
/// closing before it is reached fails with [`io::ErrorKind::UnexpectedEof`]
/// after closing the inner stream.
pub struct LengthWriter<W: Sink> {
    inner: W,
    remaining: u64,
    closed: bool,
}

impl<W: Sink> LengthWriter<W> {
    pub fn new(inner: W, length: u64) -> Self {
        Self {
            inner,
            remaining: length,
            closed: false,
        }
    }
}

impl<W: Sink> Write for LengthWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }
        if buf.len() as u64 > self.remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "body longer than Content-Length",
            ));
        }

        self.inner.write_all(buf)?;
        self.remaining -= buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        self.inner.flush()
    }
}

impl<W: Sink> Sink for LengthWriter<W> {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close()?;

        match self.remaining {
            0 => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "body shorter than Content-Length",
            )),
        }
    }
}

/// Accepts and discards everything, counting the bytes.
#[derive(Debug, Default)]
pub struct NullSink {
    written: u64,
    closed: bool,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Write for NullSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.closed {
            true => Err(closed_error()),
            false => Ok(()),
        }
    }
}

impl Sink for NullSink {
    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::testing::Recorder;

    #[test]
    fn reader_stops_at_length() {
        let data: &[u8] = b"hello world";
        let mut reader = LengthReader::new(data, 5);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn reader_short_body() {
        let data: &[u8] = b"abc";
        let mut reader = LengthReader::new(data, 10);

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn reader_zero_length() {
        let data: &[u8] = b"next request";
        let mut reader = LengthReader::new(data, 0);
        assert_eq!(reader.read(&mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn writer_enforces_length() {
        let mut rec = Recorder::default();
        let mut writer = LengthWriter::new(&mut rec, 4);

        writer.write_all(b"ab").unwrap();
        let err = writer.write(b"cde").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = writer.close().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        writer.close().unwrap();
        drop(writer);

        assert_eq!(rec.data, b"ab");
        assert_eq!(rec.closes, 1);
    }

    #[test]
    fn null_sink_counts() {
        let mut sink = NullSink::new();
        sink.write_all(b"discard me").unwrap();
        sink.close().unwrap();

        assert_eq!(sink.written(), 10);
        assert_eq!(sink.write(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
    }
}
