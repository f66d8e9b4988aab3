//! Chunked transfer coding, RFC 7230 section 4.1.

use crate::{
    errors::HttpError,
    http::header::{parse_field, HeaderMap},
    stream::{closed_error, Sink, Source},
};
use memchr::memchr;
use std::io::{self, BufRead, Read, Write};

/// Longest accepted chunk-size line, extensions included.
const MAX_SIZE_LINE: usize = 4096;
/// Most hex digits accepted in a chunk size.
const MAX_HEX_DIGITS: usize = 16;
/// Total bytes accepted for the trailer section.
const MAX_TRAILER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

/// Decodes a chunked request body.
///
/// The total decoded length is capped by `max_body`; exceeding it yields
/// [`HttpError::BodyTooLarge`], and malformed framing yields
/// [`HttpError::BadChunked`], both wrapped in [`io::Error`].
pub struct ChunkedDecoder<R> {
    inner: R,
    state: State,
    decoded: u64,
    max_body: u64,
    trailers: HeaderMap,
}

impl<R: BufRead> ChunkedDecoder<R> {
    pub fn new(inner: R, max_body: u64) -> Self {
        Self {
            inner,
            state: State::Size,
            decoded: 0,
            max_body,
            trailers: HeaderMap::new(),
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    fn read_size(&mut self) -> io::Result<()> {
        let line = read_line(&mut self.inner, MAX_SIZE_LINE)?;

        let size_part = match memchr(b';', &line) {
            Some(semi) => &line[..semi],
            None => &line[..],
        };
        let digits = trim_ws(size_part);

        if digits.is_empty()
            || digits.len() > MAX_HEX_DIGITS
            || !digits.iter().all(u8::is_ascii_hexdigit)
        {
            return Err(HttpError::BadChunked.into());
        }

        let size = digits
            .iter()
            .fold(0u64, |acc, b| acc << 4 | (*b as char).to_digit(16).unwrap_or(0) as u64);

        if size == 0 {
            self.state = State::Trailers;
            return Ok(());
        }

        self.decoded = self
            .decoded
            .checked_add(size)
            .filter(|total| *total <= self.max_body)
            .ok_or(HttpError::BodyTooLarge)?;
        self.state = State::Data(size);
        Ok(())
    }

    fn read_trailers(&mut self) -> io::Result<()> {
        let mut total = 0;
        loop {
            let line = read_line(&mut self.inner, MAX_TRAILER_BYTES)?;
            if line.is_empty() {
                self.state = State::Done;
                return Ok(());
            }

            total += line.len() + 2;
            if total > MAX_TRAILER_BYTES {
                return Err(HttpError::HeaderTooLarge.into());
            }
            if line[0] == b' ' || line[0] == b'\t' {
                return Err(HttpError::ObsoleteFolding.into());
            }

            let field = parse_field(&line)?;
            self.trailers.append(field.name, field.value);
        }
    }
}

impl<R: BufRead> Read for ChunkedDecoder<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            match self.state {
                State::Size => self.read_size()?,
                State::Data(remaining) => {
                    let available = self.inner.fill_buf()?;
                    if available.is_empty() {
                        return Err(HttpError::BadChunked.into());
                    }

                    let n = available.len().min(out.len()).min(remaining as usize);
                    out[..n].copy_from_slice(&available[..n]);
                    self.inner.consume(n);

                    self.state = match remaining - n as u64 {
                        0 => State::DataEnd,
                        left => State::Data(left),
                    };
                    return Ok(n);
                }
                State::DataEnd => {
                    let mut crlf = [0u8; 2];
                    self.inner
                        .read_exact(&mut crlf)
                        .map_err(|_| io::Error::from(HttpError::BadChunked))?;
                    if &crlf != b"\r\n" {
                        return Err(HttpError::BadChunked.into());
                    }
                    self.state = State::Size;
                }
                State::Trailers => self.read_trailers()?,
                State::Done => return Ok(0),
            }
        }
    }
}

impl<R: BufRead> Source for ChunkedDecoder<R> {
    fn trailers(&self) -> Option<&HeaderMap> {
        match self.state {
            State::Done => Some(&self.trailers),
            _ => None,
        }
    }
}

/// Reads one CRLF-terminated line, returned without the terminator.
fn read_line<R: BufRead>(inner: &mut R, limit: usize) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        let available = inner.fill_buf()?;
        if available.is_empty() {
            return Err(HttpError::BadChunked.into());
        }

        match memchr(b'\n', available) {
            Some(pos) => {
                line.extend_from_slice(&available[..pos]);
                inner.consume(pos + 1);
                break;
            }
            None => {
                let n = available.len();
                line.extend_from_slice(available);
                inner.consume(n);
            }
        }

        if line.len() > limit {
            return Err(HttpError::BadChunked.into());
        }
    }

    match line.pop() {
        Some(b'\r') if line.len() <= limit => Ok(line),
        _ => Err(HttpError::BadChunked.into()),
    }
}

fn trim_ws(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map_or(start, |pos| pos + 1);
    &bytes[start..end]
}

/// Encodes a response body as chunks.
///
/// Every non-empty `write` becomes exactly one chunk. `flush` forwards to the
/// inner stream without emitting anything, and `close` writes the last chunk
/// before closing the inner stream.
pub struct ChunkedEncoder<W: Sink> {
    inner: W,
    closed: bool,
}

impl<W: Sink> ChunkedEncoder<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }
}

impl<W: Sink> Write for ChunkedEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut frame = Vec::with_capacity(buf.len() + 20);
        frame.extend_from_slice(format!("{:x}\r\n", buf.len()).as_bytes());
        frame.extend_from_slice(buf);
        frame.extend_from_slice(b"\r\n");

        self.inner.write_all(&frame)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        self.inner.flush()
    }
}

impl<W: Sink> Sink for ChunkedEncoder<W> {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.inner.write_all(b"0\r\n\r\n")?;
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::Error, stream::testing::Recorder};

    fn decode(input: &[u8], max_body: u64) -> Result<(Vec<u8>, Option<HeaderMap>), Error> {
        let mut decoder = ChunkedDecoder::new(input, max_body);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        let trailers = decoder.trailers().cloned();
        Ok((out, trailers))
    }

    #[test]
    fn decode_valid() {
        #[rustfmt::skip]
        let cases: [(&[u8], &[u8]); 5] = [
            (b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n", b"hello world"),
            (b"0\r\n\r\n",                              b""),
            (b"A\r\n0123456789\r\n0\r\n\r\n",           b"0123456789"),
            (b"3;name=val\r\nabc\r\n0;x\r\n\r\n",       b"abc"),
            (b"0000000000000003 \r\nxyz\r\n0\r\n\r\n",  b"xyz"),
        ];

        for (input, expected) in cases {
            let (body, _) = decode(input, 1024).unwrap();
            assert_eq!(body, expected, "{:?}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn decode_errors() {
        #[rustfmt::skip]
        let cases: [(&[u8], HttpError); 7] = [
            (b"5\r\nhelloXX0\r\n\r\n",                   HttpError::BadChunked),
            (b"G\r\nabc\r\n0\r\n\r\n",                   HttpError::BadChunked),
            (b"\r\nabc\r\n0\r\n\r\n",                    HttpError::BadChunked),
            (b"00000000000000001\r\na\r\n0\r\n\r\n",     HttpError::BadChunked),
            (b"5\nhello\r\n0\r\n\r\n",                   HttpError::BadChunked),
            (b"5\r\nhel",                                HttpError::BadChunked),
            (b"400\r\n",                                 HttpError::BodyTooLarge),
        ];

        for (input, expected) in cases {
            match decode(input, 1000) {
                Err(Error::Http(e)) => assert_eq!(e, expected, "{:?}", String::from_utf8_lossy(input)),
                other => panic!("{:?}: unexpected {other:?}", String::from_utf8_lossy(input)),
            }
        }
    }

    #[test]
    fn trailers_after_last_chunk() {
        let input = b"2\r\nok\r\n0\r\nX-Checksum: abc\r\nX-Other:  1 \r\n\r\nGET /next";
        let mut reader: &[u8] = input;

        let mut decoder = ChunkedDecoder::new(&mut reader, 1024);
        assert!(decoder.trailers().is_none());

        let mut body = Vec::new();
        decoder.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"ok");
        assert!(decoder.is_done());

        let trailers = decoder.trailers().unwrap();
        assert_eq!(trailers.get("x-checksum"), Some("abc"));
        assert_eq!(trailers.get("X-Other"), Some("1"));

        drop(decoder);
        assert_eq!(reader, b"GET /next");
    }

    #[test]
    fn encoder_framing() {
        let mut rec = Recorder::default();
        {
            let mut encoder = ChunkedEncoder::new(&mut rec);
            encoder.write_all(b"hello").unwrap();
            assert_eq!(encoder.write(b"").unwrap(), 0);
            encoder.flush().unwrap();
            encoder.write_all(&[b'x'; 26]).unwrap();
            encoder.close().unwrap();
            encoder.close().unwrap();
            assert_eq!(encoder.write(b"late").unwrap_err().kind(), io::ErrorKind::NotConnected);
        }

        let mut expected = b"5\r\nhello\r\n1a\r\n".to_vec();
        expected.extend_from_slice(&[b'x'; 26]);
        expected.extend_from_slice(b"\r\n0\r\n\r\n");

        assert_eq!(rec.data, expected);
        assert_eq!(rec.flushes, 1);
        assert_eq!(rec.closes, 1);
    }

    #[test]
    fn decode_what_was_encoded() {
        let body: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        let mut encoded = Vec::new();
        {
            let mut encoder = ChunkedEncoder::new(&mut encoded);
            for part in body.chunks(777) {
                encoder.write_all(part).unwrap();
            }
            encoder.close().unwrap();
        }

        let (decoded, trailers) = decode(&encoded, 1 << 20).unwrap();
        assert_eq!(decoded, body);
        assert!(trailers.unwrap().is_empty());
    }
}
