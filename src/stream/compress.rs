//! Content coding: gzip/deflate stream layers and `Accept-Encoding` negotiation.

use crate::{
    errors::HttpError,
    http::header::{quality_list, HeaderMap},
    stream::{closed_error, Sink, Source},
};
use flate2::{
    bufread::{GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use std::io::{self, BufRead, BufReader, Read, Write};

/// A content coding the engine can produce and consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    /// zlib-wrapped deflate, as `Content-Encoding: deflate` is specified
    Deflate,
    Gzip,
}

impl Encoding {
    /// Server preference, best first.
    const PREFERENCE: [Encoding; 3] = [Encoding::Gzip, Encoding::Deflate, Encoding::Identity];

    pub fn from_token(token: &str) -> Option<Encoding> {
        match token.trim() {
            t if t.eq_ignore_ascii_case("gzip") || t.eq_ignore_ascii_case("x-gzip") => {
                Some(Encoding::Gzip)
            }
            t if t.eq_ignore_ascii_case("deflate") => Some(Encoding::Deflate),
            t if t.eq_ignore_ascii_case("identity") => Some(Encoding::Identity),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Deflate => "deflate",
            Encoding::Gzip => "gzip",
        }
    }

    fn matches(&self, token: &str) -> bool {
        Encoding::from_token(token) == Some(*self)
    }
}

/// Picks the response coding for an `Accept-Encoding` value.
///
/// The highest `q` wins and ties go to gzip, then deflate, then identity.
/// Identity stays acceptable unless it is refused explicitly or through
/// `*;q=0`. With nothing acceptable the result is [`HttpError::NotAcceptable`].
///
/// # Examples
/// ```
/// use kiln::{negotiate_encoding, Encoding};
///
/// assert_eq!(negotiate_encoding(None), Ok(Encoding::Identity));
/// assert_eq!(negotiate_encoding(Some("deflate, gzip")), Ok(Encoding::Gzip));
/// assert_eq!(negotiate_encoding(Some("gzip;q=0.2, deflate;q=0.9")), Ok(Encoding::Deflate));
/// assert!(negotiate_encoding(Some("br, identity;q=0")).is_err());
/// ```
pub fn negotiate(accept: Option<&str>) -> Result<Encoding, HttpError> {
    let Some(accept) = accept else {
        return Ok(Encoding::Identity);
    };

    let weights = quality_list(accept);
    let wildcard = weights.iter().find(|(t, _)| *t == "*").map(|(_, q)| *q);

    let weight_of = |encoding: Encoding| -> f32 {
        match weights.iter().find(|(t, _)| encoding.matches(t)) {
            Some((_, q)) => *q,
            None => match (encoding, wildcard) {
                (_, Some(q)) => q,
                (Encoding::Identity, None) => 1.0,
                _ => 0.0,
            },
        }
    };

    let mut best: Option<(Encoding, f32)> = None;
    for encoding in Encoding::PREFERENCE {
        let q = weight_of(encoding);
        if q > 0.0 && best.map_or(true, |(_, best_q)| q > best_q) {
            best = Some((encoding, q));
        }
    }

    best.map(|(encoding, _)| encoding)
        .ok_or(HttpError::NotAcceptable)
}

/// Whether a body of this media type is worth compressing. A missing type counts as compressible.
pub fn is_compressible(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return true;
    };
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    essence.starts_with("text/")
        || essence.ends_with("+xml")
        || essence.ends_with("+json")
        || matches!(
            essence.as_str(),
            "application/json" | "application/javascript" | "application/xml"
        )
}

enum EncoderInner<W: Write> {
    Identity(W),
    Deflate(ZlibEncoder<W>),
    Gzip(GzEncoder<W>),
}

/// Compresses everything written to it into the inner sink.
///
/// `flush` performs a sync flush so the peer can decode everything sent
/// so far; `close` writes the coding trailer and closes the inner sink.
pub struct Encoder<W: Sink> {
    inner: Option<EncoderInner<W>>,
}

impl<W: Sink> Encoder<W> {
    pub fn new(inner: W, encoding: Encoding, level: u32) -> Self {
        let level = Compression::new(level.min(9));
        let inner = match encoding {
            Encoding::Identity => EncoderInner::Identity(inner),
            Encoding::Deflate => EncoderInner::Deflate(ZlibEncoder::new(inner, level)),
            Encoding::Gzip => EncoderInner::Gzip(GzEncoder::new(inner, level)),
        };
        Self { inner: Some(inner) }
    }

    fn writer(&mut self) -> io::Result<&mut dyn Write> {
        match self.inner.as_mut() {
            Some(EncoderInner::Identity(w)) => Ok(w),
            Some(EncoderInner::Deflate(w)) => Ok(w),
            Some(EncoderInner::Gzip(w)) => Ok(w),
            None => Err(closed_error()),
        }
    }
}

impl<W: Sink> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl<W: Sink> Sink for Encoder<W> {
    fn close(&mut self) -> io::Result<()> {
        let mut inner = match self.inner.take() {
            None => return Ok(()),
            Some(EncoderInner::Identity(w)) => w,
            Some(EncoderInner::Deflate(w)) => w.finish()?,
            Some(EncoderInner::Gzip(w)) => w.finish()?,
        };
        inner.close()
    }
}

enum DecoderInner<R: Read> {
    Deflate(ZlibDecoder<BufReader<R>>),
    Gzip(GzDecoder<BufReader<R>>),
}

/// Decompresses a request body lazily, capping the decoded size.
///
/// Once the compressed stream ends, the framed body under it is read to its
/// own end so the framing terminator and any trailers are consumed. Bytes
/// left between the two ends fail with [`HttpError::TrailingBodyData`].
pub struct Decoder<R: Source> {
    inner: DecoderInner<R>,
    produced: u64,
    max_body: u64,
    done: bool,
}

impl<R: Source> Decoder<R> {
    /// Wraps `inner` in a decoding layer. [`Encoding::Identity`] needs no
    /// layer, so `inner` is handed back unchanged as the error value.
    pub fn wrap(inner: R, encoding: Encoding, max_body: u64) -> Result<Self, R> {
        let inner = match encoding {
            Encoding::Identity => return Err(inner),
            Encoding::Deflate => DecoderInner::Deflate(ZlibDecoder::new(BufReader::new(inner))),
            Encoding::Gzip => DecoderInner::Gzip(GzDecoder::new(BufReader::new(inner))),
        };
        Ok(Self {
            inner,
            produced: 0,
            max_body,
            done: false,
        })
    }

    fn framed(&mut self) -> &mut BufReader<R> {
        match &mut self.inner {
            DecoderInner::Deflate(r) => r.get_mut(),
            DecoderInner::Gzip(r) => r.get_mut(),
        }
    }

    /// Reads the framed body past the end of the compressed data.
    fn finish(&mut self) -> io::Result<()> {
        let framed = self.framed();
        match framed.fill_buf()?.is_empty() {
            true => Ok(()),
            false => Err(HttpError::TrailingBodyData.into()),
        }
    }
}

impl<R: Source> Read for Decoder<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.done {
            return Ok(0);
        }

        let n = match &mut self.inner {
            DecoderInner::Deflate(r) => r.read(out)?,
            DecoderInner::Gzip(r) => r.read(out)?,
        };

        if n == 0 && !out.is_empty() {
            self.finish()?;
            self.done = true;
            return Ok(0);
        }

        self.produced += n as u64;
        if self.produced > self.max_body {
            return Err(HttpError::BodyTooLarge.into());
        }
        Ok(n)
    }
}

impl<R: Source> Source for Decoder<R> {
    fn trailers(&self) -> Option<&HeaderMap> {
        match &self.inner {
            DecoderInner::Deflate(r) => r.get_ref().get_ref().trailers(),
            DecoderInner::Gzip(r) => r.get_ref().get_ref().trailers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::Error,
        stream::{chunked::ChunkedEncoder, testing::Recorder},
    };

    fn compress(encoding: Encoding, parts: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = Encoder::new(&mut out, encoding, 6);
            for part in parts {
                encoder.write_all(part).unwrap();
            }
            encoder.close().unwrap();
        }
        out
    }

    fn decompress(encoding: Encoding, data: &[u8], max: u64) -> Result<Vec<u8>, Error> {
        let Ok(mut decoder) = Decoder::wrap(data, encoding, max) else {
            panic!("identity has no decoder");
        };
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn negotiation() {
        #[rustfmt::skip]
        let cases: [(Option<&str>, Result<Encoding, HttpError>); 12] = [
            (None,                               Ok(Encoding::Identity)),
            (Some(""),                           Ok(Encoding::Identity)),
            (Some("gzip"),                       Ok(Encoding::Gzip)),
            (Some("deflate"),                    Ok(Encoding::Deflate)),
            (Some("deflate, gzip"),              Ok(Encoding::Gzip)),
            (Some("gzip;q=0.5, deflate"),        Ok(Encoding::Deflate)),
            (Some("*"),                          Ok(Encoding::Gzip)),
            (Some("br"),                         Ok(Encoding::Identity)),
            (Some("gzip;q=0, deflate;q=0"),      Ok(Encoding::Identity)),
            (Some("identity;q=0"),               Err(HttpError::NotAcceptable)),
            (Some("br, identity;q=0"),           Err(HttpError::NotAcceptable)),
            (Some("*;q=0"),                      Err(HttpError::NotAcceptable)),
        ];

        for (accept, expected) in cases {
            assert_eq!(negotiate(accept), expected, "{accept:?}");
        }
    }

    #[test]
    fn compressible_types() {
        #[rustfmt::skip]
        let cases = [
            (None,                                  true),
            (Some("text/html; charset=utf-8"),      true),
            (Some("application/json"),              true),
            (Some("application/vnd.api+json"),      true),
            (Some("image/svg+xml"),                 true),
            (Some("Application/JavaScript"),        true),
            (Some("image/png"),                     false),
            (Some("application/octet-stream"),      false),
        ];

        for (content_type, expected) in cases {
            assert_eq!(is_compressible(content_type), expected, "{content_type:?}");
        }
    }

    #[test]
    fn streamed_equals_one_shot() {
        let payload: Vec<u8> = b"the quick brown fox ".repeat(500);

        for encoding in [Encoding::Gzip, Encoding::Deflate] {
            let one_shot = compress(encoding, &[&payload]);
            let parts: Vec<&[u8]> = payload.chunks(333).collect();
            let streamed = compress(encoding, &parts);

            assert_eq!(decompress(encoding, &one_shot, 1 << 20).unwrap(), payload);
            assert_eq!(decompress(encoding, &streamed, 1 << 20).unwrap(), payload);
        }
    }

    #[test]
    fn gzip_trailer_present() {
        let data = compress(Encoding::Gzip, &[b"hello"]);

        assert_eq!(&data[..2], &[0x1f, 0x8b]);
        // ISIZE is the last four bytes, little endian
        assert_eq!(&data[data.len() - 4..], &5u32.to_le_bytes());
    }

    #[test]
    fn flush_makes_prefix_decodable() {
        let mut sink = Vec::new();
        let mut encoder = Encoder::new(&mut sink, Encoding::Deflate, 6);
        encoder.write_all(b"partial data").unwrap();
        encoder.flush().unwrap();
        drop(encoder);

        let mut decoder = ZlibDecoder::new(&sink[..]);
        let mut out = [0u8; 32];
        let n = decoder.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"partial data");
    }

    #[test]
    fn close_propagates_once() {
        let mut rec = Recorder::default();
        {
            let mut encoder = Encoder::new(ChunkedEncoder::new(&mut rec), Encoding::Gzip, 1);
            encoder.write_all(&[b'A'; 1000]).unwrap();
            encoder.close().unwrap();
            encoder.close().unwrap();
            assert_eq!(encoder.write(b"x").unwrap_err().kind(), io::ErrorKind::NotConnected);
        }

        assert_eq!(rec.closes, 1);
        assert!(rec.data.ends_with(b"0\r\n\r\n"));
    }

    #[test]
    fn decoded_size_capped() {
        let bomb = compress(Encoding::Gzip, &[&[0u8; 10_000]]);

        match decompress(Encoding::Gzip, &bomb, 1000) {
            Err(Error::Http(HttpError::BodyTooLarge)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(Decoder::wrap(&bomb[..], Encoding::Identity, 10).is_err());
    }

    #[test]
    fn decoder_reads_through_to_the_framed_end() {
        for encoding in [Encoding::Gzip, Encoding::Deflate] {
            let data = compress(encoding, &[b"payload"]);
            assert_eq!(decompress(encoding, &data, 1 << 20).unwrap(), b"payload");

            let padded = [&data[..], &b"extra"[..]].concat();
            match decompress(encoding, &padded, 1 << 20) {
                Err(Error::Http(HttpError::TrailingBodyData)) => {}
                other => panic!("{encoding:?}: unexpected {other:?}"),
            }
        }
    }
}
