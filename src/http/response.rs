//! Response builder and emitter.

use crate::{
    errors::Error,
    http::{
        date,
        header::HeaderMap,
        types::{slice_to_u64, Method, StatusCode, Version},
    },
    limits::RespLimits,
    stream::{
        chunked::ChunkedEncoder,
        closed_error,
        compress::{is_compressible, Encoder, Encoding},
        length::{LengthWriter, NullSink},
        KeepOpen, Sink,
    },
};
use std::{
    fmt,
    io::{self, Write},
};
use tracing::trace;

/// What the connection loop knows about the exchange when it creates a response.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Exchange {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) keep_alive: bool,
    pub(crate) encoding: Encoding,
}

impl Exchange {
    /// An exchange for a request that could not be parsed: HTTP/1.1, no
    /// compression, connection closes afterwards.
    pub(crate) fn fallback() -> Self {
        Self {
            method: Method::Get,
            version: Version::Http11,
            keep_alive: false,
            encoding: Encoding::Identity,
        }
    }
}

/// How the body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// 1xx, 204 and 304.
    None,
    Length(u64),
    Chunked,
    /// HTTP/1.0 peer with unknown length; the connection closes after the body.
    Close,
}

struct Plan {
    framing: Framing,
    compress: Option<Encoding>,
}

/// HTTP response handed to [`Resource::handle`](crate::Resource::handle).
///
/// Status and headers stay mutable until the first body byte is written;
/// from then on the response is *sealed* and header changes are ignored.
///
/// A response is either buffered (the default) or streaming:
/// - buffered bodies are collected in memory and sent with `Content-Length`,
///   or compressed and chunked once they reach the compression threshold;
/// - streaming bodies are sent as they are written, with `Transfer-Encoding:
///   chunked` for HTTP/1.1 peers and close-delimited for HTTP/1.0 peers,
///   unless the resource declares a `Content-Length` itself.
///
/// `Date`, `Server`, `Connection` and the framing headers are added by the
/// engine when the head is emitted.
///
/// # Examples
/// ```
/// use kiln::{Error, Request, Response, StatusCode};
///
/// fn handle(_req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<(), Error> {
///     resp.status(StatusCode::OK)
///         .header("content-type", "text/html");
///     resp.body("<h1>Hello World</h1>")
/// }
/// ```
pub struct Response<'a> {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,

    streaming: bool,
    sealed: bool,
    finished: bool,
    keep_alive: bool,
    buffer: Vec<u8>,

    out: Option<&'a mut (dyn Write + 'a)>,
    body: Option<Box<dyn Sink + 'a>>,

    exchange: Exchange,
    limits: &'a RespLimits,
}

impl<'a> Response<'a> {
    pub(crate) fn new(
        out: &'a mut (dyn Write + 'a),
        exchange: Exchange,
        limits: &'a RespLimits,
    ) -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            headers: HeaderMap::with_capacity(8),
            streaming: false,
            sealed: false,
            finished: false,
            keep_alive: exchange.keep_alive,
            buffer: Vec::with_capacity(limits.default_capacity),
            out: Some(out),
            body: None,
            exchange,
            limits,
        }
    }

    /// Sets the status code. Defaults to `200 OK`.
    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        if self.check_open("status") {
            self.status = status;
        }
        self
    }

    /// Overrides the reason phrase from the status table.
    pub fn reason(&mut self, reason: impl Into<String>) -> &mut Self {
        if self.check_open("reason") {
            self.reason = Some(reason.into());
        }
        self
    }

    /// Adds a header, keeping earlier values of the same name.
    pub fn header(&mut self, name: impl Into<String>, value: impl ToString) -> &mut Self {
        if self.check_open("header") {
            self.headers.append(name, value.to_string());
        }
        self
    }

    /// Sets a header, replacing earlier values of the same name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl ToString) -> &mut Self {
        if self.check_open("set_header") {
            self.headers.insert(name, value.to_string());
        }
        self
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        if self.check_open("remove_header") {
            self.headers.remove(name);
        }
        self
    }

    /// Switches between buffered and streaming bodies. Only valid before sealing.
    pub fn streaming(&mut self, streaming: bool) -> &mut Self {
        if self.check_open("streaming") {
            self.streaming = streaming;
        }
        self
    }

    /// Closes the connection after this response.
    pub fn close(&mut self) -> &mut Self {
        self.keep_alive = false;
        self
    }

    /// Writes `data` as (part of) the body.
    pub fn body(&mut self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        self.write_all(data.as_ref()).map_err(Error::from)
    }

    /// Emits an interim 1xx response such as `100 Continue` or `103 Early Hints`.
    ///
    /// Any number of interim responses may precede the final one. `101` is
    /// a final status for the purposes of this engine and must be set with
    /// [`status`](Response::status) instead.
    pub fn send_informational(&mut self, status: StatusCode, headers: &HeaderMap) -> Result<(), Error> {
        if !status.is_informational() || status == StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::Internal(format!("{status} is not an interim status")));
        }
        if self.sealed {
            return Err(Error::Internal("interim response after the body started".into()));
        }
        // HTTP/1.0 clients do not understand interim responses.
        if self.exchange.version == Version::Http10 {
            return Ok(());
        }

        let out = self.out.as_mut().ok_or_else(closed_error)?;
        let mut head = Vec::with_capacity(64);
        status_line(&mut head, status, None);
        headers.write_to(&mut head);
        head.extend_from_slice(b"\r\n");

        out.write_all(&head)?;
        out.flush()?;
        trace!(status = status.as_u16(), "interim response sent");
        Ok(())
    }

    #[inline]
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The method of the request being answered.
    #[inline]
    pub fn request_method(&self) -> Method {
        self.exchange.method
    }

    /// The version of the request being answered.
    #[inline]
    pub fn request_version(&self) -> Version {
        self.exchange.version
    }

    #[inline]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether the first body byte was written.
    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Whether the head already went out on the wire.
    #[inline]
    pub(crate) fn is_started(&self) -> bool {
        self.out.is_none()
    }

    #[inline]
    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Emits whatever has not been sent yet and terminates the body framing.
    ///
    /// Returns whether the connection may carry another request.
    pub(crate) fn finish(&mut self) -> Result<bool, Error> {
        if self.finished {
            return Ok(self.keep_alive);
        }
        self.sealed = true;

        let result = self.finish_inner();
        self.finished = true;
        if result.is_err() {
            self.keep_alive = false;
        }
        result.map(|_| self.keep_alive)
    }

    fn finish_inner(&mut self) -> Result<(), Error> {
        if self.body.is_none() {
            let known = if self.streaming {
                // A streaming resource that wrote nothing has an empty body.
                Some(0)
            } else {
                Some(self.buffer.len() as u64)
            };
            self.start(known)?;

            let buffer = std::mem::take(&mut self.buffer);
            self.sink()?.write_all(&buffer)?;
        }

        self.sink()?.close()?;
        Ok(())
    }

    fn sink(&mut self) -> io::Result<&mut Box<dyn Sink + 'a>> {
        self.body.as_mut().ok_or_else(closed_error)
    }

    fn check_open(&self, what: &str) -> bool {
        if self.sealed {
            tracing::warn!(call = what, "response is sealed, change ignored");
        }
        !self.sealed
    }

    fn plan(&mut self, known: Option<u64>) -> Plan {
        let version = self.exchange.version;
        if self.headers.contains_token("connection", "close") {
            self.keep_alive = false;
        }

        if !self.status.allows_body() {
            return Plan {
                framing: Framing::None,
                compress: None,
            };
        }

        let declared = self
            .headers
            .get("content-length")
            .and_then(|value| slice_to_u64(value.trim().as_bytes()));
        let length = known.or(declared);

        let compress = match self.exchange.encoding {
            Encoding::Identity => None,
            encoding => {
                let eligible = !self.headers.contains("content-encoding")
                    && is_compressible(self.headers.get("content-type"))
                    && match known {
                        Some(len) => len >= self.limits.compression_min_bytes as u64,
                        None => declared.is_none(),
                    };
                eligible.then_some(encoding)
            }
        };

        let framing = match (compress, length, version) {
            (None, Some(len), _) => Framing::Length(len),
            (_, _, Version::Http11) => Framing::Chunked,
            (_, _, Version::Http10) => {
                self.keep_alive = false;
                Framing::Close
            }
        };

        Plan { framing, compress }
    }

    fn render_head(&mut self, plan: &Plan) -> Vec<u8> {
        let headers = &mut self.headers;

        if let Some(encoding) = plan.compress {
            headers.insert("Content-Encoding", encoding.as_str());
            if !headers.contains_token("vary", "accept-encoding") {
                headers.append("Vary", "Accept-Encoding");
            }
        }

        match plan.framing {
            Framing::None => {}
            Framing::Length(len) => {
                headers.remove("transfer-encoding");
                headers.insert("Content-Length", len.to_string());
            }
            Framing::Chunked => {
                headers.remove("content-length");
                headers.insert("Transfer-Encoding", "chunked");
            }
            Framing::Close => {
                headers.remove("content-length");
                headers.remove("transfer-encoding");
            }
        }

        if !headers.contains("date") {
            headers.append("Date", date::now());
        }
        if !headers.contains("server") && !self.limits.server_header.is_empty() {
            headers.append("Server", self.limits.server_header.as_str());
        }

        if self.status == StatusCode::SWITCHING_PROTOCOLS {
            if !headers.contains_token("connection", "upgrade") {
                headers.insert("Connection", "Upgrade");
            }
        } else if self.keep_alive {
            headers.insert("Connection", "keep-alive");
        } else {
            headers.insert("Connection", "close");
        }

        let mut head = Vec::with_capacity(128 + headers.len() * 32);
        status_line(&mut head, self.status, self.reason.as_deref());
        headers.write_to(&mut head);
        head.extend_from_slice(b"\r\n");
        head
    }

    /// Writes the head and assembles the body sink chain.
    fn start(&mut self, known: Option<u64>) -> io::Result<()> {
        let plan = self.plan(known);
        let head = self.render_head(&plan);
        let out = self.out.take().ok_or_else(closed_error)?;

        out.write_all(&head)?;
        trace!(
            status = self.status.as_u16(),
            framing = ?plan.framing,
            encoding = ?plan.compress,
            "response head sent"
        );

        if self.exchange.method == Method::Head || plan.framing == Framing::None {
            out.flush()?;
            self.body = Some(Box::new(NullSink::new()));
            return Ok(());
        }

        let base = KeepOpen::new(out);
        let framed: Box<dyn Sink + 'a> = match plan.framing {
            Framing::Length(len) => Box::new(LengthWriter::new(base, len)),
            Framing::Chunked => Box::new(ChunkedEncoder::new(base)),
            Framing::Close | Framing::None => Box::new(base),
        };

        self.body = Some(match plan.compress {
            Some(encoding) => Box::new(Encoder::new(framed, encoding, self.limits.compression_level)),
            None => framed,
        });
        Ok(())
    }
}

impl Write for Response<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(closed_error());
        }
        self.sealed = true;

        if !self.streaming {
            self.buffer.extend_from_slice(buf);
            return Ok(buf.len());
        }

        if self.body.is_none() {
            self.start(None)?;
        }
        self.sink()?.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.finished || !self.streaming {
            return Ok(());
        }
        if self.body.is_none() {
            self.sealed = true;
            self.start(None)?;
        }
        self.sink()?.flush()
    }
}

impl fmt::Debug for Response<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("streaming", &self.streaming)
            .field("sealed", &self.sealed)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

fn status_line(out: &mut Vec<u8>, status: StatusCode, reason: Option<&str>) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_u16().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(reason.unwrap_or(status.canonical_reason()).as_bytes());
    out.extend_from_slice(b"\r\n");
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn respond(
        exchange: Exchange,
        handle: impl FnOnce(&mut Response<'_>) -> Result<(), Error>,
    ) -> (Vec<u8>, bool) {
        let limits = RespLimits::default();
        let mut out = Vec::new();
        let keep_alive = {
            let mut resp = Response::new(&mut out, exchange, &limits);
            handle(&mut resp).unwrap();
            resp.finish().unwrap()
        };
        (out, keep_alive)
    }

    fn get11() -> Exchange {
        exchange(Method::Get, Version::Http11, Encoding::Identity)
    }

    #[test]
    fn buffered_body_gets_content_length() {
        let (raw, keep_alive) = respond(get11(), |resp| resp.body("hi"));
        let (head, body) = split(&raw);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Date: "));
        assert!(head.contains("Server: kiln/"));
        assert_eq!(body, b"hi");
        assert!(keep_alive);
    }

    #[test]
    fn headers_keep_insertion_order() {
        let (raw, _) = respond(get11(), |resp| {
            resp.status(StatusCode::CREATED)
                .reason("Made")
                .header("X-B", 1)
                .header("X-A", "2")
                .header("x-b", 3);
            Ok(())
        });
        let (head, _) = split(&raw);

        assert!(head.starts_with("HTTP/1.1 201 Made\r\nX-B: 1\r\nX-A: 2\r\nx-b: 3\r\n"));
        assert!(head.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn sealed_after_first_write() {
        let (raw, _) = respond(get11(), |resp| {
            resp.body("x")?;
            assert!(resp.is_sealed());
            resp.status(StatusCode::NOT_FOUND).header("X-Late", "1");
            Ok(())
        });
        let (head, _) = split(&raw);

        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(!head.contains("X-Late"));
    }

    #[test]
    fn streaming_framing() {
        #[rustfmt::skip]
        let cases = [
            (Version::Http11, "Transfer-Encoding: chunked\r\n", &b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"[..], true),
            (Version::Http10, "Connection: close\r\n",          &b"abcde"[..],                          false),
        ];

        for (version, marker, expected_body, expected_keep_alive) in cases {
            let exchange = exchange(Method::Get, version, Encoding::Identity);
            let (raw, keep_alive) = respond(exchange, |resp| {
                resp.streaming(true);
                resp.body("abc")?;
                resp.flush()?;
                resp.body("de")
            });
            let (head, body) = split(&raw);

            assert!(head.contains(marker), "{version}: {head}");
            assert!(!head.contains("Content-Length"), "{version}");
            assert_eq!(body, expected_body, "{version}");
            assert_eq!(keep_alive, expected_keep_alive, "{version}");
        }
    }

    #[test]
    fn streaming_with_declared_length() {
        let (raw, keep_alive) = respond(get11(), |resp| {
            resp.streaming(true).set_header("Content-Length", 4);
            resp.body("ab")?;
            resp.body("cd")
        });
        let (head, body) = split(&raw);

        assert!(head.contains("Content-Length: 4\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
        assert_eq!(body, b"abcd");
        assert!(keep_alive);
    }

    #[test]
    fn compression_decisions() {
        let big = "A".repeat(10 * 1024);

        #[rustfmt::skip]
        let cases: [(Encoding, Option<&str>, Option<&str>, &str, bool); 6] = [
            (Encoding::Gzip,     None,               None,         big.as_str(), true),
            (Encoding::Gzip,     Some("text/plain"), None,         "tiny",       false),
            (Encoding::Gzip,     Some("image/png"),  None,         big.as_str(), false),
            (Encoding::Gzip,     None,               Some("br"),   big.as_str(), false),
            (Encoding::Identity, None,               None,         big.as_str(), false),
            (Encoding::Deflate,  Some("text/html"),  None,         big.as_str(), true),
        ];

        for (encoding, content_type, content_encoding, payload, compressed) in cases {
            let exchange = exchange(Method::Get, Version::Http11, encoding);
            let (raw, _) = respond(exchange, |resp| {
                if let Some(value) = content_type {
                    resp.header("Content-Type", value);
                }
                if let Some(value) = content_encoding {
                    resp.header("Content-Encoding", value);
                }
                resp.body(payload)
            });
            let (head, _) = split(&raw);

            let marker = format!("Content-Encoding: {}\r\n", encoding.as_str());
            assert_eq!(head.contains(&marker), compressed, "{encoding:?} {content_type:?}: {head}");
            assert_eq!(head.contains("Transfer-Encoding: chunked"), compressed, "{head}");
        }
    }

    #[test]
    fn gzip_body_decodes() {
        let payload = "A".repeat(10 * 1024);
        let exchange = exchange(Method::Get, Version::Http11, Encoding::Gzip);
        let (raw, _) = respond(exchange, |resp| resp.body(&payload));
        let (head, body) = split(&raw);
        assert!(head.contains("Vary: Accept-Encoding\r\n"));

        let mut dechunked = Vec::new();
        crate::stream::chunked::ChunkedDecoder::new(body, u64::MAX)
            .read_to_end(&mut dechunked)
            .unwrap();

        let mut plain = String::new();
        GzDecoder::new(&dechunked[..]).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, payload);
    }

    #[test]
    fn head_suppresses_body() {
        let exchange = exchange(Method::Head, Version::Http11, Encoding::Identity);
        let (raw, _) = respond(exchange, |resp| resp.body("hello"));
        let (head, body) = split(&raw);

        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(body.is_empty());
    }

    #[test]
    fn bodiless_statuses() {
        for status in [StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED] {
            let (raw, keep_alive) = respond(get11(), |resp| {
                resp.status(status);
                resp.body("ignored")
            });
            let (head, body) = split(&raw);

            assert!(!head.contains("Content-Length"), "{status}");
            assert!(!head.contains("Transfer-Encoding"), "{status}");
            assert!(body.is_empty(), "{status}");
            assert!(keep_alive);
        }
    }

    #[test]
    fn interim_then_final() {
        let (raw, _) = respond(get11(), |resp| {
            resp.send_informational(StatusCode::CONTINUE, &HeaderMap::new())?;

            let mut hints = HeaderMap::new();
            hints.append("Link", "</style.css>; rel=preload");
            resp.send_informational(StatusCode::EARLY_HINTS, &hints)?;

            assert!(resp.send_informational(StatusCode::OK, &HeaderMap::new()).is_err());
            resp.body("done")
        });
        let text = String::from_utf8(raw).unwrap();

        assert!(text.starts_with(
            "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </style.css>; rel=preload\r\n\r\nHTTP/1.1 200 OK\r\n"
        ));
        assert!(text.ends_with("\r\n\r\ndone"));
    }

    #[test]
    fn connection_close_decisions() {
        let (raw, keep_alive) = respond(get11(), |resp| {
            resp.header("Connection", "close");
            Ok(())
        });
        assert!(split(&raw).0.contains("Connection: close\r\n"));
        assert!(!keep_alive);

        let (raw, keep_alive) = respond(get11(), |resp| {
            resp.close();
            Ok(())
        });
        assert!(split(&raw).0.contains("Connection: close\r\n"));
        assert!(!keep_alive);
    }

    #[test]
    fn switching_protocols_head() {
        let (raw, _) = respond(get11(), |resp| {
            resp.status(StatusCode::SWITCHING_PROTOCOLS)
                .header("Upgrade", "websocket");
            Ok(())
        });
        let (head, body) = split(&raw);

        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n"));
        assert!(head.contains("Connection: Upgrade\r\n"));
        assert!(!head.contains("Content-Length"));
        assert!(body.is_empty());
    }
}
