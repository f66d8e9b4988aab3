use crate::{
    errors::{Error, HttpError},
    http::{
        header::{parse_field, split_list, HeaderMap},
        types::{slice_to_u64, Method, Version},
        uri::{TargetForm, Uri},
    },
    limits::ReqLimits,
    stream::{
        chunked::ChunkedDecoder,
        compress::{Decoder, Encoding},
        length::LengthReader,
        read_to_vec,
        socket::SocketReader,
        Source,
    },
};
use memchr::{memchr, memchr_iter};
use std::{
    fmt,
    io::{self, BufRead, Read},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::SystemTime,
};
use tracing::warn;

/// How the body of a request is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body at all.
    Empty,
    /// `Content-Length` bytes.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

/// Everything about a request except its body.
///
/// # Wire format
///
/// ```text
/// [METHOD] SP [TARGET] SP HTTP/[DIGIT].[DIGIT] CRLF
/// *( [NAME] ":" OWS [VALUE] OWS CRLF )
/// CRLF
/// ```
///
/// - Lines end in exactly `CRLF`; a bare `LF` is rejected.
/// - Leading empty lines before the request line are skipped.
/// - The head must be UTF-8; header values may not contain control characters.
/// - A continuation line starting with `SP`/`HTAB` (obsolete folding) is rejected.
///
/// | Failure                            | Status |
/// |------------------------------------|--------|
/// | Unknown method token               | `501`  |
/// | Request line over the limit        | `414`  |
/// | Malformed line, target or header   | `400`  |
/// | Version other than 1.0 / 1.1       | `505`  |
/// | Header section over the limit      | `431`  |
#[derive(Clone, PartialEq)]
pub struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,

    pub(crate) peer: SocketAddr,
    pub(crate) local: SocketAddr,
    pub(crate) received_at: SystemTime,
}

impl RequestHead {
    const UNKNOWN_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

    /// Parses a complete head from the start of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed, and otherwise the head
    /// together with the number of bytes it occupied.
    pub(crate) fn parse(
        buf: &[u8],
        limits: &ReqLimits,
    ) -> Result<Option<(RequestHead, usize)>, HttpError> {
        // Tolerate stray CRLFs left over from a previous message.
        let mut start = 0;
        while buf[start..].starts_with(b"\r\n") {
            start += 2;
        }
        if buf.len() - start == 1 && buf[start] == b'\r' {
            return Ok(None);
        }

        let Some(lf) = memchr(b'\n', &buf[start..]).map(|i| start + i) else {
            if buf.len() - start > limits.max_request_line {
                return Err(HttpError::UriTooLong);
            }
            return Ok(None);
        };

        if lf + 1 - start > limits.max_request_line {
            return Err(HttpError::UriTooLong);
        }
        if lf == start || buf[lf - 1] != b'\r' {
            return Err(HttpError::BadRequestLine);
        }
        let (method, uri, version) = parse_request_line(&buf[start..lf - 1])?;

        let mut headers = HeaderMap::with_capacity(16);
        let headers_start = lf + 1;
        let mut line_start = headers_start;

        loop {
            let Some(lf) = memchr(b'\n', &buf[line_start..]).map(|i| line_start + i) else {
                if buf.len() - headers_start > limits.max_header_bytes {
                    return Err(HttpError::HeaderTooLarge);
                }
                return Ok(None);
            };

            if lf + 1 - headers_start > limits.max_header_bytes {
                return Err(HttpError::HeaderTooLarge);
            }
            if lf == line_start || buf[lf - 1] != b'\r' {
                return Err(HttpError::InvalidHeader);
            }

            let line = &buf[line_start..lf - 1];
            line_start = lf + 1;

            match line.first() {
                None => break,
                Some(b' ' | b'\t') => return Err(HttpError::ObsoleteFolding),
                Some(_) => {
                    let field = parse_field(line)?;
                    headers.append(field.name, field.value);
                }
            }
        }

        let head = RequestHead {
            method,
            uri,
            version,
            headers,
            peer: Self::UNKNOWN_ADDR,
            local: Self::UNKNOWN_ADDR,
            received_at: SystemTime::now(),
        };
        Ok(Some((head, line_start)))
    }

    /// Reads and parses the next head from the socket.
    ///
    /// `Ok(None)` means the peer closed the connection cleanly between requests.
    pub(crate) fn read(reader: &mut SocketReader, limits: &ReqLimits) -> Result<Option<Self>, Error> {
        loop {
            if !reader.buffered().is_empty() {
                if let Some((head, used)) = Self::parse(reader.buffered(), limits)? {
                    reader.consume(used);
                    return Ok(Some(head));
                }
            }

            let was_empty = reader.buffered().is_empty();
            match reader.fill_more()? {
                0 if was_empty => return Ok(None),
                0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-request",
                    )
                    .into())
                }
                _ => {}
            }
        }
    }

    /// Decides how the body is framed and normalizes the framing headers:
    /// `Content-Length` is dropped when chunked wins, and equal duplicates collapse.
    pub(crate) fn body_framing(&mut self, limits: &ReqLimits) -> Result<BodyFraming, HttpError> {
        if self.headers.contains("transfer-encoding") {
            let codings: Vec<String> = self
                .headers
                .get_all("transfer-encoding")
                .flat_map(split_list)
                .map(str::to_ascii_lowercase)
                .collect();

            let Some((last, rest)) = codings.split_last() else {
                return Err(HttpError::UnsupportedTransferCoding);
            };
            if last != "chunked" || rest.iter().any(|c| c != "identity") {
                return Err(HttpError::UnsupportedTransferCoding);
            }

            if self.headers.remove("content-length") {
                warn!(uri = %self.uri, "Content-Length ignored in favour of chunked framing");
            }
            return Ok(BodyFraming::Chunked);
        }

        if self.headers.contains("content-length") {
            let mut length = None;
            for value in self.headers.get_all("content-length").flat_map(|v| v.split(',')) {
                let parsed = slice_to_u64(value.trim().as_bytes()).ok_or(HttpError::InvalidContentLength)?;
                match length {
                    Some(seen) if seen != parsed => return Err(HttpError::InvalidContentLength),
                    _ => length = Some(parsed),
                }
            }

            let length = length.ok_or(HttpError::InvalidContentLength)?;
            if length > limits.max_body as u64 {
                return Err(HttpError::BodyTooLarge);
            }
            self.headers.insert("Content-Length", length.to_string());
            return Ok(BodyFraming::Length(length));
        }

        match self.method.body_optional() {
            true => Ok(BodyFraming::Empty),
            false => Err(HttpError::LengthRequired),
        }
    }

    /// `Some(true)` for `Expect: 100-continue` on HTTP/1.1, `Some(false)` when
    /// it must be ignored (HTTP/1.0), `None` when absent. Any other
    /// expectation yields `417`.
    pub(crate) fn expectation(&self) -> Result<Option<bool>, HttpError> {
        let Some(expect) = self.headers.get("expect") else {
            return Ok(None);
        };

        match expect.trim().eq_ignore_ascii_case("100-continue") {
            true => Ok(Some(self.version == Version::Http11)),
            false => Err(HttpError::ExpectationFailed),
        }
    }

    /// The coding of the request body, or `415` for anything but a single gzip/deflate.
    pub(crate) fn content_encoding(&self) -> Result<Encoding, HttpError> {
        let mut codings = self
            .headers
            .get_all("content-encoding")
            .flat_map(split_list)
            .map(Encoding::from_token)
            .filter(|c| *c != Some(Encoding::Identity));

        match (codings.next(), codings.next()) {
            (None, _) => Ok(Encoding::Identity),
            (Some(Some(encoding)), None) => Ok(encoding),
            _ => Err(HttpError::UnsupportedContentEncoding),
        }
    }

    /// Keep-alive as requested by the client (RFC 7230 section 6.3).
    pub fn wants_keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.contains_token("connection", "close"),
            Version::Http10 => self.headers.contains_token("connection", "keep-alive"),
        }
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Uri, Version), HttpError> {
    let mut spaces = memchr_iter(b' ', line);
    let (Some(first), Some(second)) = (spaces.next(), spaces.next()) else {
        return Err(HttpError::BadRequestLine);
    };
    if spaces.next().is_some() {
        return Err(HttpError::BadRequestLine);
    }

    let method = Method::from_bytes(&line[..first])?;

    let target = &line[first + 1..second];
    let target = simdutf8::basic::from_utf8(target).map_err(|_| HttpError::InvalidTarget)?;
    let uri = Uri::parse(target)?;

    match (uri.form(), method) {
        (TargetForm::Authority, Method::Connect) => {}
        (TargetForm::Authority, _) | (_, Method::Connect) => return Err(HttpError::InvalidTarget),
        (TargetForm::Asterisk, m) if m != Method::Options => return Err(HttpError::InvalidTarget),
        _ => {}
    }

    let version = Version::from_bytes(&line[second + 1..])?;
    Ok((method, uri, version))
}

// Public API
impl RequestHead {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub const fn uri(&self) -> &Uri {
        &self.uri
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the first header value with case-insensitive name matching
    /// (per [RFC 7230](https://tools.ietf.org/html/rfc7230#section-3.2)).
    #[inline(always)]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline(always)]
    pub const fn client_addr(&self) -> &SocketAddr {
        &self.peer
    }

    #[inline(always)]
    pub const fn server_addr(&self) -> &SocketAddr {
        &self.local
    }

    #[inline(always)]
    pub const fn received_at(&self) -> SystemTime {
        self.received_at
    }
}

impl fmt::Debug for RequestHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHead")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Request body as exposed to resources.
///
/// Reads through whatever framing and content coding the request declared.
pub struct Body<'a> {
    source: Box<dyn Source + 'a>,
    eof: bool,
}

impl<'a> Body<'a> {
    pub(crate) fn new(source: Box<dyn Source + 'a>) -> Self {
        Self { source, eof: false }
    }

    pub(crate) fn empty() -> Self {
        Self {
            source: Box::new(io::empty()),
            eof: true,
        }
    }

    /// Whether the body has been read to its end.
    pub fn is_finished(&self) -> bool {
        self.eof
    }
}

impl Read for Body<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let n = self.source.read(out)?;
        if n == 0 && !out.is_empty() {
            self.eof = true;
        }
        Ok(n)
    }
}

impl Source for Body<'_> {
    fn trailers(&self) -> Option<&HeaderMap> {
        self.source.trailers()
    }
}

/// An HTTP request handed to a resource.
///
/// The head is immutable once parsed; the body is read lazily from the
/// connection through [`Request::body`].
pub struct Request<'a> {
    head: RequestHead,
    framing: BodyFraming,
    body: Body<'a>,
    max_body: usize,
}

impl<'a> Request<'a> {
    /// Builds the body pipeline over `reader`: framing first, then decompression.
    pub(crate) fn new<R: BufRead + 'a>(
        head: RequestHead,
        framing: BodyFraming,
        encoding: Encoding,
        reader: R,
        limits: &ReqLimits,
    ) -> Self {
        let max_body = limits.max_body as u64;

        let framed: Box<dyn Source + 'a> = match framing {
            BodyFraming::Empty => Box::new(io::empty()),
            BodyFraming::Length(length) => Box::new(LengthReader::new(reader, length)),
            BodyFraming::Chunked => Box::new(ChunkedDecoder::new(reader, max_body)),
        };

        let body = match framing {
            BodyFraming::Empty => Body::empty(),
            _ => match Decoder::wrap(framed, encoding, max_body) {
                Ok(decoder) => Body::new(Box::new(decoder)),
                Err(identity) => Body::new(identity),
            },
        };

        Self {
            head,
            framing,
            body,
            max_body: limits.max_body,
        }
    }
}

impl<'a> Request<'a> {
    #[inline(always)]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn into_head(self) -> RequestHead {
        self.head
    }

    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.head.method
    }

    #[inline(always)]
    pub const fn uri(&self) -> &Uri {
        &self.head.uri
    }

    #[inline(always)]
    pub const fn version(&self) -> Version {
        self.head.version
    }

    #[inline(always)]
    pub const fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    #[inline(always)]
    pub const fn client_addr(&self) -> &SocketAddr {
        &self.head.peer
    }

    #[inline(always)]
    pub const fn server_addr(&self) -> &SocketAddr {
        &self.head.local
    }

    #[inline(always)]
    pub const fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Returns the value of the `Content-Length` header if the body is length-framed.
    pub const fn content_length(&self) -> Option<u64> {
        match self.framing {
            BodyFraming::Length(length) => Some(length),
            _ => None,
        }
    }

    /// Looks `name` up in the header section, then among the trailers,
    /// provided the request announced it in its `Trailer` field.
    pub fn header(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.head.headers.get(name) {
            return Some(value);
        }

        if !self.head.headers.contains_token("trailer", name) {
            return None;
        }
        self.body.trailers()?.get(name)
    }

    /// Raw trailer fields, available after the chunked body was read to its end.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.body.trailers()
    }

    pub fn body(&mut self) -> &mut Body<'a> {
        &mut self.body
    }

    /// Reads the remaining body into memory, bounded by the configured body limit.
    pub fn body_bytes(&mut self) -> Result<Vec<u8>, Error> {
        Ok(read_to_vec(&mut self.body, self.max_body)?)
    }

    /// Like [`Request::body_bytes`], failing on invalid UTF-8.
    pub fn body_string(&mut self) -> Result<String, Error> {
        let bytes = self.body_bytes()?;
        String::from_utf8(bytes).map_err(Error::resource)
    }

    /// Reads and drops whatever the resource left unread, so the connection
    /// can carry another request.
    pub(crate) fn discard_body(&mut self) -> Result<(), Error> {
        if self.body.is_finished() {
            return Ok(());
        }
        io::copy(&mut Read::take(&mut self.body, self.max_body as u64 + 1), &mut io::sink())?;

        match self.body.is_finished() {
            true => Ok(()),
            false => Err(HttpError::BodyTooLarge.into()),
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.head.wants_keep_alive()
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("head", &self.head)
            .field("framing", &self.framing)
            .finish()
    }
}
