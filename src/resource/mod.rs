//! Resource interface and dispatch.

pub(crate) mod builtin;

use crate::{
    errors::Error,
    http::{
        request::{Request, RequestHead},
        response::Response,
        types::{Method, MethodSet},
        uri::Uri,
    },
    stream::{
        socket::{SocketReader, SocketWriter},
        Sink,
    },
};
pub use builtin::{ErrorPage, Redirect, Text};
use std::{
    fmt,
    io::{self, BufRead, Read, Write},
    time::Instant,
};

/// A server-side handler selected by matching the request URI.
///
/// Resources are consulted in registration order and the first one whose
/// [`matches`](Resource::matches) returns `true` serves the request.
///
/// # Examples
/// ```
/// use kiln::{Error, Request, Resource, Response, Uri};
///
/// struct Hello;
///
/// impl Resource for Hello {
///     fn matches(&self, uri: &Uri) -> bool {
///         uri.path() == "/hello"
///     }
///
///     fn handle(&self, _req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<(), Error> {
///         resp.header("Content-Type", "text/plain");
///         resp.body("hi")
///     }
/// }
/// ```
pub trait Resource: Send + Sync + 'static {
    fn matches(&self, uri: &Uri) -> bool;

    /// Methods this resource answers. Others get `405 Method Not Allowed`.
    fn allowed_methods(&self) -> MethodSet {
        MethodSet::of(&[Method::Get, Method::Head])
    }

    /// Whether responses are sent as they are written instead of buffered.
    fn is_streaming(&self) -> bool {
        false
    }

    /// Whether a `101 Switching Protocols` answer hands the raw connection
    /// to [`upgrade`](Resource::upgrade).
    fn is_hijack(&self) -> bool {
        false
    }

    /// Serves one request.
    ///
    /// An error returned before the first body byte is written becomes an
    /// error page; after that the connection is closed.
    fn handle(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<(), Error>;

    /// Takes over the connection after a successful `101`. Runs on the worker
    /// that served the request and owns the connection until it returns.
    fn upgrade(&self, _head: RequestHead, _conn: Upgraded) -> Result<(), Error> {
        Ok(())
    }
}

/// Prefix match on path segment boundaries: `/static` matches `/static`
/// and `/static/a` but not `/statics`.
pub fn path_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Outcome of matching a request against the registry.
pub(crate) enum Dispatch<'r> {
    Found(&'r dyn Resource),
    NotFound,
    NotAllowed(MethodSet),
}

/// Ordered list of resources plus the page used to render errors.
///
/// The registry is built before the server starts and is read-only afterwards.
#[derive(Default)]
pub struct Registry {
    resources: Vec<Box<dyn Resource>>,
    errors: ErrorPage,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a resource; earlier resources take precedence.
    pub fn add(&mut self, resource: impl Resource) -> &mut Self {
        self.resources.push(Box::new(resource));
        self
    }

    /// Builder form of [`add`](Registry::add).
    pub fn with(mut self, resource: impl Resource) -> Self {
        self.add(resource);
        self
    }

    pub fn set_error_page(&mut self, page: ErrorPage) -> &mut Self {
        self.errors = page;
        self
    }

    #[inline]
    pub fn error_page(&self) -> &ErrorPage {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Finds the first matching resource and checks `method` against it.
    ///
    /// `TRACE` counts as allowed only when `enable_trace` is set.
    pub(crate) fn dispatch(&self, uri: &Uri, method: Method, enable_trace: bool) -> Dispatch<'_> {
        let Some(resource) = self.resources.iter().find(|r| r.matches(uri)) else {
            return Dispatch::NotFound;
        };

        let mut allowed = resource.allowed_methods();
        if !enable_trace {
            allowed = allowed.without(Method::Trace);
        }

        match allowed.contains(method) {
            true => Dispatch::Found(&**resource),
            false => Dispatch::NotAllowed(allowed),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("resources", &self.resources.len())
            .field("errors", &self.errors)
            .finish()
    }
}

/// The raw connection handed to [`Resource::upgrade`].
///
/// Bytes the client sent after the upgrade request are already buffered
/// and are returned by the first reads.
pub struct Upgraded {
    reader: SocketReader,
    writer: SocketWriter,
}

impl Upgraded {
    pub(crate) fn new(reader: SocketReader, writer: SocketWriter) -> Self {
        Self { reader, writer }
    }

    pub(crate) fn into_parts(self) -> (SocketReader, SocketWriter) {
        (self.reader, self.writer)
    }

    /// Bounds every following read; `None` waits forever.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.reader.set_deadline(deadline);
    }

    /// Shuts the connection down gracefully.
    pub fn close(mut self) -> io::Result<()> {
        self.writer.close()
    }
}

impl Read for Upgraded {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for Upgraded {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl Write for Upgraded {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
