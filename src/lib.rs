//! kiln - Threaded HTTP/1.1 serving engine with WebSocket upgrade
//!
//! A blocking, thread-per-connection HTTP server built around a bounded
//! worker pool. Applications plug in [`Resource`]s that are matched
//! against the request URI; the engine owns everything between the
//! socket and the resource.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, `Expect: 100-continue`,
//!   chunked request and response bodies
//! - **HTTP/1.0**: close-by-default connections and `Connection: keep-alive`
//! - **Compression**: `gzip` and `deflate` for request bodies and for
//!   responses negotiated through `Accept-Encoding`
//! - **WebSocket**: RFC 6455 upgrade, fragmentation, ping/pong and a
//!   broadcast [`Hub`](websocket::Hub)
//!
//! # Engine Characteristics
//!
//! - **Bounded admission** - a fixed worker set with a bounded queue, burst
//!   workers up to a hard limit, then `503` or an immediate close
//! - **Strict limits** - request line, header block and body sizes are
//!   capped before anything reaches a resource
//! - **Panic containment** - a panicking resource costs one connection,
//!   never the process
//! - **Graceful shutdown** - a [`Shutdown`] token stops accepting, drains
//!   in-flight requests and force-closes whatever outlives the deadline
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use kiln::{Registry, Server, Text};
//!
//! fn main() -> Result<(), kiln::Error> {
//!     let registry = Registry::new().with(Text::new("/", "Hello World!"));
//!
//!     Server::builder()
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .registry(registry)
//!         .build()?
//!         .run()
//! }
//! ```
//! A resource of your own:
//! ```no_run
//! use kiln::{Error, MethodSet, Method, Registry, Request, Resource, Response, Server, Uri};
//!
//! struct Upload;
//!
//! impl Resource for Upload {
//!     fn matches(&self, uri: &Uri) -> bool {
//!         kiln::path_matches("/upload", uri.path())
//!     }
//!
//!     fn allowed_methods(&self) -> MethodSet {
//!         MethodSet::of(&[Method::Post, Method::Put])
//!     }
//!
//!     fn handle(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<(), Error> {
//!         let body = req.body_bytes()?;
//!         resp.header("Content-Type", "text/plain");
//!         resp.body(format!("received {} bytes", body.len()))
//!     }
//! }
//!
//! fn main() -> Result<(), Error> {
//!     Server::builder()
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .registry(Registry::new().with(Upload))
//!         .build()?
//!         .run()
//! }
//! ```
//! Driven by a TOML document:
//! ```no_run
//! use kiln::Config;
//!
//! fn main() -> Result<(), kiln::Error> {
//!     let config = Config::from_toml_str(r#"
//!         listen_port = 8080
//!         worker_count = 8
//!
//!         [[resources]]
//!         kind = "text"
//!         path = "/"
//!         body = "Hello World!"
//!
//!         [[resources]]
//!         kind = "websocket_echo"
//!         path = "/ws"
//!     "#)?;
//!
//!     config.server_builder()?.build()?.run()
//! }
//! ```

pub(crate) mod http {
    pub(crate) mod date;
    pub(crate) mod header;
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
    pub(crate) mod uri;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod pool;
    pub(crate) mod server_impl;
}
pub(crate) mod config;
pub(crate) mod errors;
pub mod limits;
pub(crate) mod resource;
pub(crate) mod shutdown;
pub(crate) mod stream;
pub mod websocket;

pub use crate::{
    config::{Config, ResourceSpec},
    errors::{Error, ErrorKind, HttpError},
    http::{
        header::{Header, HeaderMap},
        query,
        request::{Body, BodyFraming, Request, RequestHead},
        response::Response,
        types::{Method, MethodSet, StatusCode, Version},
        uri::{TargetForm, Uri},
    },
    resource::{path_matches, ErrorPage, Redirect, Registry, Resource, Text, Upgraded},
    server::server_impl::{Server, ServerBuilder},
    shutdown::Shutdown,
    stream::compress::{negotiate as negotiate_encoding, Encoding},
};
