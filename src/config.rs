//! Server configuration loaded from TOML.
//!
//! Every option has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! listen_address = "0.0.0.0"
//! listen_port = 8080
//! worker_count = 8
//! max_workers = 32
//! overflow_policy = "respond503"
//!
//! [[resources]]
//! kind = "text"
//! path = "/hello"
//! body = "Hello World!"
//!
//! [[resources]]
//! kind = "redirect"
//! path = "/old"
//! location = "/hello"
//! permanent = true
//!
//! [[resources]]
//! kind = "websocket_echo"
//! path = "/echo"
//!
//! [error_pages]
//! 404 = "<h1>{status} {reason}</h1><p>{description}</p>"
//! ```

use crate::{
    errors::Error,
    http::types::StatusCode,
    limits::{ConnLimits, OverflowPolicy, ReqLimits, RespLimits, ServerLimits, WaitStrategy, WsLimits},
    resource::{ErrorPage, Redirect, Registry, Text},
    server::server_impl::{Server, ServerBuilder},
    websocket::{Echo, WebSocket},
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

/// Root configuration of the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen_address: String,
    pub listen_port: u16,

    pub worker_count: usize,
    /// Upper bound for burst workers; defaults to `worker_count`.
    pub max_workers: Option<usize>,
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,

    pub keep_alive_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub socket_write_timeout_ms: u64,
    pub max_requests_per_connection: usize,

    pub max_request_line_bytes: usize,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,

    pub compression_min_bytes: usize,
    pub compression_level: u32,
    pub server_header: String,

    pub enable_trace: bool,
    pub json_errors: bool,

    /// Served in this order; the first matching path wins.
    pub resources: Vec<ResourceSpec>,
    /// Status code to HTML template, see [`ErrorPage`].
    pub error_pages: BTreeMap<String, String>,

    pub max_ws_message_bytes: usize,
    pub ws_subprotocols: Vec<String>,
    pub ws_ping_interval_ms: u64,

    pub shutdown_drain_ms: u64,

    /// `tracing` filter directives, used when `RUST_LOG` is unset.
    pub log_filter: String,
}

/// One entry of `resources`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSpec {
    Text {
        path: String,
        body: String,
        content_type: Option<String>,
    },
    Redirect {
        path: String,
        location: String,
        #[serde(default)]
        permanent: bool,
    },
    WebsocketEcho {
        path: String,
    },
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerLimits::default();
        let conn = ConnLimits::default();
        let req = ReqLimits::default();
        let resp = RespLimits::default();
        let ws = WsLimits::default();

        Self {
            listen_address: "0.0.0.0".to_owned(),
            listen_port: 8080,
            worker_count: server.worker_count,
            max_workers: None,
            queue_capacity: server.queue_capacity,
            overflow_policy: server.overflow_policy,
            keep_alive_timeout_ms: millis(conn.keep_alive_timeout),
            request_timeout_ms: millis(conn.request_timeout),
            socket_write_timeout_ms: millis(conn.socket_write_timeout),
            max_requests_per_connection: conn.max_requests_per_connection,
            max_request_line_bytes: req.max_request_line,
            max_header_bytes: req.max_header_bytes,
            max_body_bytes: req.max_body,
            compression_min_bytes: resp.compression_min_bytes,
            compression_level: resp.compression_level,
            server_header: resp.server_header,
            enable_trace: server.enable_trace,
            json_errors: server.json_errors,
            resources: Vec::new(),
            error_pages: BTreeMap::new(),
            max_ws_message_bytes: ws.max_message,
            ws_subprotocols: ws.subprotocols,
            ws_ping_interval_ms: millis(ws.ping_interval),
            shutdown_drain_ms: millis(server.shutdown_drain),
            log_filter: "info".to_owned(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self, Error> {
        let config: Config =
            toml::from_str(src).map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let src = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&src)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        let fail = |message: String| Err(Error::Config(message));

        if self.worker_count == 0 {
            return fail("worker_count must be at least 1".into());
        }
        if self.max_workers.is_some_and(|max| max < self.worker_count) {
            return fail("max_workers must not be smaller than worker_count".into());
        }
        if self.queue_capacity == 0 {
            return fail("queue_capacity must be at least 1".into());
        }
        if self.compression_level > 9 {
            return fail(format!("compression_level must be between 0 and 9, got {}", self.compression_level));
        }
        if self.max_request_line_bytes == 0 || self.max_header_bytes == 0 {
            return fail("request line and header limits must be positive".into());
        }
        if self.keep_alive_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return fail("timeouts must be positive".into());
        }
        self.socket_addr()?;

        for status in self.error_pages.keys() {
            parse_status(status)?;
        }
        for resource in &self.resources {
            let path = resource.path();
            if !path.starts_with('/') {
                return fail(format!("resource path `{path}` must start with `/`"));
            }
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        let ip: IpAddr = self
            .listen_address
            .parse()
            .map_err(|_| Error::Config(format!("invalid listen_address `{}`", self.listen_address)))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    pub fn server_limits(&self) -> ServerLimits {
        ServerLimits {
            worker_count: self.worker_count,
            max_workers: self.max_workers.unwrap_or(self.worker_count),
            queue_capacity: self.queue_capacity,
            overflow_policy: self.overflow_policy,
            wait_strategy: WaitStrategy::Sleep(Duration::from_millis(1)),
            shutdown_drain: Duration::from_millis(self.shutdown_drain_ms),
            json_errors: self.json_errors,
            enable_trace: self.enable_trace,
        }
    }

    pub fn connection_limits(&self) -> ConnLimits {
        ConnLimits {
            keep_alive_timeout: Duration::from_millis(self.keep_alive_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            socket_write_timeout: Duration::from_millis(self.socket_write_timeout_ms),
            max_requests_per_connection: self.max_requests_per_connection,
        }
    }

    pub fn request_limits(&self) -> ReqLimits {
        ReqLimits {
            max_request_line: self.max_request_line_bytes,
            max_header_bytes: self.max_header_bytes,
            max_body: self.max_body_bytes,
        }
    }

    pub fn response_limits(&self) -> RespLimits {
        RespLimits {
            compression_min_bytes: self.compression_min_bytes,
            compression_level: self.compression_level,
            server_header: self.server_header.clone(),
            ..RespLimits::default()
        }
    }

    pub fn ws_limits(&self) -> WsLimits {
        WsLimits {
            max_message: self.max_ws_message_bytes,
            ping_interval: Duration::from_millis(self.ws_ping_interval_ms),
            subprotocols: self.ws_subprotocols.clone(),
        }
    }

    /// Instantiates `resources` in order, with `error_pages` as the error page.
    pub fn registry(&self) -> Result<Registry, Error> {
        let mut registry = Registry::new();

        for resource in &self.resources {
            match resource {
                ResourceSpec::Text {
                    path,
                    body,
                    content_type,
                } => {
                    let mut text = Text::new(path.as_str(), body.as_str());
                    if let Some(content_type) = content_type {
                        text = text.content_type(content_type.as_str());
                    }
                    registry.add(text);
                }
                ResourceSpec::Redirect {
                    path,
                    location,
                    permanent: true,
                } => {
                    registry.add(Redirect::permanent(path.as_str(), location.as_str()));
                }
                ResourceSpec::Redirect { path, location, .. } => {
                    registry.add(Redirect::temporary(path.as_str(), location.as_str()));
                }
                ResourceSpec::WebsocketEcho { path } => {
                    registry.add(WebSocket::new(path.as_str(), Echo).limits(self.ws_limits()));
                }
            }
        }

        let mut page = ErrorPage::new().json(self.json_errors);
        for (status, template) in &self.error_pages {
            page = page.page(parse_status(status)?, template.as_str());
        }
        registry.set_error_page(page);

        Ok(registry)
    }

    /// A builder carrying every setting of this configuration.
    pub fn server_builder(&self) -> Result<ServerBuilder, Error> {
        Ok(Server::builder()
            .bind(self.socket_addr()?)
            .registry(self.registry()?)
            .server_limits(self.server_limits())
            .connection_limits(self.connection_limits())
            .request_limits(self.request_limits())
            .response_limits(self.response_limits()))
    }
}

impl ResourceSpec {
    pub fn path(&self) -> &str {
        match self {
            ResourceSpec::Text { path, .. }
            | ResourceSpec::Redirect { path, .. }
            | ResourceSpec::WebsocketEcho { path } => path,
        }
    }
}

fn parse_status(key: &str) -> Result<StatusCode, Error> {
    key.trim()
        .parse::<u16>()
        .ok()
        .and_then(StatusCode::from_u16)
        .ok_or_else(|| Error::Config(format!("`{key}` in error_pages is not a status code")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    const FULL: &str = r#"
        listen_address = "127.0.0.1"
        listen_port = 9000
        worker_count = 4
        max_workers = 12
        queue_capacity = 64
        overflow_policy = "respond503"
        keep_alive_timeout_ms = 2500
        max_body_bytes = 4096
        compression_level = 9
        server_header = "test"
        enable_trace = true
        ws_subprotocols = ["chat"]
        ws_ping_interval_ms = 1000

        [[resources]]
        kind = "text"
        path = "/hello"
        body = "hi"
        content_type = "text/html"

        [[resources]]
        kind = "redirect"
        path = "/old"
        location = "/hello"
        permanent = true

        [[resources]]
        kind = "websocket_echo"
        path = "/ws"

        [error_pages]
        404 = "<h1>{status}</h1>"
    "#;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn full_document() {
        let config = Config::from_toml_str(FULL).unwrap();

        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.overflow_policy, OverflowPolicy::Respond503);
        assert_eq!(
            config.resources[1],
            ResourceSpec::Redirect {
                path: "/old".into(),
                location: "/hello".into(),
                permanent: true
            }
        );

        let server = config.server_limits();
        assert_eq!((server.worker_count, server.max_workers, server.queue_capacity), (4, 12, 64));
        assert!(server.enable_trace);

        let conn = config.connection_limits();
        assert_eq!(conn.keep_alive_timeout, Duration::from_millis(2500));
        assert_eq!(config.request_limits().max_body, 4096);
        assert_eq!(config.response_limits().server_header, "test");
        assert_eq!(config.ws_limits().subprotocols, ["chat"]);

        let registry = config.registry().unwrap();
        assert_eq!(registry.len(), 3);
        assert!(!registry.is_empty());
    }

    #[test]
    fn max_workers_defaults_to_worker_count() {
        let config = Config::from_toml_str("worker_count = 3").unwrap();
        assert_eq!(config.server_limits().max_workers, 3);
    }

    #[test]
    fn rejected_documents() {
        #[rustfmt::skip]
        let cases = [
            ("worker_count = 0",                               "worker_count"),
            ("worker_count = 4\nmax_workers = 2",              "max_workers"),
            ("queue_capacity = 0",                             "queue_capacity"),
            ("compression_level = 12",                         "compression_level"),
            ("listen_address = \"localhost\"",                 "listen_address"),
            ("overflow_policy = \"drop\"",                     "invalid configuration"),
            ("unknown_option = 1",                             "invalid configuration"),
            ("[error_pages]\nabc = \"x\"",                     "error_pages"),
            ("[error_pages]\n99 = \"x\"",                      "error_pages"),
            ("[[resources]]\nkind = \"text\"\npath = \"x\"\nbody = \"\"", "must start with"),
            ("[[resources]]\nkind = \"proxy\"\npath = \"/\"",  "invalid configuration"),
        ];

        for (src, needle) in cases {
            let err = Config::from_toml_str(src).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "{src}");
            assert!(err.to_string().contains(needle), "{src}: {err}");
        }
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Config::load("/nonexistent/kiln.toml").unwrap_err();
        assert!(err.to_string().contains("cannot read"), "{err}");
    }
}
