//! Engine limits, timeouts and tunables
//!
//! # Security-First Defaults
//!
//! Default limits are intentionally conservative to prevent:
//! - Resource exhaustion attacks
//! - Slowloris attacks (idle and per-request timeouts)
//! - Header flooding and oversized bodies
//! - Oversized WebSocket messages
//!
//! Every struct here is plain data with a [`Default`] impl. They are usually
//! derived from a [`Config`](crate::Config) but can be built directly:
//!
//! ```no_run
//! use kiln::{limits::{ConnLimits, ReqLimits}, Registry, Server};
//! use std::time::Duration;
//!
//! let server = Server::builder()
//!     .bind("127.0.0.1:8080".parse().unwrap())
//!     .registry(Registry::new())
//!     .connection_limits(ConnLimits {
//!         keep_alive_timeout: Duration::from_secs(5),
//!         max_requests_per_connection: 10_000,
//!         ..ConnLimits::default()
//!     })
//!     .request_limits(ReqLimits {
//!         max_body: 16 * 1024 * 1024,
//!         ..ReqLimits::default()
//!     })
//!     .build()
//!     .unwrap();
//! ```

use serde::Deserialize;
use std::time::Duration;

/// Controls worker-pool sizing, admission queueing and shutdown.
///
/// # Connection management
/// ```text
///                            [------------]
///                            [ Tcp accept ]
///                            [------------]
///                                  ||
///                                  || TCP_STREAM
///                                  \/
/// [--------------]   No    /----------------\   Yes  [-----------------]
/// [ Add to queue ] <====== | Queue is full? | =====> [ Overflow policy ]
/// [--------------]         \----------------/        [-----------------]
///        ||
///        \/
/// [---------]   Yes   /--------------------------\   No   [------------------]
/// [ Worker  ] <====== | Is there an idle worker? | =====> [ Burst (<= max) ]
/// [---------]         \--------------------------/        [------------------]
/// ```
///
/// A worker is an OS thread created once at startup. It blocks on the queue,
/// runs one connection to completion (including keep-alive) and goes back to
/// the queue. Burst workers are created on demand up to `max_workers` and
/// retire after staying idle.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Fixed number of workers started with the server (default: `16`).
    pub worker_count: usize,

    /// Upper bound for burst workers (default: same as `worker_count`).
    ///
    /// Must be greater than or equal to `worker_count`.
    pub max_workers: usize,

    /// Capacity of the admission queue between acceptor and workers (default: `128`).
    pub queue_capacity: usize,

    /// What the acceptor does with a connection when the queue is full
    /// (default: [`OverflowPolicy::Close`]).
    pub overflow_policy: OverflowPolicy,

    /// How the acceptor waits when no connection is pending (default: `Sleep(1ms)`).
    pub wait_strategy: WaitStrategy,

    /// How long in-flight connections may keep running after shutdown
    /// was requested (default: `5s`).
    pub shutdown_drain: Duration,

    /// Format for built-in error responses (default: `false`)
    ///
    /// If `true`, built-in error bodies are JSON documents such as
    /// `{"error":"Malformed request line","code":"BAD_REQUEST_LINE"}`,
    /// otherwise they are short HTML pages.
    pub json_errors: bool,

    /// Whether the `TRACE` method may reach resources (default: `false`).
    pub enable_trace: bool,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            worker_count: 16,
            max_workers: 16,
            queue_capacity: 128,
            overflow_policy: OverflowPolicy::Close,
            wait_strategy: WaitStrategy::Sleep(Duration::from_millis(1)),
            shutdown_drain: Duration::from_secs(5),
            json_errors: false,
            enable_trace: false,
        }
    }
}

/// Treatment of connections that arrive while the admission queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Close the TCP connection immediately.
    Close,
    /// Write a canned `503 Service Unavailable` and close.
    Respond503,
}

/// Strategy for the acceptor while no connection is pending.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// Uses [`std::thread::yield_now()`]. Burns a core; useful only in benchmarks.
    Yield,

    /// Waits on the shutdown token for the given duration, so a shutdown
    /// request wakes the acceptor immediately.
    Sleep(Duration),
}

/// Per-connection lifecycle limits.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Idle time allowed between two requests on one connection (default: `5s`).
    ///
    /// Also bounds the wait for the first request of a fresh connection.
    pub keep_alive_timeout: Duration,

    /// Time allowed for reading the rest of a request head once its first
    /// byte arrived, and again for serving the request (default: `30s`).
    pub request_timeout: Duration,

    /// Time allowed for any single socket write (default: `30s`).
    pub socket_write_timeout: Duration,

    /// Requests served on one connection before it is closed (default: `100`).
    pub max_requests_per_connection: usize,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            keep_alive_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            socket_write_timeout: Duration::from_secs(30),
            max_requests_per_connection: 100,
        }
    }
}

/// Request parsing limits.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Longest accepted request line, CRLF included (default: `8 KiB`).
    /// Longer lines are answered with `414`.
    pub max_request_line: usize,

    /// Total size of all header lines (default: `16 KiB`).
    /// Exceeding it is answered with `431`.
    pub max_header_bytes: usize,

    /// Largest accepted decoded body (default: `1 MiB`).
    /// Exceeding it is answered with `413`.
    pub max_body: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            max_request_line: 8 * 1024,
            max_header_bytes: 16 * 1024,
            max_body: 1024 * 1024,
        }
    }
}

/// Response emission defaults.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Initial capacity of the buffer collecting a non-streaming body (default: `1 KiB`).
    pub default_capacity: usize,

    /// Bodies shorter than this are never compressed (default: `256`).
    pub compression_min_bytes: usize,

    /// zlib compression level, `0..=9` (default: `6`).
    pub compression_level: u32,

    /// Value of the `Server` header (default: `kiln/<version>`).
    pub server_header: String,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            default_capacity: 1024,
            compression_min_bytes: 256,
            compression_level: 6,
            server_header: concat!("kiln/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

/// WebSocket session limits.
#[derive(Debug, Clone)]
pub struct WsLimits {
    /// Largest reassembled message (default: `1 MiB`). Overflow closes with `1009`.
    pub max_message: usize,

    /// Silence after which the server sends a Ping (default: `30s`).
    pub ping_interval: Duration,

    /// Subprotocols the server is willing to speak, in preference order.
    pub subprotocols: Vec<String>,
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_message: 1024 * 1024,
            ping_interval: Duration::from_secs(30),
            subprotocols: Vec::new(),
        }
    }
}
