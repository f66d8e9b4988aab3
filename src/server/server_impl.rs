use crate::{
    errors::{Error, HttpError},
    limits::{ConnLimits, OverflowPolicy, ReqLimits, RespLimits, ServerLimits, WaitStrategy},
    resource::Registry,
    server::{
        connection::{self, Context},
        pool::Pool,
    },
    shutdown::{Shutdown, Tracker},
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    io::{self, Write},
    net::{Shutdown as NetShutdown, SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

/// Pending-connection backlog of the listening socket.
const BACKLOG: i32 = 1024;

/// Time workers get to notice shutdown after the drain phase.
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// A bound HTTP server: one acceptor thread feeding a pool of workers.
///
/// The server owns a [`Shutdown`] token; cancelling any clone of it stops
/// accepting, lets in-flight connections finish within
/// [`shutdown_drain`](ServerLimits::shutdown_drain) and then force-closes
/// the rest.
///
/// # Examples
///
/// ```no_run
/// use kiln::{Registry, Server, Text};
///
/// let registry = Registry::new().with(Text::new("/hello", "Hello World!"));
///
/// let server = Server::builder()
///     .bind("127.0.0.1:8080".parse().unwrap())
///     .registry(registry)
///     .build()
///     .unwrap();
///
/// let shutdown = server.shutdown_handle();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(60));
///     shutdown.cancel();
/// });
///
/// server.run().unwrap();
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<Context>,
}

impl Server {
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The address actually bound, useful after binding port `0`.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A clone of the token that stops this server.
    #[inline]
    pub fn shutdown_handle(&self) -> Shutdown {
        self.ctx.shutdown.clone()
    }

    /// Accepts connections until shutdown is requested, then drains.
    ///
    /// Blocks the calling thread, which becomes the acceptor.
    pub fn run(self) -> Result<(), Error> {
        let Server {
            listener,
            local_addr,
            ctx,
        } = self;
        let limits = &ctx.server;
        let shutdown = &ctx.shutdown;
        let tracker = Tracker::new();

        let pool = {
            let ctx = Arc::clone(&ctx);
            let tracker = Arc::clone(&tracker);

            Pool::start(
                limits.worker_count,
                limits.max_workers,
                limits.queue_capacity,
                ctx.conn.keep_alive_timeout,
                shutdown.clone(),
                move |(stream, peer): (TcpStream, SocketAddr)| {
                    let _tracked = tracker.track(&stream);
                    connection::serve(stream, peer, &ctx);
                },
            )?
        };
        info!(addr = %local_addr, workers = limits.worker_count, "listening");

        while !shutdown.is_cancelled() {
            match listener.accept() {
                Ok((stream, peer)) => admit(&pool, stream, peer, limits),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => match limits.wait_strategy {
                    WaitStrategy::Yield => thread::yield_now(),
                    WaitStrategy::Sleep(pause) => {
                        shutdown.wait(pause);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // Usually descriptor exhaustion; back off instead of spinning.
                    warn!(error = %e, "accept failed");
                    shutdown.wait(Duration::from_millis(50));
                }
            }
        }

        drop(listener);
        info!(active = tracker.active(), "stopped accepting, draining connections");

        if !tracker.drain_until(Instant::now() + limits.shutdown_drain) {
            let closed = tracker.close_all();
            warn!(closed, "drain deadline passed, closed remaining connections");
        }

        let stopped = pool.join(Instant::now() + JOIN_GRACE);
        info!(detached = stopped.stuck, discarded = stopped.discarded, "server stopped");
        Ok(())
    }
}

fn admit(pool: &Pool<(TcpStream, SocketAddr)>, stream: TcpStream, peer: SocketAddr, limits: &ServerLimits) {
    trace!(%peer, "accepted");

    // Accepted sockets may inherit the listener's non-blocking mode.
    if let Err(e) = stream.set_nonblocking(false).and_then(|()| stream.set_nodelay(true)) {
        debug!(%peer, error = %e, "socket setup failed");
        return;
    }

    let Err((mut stream, peer)) = pool.submit((stream, peer)) else {
        return;
    };

    match limits.overflow_policy {
        OverflowPolicy::Close => debug!(%peer, "queue full, connection closed"),
        OverflowPolicy::Respond503 => {
            debug!(%peer, "queue full, answering 503");
            let canned = HttpError::ServiceUnavailable.canned(limits.json_errors);
            let _ = stream
                .set_write_timeout(Some(Duration::from_secs(1)))
                .and_then(|()| stream.write_all(&canned))
                .and_then(|()| stream.shutdown(NetShutdown::Write));
        }
    }
}

//

/// Builder for configuring and creating [`Server`] instances.
///
/// [`bind`](Self::bind) and [`registry`](Self::registry) are required;
/// every limit group falls back to its `Default`.
#[derive(Default)]
pub struct ServerBuilder {
    addr: Option<SocketAddr>,
    registry: Option<Registry>,
    shutdown: Option<Shutdown>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
    response_limits: Option<RespLimits>,
}

impl ServerBuilder {
    /// Sets the address to listen on. Port `0` picks a free port.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// Sets the resources served.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Uses an existing token instead of creating one, e.g. one already wired to signals.
    #[inline(always)]
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Configures pool sizing, admission and shutdown.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use kiln::{limits::{OverflowPolicy, ServerLimits}, Registry, Server};
    ///
    /// let server = Server::builder()
    ///     .bind("127.0.0.1:8080".parse().unwrap())
    ///     .registry(Registry::new())
    ///     .server_limits(ServerLimits {
    ///         worker_count: 8,
    ///         max_workers: 32,
    ///         overflow_policy: OverflowPolicy::Respond503,
    ///         ..ServerLimits::default()
    ///     })
    ///     .build()
    ///     .unwrap();
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures keep-alive and socket timeouts.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Configures request parsing limits.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Configures response emission.
    #[inline(always)]
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.response_limits = Some(limits);
        self
    }

    /// Validates the configuration and binds the listening socket.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when a required component is missing or the limits
    /// are inconsistent; [`Error::Io`] when the address cannot be bound.
    pub fn build(self) -> Result<Server, Error> {
        let addr = self
            .addr
            .ok_or_else(|| Error::Config("the `bind` method must be called before `build`".into()))?;
        let mut registry = self
            .registry
            .ok_or_else(|| Error::Config("the `registry` method must be called before `build`".into()))?;

        let server = self.server_limits.unwrap_or_default();
        let resp = self.response_limits.unwrap_or_default();
        validate(&server, &resp)?;

        if server.json_errors {
            let page = registry.error_page().clone().json(true);
            registry.set_error_page(page);
        }

        let listener = listen(addr)?;
        let local_addr = listener.local_addr()?;
        debug!(addr = %local_addr, resources = registry.len(), "server bound");

        Ok(Server {
            listener,
            local_addr,
            ctx: Arc::new(Context {
                registry,
                server,
                conn: self.connection_limits.unwrap_or_default(),
                req: self.request_limits.unwrap_or_default(),
                resp,
                shutdown: self.shutdown.unwrap_or_default(),
            }),
        })
    }
}

fn validate(server: &ServerLimits, resp: &RespLimits) -> Result<(), Error> {
    let problem = if server.worker_count == 0 {
        "worker_count must be at least 1"
    } else if server.max_workers < server.worker_count {
        "max_workers must not be smaller than worker_count"
    } else if server.queue_capacity == 0 {
        "queue_capacity must be at least 1"
    } else if resp.compression_level > 9 {
        "compression_level must be between 0 and 9"
    } else {
        return Ok(());
    };
    Err(Error::Config(problem.to_owned()))
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
