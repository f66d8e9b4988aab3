use crate::{
    errors::{Error, ErrorKind, HttpError},
    http::{
        header::HeaderMap,
        request::{BodyFraming, Request, RequestHead},
        response::{Exchange, Response},
        types::{MethodSet, StatusCode, Version},
    },
    limits::{ConnLimits, ReqLimits, RespLimits, ServerLimits},
    resource::{Dispatch, Registry, Resource, Upgraded},
    shutdown::Shutdown,
    stream::{
        compress::negotiate,
        socket::{SocketReader, SocketWriter},
        Sink,
    },
};
use std::{
    any::Any,
    io,
    net::{SocketAddr, TcpStream},
    panic::{self, AssertUnwindSafe},
    time::Instant,
};
use tracing::{debug, info_span, trace, warn};

/// Everything a worker needs to serve connections. Read-only once the server runs.
pub(crate) struct Context {
    pub(crate) registry: Registry,
    pub(crate) server: ServerLimits,
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
    pub(crate) resp: RespLimits,
    pub(crate) shutdown: Shutdown,
}

/// What happens to the connection after one request.
enum Next<'c> {
    KeepAlive,
    Close,
    Upgrade(RequestHead, &'c dyn Resource),
}

/// Serves one connection until it closes, times out or is upgraded.
pub(crate) fn serve(stream: TcpStream, peer: SocketAddr, ctx: &Context) {
    let span = info_span!("conn", %peer);
    let _enter = span.enter();

    match run(stream, peer, ctx) {
        Ok(()) => trace!("connection closed"),
        Err(err) if err.kind() == ErrorKind::Io => debug!(error = %err, "connection dropped"),
        Err(err) => warn!(error = %err, "connection failed"),
    }
}

fn run(stream: TcpStream, peer: SocketAddr, ctx: &Context) -> Result<(), Error> {
    let local = stream.local_addr()?;
    let capacity = ctx.req.max_request_line + ctx.req.max_header_bytes + 512;

    let mut writer = SocketWriter::new(stream.try_clone()?, ctx.conn.socket_write_timeout)?;
    let mut reader = SocketReader::new(stream, ctx.shutdown.clone(), capacity);

    let mut served = 0;
    loop {
        match serve_request(&mut reader, &mut writer, (peer, local), served, ctx) {
            Ok(Next::KeepAlive) => served += 1,
            Ok(Next::Close) => break,
            Ok(Next::Upgrade(head, resource)) => {
                debug!(uri = head.uri().as_str(), "connection upgraded");
                reader.set_deadline(None);
                let upgraded = Upgraded::new(reader, writer);

                return panic::catch_unwind(AssertUnwindSafe(|| resource.upgrade(head, upgraded)))
                    .unwrap_or_else(|payload| Err(Error::Internal(panic_message(payload.as_ref()))));
            }
            Err(err) => {
                let _ = writer.close();
                return Err(err);
            }
        }
    }

    writer.close()?;
    Ok(())
}

fn serve_request<'c>(
    reader: &mut SocketReader,
    writer: &mut SocketWriter,
    (peer, local): (SocketAddr, SocketAddr),
    served: usize,
    ctx: &'c Context,
) -> Result<Next<'c>, Error> {
    if reader.buffered().is_empty() {
        reader.set_deadline(Some(Instant::now() + ctx.conn.keep_alive_timeout));
        reader.watch_shutdown(true);
        let waited = reader.fill_more();
        reader.watch_shutdown(false);

        match waited {
            Ok(0) => return Ok(Next::Close),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                debug!(served, "keep-alive timeout");
                return Ok(Next::Close);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                debug!(served, "closing idle connection on shutdown");
                return Ok(Next::Close);
            }
            Err(e) => return Err(e.into()),
        }
    }

    reader.set_deadline(Some(Instant::now() + ctx.conn.request_timeout));
    let mut head = match RequestHead::read(reader, &ctx.req) {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(Next::Close),
        Err(Error::Http(err)) => return reject(writer, err, Version::Http11, ctx),
        Err(err) => return Err(err),
    };
    head.peer = peer;
    head.local = local;

    let (method, version) = (head.method(), head.version());
    debug!(%method, uri = head.uri().as_str(), version = version.as_str(), "request");

    let framing = match head.body_framing(&ctx.req) {
        Ok(framing) => framing,
        Err(err) => return reject(writer, err, version, ctx),
    };
    let expect_continue = match head.expectation() {
        Ok(expect) => expect == Some(true) && framing != BodyFraming::Empty,
        Err(err) => return reject(writer, err, version, ctx),
    };
    let encoding = match head.content_encoding() {
        Ok(encoding) => encoding,
        Err(err) => return reject(writer, err, version, ctx),
    };
    let accepted = match negotiate(head.header("accept-encoding")) {
        Ok(accepted) => accepted,
        Err(err) => return reject(writer, err, version, ctx),
    };

    let keep_alive = head.wants_keep_alive()
        && served + 1 < ctx.conn.max_requests_per_connection
        && !ctx.shutdown.is_cancelled();
    let exchange = Exchange {
        method,
        version,
        keep_alive,
        encoding: accepted,
    };

    let resource = match ctx.registry.dispatch(head.uri(), method, ctx.server.enable_trace) {
        Dispatch::Found(resource) => resource,
        Dispatch::NotFound => {
            // An unread body would be taken for the next request.
            let exchange = Exchange {
                keep_alive: keep_alive && framing == BodyFraming::Empty,
                ..exchange
            };
            return error_response(writer, exchange, StatusCode::NOT_FOUND, None, ctx);
        }
        Dispatch::NotAllowed(allowed) => {
            let exchange = Exchange {
                keep_alive: keep_alive && framing == BodyFraming::Empty,
                ..exchange
            };
            return error_response(writer, exchange, StatusCode::METHOD_NOT_ALLOWED, Some(allowed), ctx);
        }
    };

    let mut request = Request::new(head, framing, encoding, &mut *reader, &ctx.req);
    let mut response = Response::new(&mut *writer, exchange, &ctx.resp);
    if resource.is_streaming() {
        response.streaming(true);
    }
    if expect_continue {
        response.send_informational(StatusCode::CONTINUE, &HeaderMap::new())?;
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| resource.handle(&mut request, &mut response)))
        .unwrap_or_else(|payload| Err(Error::Internal(panic_message(payload.as_ref()))));

    let keep_alive = match outcome {
        Ok(()) => {
            let status = response.status_code();
            let keep_alive = response.finish()?;
            debug!(status = status.as_u16(), keep_alive, "response");

            if status == StatusCode::SWITCHING_PROTOCOLS && resource.is_hijack() {
                drop(response);
                return Ok(Next::Upgrade(request.into_head(), resource));
            }
            keep_alive
        }
        Err(err) if response.is_started() => {
            warn!(error = %err, "resource failed after the response started");
            return Ok(Next::Close);
        }
        Err(err) => {
            warn!(error = %err, "resource failed");
            drop(response);

            let cause = match &err {
                Error::Http(cause) => Some(*cause),
                _ => None,
            };
            // Request-level failures leave the body in an unknown state.
            let exchange = Exchange {
                keep_alive: keep_alive && cause.is_none(),
                ..exchange
            };

            let mut page = Response::new(&mut *writer, exchange, &ctx.resp);
            ctx.registry.error_page().render(err.status(), cause, &mut page)?;
            page.finish()?
        }
    };

    if !keep_alive {
        return Ok(Next::Close);
    }
    match request.discard_body() {
        Ok(()) => Ok(Next::KeepAlive),
        Err(err) => {
            debug!(error = %err, "unread request body, closing");
            Ok(Next::Close)
        }
    }
}

/// Answers a request that failed before dispatch. The connection closes afterwards.
fn reject(
    writer: &mut SocketWriter,
    err: HttpError,
    version: Version,
    ctx: &Context,
) -> Result<Next<'static>, Error> {
    debug!(error = %err, status = err.status().as_u16(), "rejecting request");

    let exchange = Exchange {
        version,
        ..Exchange::fallback()
    };
    let mut resp = Response::new(writer, exchange, &ctx.resp);
    ctx.registry.error_page().render(err.status(), Some(err), &mut resp)?;
    resp.finish()?;
    Ok(Next::Close)
}

fn error_response(
    writer: &mut SocketWriter,
    exchange: Exchange,
    status: StatusCode,
    allowed: Option<MethodSet>,
    ctx: &Context,
) -> Result<Next<'static>, Error> {
    let mut resp = Response::new(writer, exchange, &ctx.resp);
    if let Some(allowed) = allowed {
        resp.set_header("Allow", allowed.to_header_value());
    }
    ctx.registry.error_page().render(status, None, &mut resp)?;

    let keep_alive = resp.finish()?;
    debug!(status = status.as_u16(), keep_alive, "response");
    Ok(match keep_alive {
        true => Next::KeepAlive,
        false => Next::Close,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned());
    format!("resource panicked: {message}")
}
