//! Session state machine: message assembly, control frames, liveness and
//! the closing handshake.

use crate::{
    errors::Error,
    limits::WsLimits,
    stream::{closed_error, socket::SocketReader, Sink},
    websocket::{
        frame::{parse_close, read_frame, Frame, OpCode, Role},
        CloseCode, Message, WsHandler,
    },
};
use std::{
    fmt,
    io::{self, BufRead, Write},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

/// How long to wait for the peer's Close after sending ours.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Read half of an upgraded connection.
pub(crate) trait Transport: BufRead {
    fn set_deadline(&mut self, deadline: Option<Instant>);

    fn watch_shutdown(&mut self, _watch: bool) {}

    /// Interrupts a blocked read whenever `flag` is raised.
    fn wake_on(&mut self, _flag: Arc<AtomicBool>) {}
}

impl Transport for SocketReader {
    fn set_deadline(&mut self, deadline: Option<Instant>) {
        SocketReader::set_deadline(self, deadline);
    }

    fn watch_shutdown(&mut self, watch: bool) {
        SocketReader::watch_shutdown(self, watch);
    }

    fn wake_on(&mut self, flag: Arc<AtomicBool>) {
        SocketReader::wake_on(self, flag);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    /// We sent Close and wait for the answer.
    ClosingLocal,
    /// The peer sent Close; ours is on the way.
    ClosingRemote,
    Closed,
}

struct Outgoing {
    sink: Box<dyn Sink + Send>,
    close_sent: bool,
}

/// The sending side of a session.
///
/// Frames from different threads never interleave. Once a Close frame has
/// been sent every further send fails with [`io::ErrorKind::NotConnected`].
pub struct Peer {
    id: u64,
    addr: SocketAddr,
    protocol: Option<String>,
    out: Mutex<Outgoing>,
    /// Raised when a Close is sent from outside the session thread.
    wake: Arc<AtomicBool>,
}

impl Peer {
    pub(crate) fn new(addr: SocketAddr, protocol: Option<String>, sink: Box<dyn Sink + Send>) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            protocol,
            out: Mutex::new(Outgoing {
                sink,
                close_sent: false,
            }),
            wake: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Process-unique session id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn addr(&self) -> &SocketAddr {
        &self.addr
    }

    /// The negotiated subprotocol.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn send(&self, message: impl Into<Message>) -> Result<(), Error> {
        self.send_frame(&message.into().into_frame())
    }

    /// Starts the closing handshake. Returns `false` if a Close was already sent.
    ///
    /// A session blocked waiting for input notices the Close right away and
    /// waits a short while for the peer's answer.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<bool, Error> {
        let result = self.send_close(code, reason);
        // A failed write still marks the session as closing.
        if matches!(result, Ok(true) | Err(Error::Io(_))) {
            self.wake.store(true, Ordering::Release);
        }
        result
    }

    pub fn is_closing(&self) -> bool {
        self.lock().close_sent
    }

    /// Writes a Close without waking the session's reader.
    fn send_close(&self, code: CloseCode, reason: &str) -> Result<bool, Error> {
        if !code.is_sendable() {
            return Err(Error::Internal(format!("close code {} is not sendable", code.as_u16())));
        }

        let mut out = self.lock();
        if out.close_sent {
            return Ok(false);
        }
        out.close_sent = true;

        write_frame(&mut out.sink, &Frame::close(code, reason))?;
        debug!(peer = %self.addr, code = code.as_u16(), "close sent");
        Ok(true)
    }

    pub(crate) fn wake_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.wake)
    }

    pub(crate) fn send_frame(&self, frame: &Frame) -> Result<(), Error> {
        let mut out = self.lock();
        if out.close_sent {
            return Err(closed_error().into());
        }
        write_frame(&mut out.sink, frame)
    }

    /// Closes the TCP connection.
    pub(crate) fn disconnect(&self) {
        let mut out = self.lock();
        out.close_sent = true;
        if let Err(err) = out.sink.close() {
            trace!(peer = %self.addr, error = %err, "close after session");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Outgoing> {
        self.out.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("protocol", &self.protocol)
            .finish()
    }
}

fn write_frame(sink: &mut Box<dyn Sink + Send>, frame: &Frame) -> Result<(), Error> {
    sink.write_all(&frame.encode(None))?;
    sink.flush()?;
    Ok(())
}

/// A data message being reassembled from fragments.
struct Assembly {
    text: bool,
    data: Vec<u8>,
    /// Prefix of `data` known to be valid UTF-8.
    checked: usize,
}

impl Assembly {
    fn push(&mut self, payload: &[u8], fin: bool, max: usize) -> Result<(), Error> {
        if self.data.len() + payload.len() > max {
            return Err(Error::ws(CloseCode::TooBig, "message too big"));
        }
        self.data.extend_from_slice(payload);

        if self.text {
            // An incomplete sequence at the end is fine until the last fragment.
            match simdutf8::compat::from_utf8(&self.data[self.checked..]) {
                Ok(_) => self.checked = self.data.len(),
                Err(err) if err.error_len().is_none() && !fin => self.checked += err.valid_up_to(),
                Err(_) => return Err(Error::ws(CloseCode::InvalidPayload, "invalid UTF-8 in text message")),
            }
        }
        Ok(())
    }

    fn into_message(self) -> Result<Message, Error> {
        match self.text {
            true => String::from_utf8(self.data)
                .map(Message::Text)
                .map_err(|_| Error::ws(CloseCode::InvalidPayload, "invalid UTF-8 in text message")),
            false => Ok(Message::Binary(self.data)),
        }
    }
}

/// Drives one upgraded connection until it closes.
pub(crate) struct Session<'h, R, H: ?Sized> {
    reader: R,
    peer: Arc<Peer>,
    handler: &'h H,
    max_message: usize,
    ping_interval: Duration,

    state: State,
    assembly: Option<Assembly>,
    last_seen: Instant,
    awaiting_pong: bool,
}

impl<'h, R: Transport, H: WsHandler + ?Sized> Session<'h, R, H> {
    pub(crate) fn new(reader: R, peer: Arc<Peer>, handler: &'h H, limits: &WsLimits) -> Self {
        Self {
            reader,
            peer,
            handler,
            max_message: limits.max_message,
            ping_interval: limits.ping_interval,
            state: State::Open,
            assembly: None,
            last_seen: Instant::now(),
            awaiting_pong: false,
        }
    }

    /// Runs the session to completion and closes the connection.
    ///
    /// Returns the code that ended the session.
    pub(crate) fn run(mut self) -> CloseCode {
        info!(peer = %self.peer.addr, id = self.peer.id, protocol = ?self.peer.protocol, "websocket open");
        self.reader.watch_shutdown(true);
        self.reader.wake_on(self.peer.wake_flag());
        self.handler.on_open(&self.peer);

        let code = match self.pump() {
            Ok(code) => code,
            Err(Error::WebSocket { code, reason }) => {
                debug!(peer = %self.peer.addr, code = code.as_u16(), reason, "websocket failure");
                self.send_close(code, reason);
                code
            }
            Err(err @ Error::Io(_)) => {
                debug!(peer = %self.peer.addr, error = %err, "websocket transport failed");
                CloseCode::Abnormal
            }
            Err(err) => {
                warn!(peer = %self.peer.addr, error = %err, "websocket handler failed");
                self.send_close(CloseCode::Internal, "");
                CloseCode::Internal
            }
        };

        self.state = State::Closed;
        self.peer.disconnect();
        info!(peer = %self.peer.addr, id = self.peer.id, code = code.as_u16(), "websocket closed");
        self.handler.on_close(&self.peer, code);
        code
    }

    fn pump(&mut self) -> Result<CloseCode, Error> {
        loop {
            if self.state == State::Open && self.peer.is_closing() {
                // Closed from another thread, e.g. through the hub.
                self.state = State::ClosingLocal;
                self.last_seen = Instant::now();
            }
            self.reader.set_deadline(self.deadline());

            // Waiting for the first byte of a frame is the only place where
            // a timeout means silence rather than a stalled peer.
            match self.reader.fill_buf() {
                Ok([]) => return Ok(CloseCode::Abnormal),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::TimedOut => match self.on_idle()? {
                    Some(code) => return Ok(code),
                    None => continue,
                },
                Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {
                    return self.going_away();
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            let frame = match read_frame(&mut self.reader, Role::Server, self.max_message)? {
                Some(frame) => frame,
                None => return Ok(CloseCode::Abnormal),
            };
            self.last_seen = Instant::now();

            if let Some(code) = self.on_frame(frame)? {
                return Ok(code);
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.state {
            State::ClosingLocal => Some(self.last_seen + CLOSE_WAIT),
            _ if self.ping_interval.is_zero() => None,
            _ => Some(self.last_seen + self.ping_interval),
        }
    }

    fn on_idle(&mut self) -> Result<Option<CloseCode>, Error> {
        if self.state == State::ClosingLocal {
            debug!(peer = %self.peer.addr, "no close answer");
            return Ok(Some(CloseCode::Abnormal));
        }
        if self.awaiting_pong {
            debug!(peer = %self.peer.addr, "no pong, dropping connection");
            return Ok(Some(CloseCode::Abnormal));
        }

        trace!(peer = %self.peer.addr, "ping");
        self.peer.send_frame(&Frame::new(true, OpCode::Ping, Vec::new()))?;
        self.awaiting_pong = true;
        self.last_seen = Instant::now();
        Ok(None)
    }

    fn on_frame(&mut self, frame: Frame) -> Result<Option<CloseCode>, Error> {
        let Frame { fin, opcode, payload } = frame;
        trace!(opcode = ?opcode, fin, len = payload.len(), "frame");

        match opcode {
            OpCode::Ping => {
                if self.state == State::Open {
                    self.peer.send_frame(&Frame::new(true, OpCode::Pong, payload))?;
                }
            }
            OpCode::Pong => self.awaiting_pong = false,
            OpCode::Close => return self.on_close(&payload).map(Some),
            OpCode::Text | OpCode::Binary => {
                if self.assembly.is_some() {
                    return Err(Error::ws(CloseCode::ProtocolError, "expected a continuation frame"));
                }
                let mut assembly = Assembly {
                    text: opcode == OpCode::Text,
                    data: Vec::new(),
                    checked: 0,
                };
                assembly.push(&payload, fin, self.max_message)?;

                match fin {
                    true => self.deliver(assembly)?,
                    false => self.assembly = Some(assembly),
                }
            }
            OpCode::Continuation => {
                let mut assembly = self
                    .assembly
                    .take()
                    .ok_or(Error::ws(CloseCode::ProtocolError, "continuation without a message"))?;
                assembly.push(&payload, fin, self.max_message)?;

                match fin {
                    true => self.deliver(assembly)?,
                    false => self.assembly = Some(assembly),
                }
            }
        }
        Ok(None)
    }

    fn deliver(&mut self, assembly: Assembly) -> Result<(), Error> {
        let message = assembly.into_message()?;
        // Data after our Close is read but dropped.
        if self.state != State::Open {
            return Ok(());
        }
        self.handler.on_message(&self.peer, message)
    }

    fn on_close(&mut self, payload: &[u8]) -> Result<CloseCode, Error> {
        let received = parse_close(payload)?;
        let code = received.as_ref().map_or(CloseCode::NoStatus, |(code, _)| *code);
        debug!(peer = %self.peer.addr, code = code.as_u16(), "close received");

        if self.state == State::Open {
            self.state = State::ClosingRemote;
            let echo = received.map_or(CloseCode::Normal, |(code, _)| code);
            self.send_close(echo, "");
        }
        Ok(code)
    }

    /// Shutdown: announce 1001 and give the peer a moment to answer.
    fn going_away(&mut self) -> Result<CloseCode, Error> {
        self.send_close(CloseCode::GoingAway, "server shutting down");
        self.state = State::ClosingLocal;
        self.reader.watch_shutdown(false);
        self.reader.set_deadline(Some(Instant::now() + CLOSE_WAIT));

        loop {
            match read_frame(&mut self.reader, Role::Server, self.max_message) {
                Ok(Some(Frame { opcode: OpCode::Close, .. })) | Ok(None) | Err(_) => break,
                Ok(Some(_)) => {}
            }
        }
        Ok(CloseCode::GoingAway)
    }

    fn send_close(&mut self, code: CloseCode, reason: &str) {
        if let Err(err) = self.peer.send_close(code, reason) {
            trace!(peer = %self.peer.addr, error = %err, "close frame not sent");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::websocket::Echo;

    const KEY: [u8; 4] = [1, 2, 3, 4];

    fn client(frames: &[Frame]) -> Vec<u8> {
        frames.iter().flat_map(|frame| frame.encode(Some(KEY))).collect()
    }

    fn run_with<H: WsHandler>(handler: &H, input: &[u8], limits: &WsLimits) -> (CloseCode, Vec<Frame>, bool) {
        let (peer, shared) = peer();
        let code = Session::new(input, peer, handler, limits).run();
        (code, server_frames(&shared.bytes()), shared.is_closed())
    }

    fn run(input: &[u8]) -> (CloseCode, Vec<Frame>, bool) {
        run_with(&Echo, input, &WsLimits::default())
    }

    fn close_code(frame: &Frame) -> u16 {
        assert_eq!(frame.opcode, OpCode::Close);
        u16::from_be_bytes([frame.payload[0], frame.payload[1]])
    }

    #[test]
    fn echo_then_close() {
        let input = client(&[
            Frame::new(true, OpCode::Text, b"Hello".to_vec()),
            Frame::close(CloseCode::Normal, ""),
        ]);
        let (code, frames, closed) = run(&input);

        assert_eq!(code, CloseCode::Normal);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::new(true, OpCode::Text, b"Hello".to_vec()));
        assert_eq!(close_code(&frames[1]), 1000);
        assert!(closed);
    }

    #[test]
    fn fragments_with_interleaved_ping() {
        let input = client(&[
            Frame::new(false, OpCode::Text, b"Hel".to_vec()),
            Frame::new(true, OpCode::Ping, b"p".to_vec()),
            Frame::new(false, OpCode::Continuation, b"lo ".to_vec()),
            Frame::new(true, OpCode::Continuation, "wörld".as_bytes().to_vec()),
            Frame::close(CloseCode::GoingAway, "bye"),
        ]);
        let (code, frames, _) = run(&input);

        assert_eq!(code, CloseCode::GoingAway);
        assert_eq!(frames[0], Frame::new(true, OpCode::Pong, b"p".to_vec()));
        assert_eq!(frames[1], Frame::new(true, OpCode::Text, "Hello wörld".as_bytes().to_vec()));
        assert_eq!(close_code(&frames[2]), 1001);
    }

    #[test]
    fn utf8_split_across_fragments() {
        let bytes = "€".as_bytes();
        let input = client(&[
            Frame::new(false, OpCode::Text, bytes[..1].to_vec()),
            Frame::new(true, OpCode::Continuation, bytes[1..].to_vec()),
        ]);
        let (code, frames, _) = run(&input);

        assert_eq!(frames[0], Frame::new(true, OpCode::Text, bytes.to_vec()));
        // stream ended without Close
        assert_eq!(code, CloseCode::Abnormal);
    }

    #[test]
    fn protocol_failures_close_with_code() {
        #[rustfmt::skip]
        let cases: [(Vec<Frame>, CloseCode); 5] = [
            (vec![Frame::new(true, OpCode::Text, vec![0xC3, 0x28])],                   CloseCode::InvalidPayload),
            (vec![Frame::new(false, OpCode::Text, vec![0xFF]),
                  Frame::new(true, OpCode::Continuation, vec![b'a'])],                 CloseCode::InvalidPayload),
            (vec![Frame::new(true, OpCode::Continuation, b"x".to_vec())],              CloseCode::ProtocolError),
            (vec![Frame::new(false, OpCode::Binary, b"x".to_vec()),
                  Frame::new(true, OpCode::Binary, b"y".to_vec())],                    CloseCode::ProtocolError),
            (vec![Frame::new(true, OpCode::Close, vec![0x03, 0xEE])],                  CloseCode::ProtocolError),
        ];

        for (frames, expected) in cases {
            let (code, sent, closed) = run(&client(&frames));
            assert_eq!(code, expected, "{frames:?}");
            assert_eq!(close_code(sent.last().unwrap()), expected.as_u16(), "{frames:?}");
            assert!(closed);
        }
    }

    #[test]
    fn message_size_limit() {
        let limits = WsLimits {
            max_message: 8,
            ..WsLimits::default()
        };
        let input = client(&[
            Frame::new(false, OpCode::Binary, vec![0; 5]),
            Frame::new(true, OpCode::Continuation, vec![0; 5]),
        ]);
        let (code, sent, _) = run_with(&Echo, &input, &limits);

        assert_eq!(code, CloseCode::TooBig);
        assert_eq!(close_code(&sent[0]), 1009);
    }

    #[test]
    fn unmasked_client_frame_is_rejected() {
        let input = Frame::new(true, OpCode::Text, b"hi".to_vec()).encode(None);
        let (code, sent, _) = run(&input);

        assert_eq!(code, CloseCode::ProtocolError);
        assert_eq!(close_code(&sent[0]), 1002);
    }

    #[test]
    fn close_without_code_is_answered_with_normal() {
        let input = client(&[Frame::new(true, OpCode::Close, Vec::new())]);
        let (code, sent, _) = run(&input);

        assert_eq!(code, CloseCode::NoStatus);
        assert_eq!(close_code(&sent[0]), 1000);
    }

    #[test]
    fn handler_failure_closes_with_internal_error() {
        struct Failing;
        impl WsHandler for Failing {
            fn on_message(&self, _peer: &Arc<Peer>, _message: Message) -> Result<(), Error> {
                Err(Error::resource("boom"))
            }
        }

        let input = client(&[Frame::new(true, OpCode::Binary, vec![1])]);
        let (code, sent, _) = run_with(&Failing, &input, &WsLimits::default());

        assert_eq!(code, CloseCode::Internal);
        assert_eq!(close_code(&sent[0]), 1011);
    }

    #[test]
    fn hub_close_wakes_a_silent_session() {
        use crate::{shutdown::Shutdown, stream::socket::SocketWriter, websocket::Hub};
        use std::{
            io::BufReader,
            net::{TcpListener, TcpStream},
            thread,
        };

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (server, addr) = listener.accept().unwrap();

        let writer = SocketWriter::new(server.try_clone().unwrap(), Duration::from_secs(1)).unwrap();
        let peer = Arc::new(Peer::new(addr, None, Box::new(writer)));
        let hub = Arc::new(Hub::new());
        let membership = hub.join(&peer);

        let limits = WsLimits {
            ping_interval: Duration::ZERO,
            ..WsLimits::default()
        };
        let reader = SocketReader::new(server, Shutdown::new(), 4096);
        let session = thread::spawn(move || {
            let _membership = membership;
            Session::new(reader, peer, &Echo, &limits).run()
        });

        thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        assert_eq!(hub.close_all(CloseCode::Normal, "bye"), 1);

        // The client never answers, so the session gives up after the close wait.
        assert_eq!(session.join().unwrap(), CloseCode::Abnormal);
        assert!(started.elapsed() < CLOSE_WAIT + Duration::from_secs(1), "{:?}", started.elapsed());
        assert!(hub.is_empty());

        let mut client = BufReader::new(client);
        let close = read_frame(&mut client, Role::Client, usize::MAX).unwrap().unwrap();
        assert_eq!(close_code(&close), 1000);
    }

    #[test]
    fn peer_refuses_frames_after_close() {
        let (peer, shared) = peer();

        assert!(peer.close(CloseCode::Normal, "done").unwrap());
        assert!(!peer.close(CloseCode::Normal, "again").unwrap());
        assert!(peer.send("late").is_err());
        assert!(peer.close(CloseCode::Abnormal, "").is_err());

        let frames = server_frames(&shared.bytes());
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[2..], b"done");
    }
}
