use flate2::read::GzDecoder;
use kiln::{
    limits::ConnLimits,
    websocket::{read_frame, Echo, Frame, OpCode, Role, WebSocket},
    Error, Method, MethodSet, Registry, Request, Resource, Response, Server, Shutdown, Text, Uri,
};
use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Stores every body it receives and answers with an empty 200.
struct Upload {
    received: Arc<Mutex<Vec<String>>>,
}

impl Resource for Upload {
    fn matches(&self, uri: &Uri) -> bool {
        uri.path() == "/u"
    }

    fn allowed_methods(&self) -> MethodSet {
        MethodSet::of(&[Method::Post])
    }

    fn handle(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<(), Error> {
        let body = req.body_string()?;
        self.received.lock().unwrap().push(body);
        resp.body("")
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: Shutdown,
    handle: Option<JoinHandle<Result<(), Error>>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn start(registry: Registry, conn: ConnLimits) -> Running {
    let server = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .registry(registry)
        .connection_limits(conn)
        .build()
        .unwrap();

    Running {
        addr: server.local_addr(),
        shutdown: server.shutdown_handle(),
        handle: Some(thread::spawn(move || server.run())),
    }
}

fn connect(addr: SocketAddr) -> (TcpStream, BufReader<TcpStream>) {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    (stream, reader)
}

/// Reads one response: the head as text and the decoded body bytes.
fn read_response(reader: &mut BufReader<TcpStream>) -> (String, Vec<u8>) {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        assert!(reader.read_line(&mut line).unwrap() > 0, "connection closed mid-head: {head}");
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }

    let field = |name: &str| {
        head.lines()
            .find_map(|line| line.split_once(": ").filter(|(n, _)| n.eq_ignore_ascii_case(name)))
            .map(|(_, value)| value.to_owned())
    };

    let mut body = Vec::new();
    if field("Transfer-Encoding").as_deref() == Some("chunked") {
        loop {
            let mut size = String::new();
            reader.read_line(&mut size).unwrap();
            let size = usize::from_str_radix(size.trim_end(), 16).unwrap();
            let mut chunk = vec![0; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            if size == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..size]);
        }
    } else if let Some(len) = field("Content-Length") {
        body.resize(len.parse().unwrap(), 0);
        reader.read_exact(&mut body).unwrap();
    }

    (head, body)
}

#[test]
fn simple_get() {
    let server = start(Registry::new().with(Text::new("/hello", "hi")), ConnLimits::default());
    let (mut stream, mut reader) = connect(server.addr);

    stream.write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut reader);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Length: 2\r\n"), "{head}");
    assert!(head.contains("Connection: keep-alive\r\n"), "{head}");
    assert_eq!(body, b"hi");
}

#[test]
fn chunked_upload() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new().with(Upload {
        received: Arc::clone(&received),
    });
    let server = start(registry, ConnLimits::default());
    let (mut stream, mut reader) = connect(server.addr);

    stream
        .write_all(
            b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .unwrap();
    let (head, body) = read_response(&mut reader);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Length: 0\r\n"), "{head}");
    assert!(body.is_empty());
    assert_eq!(*received.lock().unwrap(), ["hello world"]);
}

#[test]
fn compressed_chunked_upload_keeps_the_connection() {
    use flate2::{write::GzEncoder, Compression};

    let received = Arc::new(Mutex::new(Vec::new()));
    let registry = Registry::new()
        .with(Upload {
            received: Arc::clone(&received),
        })
        .with(Text::new("/hello", "hi"));
    let server = start(registry, ConnLimits::default());
    let (mut stream, mut reader) = connect(server.addr);

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(b"hello world").unwrap();
    let payload = gz.finish().unwrap();

    let mut raw = b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    raw.extend_from_slice(format!("{:x}\r\n", payload.len()).as_bytes());
    raw.extend_from_slice(&payload);
    raw.extend_from_slice(b"\r\n0\r\n\r\nGET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    stream.write_all(&raw).unwrap();

    let (head, _) = read_response(&mut reader);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    let (head, body) = read_response(&mut reader);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, b"hi");
    assert_eq!(*received.lock().unwrap(), ["hello world"]);
}

#[test]
fn gzip_response() {
    let big = "A".repeat(10 * 1024);
    let server = start(Registry::new().with(Text::new("/big", big.clone())), ConnLimits::default());
    let (mut stream, mut reader) = connect(server.addr);

    stream
        .write_all(b"GET /big HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut reader);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Encoding: gzip\r\n"), "{head}");
    assert!(head.contains("Transfer-Encoding: chunked\r\n"), "{head}");
    assert!(!head.contains("Content-Length"), "{head}");
    assert!(body.len() < big.len());

    let mut decoded = String::new();
    GzDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
    assert_eq!(decoded, big);
}

#[test]
fn method_not_allowed_lists_allowed_methods() {
    let server = start(Registry::new().with(Text::new("/static", "file")), ConnLimits::default());
    let (mut stream, mut reader) = connect(server.addr);

    stream.write_all(b"DELETE /static/foo HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut reader);

    assert!(head.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"), "{head}");
    assert!(head.contains("Allow: GET, HEAD\r\n"), "{head}");
}

#[test]
fn websocket_echo() {
    let server = start(Registry::new().with(WebSocket::new("/ws", Echo)), ConnLimits::default());
    let (mut stream, mut reader) = connect(server.addr);

    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let (head, _) = read_response(&mut reader);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"), "{head}");

    let mask = Some([0x37, 0xfa, 0x21, 0x3d]);
    stream
        .write_all(&Frame::new(true, OpCode::Text, b"Hello".to_vec()).encode(mask))
        .unwrap();
    let echoed = read_frame(&mut reader, Role::Client, 1 << 20).unwrap().unwrap();
    assert_eq!(echoed, Frame::new(true, OpCode::Text, b"Hello".to_vec()));

    stream
        .write_all(&Frame::new(true, OpCode::Close, 1000u16.to_be_bytes().to_vec()).encode(mask))
        .unwrap();
    let close = read_frame(&mut reader, Role::Client, 1 << 20).unwrap().unwrap();
    assert_eq!(close.opcode, OpCode::Close);
    assert_eq!(close.payload[..2], 1000u16.to_be_bytes());

    let mut rest = Vec::new();
    assert_eq!(reader.read_to_end(&mut rest).unwrap(), 0);
}

#[test]
fn keep_alive_then_idle_timeout() {
    let conn = ConnLimits {
        keep_alive_timeout: Duration::from_millis(300),
        ..ConnLimits::default()
    };
    let server = start(Registry::new().with(Text::new("/hello", "hi")), conn);
    let (mut stream, mut reader) = connect(server.addr);

    for _ in 0..2 {
        stream.write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let (head, body) = read_response(&mut reader);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert_eq!(body, b"hi");
    }

    let idle = Instant::now();
    let mut rest = Vec::new();
    assert_eq!(reader.read_to_end(&mut rest).unwrap(), 0);
    assert!(idle.elapsed() >= Duration::from_millis(250), "closed after {:?}", idle.elapsed());
    assert!(idle.elapsed() < Duration::from_secs(5));
}

#[test]
fn concurrent_clients_get_their_own_responses() {
    let registry = (0..8).fold(Registry::new(), |registry, i| {
        registry.with(Text::new(format!("/n{i}"), format!("body-{i}")))
    });
    let server = start(registry, ConnLimits::default());
    let addr = server.addr;

    let clients: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                let (mut stream, mut reader) = connect(addr);
                for _ in 0..20 {
                    write!(stream, "GET /n{i} HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
                    let (head, body) = read_response(&mut reader);
                    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
                    assert_eq!(body, format!("body-{i}").into_bytes());
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }
}
