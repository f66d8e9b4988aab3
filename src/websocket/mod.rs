//! WebSocket (RFC 6455) upgrade, framing and sessions.
//!
//! A [`WebSocket`] resource answers the upgrade handshake with `101` and
//! then takes over the connection: frames are read on the worker that
//! served the handshake, data messages go to a [`WsHandler`] and control
//! frames are answered by the session itself.
//!
//! ```no_run
//! use kiln::{websocket::{Echo, WebSocket}, Registry};
//!
//! let mut registry = Registry::new();
//! registry.add(WebSocket::new("/echo", Echo));
//! ```

pub(crate) mod frame;
pub(crate) mod handshake;
pub(crate) mod hub;
pub(crate) mod session;

pub use frame::{read_frame, Frame, OpCode, Role};
pub use handshake::accept_key;
pub use hub::Hub;
pub use session::Peer;

use crate::{
    errors::Error,
    http::{
        request::{Request, RequestHead},
        response::Response,
        types::{Method, MethodSet, StatusCode},
        uri::Uri,
    },
    limits::WsLimits,
    resource::{path_matches, Resource, Upgraded},
};
use std::sync::Arc;
use tracing::debug;

/// Status codes carried by Close frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001, endpoint going away (server shutdown)
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003, data type the endpoint cannot accept
    Unsupported,
    /// 1005, reported locally when a Close carried no code. Never sent.
    NoStatus,
    /// 1006, reported locally when the TCP connection dropped. Never sent.
    Abnormal,
    /// 1007, e.g. invalid UTF-8 in a text message
    InvalidPayload,
    /// 1008
    Policy,
    /// 1009
    TooBig,
    /// 1011
    Internal,
    /// 1015, TLS handshake failure. Never sent.
    TlsHandshake,
    /// Any other code valid on the wire (1010, 1012-1014, 3000-4999).
    Other(u16),
}

impl CloseCode {
    pub const fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::Policy => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::Internal => 1011,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Other(code) => *code,
        }
    }

    /// Interprets a code received in a Close frame.
    ///
    /// Returns `None` for codes a peer must not send, which is a protocol error.
    pub const fn from_wire(code: u16) -> Option<CloseCode> {
        Some(match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::Policy,
            1009 => CloseCode::TooBig,
            1011 => CloseCode::Internal,
            1010 | 1012..=1014 | 3000..=4999 => CloseCode::Other(code),
            _ => return None,
        })
    }

    /// Whether the code may appear in a Close frame on the wire.
    pub const fn is_sendable(&self) -> bool {
        CloseCode::from_wire(self.as_u16()).is_some()
    }
}

/// A complete data message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn into_frame(self) -> Frame {
        match self {
            Message::Text(text) => Frame::new(true, OpCode::Text, text.into_bytes()),
            Message::Binary(data) => Frame::new(true, OpCode::Binary, data),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_owned())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data)
    }
}

/// Application logic of a WebSocket endpoint.
///
/// Callbacks run on the worker thread that owns the session. A [`Peer`]
/// may be cloned out of a callback and used from other threads.
pub trait WsHandler: Send + Sync {
    fn on_open(&self, _peer: &Arc<Peer>) {}

    /// A complete text or binary message arrived. Returning an error closes
    /// the session with `1011`.
    fn on_message(&self, peer: &Arc<Peer>, message: Message) -> Result<(), Error>;

    /// The session ended. `code` is the code received or sent, or
    /// [`CloseCode::Abnormal`] when the connection dropped.
    fn on_close(&self, _peer: &Arc<Peer>, _code: CloseCode) {}
}

/// Sends every message back to its sender.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl WsHandler for Echo {
    fn on_message(&self, peer: &Arc<Peer>, message: Message) -> Result<(), Error> {
        peer.send(message)
    }
}

/// Resource that upgrades matching requests to WebSocket sessions.
pub struct WebSocket<H> {
    prefix: String,
    handler: H,
    hub: Arc<Hub>,
    limits: WsLimits,
}

impl<H: WsHandler> WebSocket<H> {
    pub fn new(prefix: impl Into<String>, handler: H) -> Self {
        Self {
            prefix: prefix.into(),
            handler,
            hub: Arc::new(Hub::new()),
            limits: WsLimits::default(),
        }
    }

    pub fn limits(mut self, limits: WsLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Registers sessions in a shared hub instead of a private one.
    pub fn hub(mut self, hub: Arc<Hub>) -> Self {
        self.hub = hub;
        self
    }

    /// The hub that tracks this endpoint's open sessions.
    pub fn sessions(&self) -> &Arc<Hub> {
        &self.hub
    }
}

impl<H: WsHandler + 'static> Resource for WebSocket<H> {
    fn matches(&self, uri: &Uri) -> bool {
        path_matches(&self.prefix, uri.path())
    }

    fn allowed_methods(&self) -> MethodSet {
        MethodSet::from(Method::Get)
    }

    fn is_hijack(&self) -> bool {
        true
    }

    fn handle(&self, req: &mut Request<'_>, resp: &mut Response<'_>) -> Result<(), Error> {
        match handshake::negotiate(req.head(), &self.limits.subprotocols) {
            Ok(accepted) => {
                resp.status(StatusCode::SWITCHING_PROTOCOLS)
                    .header("Upgrade", "websocket")
                    .header("Connection", "Upgrade")
                    .header("Sec-WebSocket-Accept", accepted.accept);
                if let Some(protocol) = accepted.protocol {
                    resp.header("Sec-WebSocket-Protocol", protocol);
                }
                Ok(())
            }
            Err(rejected) => {
                debug!(status = rejected.status.as_u16(), reason = rejected.reason, "upgrade refused");
                resp.status(rejected.status).header("Content-Type", "text/plain; charset=utf-8");
                for (name, value) in rejected.headers {
                    resp.header(*name, value);
                }
                resp.body(rejected.reason)
            }
        }
    }

    fn upgrade(&self, head: RequestHead, upgraded: Upgraded) -> Result<(), Error> {
        let protocol = handshake::select_protocol(head.headers(), &self.limits.subprotocols);
        let (reader, writer) = upgraded.into_parts();

        let peer = Arc::new(Peer::new(*head.client_addr(), protocol, Box::new(writer)));
        let _membership = self.hub.join(&peer);

        session::Session::new(reader, peer, &self.handler, &self.limits).run();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Dispatch;

    #[test]
    fn close_codes_on_the_wire() {
        #[rustfmt::skip]
        let cases = [
            (1000, Some(CloseCode::Normal)),
            (1001, Some(CloseCode::GoingAway)),
            (1007, Some(CloseCode::InvalidPayload)),
            (1012, Some(CloseCode::Other(1012))),
            (4000, Some(CloseCode::Other(4000))),
            (999,  None),
            (1004, None),
            (1005, None),
            (1006, None),
            (1015, None),
            (2999, None),
            (5000, None),
        ];

        for (code, expected) in cases {
            assert_eq!(CloseCode::from_wire(code), expected, "{code}");
        }
    }

    #[test]
    fn local_only_codes_are_not_sendable() {
        for code in [CloseCode::NoStatus, CloseCode::Abnormal, CloseCode::TlsHandshake] {
            assert!(!code.is_sendable(), "{code:?}");
        }
        for code in [CloseCode::Normal, CloseCode::GoingAway, CloseCode::TooBig, CloseCode::Internal] {
            assert!(code.is_sendable(), "{code:?}");
        }
    }

    #[test]
    fn endpoint_registers_as_resource() {
        let registry = crate::resource::Registry::new().with(WebSocket::new("/ws", Echo));
        let uri = Uri::parse("/ws/room").unwrap();

        assert!(matches!(registry.dispatch(&uri, Method::Get, false), Dispatch::Found(r) if r.is_hijack()));
        assert!(matches!(registry.dispatch(&uri, Method::Post, false), Dispatch::NotAllowed(_)));
    }
}
