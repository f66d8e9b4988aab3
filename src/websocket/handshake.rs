//! Opening handshake, RFC 6455 section 4.2.

use crate::http::{
    header::{split_list, HeaderMap},
    request::RequestHead,
    types::{StatusCode, Version},
};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};

/// Appended to the client key before hashing.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
const VERSION: &str = "13";

/// Computes `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
///
/// # Examples
/// ```
/// assert_eq!(
///     kiln::websocket::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Accepted {
    pub(crate) accept: String,
    pub(crate) protocol: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Rejected {
    pub(crate) status: StatusCode,
    pub(crate) headers: &'static [(&'static str, &'static str)],
    pub(crate) reason: &'static str,
}

const UPGRADE_HEADERS: &[(&str, &str)] = &[("Upgrade", "websocket"), ("Sec-WebSocket-Version", VERSION)];

/// Validates an upgrade request and computes the handshake answer.
pub(crate) fn negotiate(head: &RequestHead, supported: &[String]) -> Result<Accepted, Rejected> {
    let headers = head.headers();

    if !headers.contains_token("upgrade", "websocket") || !headers.contains_token("connection", "upgrade") {
        return Err(Rejected {
            status: StatusCode::UPGRADE_REQUIRED,
            headers: UPGRADE_HEADERS,
            reason: "This endpoint requires a WebSocket upgrade",
        });
    }

    if head.version() != Version::Http11 {
        return Err(bad_request("WebSocket upgrade requires HTTP/1.1"));
    }

    if headers.get("sec-websocket-version").map(str::trim) != Some(VERSION) {
        return Err(Rejected {
            status: StatusCode::UPGRADE_REQUIRED,
            headers: &[("Sec-WebSocket-Version", VERSION)],
            reason: "Unsupported WebSocket version",
        });
    }

    let key = headers
        .get("sec-websocket-key")
        .map(str::trim)
        .filter(|key| matches!(STANDARD.decode(key), Ok(raw) if raw.len() == 16))
        .ok_or_else(|| bad_request("Missing or malformed Sec-WebSocket-Key"))?;

    Ok(Accepted {
        accept: accept_key(key),
        protocol: select_protocol(headers, supported),
    })
}

/// Picks the first server-supported subprotocol the client offered.
pub(crate) fn select_protocol(headers: &HeaderMap, supported: &[String]) -> Option<String> {
    supported
        .iter()
        .find(|ours| {
            headers
                .get_all("sec-websocket-protocol")
                .flat_map(split_list)
                .any(|offered| offered == ours.as_str())
        })
        .cloned()
}

fn bad_request(reason: &'static str) -> Rejected {
    Rejected {
        status: StatusCode::BAD_REQUEST,
        headers: &[],
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ReqLimits;

    fn head(extra: &str) -> RequestHead {
        let raw = format!("GET /chat HTTP/1.1\r\nHost: x\r\n{extra}\r\n");
        RequestHead::parse(raw.as_bytes(), &ReqLimits::default())
            .unwrap()
            .unwrap()
            .0
    }

    const VALID: &str = "Upgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n";

    #[test]
    fn rfc_sample_key() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn accepts_valid_upgrade() {
        let accepted = negotiate(&head(VALID), &[]).unwrap();
        assert_eq!(accepted.accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(accepted.protocol, None);
    }

    #[test]
    fn rejections() {
        #[rustfmt::skip]
        let cases = [
            ("Connection: Upgrade\r\n",                                        426),
            ("Upgrade: websocket\r\n",                                         426),
            ("Upgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Version: 8\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n", 426),
            ("Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n", 400),
            ("Upgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: c2hvcnQ=\r\n", 400),
        ];

        for (extra, status) in cases {
            let rejected = negotiate(&head(extra), &[]).unwrap_err();
            assert_eq!(rejected.status.as_u16(), status, "{extra:?}");
        }

        let rejected = negotiate(&head("Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 7\r\n"), &[])
            .unwrap_err();
        assert!(rejected.headers.contains(&("Sec-WebSocket-Version", "13")));
    }

    #[test]
    fn subprotocol_follows_server_preference() {
        let supported = ["v2.chat".to_owned(), "chat".to_owned()];

        #[rustfmt::skip]
        let cases = [
            ("Sec-WebSocket-Protocol: chat, v2.chat\r\n",               Some("v2.chat")),
            ("Sec-WebSocket-Protocol: chat\r\n",                        Some("chat")),
            ("Sec-WebSocket-Protocol: other\r\nSec-WebSocket-Protocol: chat\r\n", Some("chat")),
            ("Sec-WebSocket-Protocol: mqtt\r\n",                        None),
            ("",                                                        None),
        ];

        for (extra, expected) in cases {
            let accepted = negotiate(&head(&format!("{VALID}{extra}")), &supported).unwrap();
            assert_eq!(accepted.protocol.as_deref(), expected, "{extra:?}");
        }
    }
}
