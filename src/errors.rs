use crate::{http::types::StatusCode, websocket::CloseCode};
use std::{error, io};
use thiserror::Error;

/// Coarse classification of every failure the engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket read/write failure, timeout or reset.
    Io,
    /// Malformed HTTP or WebSocket framing.
    Parse,
    /// Header, body or message size limit exceeded.
    Limit,
    /// Syntactically valid but semantically unacceptable.
    Protocol,
    /// Failure reported by a resource handler.
    Resource,
    /// Broken invariant inside the engine.
    Internal,
    /// Invalid configuration.
    Config,
}

/// The error type returned by engine and resource operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(io::Error),

    #[error("{0}")]
    Http(HttpError),

    #[error("websocket failure ({code:?}): {reason}")]
    WebSocket {
        code: CloseCode,
        reason: &'static str,
    },

    #[error("resource failure: {0}")]
    Resource(Box<dyn error::Error + Send + Sync>),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wraps any error produced inside a resource handler.
    pub fn resource<E>(err: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Error::Resource(err.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Http(e) => e.kind(),
            Error::WebSocket { code, .. } => match code {
                CloseCode::TooBig => ErrorKind::Limit,
                CloseCode::ProtocolError | CloseCode::InvalidPayload => ErrorKind::Parse,
                CloseCode::Internal => ErrorKind::Internal,
                _ => ErrorKind::Protocol,
            },
            Error::Resource(_) => ErrorKind::Resource,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// The HTTP status a client should see for this error, if any can still be sent.
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            Error::Http(e) => e.status(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn ws(code: CloseCode, reason: &'static str) -> Self {
        Error::WebSocket { code, reason }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // Codec layers report framing problems through io::Error; unwrap them again.
        let http = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<HttpError>())
            .copied();

        match http {
            Some(http) => Error::Http(http),
            None => Error::Io(err),
        }
    }
}

impl From<HttpError> for Error {
    fn from(err: HttpError) -> Self {
        Error::Http(err)
    }
}

impl From<HttpError> for io::Error {
    fn from(err: HttpError) -> Self {
        let kind = match err.kind() {
            ErrorKind::Limit => io::ErrorKind::OutOfMemory,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

macro_rules! http_errors {
    ($($name:ident: $kind:ident, $status:ident => $code:literal, $message:literal; )*) => {
        /// Request-level failures that map onto an HTTP status.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
        #[non_exhaustive]
        pub enum HttpError { $(
            #[error($message)]
            $name,
        )* }

        impl HttpError {
            pub fn kind(&self) -> ErrorKind {
                match self { $( Self::$name => ErrorKind::$kind, )* }
            }

            pub fn status(&self) -> StatusCode {
                match self { $( Self::$name => StatusCode::$status, )* }
            }

            /// Machine readable identifier used in JSON error bodies.
            pub const fn code(&self) -> &'static str {
                match self { $( Self::$name => $code, )* }
            }

            pub const fn message(&self) -> &'static str {
                match self { $( Self::$name => $message, )* }
            }
        }
    };
}

http_errors! {
    BadRequestLine: Parse, BAD_REQUEST => "BAD_REQUEST_LINE", "Malformed request line";
    UnknownMethod: Protocol, NOT_IMPLEMENTED => "UNKNOWN_METHOD", "Unknown HTTP method";
    InvalidTarget: Parse, BAD_REQUEST => "INVALID_TARGET", "Invalid request target";
    InvalidVersion: Parse, BAD_REQUEST => "INVALID_VERSION", "Invalid HTTP version";
    UnsupportedVersion: Protocol, HTTP_VERSION_NOT_SUPPORTED => "UNSUPPORTED_VERSION", "HTTP version not supported";
    UriTooLong: Limit, URI_TOO_LONG => "URI_TOO_LONG", "Request line too long";
    InvalidHeader: Parse, BAD_REQUEST => "INVALID_HEADER", "Invalid header format";
    ObsoleteFolding: Parse, BAD_REQUEST => "OBSOLETE_FOLDING", "Obsolete header line folding";
    HeaderTooLarge: Limit, REQUEST_HEADER_FIELDS_TOO_LARGE => "HEADER_TOO_LARGE", "Request header fields too large";
    InvalidContentLength: Parse, BAD_REQUEST => "INVALID_CONTENT_LENGTH", "Invalid Content-Length";
    UnsupportedTransferCoding: Protocol, NOT_IMPLEMENTED => "UNSUPPORTED_TRANSFER_CODING", "Unsupported transfer coding";
    UnsupportedContentEncoding: Protocol, UNSUPPORTED_MEDIA_TYPE => "UNSUPPORTED_CONTENT_ENCODING", "Unsupported content encoding";
    LengthRequired: Protocol, LENGTH_REQUIRED => "LENGTH_REQUIRED", "Length required";
    BodyTooLarge: Limit, PAYLOAD_TOO_LARGE => "BODY_TOO_LARGE", "Request body too large";
    BadChunked: Parse, BAD_REQUEST => "BAD_CHUNKED", "Malformed chunked body";
    TrailingBodyData: Parse, BAD_REQUEST => "TRAILING_BODY_DATA", "Data after the end of the encoded body";
    ExpectationFailed: Protocol, EXPECTATION_FAILED => "EXPECTATION_FAILED", "Unsupported expectation";
    NotAcceptable: Protocol, NOT_ACCEPTABLE => "NOT_ACCEPTABLE", "No acceptable content encoding";
    InvalidUpgrade: Protocol, BAD_REQUEST => "INVALID_UPGRADE", "Invalid upgrade request";
    ServiceUnavailable: Protocol, SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE", "Service temporarily unavailable";
}

impl HttpError {
    /// A complete, self-contained response for paths that cannot build a
    /// [`Response`](crate::Response), such as rejecting a connection at accept time.
    pub(crate) fn canned(&self, json: bool) -> Vec<u8> {
        let status = self.status();
        let mut out = Vec::with_capacity(160);

        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(status.as_u16().to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(status.canonical_reason().as_bytes());
        out.extend_from_slice(b"\r\nconnection: close\r\n");

        if json {
            let body = format!(r#"{{"error":"{}","code":"{}"}}"#, self.message(), self.code());
            out.extend_from_slice(b"content-type: application/json\r\n");
            out.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
            out.extend_from_slice(body.as_bytes());
        } else {
            out.extend_from_slice(b"content-length: 0\r\n\r\n");
        }

        out
    }
}
