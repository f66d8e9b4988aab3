#![allow(rustdoc::bare_urls)]

//! Core HTTP protocol types and utilities

use crate::errors::HttpError;
use std::{fmt, ops};

#[inline]
pub(crate) fn slice_to_u64(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }

    let mut result: u64 = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            return None;
        }

        result = result
            .checked_mul(10)?
            .checked_add((byte - b'0') as u64)?;
    }

    Some(result)
}

/// `tchar` from RFC 7230 section 3.2.6.
#[inline]
pub(crate) const fn is_token_byte(byte: u8) -> bool {
    matches!(byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

// METHOD

macro_rules! methods {
    ($( $(#[$docs:meta])+ $name:ident = ($bit:expr, $text:literal); )+) => {
        /// HTTP request methods
        ///
        /// # References
        ///
        /// - [RFC 7231, Section 4](https://datatracker.ietf.org/doc/html/rfc7231#section-4)
        /// - [RFC 5789](https://datatracker.ietf.org/doc/html/rfc5789) (PATCH method)
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum Method { $( $(#[$docs])+ $name, )+ }

        impl Method {
            /// Every method, in declaration order.
            pub const ALL: &'static [Method] = &[$( Method::$name, )+];

            pub(crate) fn from_bytes(src: &[u8]) -> Result<Self, HttpError> {
                match src {
                    $( $text => Ok(Method::$name), )+
                    _ if !src.is_empty() && src.iter().all(|b| is_token_byte(*b)) => {
                        Err(HttpError::UnknownMethod)
                    }
                    _ => Err(HttpError::BadRequestLine),
                }
            }

            pub const fn as_str(&self) -> &'static str {
                match self { $(
                    Method::$name => match std::str::from_utf8($text) {
                        Ok(text) => text,
                        Err(_) => "",
                    },
                )+ }
            }

            const fn bit(&self) -> u16 {
                match self { $( Method::$name => 1 << $bit, )+ }
            }
        }
    };
}

methods! {
    /// GET method - transfer a current representation of the target resource
    /// [[RFC7231, Section 4.3.1](https://tools.ietf.org/html/rfc7231#section-4.3.1)]
    Get = (0, b"GET");
    /// HEAD method - same as GET but without response body
    /// [[RFC7231, Section 4.3.2](https://tools.ietf.org/html/rfc7231#section-4.3.2)]
    Head = (1, b"HEAD");
    /// POST method - perform resource-specific processing on the request payload
    /// [[RFC7231, Section 4.3.3](https://tools.ietf.org/html/rfc7231#section-4.3.3)]
    Post = (2, b"POST");
    /// PUT method - replace all current representations of the target resource with the request payload
    /// [[RFC7231, Section 4.3.4](https://tools.ietf.org/html/rfc7231#section-4.3.4)]
    Put = (3, b"PUT");
    /// DELETE method - remove all current representations of the target resource
    /// [[RFC7231, Section 4.3.5](https://tools.ietf.org/html/rfc7231#section-4.3.5)]
    Delete = (4, b"DELETE");
    /// OPTIONS method - describe the communication options for the target resource
    /// [[RFC7231, Section 4.3.7](https://tools.ietf.org/html/rfc7231#section-4.3.7)]
    Options = (5, b"OPTIONS");
    /// PATCH method - apply partial modifications to a resource
    /// [[RFC5789, Section 2](https://tools.ietf.org/html/rfc5789#section-2)]
    Patch = (6, b"PATCH");
    /// TRACE method - loop-back of the request message; disabled unless configured
    /// [[RFC7231, Section 4.3.8](https://tools.ietf.org/html/rfc7231#section-4.3.8)]
    Trace = (7, b"TRACE");
    /// CONNECT method - establish a tunnel to the server identified by the target
    /// [[RFC7231, Section 4.3.6](https://tools.ietf.org/html/rfc7231#section-4.3.6)]
    Connect = (8, b"CONNECT");
}

impl Method {
    /// Methods whose requests carry no body unless framing headers say otherwise.
    pub(crate) const fn body_optional(&self) -> bool {
        !matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A set of [`Method`]s, used for `allowed_methods` and the `Allow` header.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodSet(u16);

impl MethodSet {
    pub const EMPTY: MethodSet = MethodSet(0);

    pub const fn of(methods: &[Method]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < methods.len() {
            bits |= methods[i].bit();
            i += 1;
        }
        MethodSet(bits)
    }

    pub const fn contains(&self, method: Method) -> bool {
        self.0 & method.bit() != 0
    }

    pub const fn with(self, method: Method) -> Self {
        MethodSet(self.0 | method.bit())
    }

    pub const fn without(self, method: Method) -> Self {
        MethodSet(self.0 & !method.bit())
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Method> + '_ {
        Method::ALL.iter().copied().filter(|m| self.contains(*m))
    }

    /// Renders the set as an `Allow` header value, e.g. `GET, HEAD`.
    pub fn to_header_value(&self) -> String {
        let mut out = String::new();
        for method in self.iter() {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(method.as_str());
        }
        out
    }
}

impl ops::BitOr<Method> for MethodSet {
    type Output = MethodSet;

    fn bitor(self, rhs: Method) -> MethodSet {
        self.with(rhs)
    }
}

impl ops::BitOr for Method {
    type Output = MethodSet;

    fn bitor(self, rhs: Method) -> MethodSet {
        MethodSet::of(&[self, rhs])
    }
}

impl From<Method> for MethodSet {
    fn from(method: Method) -> Self {
        MethodSet::of(&[method])
    }
}

impl fmt::Debug for MethodSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// VERSION

/// HTTP protocol version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    /// HTTP/1.0 - Added headers and status codes (1996)
    ///
    /// [RFC 1945](https://tools.ietf.org/html/rfc1945)
    Http10,

    /// HTTP/1.1 - Current standard with keep-alive and chunking (1999)
    ///
    /// [RFC 7230](https://tools.ietf.org/html/rfc7230) and related
    Http11,
}

impl Version {
    /// Accepts exactly `HTTP/<digit>.<digit>`; only 1.0 and 1.1 are supported.
    pub(crate) const fn from_bytes(src: &[u8]) -> Result<Self, HttpError> {
        match src {
            b"HTTP/1.1" => Ok(Self::Http11),
            b"HTTP/1.0" => Ok(Self::Http10),
            [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
                if major.is_ascii_digit() && minor.is_ascii_digit() =>
            {
                Err(HttpError::UnsupportedVersion)
            }
            _ => Err(HttpError::InvalidVersion),
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    pub const fn major(&self) -> u8 {
        1
    }

    pub const fn minor(&self) -> u8 {
        match self {
            Version::Http10 => 0,
            Version::Http11 => 1,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// STATUS_CODE

/// An HTTP status code in `100..=599`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

macro_rules! set_status_codes {
    ($(
        $(#[$docs:meta])+
        $name:ident = ($num:expr, $str:expr);
    )+) => {
        impl StatusCode { $(
            #[doc = concat!(stringify!($num), " ", $str)]
            $(#[$docs])+
            pub const $name: StatusCode = StatusCode($num);
        )+

            /// The reason phrase registered for this code, or `""` when unknown.
            pub const fn canonical_reason(&self) -> &'static str {
                match self.0 {
                    $( $num => $str, )+
                    _ => "",
                }
            }
        }
    }
}

set_status_codes! {
    /// [[RFC9110, Section 15.2.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.2.1)]
    CONTINUE = (100, "Continue");
    /// [[RFC9110, Section 15.2.2](https://datatracker.ietf.org/doc/html/rfc9110#section-15.2.2)]
    SWITCHING_PROTOCOLS = (101, "Switching Protocols");
    /// [[RFC2518, Section 10.1](https://datatracker.ietf.org/doc/html/rfc2518#section-10.1)]
    PROCESSING = (102, "Processing");
    /// [[RFC8297, Section 2](https://datatracker.ietf.org/doc/html/rfc8297#section-2)]
    EARLY_HINTS = (103, "Early Hints");

    /// [[RFC9110, Section 15.3.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.3.1)]
    OK = (200, "OK");
    /// [[RFC9110, Section 15.3.2](https://datatracker.ietf.org/doc/html/rfc9110#section-15.3.2)]
    CREATED = (201, "Created");
    /// [[RFC9110, Section 15.3.3](https://datatracker.ietf.org/doc/html/rfc9110#section-15.3.3)]
    ACCEPTED = (202, "Accepted");
    /// [[RFC9110, Section 15.3.4](https://datatracker.ietf.org/doc/html/rfc9110#section-15.3.4)]
    NON_AUTHORITATIVE_INFORMATION = (203, "Non-Authoritative Information");
    /// [[RFC9110, Section 15.3.5](https://datatracker.ietf.org/doc/html/rfc9110#section-15.3.5)]
    NO_CONTENT = (204, "No Content");
    /// [[RFC9110, Section 15.3.6](https://datatracker.ietf.org/doc/html/rfc9110#section-15.3.6)]
    RESET_CONTENT = (205, "Reset Content");
    /// [[RFC9110, Section 15.3.7](https://datatracker.ietf.org/doc/html/rfc9110#section-15.3.7)]
    PARTIAL_CONTENT = (206, "Partial Content");

    /// [[RFC9110, Section 15.4.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.1)]
    MULTIPLE_CHOICES = (300, "Multiple Choices");
    /// [[RFC9110, Section 15.4.2](https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.2)]
    MOVED_PERMANENTLY = (301, "Moved Permanently");
    /// [[RFC9110, Section 15.4.3](https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.3)]
    FOUND = (302, "Found");
    /// [[RFC9110, Section 15.4.4](https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.4)]
    SEE_OTHER = (303, "See Other");
    /// [[RFC9110, Section 15.4.5](https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.5)]
    NOT_MODIFIED = (304, "Not Modified");
    /// [[RFC9110, Section 15.4.8](https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.8)]
    TEMPORARY_REDIRECT = (307, "Temporary Redirect");
    /// [[RFC9110, Section 15.4.9](https://datatracker.ietf.org/doc/html/rfc9110#section-15.4.9)]
    PERMANENT_REDIRECT = (308, "Permanent Redirect");

    /// [[RFC9110, Section 15.5.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.1)]
    BAD_REQUEST = (400, "Bad Request");
    /// [[RFC9110, Section 15.5.2](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.2)]
    UNAUTHORIZED = (401, "Unauthorized");
    /// [[RFC9110, Section 15.5.4](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.4)]
    FORBIDDEN = (403, "Forbidden");
    /// [[RFC9110, Section 15.5.5](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.5)]
    NOT_FOUND = (404, "Not Found");
    /// [[RFC9110, Section 15.5.6](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.6)]
    METHOD_NOT_ALLOWED = (405, "Method Not Allowed");
    /// [[RFC9110, Section 15.5.7](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.7)]
    NOT_ACCEPTABLE = (406, "Not Acceptable");
    /// [[RFC9110, Section 15.5.9](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.9)]
    REQUEST_TIMEOUT = (408, "Request Timeout");
    /// [[RFC9110, Section 15.5.10](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.10)]
    CONFLICT = (409, "Conflict");
    /// [[RFC9110, Section 15.5.11](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.11)]
    GONE = (410, "Gone");
    /// [[RFC9110, Section 15.5.12](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.12)]
    LENGTH_REQUIRED = (411, "Length Required");
    /// [[RFC9110, Section 15.5.13](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.13)]
    PRECONDITION_FAILED = (412, "Precondition Failed");
    /// [[RFC9110, Section 15.5.14](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.14)]
    PAYLOAD_TOO_LARGE = (413, "Payload Too Large");
    /// [[RFC9110, Section 15.5.15](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.15)]
    URI_TOO_LONG = (414, "URI Too Long");
    /// [[RFC9110, Section 15.5.16](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.16)]
    UNSUPPORTED_MEDIA_TYPE = (415, "Unsupported Media Type");
    /// [[RFC9110, Section 15.5.18](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.18)]
    EXPECTATION_FAILED = (417, "Expectation Failed");
    /// [[RFC9110, Section 15.5.22](https://datatracker.ietf.org/doc/html/rfc9110#section-15.5.22)]
    UPGRADE_REQUIRED = (426, "Upgrade Required");
    /// [[RFC6585, Section 4](https://datatracker.ietf.org/doc/html/rfc6585#section-4)]
    TOO_MANY_REQUESTS = (429, "Too Many Requests");
    /// [[RFC6585, Section 5](https://datatracker.ietf.org/doc/html/rfc6585#section-5)]
    REQUEST_HEADER_FIELDS_TOO_LARGE = (431, "Request Header Fields Too Large");

    /// [[RFC9110, Section 15.6.1](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.1)]
    INTERNAL_SERVER_ERROR = (500, "Internal Server Error");
    /// [[RFC9110, Section 15.6.2](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.2)]
    NOT_IMPLEMENTED = (501, "Not Implemented");
    /// [[RFC9110, Section 15.6.3](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.3)]
    BAD_GATEWAY = (502, "Bad Gateway");
    /// [[RFC9110, Section 15.6.4](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.4)]
    SERVICE_UNAVAILABLE = (503, "Service Unavailable");
    /// [[RFC9110, Section 15.6.5](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.5)]
    GATEWAY_TIMEOUT = (504, "Gateway Timeout");
    /// [[RFC9110, Section 15.6.6](https://datatracker.ietf.org/doc/html/rfc9110#section-15.6.6)]
    HTTP_VERSION_NOT_SUPPORTED = (505, "HTTP Version Not Supported");
}

impl StatusCode {
    /// Builds a status code, rejecting values outside `100..=599`.
    pub const fn from_u16(code: u16) -> Option<StatusCode> {
        match code {
            100..=599 => Some(StatusCode(code)),
            _ => None,
        }
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    pub const fn is_informational(&self) -> bool {
        self.0 < 200
    }

    /// `1xx`, `204` and `304` responses never carry a body.
    pub const fn allows_body(&self) -> bool {
        !(self.is_informational() || self.0 == 204 || self.0 == 304)
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.canonical_reason())
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
