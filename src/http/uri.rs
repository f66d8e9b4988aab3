//! Request-target parsing, path normalization and percent coding.

use crate::{errors::HttpError, http::query::Query};
use std::fmt;

/// The four request-target forms of RFC 7230 section 5.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetForm {
    /// `/path?query`
    Origin,
    /// `http://host:port/path?query`
    Absolute,
    /// `host:port`, only valid for `CONNECT`
    Authority,
    /// `*`, only valid for `OPTIONS`
    Asterisk,
}

/// A parsed request target.
///
/// The raw text is retained for echo-back; [`Uri::path`] returns the
/// percent-decoded, dot-segment-normalized path used for matching.
#[derive(Clone, PartialEq, Eq)]
pub struct Uri {
    raw: String,
    form: TargetForm,

    scheme: Option<String>,
    userinfo: Option<String>,
    host: Option<String>,
    port: Option<u16>,

    raw_path: String,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
}

impl Uri {
    /// Parses a request target.
    ///
    /// # Examples
    /// ```
    /// use kiln::Uri;
    ///
    /// let uri = Uri::parse("/static/../a%20b/./c?x=1#top").unwrap();
    /// assert_eq!(uri.path(), "/a b/c");
    /// assert_eq!(uri.raw_path(), "/static/../a%20b/./c");
    /// assert_eq!(uri.query(), Some("x=1"));
    /// assert_eq!(uri.fragment(), Some("top"));
    /// ```
    pub fn parse(target: &str) -> Result<Uri, HttpError> {
        if target.is_empty() || !target.bytes().all(is_target_byte) || !valid_escapes(target) {
            return Err(HttpError::InvalidTarget);
        }

        if target == "*" {
            return Ok(Uri::empty(target, TargetForm::Asterisk));
        }

        if target.starts_with('/') {
            let mut uri = Uri::empty(target, TargetForm::Origin);
            uri.split_path(target);
            return Ok(uri);
        }

        if let Some((scheme, rest)) = target.split_once("://") {
            if !is_scheme(scheme) {
                return Err(HttpError::InvalidTarget);
            }

            let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
            let (authority, tail) = rest.split_at(end);

            let mut uri = Uri::empty(target, TargetForm::Absolute);
            uri.scheme = Some(scheme.to_ascii_lowercase());
            uri.set_authority(authority, false)?;

            match tail.starts_with('/') {
                true => uri.split_path(tail),
                false => uri.split_path(&format!("/{tail}")),
            }
            return Ok(uri);
        }

        let mut uri = Uri::empty(target, TargetForm::Authority);
        uri.set_authority(target, true)?;
        Ok(uri)
    }

    fn empty(raw: &str, form: TargetForm) -> Uri {
        Uri {
            raw: raw.to_owned(),
            form,
            scheme: None,
            userinfo: None,
            host: None,
            port: None,
            raw_path: String::new(),
            path: String::new(),
            query: None,
            fragment: None,
        }
    }

    fn split_path(&mut self, src: &str) {
        let (rest, fragment) = match src.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment.to_owned())),
            None => (src, None),
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query.to_owned())),
            None => (rest, None),
        };

        self.raw_path = path.to_owned();
        self.path = normalize_path(path);
        self.query = query;
        self.fragment = fragment;
    }

    fn set_authority(&mut self, authority: &str, port_required: bool) -> Result<(), HttpError> {
        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo.to_owned()), hostport),
            None => (None, authority),
        };

        // `[v6]:port` keeps its brackets in the host.
        let (host, port) = match hostport.rfind(':') {
            Some(colon) if !hostport[colon..].contains(']') => {
                let port = hostport[colon + 1..]
                    .parse::<u16>()
                    .map_err(|_| HttpError::InvalidTarget)?;
                (&hostport[..colon], Some(port))
            }
            _ => (hostport, None),
        };

        if host.is_empty() || (port_required && port.is_none()) {
            return Err(HttpError::InvalidTarget);
        }

        self.userinfo = userinfo;
        self.host = Some(host.to_ascii_lowercase());
        self.port = port;
        Ok(())
    }
}

// Accessors
impl Uri {
    /// The target exactly as received.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[inline]
    pub const fn form(&self) -> TargetForm {
        self.form
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn userinfo(&self) -> Option<&str> {
        self.userinfo.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub const fn port(&self) -> Option<u16> {
        self.port
    }

    /// Decoded, normalized path. Empty for authority and asterisk forms.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path as received, still percent-encoded and not normalized.
    #[inline]
    pub fn raw_path(&self) -> &str {
        &self.raw_path
    }

    /// Raw query string without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// Decoded, non-empty path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// Decoded query pairs in order of appearance.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        match &self.query {
            Some(query) => Query::decoded(query),
            None => Vec::new(),
        }
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uri")
            .field("raw", &self.raw)
            .field("form", &self.form)
            .field("path", &self.path)
            .finish()
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[inline]
const fn is_target_byte(byte: u8) -> bool {
    byte > b' ' && byte < 0x7f
}

fn is_scheme(scheme: &str) -> bool {
    let mut bytes = scheme.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic())
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
}

fn valid_escapes(src: &str) -> bool {
    let bytes = src.as_bytes();
    memchr::memchr_iter(b'%', bytes).all(|pos| {
        matches!(bytes.get(pos + 1..pos + 3), Some([a, b]) if a.is_ascii_hexdigit() && b.is_ascii_hexdigit())
    })
}

#[inline]
const fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Decodes `%XX` triplets. Invalid triplets are kept verbatim and
/// invalid UTF-8 is replaced with U+FFFD.
pub fn percent_decode(src: &str) -> String {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).copied().and_then(hex_value),
                bytes.get(i + 2).copied().and_then(hex_value),
            ) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8(out).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

/// Encodes every byte outside the RFC 3986 unreserved set, keeping `/`.
pub fn percent_encode_path(src: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut out = String::with_capacity(src.len());
    for &byte in src.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0xf) as usize] as char);
            }
        }
    }
    out
}

/// Decodes each segment and resolves `.` and `..` without ever climbing
/// above the root. A trailing slash is preserved.
pub fn normalize_path(raw: &str) -> String {
    let mut stack: Vec<String> = Vec::new();
    let mut trailing_slash = raw.ends_with('/');

    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        let decoded = percent_decode(segment);
        trailing_slash = raw.ends_with('/');

        match decoded.as_str() {
            "." => trailing_slash = true,
            ".." => {
                stack.pop();
                trailing_slash = true;
            }
            _ => stack.push(decoded),
        }
    }

    let mut out = String::with_capacity(raw.len());
    for segment in &stack {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() || trailing_slash {
        out.push('/');
    }
    out
}
