//! Ordered, case-insensitive header storage and list-value helpers.

use crate::{errors::HttpError, http::types::is_token_byte};
use std::fmt;

/// A single header field as received or as it will be emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Header map with case-insensitive names.
///
/// Fields are kept in a flat vector, so the insertion order of distinct
/// names and the order of repeated values for one name are both preserved.
/// Lookups are linear, which is faster than hashing for the handful of
/// headers a typical request carries.
///
/// # Examples
/// ```
/// use kiln::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.append("Accept", "text/html");
/// headers.append("accept", "application/json");
///
/// assert_eq!(headers.get("ACCEPT"), Some("text/html"));
/// assert_eq!(headers.get_all("Accept").count(), 2);
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    fields: Vec<Header>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Adds a field, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replaces every value of `name` with `value`.
    ///
    /// The field keeps the position of the first existing occurrence.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.position(&name) {
            Some(pos) => {
                self.fields[pos].value = value;
                let mut index = 0;
                self.fields.retain(|h| {
                    index += 1;
                    index - 1 <= pos || !h.name.eq_ignore_ascii_case(&name)
                });
            }
            None => self.fields.push(Header { name, value }),
        }
    }

    /// Removes every value of `name`, returning whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before != self.fields.len()
    }

    /// Returns the first value of `name`.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Returns every value of `name` in the order they were added.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Checks whether any value of the comma-separated list header `name`
    /// contains `token` (case-insensitive), e.g. `Connection: keep-alive, Upgrade`.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(split_list)
            .any(|item| item.eq_ignore_ascii_case(token))
    }

    /// The last element of the comma-separated list header `name`.
    pub fn last_token<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.get_all(name).flat_map(split_list).last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.fields.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Serializes every field as `name: value\r\n`.
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        for Header { name, value } in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(name))
    }
}

impl fmt::Debug for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.fields.iter().map(|h| (&h.name, &h.value)))
            .finish()
    }
}

impl<'a> IntoIterator for &'a HeaderMap {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

/// Parses one field line (`name: OWS value OWS`) without its line terminator.
///
/// Names must be tokens with no whitespace before the colon. The value must
/// be UTF-8 and may be empty.
pub(crate) fn parse_field(line: &[u8]) -> Result<Header, HttpError> {
    let colon = memchr::memchr(b':', line).ok_or(HttpError::InvalidHeader)?;
    let (name, value) = (&line[..colon], &line[colon + 1..]);

    if name.is_empty() || !name.iter().all(|b| is_token_byte(*b)) {
        return Err(HttpError::InvalidHeader);
    }

    let start = value
        .iter()
        .position(|b| *b != b' ' && *b != b'\t')
        .unwrap_or(value.len());
    let end = value
        .iter()
        .rposition(|b| *b != b' ' && *b != b'\t')
        .map_or(start, |pos| pos + 1);
    let value = &value[start..end];

    if value.iter().any(|b| (*b < b' ' && *b != b'\t') || *b == 0x7f) {
        return Err(HttpError::InvalidHeader);
    }

    let value = simdutf8::basic::from_utf8(value).map_err(|_| HttpError::InvalidHeader)?;
    // token bytes are ASCII
    let name = String::from_utf8_lossy(name).into_owned();

    Ok(Header {
        name,
        value: value.to_owned(),
    })
}

/// Splits a comma-separated header value into trimmed, non-empty items.
pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(|item| item.trim_matches(|c| c == ' ' || c == '\t'))
        .filter(|item| !item.is_empty())
}

/// Parses a weighted list such as `gzip;q=0.8, deflate, *;q=0`.
///
/// Items without a `q` parameter weigh `1.0`. Malformed weights count
/// as `0.0`, which makes the item unacceptable.
pub(crate) fn quality_list(value: &str) -> Vec<(&str, f32)> {
    split_list(value)
        .map(|item| {
            let mut parts = item.split(';');
            let token = parts.next().unwrap_or_default().trim();

            let quality = parts
                .map(str::trim)
                .find_map(|param| {
                    let (key, val) = param.split_once('=')?;
                    key.trim()
                        .eq_ignore_ascii_case("q")
                        .then(|| parse_quality(val.trim()))
                })
                .unwrap_or(1.0);

            (token, quality)
        })
        .collect()
}

fn parse_quality(value: &str) -> f32 {
    match value.parse::<f32>() {
        Ok(q) if (0.0..=1.0).contains(&q) => q,
        _ => 0.0,
    }
}
