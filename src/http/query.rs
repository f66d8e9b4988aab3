//! Query string and form-data parsing.

use crate::http::uri::percent_decode;
use memchr::memchr;
use std::{collections::HashMap, error, fmt};

/// Parser for `application/x-www-form-urlencoded` data and URI query strings.
///
/// [`Query::parse`] borrows keys and values from the input without decoding;
/// [`Query::decoded`] returns owned, percent- and `+`-decoded pairs.
///
/// # Examples
/// ```rust
/// use kiln::query::Query;
/// use std::collections::HashMap;
///
/// // Raw pairs, order preserved
/// let pairs: Vec<(&str, &str)> = Query::parse("name=jo%20e&age=25&flag", 10).unwrap();
/// assert_eq!(pairs, [("name", "jo%20e"), ("age", "25"), ("flag", "")]);
///
/// // Deduplicated, last value wins
/// let map: HashMap<&str, &str> = Query::parse("k=1&k=2", 10).unwrap();
/// assert_eq!(map["k"], "2");
///
/// // Decoded pairs
/// let decoded = Query::decoded("name=jo%20e&city=new+york");
/// assert_eq!(decoded[1], ("city".to_owned(), "new york".to_owned()));
/// ```
pub struct Query;

impl Query {
    /// Parses `query` into a new collection, failing once more than
    /// `limit` parameters are present. A leading `?` is ignored.
    #[inline]
    pub fn parse<'a, C: QueryCollector<'a>>(query: &'a str, limit: usize) -> Result<C, Error> {
        let mut result = C::with_capacity(limit.min(16));
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Parses `query`, appending to an existing collection.
    pub fn parse_into<'a, C: QueryCollector<'a>>(
        result: &mut C,
        query: &'a str,
        limit: usize,
    ) -> Result<(), Error> {
        let data = query.strip_prefix('?').unwrap_or(query);
        if data.is_empty() {
            return Err(Error::Empty);
        }

        let bytes = data.as_bytes();
        let mut start = 0;
        while start < bytes.len() {
            if result.length() >= limit {
                return Err(Error::OverLimit(limit));
            }

            let end = memchr(b'&', &bytes[start..])
                .map(|pos| start + pos)
                .unwrap_or(bytes.len());

            // '&' and '=' are ASCII, so both splits land on char boundaries
            let pair = &data[start..end];
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));

            result.add_param(key, value);
            start = end + 1;
        }

        Ok(())
    }

    /// Parses and decodes every pair; empty input gives an empty list.
    pub fn decoded(query: &str) -> Vec<(String, String)> {
        let mut pairs: Vec<(&str, &str)> = Vec::new();
        if Self::parse_into(&mut pairs, query, usize::MAX).is_err() {
            return Vec::new();
        }

        pairs
            .into_iter()
            .filter(|(key, value)| !(key.is_empty() && value.is_empty()))
            .map(|(key, value)| (form_decode(key), form_decode(value)))
            .collect()
    }
}

fn form_decode(src: &str) -> String {
    match src.contains('+') {
        true => percent_decode(&src.replace('+', " ")),
        false => percent_decode(src),
    }
}

/// A collection that receives parsed query parameters.
///
/// # Examples
/// ```rust
/// use kiln::query::{Query, QueryCollector};
///
/// struct Keys(Vec<String>);
///
/// impl<'a> QueryCollector<'a> for Keys {
///     fn add_param(&mut self, key: &'a str, _: &'a str) {
///         self.0.push(key.to_uppercase());
///     }
///
///     fn length(&self) -> usize {
///         self.0.len()
///     }
///
///     fn with_capacity(capacity: usize) -> Self {
///         Keys(Vec::with_capacity(capacity))
///     }
/// }
///
/// let keys: Keys = Query::parse("a=1&b=2", 4).unwrap();
/// assert_eq!(keys.0, ["A", "B"]);
/// ```
pub trait QueryCollector<'a>
where
    Self: Sized,
{
    fn add_param(&mut self, key: &'a str, value: &'a str);

    // `length` rather than `len`, so clippy does not ask for `is_empty`
    fn length(&self) -> usize;

    fn with_capacity(capacity: usize) -> Self;
}

impl<'a> QueryCollector<'a> for Vec<(&'a str, &'a str)> {
    #[inline(always)]
    fn add_param(&mut self, key: &'a str, value: &'a str) {
        self.push((key, value));
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }
}

impl<'a> QueryCollector<'a> for HashMap<&'a str, &'a str> {
    #[inline(always)]
    fn add_param(&mut self, key: &'a str, value: &'a str) {
        self.insert(key, value);
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity(capacity)
    }
}

/// Failures of [`Query::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// More parameters than the given limit.
    OverLimit(usize),
    /// Nothing to parse (empty, or just `?`).
    Empty,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OverLimit(limit) => write!(f, "query parameter limit exceeded: limit={limit}"),
            Error::Empty => f.write_str("query string is empty"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_pairs() {
        #[rustfmt::skip]
        let cases: [(&str, Vec<(&str, &str)>); 4] = [
            ("a=1&b=2",                     vec![("a", "1"), ("b", "2")]),
            ("?a=1&b=2",                    vec![("a", "1"), ("b", "2")]),
            ("flag&empty=&=val&&key=v=w",   vec![("flag", ""), ("empty", ""), ("", "val"), ("", ""), ("key", "v=w")]),
            ("x=%41",                       vec![("x", "%41")]),
        ];

        for (line, expected) in cases {
            let params: Vec<(&str, &str)> = Query::parse(line, 10).unwrap();
            assert_eq!(params, expected, "{line}");
        }
    }

    #[test]
    fn errors() {
        assert_eq!(Query::parse::<Vec<(&str, &str)>>("a&a", 1), Err(Error::OverLimit(1)));
        assert_eq!(Query::parse::<Vec<(&str, &str)>>("", 10), Err(Error::Empty));
        assert_eq!(Query::parse::<Vec<(&str, &str)>>("?", 10), Err(Error::Empty));
    }

    #[test]
    fn decoding() {
        assert_eq!(
            Query::decoded("q=a%26b&&sp=x+y&u=%E2%9C%93"),
            vec![
                ("q".to_owned(), "a&b".to_owned()),
                ("sp".to_owned(), "x y".to_owned()),
                ("u".to_owned(), "✓".to_owned()),
            ]
        );
        assert!(Query::decoded("").is_empty());
    }
}
