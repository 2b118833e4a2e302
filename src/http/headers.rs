//! HTTP headers handling
//!
//! Header names are matched case-insensitively; insertion order is kept so
//! that requests go out on the wire exactly as they were built.

use super::{Error, Result, MAX_HEADERS};
use std::fmt;

/// Ordered HTTP header list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Append a header, keeping any existing value with the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        // Extra headers past the cap are dropped
        if self.entries.len() >= MAX_HEADERS {
            return;
        }
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single `value`
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.insert(name, value);
    }

    /// First value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove all instances of a header, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Parsed `Content-Length`, if present
    pub fn content_length(&self) -> Result<Option<usize>> {
        match self.get("Content-Length") {
            Some(value) => value
                .parse::<usize>()
                .map(Some)
                .map_err(|_| Error::Parse(format!("Invalid Content-Length: {}", value))),
            None => Ok(None),
        }
    }

    /// Whether the body uses chunked transfer encoding
    pub fn is_chunked(&self) -> bool {
        self.get("Transfer-Encoding")
            .map(|te| {
                te.split(',')
                    .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all headers
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate over all headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Split a `Name: value` line
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHeader(format!("No colon in header: {}", line)))?;

        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidHeader("Empty header name".to_string()));
        }

        Ok((name.to_string(), value.trim().to_string()))
    }

    /// Serialize as `Name: value\r\n` lines
    pub(crate) fn write_wire(&self, buf: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(super::CRLF.as_bytes());
        }
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}
