//! Ordered HTTP header collection
//!
//! Names compare case-insensitively; insertion order and duplicates are kept
//! so that forwarded header blocks stay faithful to what the peer sent.

use bytes::{BufMut, BytesMut};

use crate::{Error, Result};

/// Headers that only describe the current hop and are never forwarded
pub const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Proxy-Connection",
    "TE",
    "Trailers",
    "Transfer-Encoding",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    entries: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_httparse(headers: &[httparse::Header<'_>]) -> Self {
        let entries = headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Append a header, keeping any existing ones with the same name
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every header named `name` with a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.add(name, value);
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every header named `name`, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Comma-separated tokens across every value of `name`
    pub fn tokens<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Whether the list-valued header `name` carries `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.tokens(name).any(|t| t.eq_ignore_ascii_case(token))
    }

    /// Strip the fixed hop-by-hop set plus every header listed in `Connection`
    pub fn remove_hop_by_hop(&mut self) {
        let nominated: Vec<String> = self.tokens("Connection").map(str::to_string).collect();
        self.entries.retain(|(n, _)| {
            !HOP_BY_HOP.iter().any(|h| n.eq_ignore_ascii_case(h))
                && !nominated.iter().any(|c| n.eq_ignore_ascii_case(c))
        });
    }

    /// Declared body length; conflicting or malformed values are an error
    pub fn content_length(&self) -> Result<Option<u64>> {
        let mut length = None;
        for value in self.tokens("Content-Length") {
            let parsed: u64 = value
                .parse()
                .map_err(|_| Error::invalid_request(format!("invalid Content-Length: {}", value)))?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(Error::invalid_request("conflicting Content-Length values"));
                }
                _ => length = Some(parsed),
            }
        }
        Ok(length)
    }

    /// Whether `chunked` is the final transfer coding
    pub fn is_chunked(&self) -> bool {
        self.tokens("Transfer-Encoding")
            .last()
            .map(|t| t.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// Serialize as `Name: value\r\n` lines (without the terminating blank line)
    pub fn write_to(&self, out: &mut BytesMut) {
        for (name, value) in &self.entries {
            out.reserve(name.len() + value.len() + 4);
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HttpHeaders {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let headers: HttpHeaders = [("Content-Type", "text/plain"), ("X-Tag", "a"), ("x-tag", "b")]
            .into_iter()
            .collect();

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get_all("X-TAG").collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(!headers.contains("Host"));
    }

    #[test]
    fn test_value_outlives_looked_up_name() {
        let headers: HttpHeaders = [("Host", "example.com")].into_iter().collect();
        let value = {
            let name = String::from("host");
            headers.get(&name)
        };
        assert_eq!(value, Some("example.com"));
    }

    #[test]
    fn test_remove_hop_by_hop_preserves_order_and_duplicates() {
        let mut headers: HttpHeaders = [
            ("Host", "example.com"),
            ("Connection", "keep-alive, X-Trace"),
            ("Accept", "text/html"),
            ("Keep-Alive", "timeout=5"),
            ("Proxy-Authenticate", "Digest"),
            ("Proxy-Authorization", "Digest username=\"u\""),
            ("Proxy-Connection", "keep-alive"),
            ("TE", "trailers"),
            ("Trailers", "Expires"),
            ("Transfer-Encoding", "chunked"),
            ("X-Trace", "abc"),
            ("Accept", "application/json"),
            ("Cookie", "a=1"),
            ("x-trace", "def"),
        ]
        .into_iter()
        .collect();

        headers.remove_hop_by_hop();

        let remaining: Vec<(&str, &str)> = headers.iter().collect();
        assert_eq!(
            remaining,
            vec![
                ("Host", "example.com"),
                ("Accept", "text/html"),
                ("Accept", "application/json"),
                ("Cookie", "a=1"),
            ]
        );
    }

    #[test]
    fn test_content_length() {
        let headers: HttpHeaders = [("Content-Length", "42")].into_iter().collect();
        assert_eq!(headers.content_length().unwrap(), Some(42));

        let headers: HttpHeaders = [("Content-Length", "42"), ("content-length", "42")]
            .into_iter()
            .collect();
        assert_eq!(headers.content_length().unwrap(), Some(42));

        let headers: HttpHeaders = [("Content-Length", "42"), ("Content-Length", "7")]
            .into_iter()
            .collect();
        assert!(headers.content_length().is_err());

        let headers: HttpHeaders = [("Content-Length", "-1")].into_iter().collect();
        assert!(headers.content_length().is_err());

        assert_eq!(HttpHeaders::new().content_length().unwrap(), None);
    }

    #[test]
    fn test_chunked_detection() {
        let headers: HttpHeaders = [("Transfer-Encoding", "gzip, Chunked")].into_iter().collect();
        assert!(headers.is_chunked());

        let headers: HttpHeaders = [("Transfer-Encoding", "chunked, gzip")].into_iter().collect();
        assert!(!headers.is_chunked());
    }

    #[test]
    fn test_write_to() {
        let mut headers = HttpHeaders::new();
        headers.add("Host", "example.com");
        headers.set("Accept", "*/*");

        let mut out = BytesMut::new();
        headers.write_to(&mut out);
        assert_eq!(&out[..], b"Host: example.com\r\nAccept: */*\r\n");
    }
}
