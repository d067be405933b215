//! HTTP/1.x message heads: incremental parsing, framing rules and
//! serialization

use bytes::{BufMut, BytesMut};
use http::StatusCode;

use super::headers::HttpHeaders;
use crate::{Error, Result};

/// Largest request or response head we buffer before giving up
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor version of HTTP/1.x
    pub version: u8,
    pub headers: HttpHeaders,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: HttpHeaders,
}

/// How the end of a message body is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Parse a request head from the start of `buf`
///
/// Returns `Ok(None)` while the head is incomplete, so the caller can append
/// more bytes and retry; on success also returns the head's length.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = RequestHead {
                method: request.method.unwrap_or_default().to_string(),
                target: request.path.unwrap_or_default().to_string(),
                version: request.version.unwrap_or(1),
                headers: HttpHeaders::from_httparse(request.headers),
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_SIZE => {
            Err(Error::invalid_request("request head too large"))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(httparse::Error::Version) => Err(Error::UnsupportedVersion(
            String::from_utf8_lossy(buf.split(|&b| b == b'\n').next().unwrap_or_default())
                .trim()
                .to_string(),
        )),
        Err(e) => Err(Error::invalid_request(format!("malformed request head: {}", e))),
    }
}

/// Parse a response head from the start of `buf`
pub fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let head = ResponseHead {
                version: response.version.unwrap_or(1),
                status: response.code.unwrap_or_default(),
                reason: response.reason.unwrap_or_default().to_string(),
                headers: HttpHeaders::from_httparse(response.headers),
            };
            Ok(Some((head, len)))
        }
        Ok(httparse::Status::Partial) if buf.len() > MAX_HEAD_SIZE => {
            Err(Error::protocol("response head too large"))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(Error::protocol(format!("malformed response head: {}", e))),
    }
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Whether the client wants the connection kept open after this exchange
    pub fn keep_alive(&self) -> bool {
        persistent(self.version, &self.headers)
    }

    /// Body framing of this request; requests without a length have no body
    pub fn framing(&self) -> Result<BodyFraming> {
        if self.headers.contains("Transfer-Encoding") {
            if !self.headers.is_chunked() {
                return Err(Error::invalid_request("unsupported transfer coding"));
            }
            if self.headers.contains("Content-Length") {
                return Err(Error::invalid_request(
                    "both Transfer-Encoding and Content-Length present",
                ));
            }
            return Ok(BodyFraming::Chunked);
        }
        Ok(match self.headers.content_length()? {
            Some(0) | None => BodyFraming::Empty,
            Some(len) => BodyFraming::Length(len),
        })
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        self.headers.write_to(out);
        out.put_slice(b"\r\n");
    }
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: 1,
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            headers: HttpHeaders::new(),
        }
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn keep_alive(&self) -> bool {
        persistent(self.version, &self.headers)
    }

    /// Body framing of this response to a request made with `method`
    pub fn framing(&self, method: &str) -> Result<BodyFraming> {
        if method.eq_ignore_ascii_case("HEAD")
            || self.is_informational()
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyFraming::Empty);
        }
        if self.headers.contains("Transfer-Encoding") {
            if !self.headers.is_chunked() {
                return Ok(BodyFraming::UntilClose);
            }
            if self.headers.contains("Content-Length") {
                return Err(Error::protocol(
                    "both Transfer-Encoding and Content-Length present",
                ));
            }
            return Ok(BodyFraming::Chunked);
        }
        Ok(match self.headers.content_length().map_err(|e| Error::protocol(e))? {
            Some(0) => BodyFraming::Empty,
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::UntilClose,
        })
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(
            format!("HTTP/1.{} {} {}\r\n", self.version, self.status, self.reason).as_bytes(),
        );
        self.headers.write_to(out);
        out.put_slice(b"\r\n");
    }
}

fn persistent(version: u8, headers: &HttpHeaders) -> bool {
    let says = |token: &str| {
        headers.has_token("Connection", token) || headers.has_token("Proxy-Connection", token)
    };
    if version >= 1 {
        !says("close")
    } else {
        says("keep-alive")
    }
}

/// HTML body describing a proxy-generated error
pub fn format_error(status: StatusCode, message: &str) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("Error");
    format!(
        r#"<html>
<head>
    <title>{code} {reason}</title>
</head>
<body>
    <h1>{code} {reason}</h1>
    <p>{message}</p>
</body>
</html>"#,
        code = status.as_u16(),
        reason = reason,
        message = html_escape(message),
    )
    .into_bytes()
}

fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Complete response the proxy sends on its own behalf
///
/// `extra` headers are added before the framing headers. The connection is
/// marked for closing unless `keep_alive` is set.
pub fn make_error_response(
    status: StatusCode,
    message: &str,
    extra: &[(&str, String)],
    keep_alive: bool,
) -> BytesMut {
    let body = format_error(status, message);
    let mut head = ResponseHead::new(status);
    for (name, value) in extra {
        head.headers.add(*name, value.clone());
    }
    head.headers.add("Content-Type", "text/html");
    head.headers.add("Content-Length", body.len().to_string());
    head.headers.add(
        "Connection",
        if keep_alive { "keep-alive" } else { "close" },
    );

    let mut out = BytesMut::with_capacity(256 + body.len());
    head.write_to(&mut out);
    out.put_slice(&body);
    out
}
