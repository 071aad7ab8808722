//! Raw HTTP/1.x response parsing and synthesis

use super::headers::{find_header, HeaderList};
use crate::error::HttpError;

const MAX_HEADERS: usize = 128;

/// An HTTP response parsed from raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderList,
    /// Length of the head including the blank line
    pub head_len: usize,
    pub body: Vec<u8>,
}

/// Parse a response (head and any body bytes that follow).
pub fn parse_response(bytes: &[u8]) -> Result<ParsedResponse, HttpError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut raw_headers);

    let head_len = match resp.parse(bytes) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Err(HttpError::Incomplete),
        Err(e) => return Err(HttpError::Parse(e.to_string())),
    };

    let headers = resp
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    Ok(ParsedResponse {
        version: resp.version.unwrap_or(1),
        status: resp.code.unwrap_or_default(),
        reason: resp.reason.unwrap_or_default().to_string(),
        headers,
        head_len,
        body: bytes[head_len..].to_vec(),
    })
}

impl ParsedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Media type without parameters, lowercased; empty if absent.
    pub fn content_type(&self) -> String {
        self.header("content-type")
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default()
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type() == "text/event-stream"
    }
}

/// A minimal `text/plain` response with a correct length.
pub fn text_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Type: Text/HTML; charset=utf-8\r\nContent-Length: 3\r\n\r\nnop";
        let resp = parse_response(raw).unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.reason, "Not Found");
        assert_eq!(resp.content_type(), "text/html");
        assert_eq!(resp.body, b"nop");
    }

    #[test]
    fn test_event_stream_detection() {
        let resp = parse_response(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n").unwrap();
        assert!(resp.is_event_stream());
    }

    #[test]
    fn test_text_response_round_trips() {
        let raw = text_response(403, "Forbidden", "Request dropped by proxy");
        let resp = parse_response(&raw).unwrap();
        assert_eq!(resp.status, 403);
        assert_eq!(resp.body, b"Request dropped by proxy");
        assert_eq!(resp.header("content-length"), Some("24"));
    }

    #[test]
    fn test_partial_response() {
        assert!(matches!(
            parse_response(b"HTTP/1.1 200 OK\r\n"),
            Err(HttpError::Incomplete)
        ));
    }
}
