//! Header block helpers: locating the head, body framing, length correction

use crate::error::HttpError;

/// Ordered header list as it appeared on the wire.
pub type HeaderList = Vec<(String, String)>;

/// Case-insensitive lookup of the first header named `name`.
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Whether any comma-separated token of header `name` equals `token`.
pub fn header_has_token(headers: &[(String, String)], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Position and line ending of the blank line ending the header block.
///
/// Returns `(offset of the separator, line ending)`; `\r\n` is preferred,
/// bare `\n` is accepted.
pub fn find_head_end(bytes: &[u8]) -> Option<(usize, &'static str)> {
    if let Some(pos) = find(bytes, b"\r\n\r\n") {
        return Some((pos, "\r\n"));
    }
    find(bytes, b"\n\n").map(|pos| (pos, "\n"))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Rewrite a message so its declared length matches its body.
///
/// Strips `Transfer-Encoding`, `Content-Length` and `Content-Encoding` and
/// appends `Content-Length: <body length>`. Input without a header
/// terminator is returned unchanged.
pub fn correct_length_headers(message: &[u8]) -> Vec<u8> {
    rewrite_length(
        message,
        &["transfer-encoding", "content-length", "content-encoding"],
    )
}

/// Like [`correct_length_headers`] but keeps `Content-Encoding`, for bodies
/// that were only de-chunked.
pub fn reframe_with_length(message: &[u8]) -> Vec<u8> {
    rewrite_length(message, &["transfer-encoding", "content-length"])
}

fn rewrite_length(message: &[u8], strip: &[&str]) -> Vec<u8> {
    let Some((end, eol)) = find_head_end(message) else {
        return message.to_vec();
    };

    let body_start = end + eol.len() * 2;
    let body = &message[body_start..];
    let head = &message[..end];

    let mut out = Vec::with_capacity(message.len() + 24);
    for (i, line) in split_lines(head, eol).enumerate() {
        if i > 0 && is_named(line, strip) {
            continue;
        }
        if !out.is_empty() {
            out.extend_from_slice(eol.as_bytes());
        }
        out.extend_from_slice(line);
    }
    out.extend_from_slice(eol.as_bytes());
    out.extend_from_slice(format!("Content-Length: {}", body.len()).as_bytes());
    out.extend_from_slice(eol.as_bytes());
    out.extend_from_slice(eol.as_bytes());
    out.extend_from_slice(body);
    out
}

fn split_lines<'a>(head: &'a [u8], eol: &'static str) -> impl Iterator<Item = &'a [u8]> + 'a {
    let mut rest = Some(head);
    std::iter::from_fn(move || {
        let current = rest?;
        match find(current, eol.as_bytes()) {
            Some(pos) => {
                rest = Some(&current[pos + eol.len()..]);
                Some(&current[..pos])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

fn is_named(line: &[u8], names: &[&str]) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    let name = String::from_utf8_lossy(&line[..colon]);
    let name = name.trim();
    names.iter().any(|n| name.eq_ignore_ascii_case(n))
}

/// How the body of a message is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    Empty,
    /// Exactly this many bytes follow.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the peer closes the connection.
    UntilClose,
}

/// Framing of a request body.
pub fn request_framing(headers: &[(String, String)]) -> Result<BodyFraming, HttpError> {
    if header_has_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match find_header(headers, "content-length") {
        Some(value) => parse_length(value).map(|n| {
            if n == 0 {
                BodyFraming::Empty
            } else {
                BodyFraming::Length(n)
            }
        }),
        None => Ok(BodyFraming::Empty),
    }
}

/// Framing of a response body to a request made with `method`.
pub fn response_framing(
    status: u16,
    method: &str,
    headers: &[(String, String)],
) -> Result<BodyFraming, HttpError> {
    if method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyFraming::Empty);
    }
    if header_has_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyFraming::Chunked);
    }
    match find_header(headers, "content-length") {
        Some(value) => parse_length(value).map(|n| {
            if n == 0 {
                BodyFraming::Empty
            } else {
                BodyFraming::Length(n)
            }
        }),
        None => Ok(BodyFraming::UntilClose),
    }
}

fn parse_length(value: &str) -> Result<u64, HttpError> {
    value
        .trim()
        .parse()
        .map_err(|_| HttpError::Parse(format!("invalid Content-Length '{}'", value)))
}

/// Decode a complete chunked body, discarding extensions and trailers.
pub fn dechunk(raw: &[u8]) -> Result<Vec<u8>, HttpError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut pos = 0;

    loop {
        let line_end = find(&raw[pos..], b"\n").ok_or(HttpError::Incomplete)? + pos;
        let line = String::from_utf8_lossy(&raw[pos..line_end]);
        let size_text = line.trim().split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| HttpError::Parse(format!("invalid chunk size '{}'", size_text)))?;
        pos = line_end + 1;

        if size == 0 {
            return Ok(out);
        }
        if size > raw.len() - pos {
            return Err(HttpError::Incomplete);
        }
        out.extend_from_slice(&raw[pos..pos + size]);
        pos += size;

        // Chunk data is followed by CRLF (or a bare LF).
        if raw[pos..].starts_with(b"\r\n") {
            pos += 2;
        } else if raw[pos..].starts_with(b"\n") {
            pos += 1;
        } else {
            return Err(HttpError::Parse("missing chunk terminator".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correct_length_headers_replaces_framing() {
        let input = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Encoding: gzip\r\nX-Test: 1\r\n\r\nhello";
        let out = correct_length_headers(input);
        assert_eq!(
            out,
            b"HTTP/1.1 200 OK\r\nX-Test: 1\r\nContent-Length: 5\r\n\r\nhello".to_vec()
        );
    }

    #[test]
    fn test_correct_length_headers_bare_newlines() {
        let input = b"POST / HTTP/1.1\ncontent-length: 99\n\nabc";
        assert_eq!(
            correct_length_headers(input),
            b"POST / HTTP/1.1\nContent-Length: 3\n\nabc".to_vec()
        );
    }

    #[test]
    fn test_correct_length_headers_without_terminator() {
        let input = b"GET / HTTP/1.1\r\nHost: x";
        assert_eq!(correct_length_headers(input), input.to_vec());
    }

    #[test]
    fn test_reframe_keeps_content_encoding() {
        let input = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nTransfer-Encoding: chunked\r\n\r\nab";
        let out = String::from_utf8(reframe_with_length(input)).unwrap();
        assert!(out.contains("Content-Encoding: gzip"));
        assert!(out.ends_with("Content-Length: 2\r\n\r\nab"));
        assert!(!out.contains("chunked"));
    }

    #[test]
    fn test_dechunk() {
        let raw = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nTrailer: x\r\n\r\n";
        assert_eq!(dechunk(raw).unwrap(), b"Wikipedia");
        assert!(matches!(dechunk(b"4\r\nWi"), Err(HttpError::Incomplete)));
        assert!(dechunk(b"zz\r\n").is_err());
    }

    #[test]
    fn test_dechunk_rejects_hostile_sizes() {
        assert!(matches!(
            dechunk(b"ffffffffffffffff\r\nabc"),
            Err(HttpError::Incomplete)
        ));
        assert!(matches!(
            dechunk(b"fffffffffffffffff\r\nabc"),
            Err(HttpError::Parse(_))
        ));
        assert!(dechunk(b"3\r\nabcX0\r\n\r\n").is_err());
    }

    #[test]
    fn test_response_framing() {
        let chunked = vec![("Transfer-Encoding".to_string(), "gzip, chunked".to_string())];
        assert_eq!(response_framing(200, "GET", &chunked).unwrap(), BodyFraming::Chunked);
        assert_eq!(response_framing(200, "HEAD", &chunked).unwrap(), BodyFraming::Empty);
        assert_eq!(response_framing(304, "GET", &[]).unwrap(), BodyFraming::Empty);
        assert_eq!(response_framing(200, "GET", &[]).unwrap(), BodyFraming::UntilClose);

        let sized = vec![("content-length".to_string(), "12".to_string())];
        assert_eq!(response_framing(200, "GET", &sized).unwrap(), BodyFraming::Length(12));
        assert_eq!(request_framing(&sized).unwrap(), BodyFraming::Length(12));
        assert_eq!(request_framing(&[]).unwrap(), BodyFraming::Empty);
    }
}
