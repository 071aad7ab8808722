//! Raw HTTP/1.x request parsing

use url::Url;

use super::headers::{find_head_end, find_header, header_has_token, HeaderList};
use crate::error::HttpError;

const MAX_HEADERS: usize = 128;

/// An HTTP request parsed from raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    /// Request target exactly as sent (origin, absolute or authority form)
    pub target: String,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1
    pub version: u8,
    pub headers: HeaderList,
    /// Length of the head including the blank line
    pub head_len: usize,
    pub body: Vec<u8>,
}

/// Parse a complete request (head and whatever body bytes follow it).
pub fn parse_request(bytes: &[u8]) -> Result<ParsedRequest, HttpError> {
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw_headers);

    let head_len = match req.parse(bytes) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Err(HttpError::Incomplete),
        Err(e) => return Err(HttpError::Parse(e.to_string())),
    };

    let headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    Ok(ParsedRequest {
        method: req.method.unwrap_or_default().to_string(),
        target: req.path.unwrap_or_default().to_string(),
        version: req.version.unwrap_or(1),
        headers,
        head_len,
        body: bytes[head_len..].to_vec(),
    })
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        header_has_token(&self.headers, "upgrade", "websocket")
    }

    /// Whether the client asked for the connection to end after this exchange.
    pub fn wants_close(&self) -> bool {
        if header_has_token(&self.headers, "connection", "close") {
            return true;
        }
        self.version == 0 && !header_has_token(&self.headers, "connection", "keep-alive")
    }

    /// Whether the target is in absolute form (`http://host/path`).
    pub fn is_absolute_form(&self) -> bool {
        let lower = self.target.to_ascii_lowercase();
        lower.starts_with("http://") || lower.starts_with("https://")
    }

    /// Full URL of the request.
    ///
    /// Absolute-form targets are used as-is; otherwise the target is
    /// resolved against `scheme://authority`.
    pub fn url(&self, scheme: &str, authority: &str) -> Result<Url, HttpError> {
        let text = if self.is_absolute_form() {
            self.target.clone()
        } else {
            format!("{}://{}{}", scheme, authority, self.target)
        };
        Url::parse(&text).map_err(|e| HttpError::InvalidUrl(format!("{}: {}", text, e)))
    }

    /// URL of the request pinned to `scheme://authority`.
    ///
    /// Only the path and query of the target are used, so an absolute-form
    /// target naming another host cannot move the request elsewhere.
    pub fn url_on(&self, scheme: &str, authority: &str) -> Result<Url, HttpError> {
        let path = if self.is_absolute_form() {
            let target = Url::parse(&self.target)
                .map_err(|e| HttpError::InvalidUrl(format!("{}: {}", self.target, e)))?;
            match target.query() {
                Some(query) => format!("{}?{}", target.path(), query),
                None => target.path().to_string(),
            }
        } else if self.target.starts_with('/') {
            self.target.clone()
        } else {
            format!("/{}", self.target)
        };

        let text = format!("{}://{}{}", scheme, authority, path);
        Url::parse(&text).map_err(|e| HttpError::InvalidUrl(format!("{}: {}", text, e)))
    }
}

/// Host and port named by a CONNECT target (`host:port`).
pub fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16), HttpError> {
    let url = Url::parse(&format!("http://{}", authority))
        .map_err(|e| HttpError::InvalidUrl(format!("{}: {}", authority, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| HttpError::InvalidUrl(authority.to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    // `Url` drops the port when it is the scheme default, so read it back explicitly.
    let port = authority
        .rsplit_once(':')
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(default_port);
    Ok((host, port))
}

/// Rewrite a proxy-style request into what an origin server expects.
///
/// Absolute-form targets become origin form and hop-by-hop
/// `Proxy-Connection` / `Proxy-Authorization` headers are dropped. Bytes
/// without a complete head are returned unchanged.
pub fn to_origin_form(bytes: &[u8]) -> Vec<u8> {
    let Some((end, eol)) = find_head_end(bytes) else {
        return bytes.to_vec();
    };
    let head = String::from_utf8_lossy(&bytes[..end]);
    let mut lines = head.split(eol);

    let Some(request_line) = lines.next() else {
        return bytes.to_vec();
    };

    let mut parts = request_line.splitn(3, ' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return bytes.to_vec(),
    };

    let target = match Url::parse(target) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
            let mut origin = url.path().to_string();
            if let Some(query) = url.query() {
                origin.push('?');
                origin.push_str(query);
            }
            origin
        }
        _ => target.to_string(),
    };

    let mut out = format!("{} {} {}", method, target, version);
    for line in lines {
        let name = line.split(':').next().unwrap_or("").trim();
        if name.eq_ignore_ascii_case("proxy-connection")
            || name.eq_ignore_ascii_case("proxy-authorization")
        {
            continue;
        }
        out.push_str(eol);
        out.push_str(line);
    }
    out.push_str(eol);
    out.push_str(eol);

    let mut rewritten = out.into_bytes();
    rewritten.extend_from_slice(&bytes[end + eol.len() * 2..]);
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_with_body() {
        let raw = b"POST /login?next=%2F HTTP/1.1\r\nHost: example.com\r\nContent-Length: 7\r\n\r\nuser=ab";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.target, "/login?next=%2F");
        assert_eq!(req.header("host"), Some("example.com"));
        assert_eq!(req.body, b"user=ab");
        assert_eq!(req.head_len, raw.len() - 7);
    }

    #[test]
    fn test_parse_request_errors() {
        assert!(matches!(
            parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n"),
            Err(HttpError::Incomplete)
        ));
        assert!(matches!(
            parse_request(b"NOT A REQUEST\r\n\r\n"),
            Err(HttpError::Parse(_))
        ));
    }

    #[test]
    fn test_url_resolution() {
        let req = parse_request(b"GET /a/b?c=1 HTTP/1.1\r\nHost: ignored\r\n\r\n").unwrap();
        assert_eq!(
            req.url("https", "example.com:8443").unwrap().as_str(),
            "https://example.com:8443/a/b?c=1"
        );

        let abs = parse_request(b"GET http://example.com/x HTTP/1.1\r\n\r\n").unwrap();
        assert!(abs.is_absolute_form());
        assert_eq!(abs.url("https", "other").unwrap().as_str(), "http://example.com/x");
    }

    #[test]
    fn test_url_on_keeps_scheme_and_authority() {
        let abs = parse_request(b"GET http://evil.test/steal?k=v HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(
            abs.url_on("https", "example.com").unwrap().as_str(),
            "https://example.com/steal?k=v"
        );

        let slashes = parse_request(b"GET //evil.test/x HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(slashes.url_on("http", "example.com:8080").unwrap().host_str(), Some("example.com"));

        let star = parse_request(b"OPTIONS * HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(star.url_on("http", "example.com").unwrap().host_str(), Some("example.com"));
    }

    #[test]
    fn test_split_authority() {
        assert_eq!(
            split_authority("example.com:443", 443).unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_authority("example.com", 80).unwrap(),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            split_authority("[::1]:8443", 443).unwrap(),
            ("::1".to_string(), 8443)
        );
    }

    #[test]
    fn test_to_origin_form() {
        let raw = b"GET http://example.com/p?q=1 HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\n\r\n";
        assert_eq!(
            to_origin_form(raw),
            b"GET /p?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_websocket_and_close_detection() {
        let req = parse_request(
            b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap();
        assert!(req.is_websocket_upgrade());
        assert!(!req.wants_close());

        let old = parse_request(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(old.wants_close());
    }
}
