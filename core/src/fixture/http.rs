//! Minimal HTTP/1.1 message-head codec used by the fixture.
//!
//! The fixture only needs the start line and headers to match rules and to
//! rewrite `Host` and `Connection`; bodies are relayed as opaque bytes.

use tokio::io::{AsyncRead, AsyncReadExt};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed request line and headers of an incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent (path plus optional query).
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup; returns the first value.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replace the first `name` header in place (dropping any repeats), or
    /// append it if absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_head(
            &format!("{} {} {}", self.method, self.target, self.version),
            &self.headers,
        )
    }
}

/// Parsed status line and headers of a response from the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseHead {
    pub(crate) version: String,
    pub(crate) status: u16,
    pub(crate) reason: String,
    pub(crate) headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// 1xx responses other than `101 Switching Protocols` precede the final
    /// response on the same connection.
    pub(crate) fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub(crate) fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub(crate) fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        encode_head(
            &format!("{} {} {}", self.version, self.status, self.reason),
            &self.headers,
        )
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    let mut replaced = false;
    headers.retain_mut(|(k, v)| {
        if !k.eq_ignore_ascii_case(name) {
            return true;
        }
        if replaced {
            return false;
        }
        *k = name.to_string();
        *v = value.to_string();
        replaced = true;
        true
    });
    if !replaced {
        headers.push((name.to_string(), value.to_string()));
    }
}

fn encode_head(start_line: &str, headers: &[(String, String)]) -> Vec<u8> {
    let mut out = format!("{start_line}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

/// Why a message head could not be read.
#[derive(Debug)]
pub(crate) enum HeadError {
    /// The peer closed before sending a complete head.
    Closed { received: usize },
    /// The head exceeded the configured limit.
    TooLarge,
    /// The bytes did not form a valid message head.
    Malformed(String),
    Io(std::io::Error),
}

impl std::fmt::Display for HeadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed { received } => {
                write!(f, "peer closed after {received} bytes of message head")
            }
            Self::TooLarge => f.write_str("message head too large"),
            Self::Malformed(msg) => write!(f, "malformed message head: {msg}"),
            Self::Io(e) => write!(f, "I/O error reading message head: {e}"),
        }
    }
}

/// Read a request head from `reader`.
///
/// Returns the parsed head and any bytes that arrived after it (the start
/// of a body), which must be forwarded verbatim.
pub(crate) async fn read_request_head<R>(
    reader: &mut R,
    max_head_bytes: usize,
) -> Result<(RequestHead, Vec<u8>), HeadError>
where
    R: AsyncRead + Unpin,
{
    let (raw, rest) = read_head(reader, Vec::new(), max_head_bytes).await?;
    Ok((parse_request_head(&raw)?, rest))
}

/// Read a response head from `reader`, starting with bytes already
/// `buffered` from an earlier read.
pub(crate) async fn read_response_head<R>(
    reader: &mut R,
    buffered: Vec<u8>,
    max_head_bytes: usize,
) -> Result<(ResponseHead, Vec<u8>), HeadError>
where
    R: AsyncRead + Unpin,
{
    let (raw, rest) = read_head(reader, buffered, max_head_bytes).await?;
    Ok((parse_response_head(&raw)?, rest))
}

/// Read until the blank line that ends a head. Returns the head bytes
/// without the terminator, and whatever followed it.
async fn read_head<R>(
    reader: &mut R,
    mut buf: Vec<u8>,
    max_head_bytes: usize,
) -> Result<(Vec<u8>, Vec<u8>), HeadError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let mut scan_from = 0;

    loop {
        if let Some(pos) = find_head_end(&buf[scan_from..]) {
            let head_end = scan_from + pos;
            if head_end > max_head_bytes {
                return Err(HeadError::TooLarge);
            }
            let rest = buf.split_off(head_end + HEAD_TERMINATOR.len());
            buf.truncate(head_end);
            return Ok((buf, rest));
        }
        if buf.len() > max_head_bytes {
            return Err(HeadError::TooLarge);
        }

        scan_from = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
        let n = reader.read(&mut chunk).await.map_err(HeadError::Io)?;
        if n == 0 {
            return Err(HeadError::Closed {
                received: buf.len(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

/// Parse the bytes before the blank line into a [`RequestHead`].
pub(crate) fn parse_request_head(raw: &[u8]) -> Result<RequestHead, HeadError> {
    let (request_line, headers) = split_head(raw)?;
    let parts: Vec<&str> = request_line.split(' ').collect();
    let (method, target, version) = match parts.as_slice() {
        [m, t, v] if !m.is_empty() && !t.is_empty() => (*m, *t, *v),
        _ => {
            return Err(HeadError::Malformed(format!(
                "bad request line: {request_line:?}"
            )));
        }
    };
    check_version(version)?;

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Parse the bytes before the blank line into a [`ResponseHead`].
pub(crate) fn parse_response_head(raw: &[u8]) -> Result<ResponseHead, HeadError> {
    let (status_line, headers) = split_head(raw)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    check_version(version)?;
    let code = parts.next().unwrap_or_default();
    let status = match code.parse::<u16>() {
        Ok(status) if code.len() == 3 => status,
        _ => {
            return Err(HeadError::Malformed(format!(
                "bad status line: {status_line:?}"
            )));
        }
    };
    let reason = parts.next().unwrap_or_default();

    Ok(ResponseHead {
        version: version.to_string(),
        status,
        reason: reason.to_string(),
        headers,
    })
}

fn check_version(version: &str) -> Result<(), HeadError> {
    if version.starts_with("HTTP/1.") {
        Ok(())
    } else {
        Err(HeadError::Malformed(format!(
            "unsupported version: {version}"
        )))
    }
}

/// Split a raw head into its start line and header fields.
fn split_head(raw: &[u8]) -> Result<(&str, Vec<(String, String)>), HeadError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| HeadError::Malformed("head is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| HeadError::Malformed("empty start line".to_string()))?;

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HeadError::Malformed(format!("bad header line: {line:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HeadError::Malformed("empty header name".to_string()));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    Ok((start_line, headers))
}

/// A complete, body-less response that closes the connection.
pub(crate) fn fixed_response(status: u16) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status)
    )
    .into_bytes()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let head =
            parse_request_head(b"GET /status?x=1 HTTP/1.1\r\nHost: 127.0.0.1:1080\r\nAccept: */*")
                .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/status?x=1");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.header("host"), Some("127.0.0.1:1080"));
        assert_eq!(head.header("ACCEPT"), Some("*/*"));
        assert_eq!(head.header("missing"), None);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            parse_request_head(b"HELLO"),
            Err(HeadError::Malformed(_))
        ));
        assert!(matches!(
            parse_request_head(b"GET / SPDY/3"),
            Err(HeadError::Malformed(_))
        ));
        assert!(matches!(
            parse_request_head(b"GET / HTTP/1.1\r\nno-colon-here"),
            Err(HeadError::Malformed(_))
        ));
    }

    #[test]
    fn set_header_rewrites_host_in_place() {
        let raw = b"GET / HTTP/1.1\r\nhost: 127.0.0.1:1080\r\nAccept: */*";
        let mut head = parse_request_head(raw).unwrap();
        head.set_header("Host", "httpbin.org");
        let out = String::from_utf8(head.encode()).unwrap();
        assert_eq!(
            out,
            "GET / HTTP/1.1\r\nHost: httpbin.org\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn set_header_collapses_repeats_and_appends_missing() {
        let raw = b"GET / HTTP/1.1\r\nConnection: keep-alive\r\nconnection: Upgrade";
        let mut head = parse_request_head(raw).unwrap();
        head.set_header("Connection", "close");
        head.set_header("Host", "example.com");
        head.remove_header("keep-alive");
        let out = String::from_utf8(head.encode()).unwrap();
        assert_eq!(
            out,
            "GET / HTTP/1.1\r\nConnection: close\r\nHost: example.com\r\n\r\n"
        );
    }

    #[test]
    fn parse_response_status_line() {
        let head = parse_response_head(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0").unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.reason, "Not Found");
        assert!(!head.is_interim());

        let bare = parse_response_head(b"HTTP/1.1 200").unwrap();
        assert_eq!(bare.status, 200);
        assert_eq!(bare.reason, "");

        let interim = parse_response_head(b"HTTP/1.1 100 Continue").unwrap();
        assert!(interim.is_interim());
        let upgrade = parse_response_head(b"HTTP/1.1 101 Switching Protocols").unwrap();
        assert!(!upgrade.is_interim());
        assert!(matches!(
            parse_response_head(b"HTTP/1.1 OK"),
            Err(HeadError::Malformed(_))
        ));
    }

    #[test]
    fn response_head_marks_connection_close() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nKeep-Alive: timeout=5";
        let mut head = parse_response_head(raw).unwrap();
        head.set_header("Connection", "close");
        head.remove_header("Keep-Alive");
        let out = String::from_utf8(head.encode()).unwrap();
        assert_eq!(
            out,
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n"
        );
    }

    #[test]
    fn fixed_response_shape() {
        let out = String::from_utf8(fixed_response(503)).unwrap();
        assert_eq!(
            out,
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn read_head_returns_trailing_bytes() {
        let mut input: &[u8] = b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody";
        let (head, rest) = read_request_head(&mut input, 1024).await.unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(rest, b"body");
    }

    #[tokio::test]
    async fn read_response_head_uses_buffered_bytes() {
        let buffered = b"HTTP/1.1 200 OK\r\nContent-Le".to_vec();
        let mut input: &[u8] = b"ngth: 2\r\n\r\nhi";
        let (head, rest) = read_response_head(&mut input, buffered, 1024).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(find_header(&head.headers, "content-length"), Some("2"));
        assert_eq!(rest, b"hi");
    }

    #[tokio::test]
    async fn read_head_reports_early_close() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\nHost";
        let err = read_request_head(&mut input, 1024).await.unwrap_err();
        assert!(matches!(err, HeadError::Closed { received: 20 }));
    }

    #[tokio::test]
    async fn read_head_enforces_limit() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(200));
        let mut input: &[u8] = &raw;
        let err = read_request_head(&mut input, 64).await.unwrap_err();
        assert!(matches!(err, HeadError::TooLarge));
    }
}
