//! Minimal HTTP/1.1 message framing: start line, header block and
//! `Content-Length` bodies. Enough surface for plain request/response
//! exchanges and for the WebSocket and HTTP/2 upgrade handshakes.

use crate::buffer::ChunkedBuffer;
use lumen::shared::{NetworkError, NetworkResult, ProtocolError};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: &str, path: &str) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> HttpRequest {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    pub fn parse(buffer: &mut ChunkedBuffer) -> NetworkResult<HttpRequest> {
        let (head, body) = read_message(buffer)?;
        let mut lines = head.split(|line: char| line == '\n').map(|line| line.trim_end_matches('\r'));

        let start = match lines.next() {
            Some(line) => line,
            None => return Err(NetworkError::protocol(ProtocolError::Malformed)),
        };

        let mut parts = start.split(' ');
        let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(version)) if !method.is_empty() => {
                (method, path, version)
            }
            _ => return Err(NetworkError::protocol(ProtocolError::Malformed)),
        };

        Ok(HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers: parse_headers(lines)?,
            body,
        })
    }

    pub fn serialize(&self, buffer: &mut ChunkedBuffer) -> NetworkResult<()> {
        let mut head = format!("{} {} {}\r\n", self.method, self.path, self.version);
        write_headers(&mut head, &self.headers, self.body.len());

        buffer.write(head.as_bytes())?;
        buffer.write(&self.body)
    }
}

impl HttpResponse {
    pub fn new(status: u16, reason: &str) -> HttpResponse {
        HttpResponse {
            version: "HTTP/1.1".to_string(),
            status,
            reason: reason.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> HttpResponse {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    pub fn parse(buffer: &mut ChunkedBuffer) -> NetworkResult<HttpResponse> {
        let (head, body) = read_message(buffer)?;
        let mut lines = head.split(|line: char| line == '\n').map(|line| line.trim_end_matches('\r'));

        let start = match lines.next() {
            Some(line) => line,
            None => return Err(NetworkError::protocol(ProtocolError::Malformed)),
        };

        let mut parts = start.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        let status = parts
            .next()
            .and_then(|status| status.parse::<u16>().ok())
            .ok_or_else(|| NetworkError::protocol(ProtocolError::Malformed))?;
        let reason = parts.next().unwrap_or("");

        if !version.starts_with("HTTP/") {
            return Err(NetworkError::protocol(ProtocolError::Malformed));
        }

        Ok(HttpResponse {
            version: version.to_string(),
            status,
            reason: reason.to_string(),
            headers: parse_headers(lines)?,
            body,
        })
    }

    pub fn serialize(&self, buffer: &mut ChunkedBuffer) -> NetworkResult<()> {
        let mut head = format!("{} {} {}\r\n", self.version, self.status, self.reason);
        write_headers(&mut head, &self.headers, self.body.len());

        buffer.write(head.as_bytes())?;
        buffer.write(&self.body)
    }
}

/// Pull one complete message (head + declared body) off the buffer as
/// `(head string, body)`, rewinding on underflow.
fn read_message(buffer: &mut ChunkedBuffer) -> NetworkResult<(String, Vec<u8>)> {
    let mark = buffer.read_position();
    let bytes = buffer.read(buffer.available())?;

    let head_end = match find(&bytes, HEAD_TERMINATOR) {
        Some(position) => position,
        None => {
            buffer.set_read_position(mark)?;
            if bytes.len() > MAX_HEAD_SIZE {
                return Err(NetworkError::protocol(ProtocolError::HeaderTooLarge));
            }
            return Err(NetworkError::Incomplete);
        }
    };

    let head = String::from_utf8(bytes[..head_end].to_vec())
        .map_err(|_| NetworkError::protocol(ProtocolError::Malformed))?;

    let content_length = content_length_of(&head)?;
    let body_start = head_end + HEAD_TERMINATOR.len();
    let total = body_start + content_length;

    if bytes.len() < total {
        buffer.set_read_position(mark)?;
        return Err(NetworkError::Incomplete);
    }

    // Leave anything past this message unconsumed.
    buffer.set_read_position(mark + total)?;

    Ok((head, bytes[body_start..total].to_vec()))
}

fn content_length_of(head: &str) -> NetworkResult<usize> {
    for line in head.split('\n').skip(1) {
        let line = line.trim_end_matches('\r');
        if let Some(position) = line.find(':') {
            if line[..position].eq_ignore_ascii_case("content-length") {
                return line[position + 1..]
                    .trim()
                    .parse()
                    .map_err(|_| NetworkError::protocol(ProtocolError::Malformed));
            }
        }
    }

    Ok(0)
}

fn parse_headers<'a, I: Iterator<Item = &'a str>>(lines: I) -> NetworkResult<Vec<(String, String)>> {
    let mut headers = Vec::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let position = line
            .find(':')
            .ok_or_else(|| NetworkError::protocol(ProtocolError::Malformed))?;

        headers.push((
            line[..position].trim().to_string(),
            line[position + 1..].trim().to_string(),
        ));
    }

    Ok(headers)
}

fn write_headers(head: &mut String, headers: &[(String, String)], body_len: usize) {
    let mut has_length = false;

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            has_length = true;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    if body_len > 0 && !has_length {
        head.push_str(&format!("Content-Length: {}\r\n", body_len));
    }

    head.push_str("\r\n");
}

fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChunkPool;
    use std::sync::Arc;

    fn buffer() -> ChunkedBuffer {
        ChunkedBuffer::new(&Arc::new(ChunkPool::new(64)))
    }

    #[test]
    fn test_request_roundtrip() {
        let request = HttpRequest::new("GET", "/chat")
            .with_header("Host", "example.net")
            .with_header("Upgrade", "websocket");

        let mut wire = buffer();
        request.serialize(&mut wire).unwrap();

        let parsed = HttpRequest::parse(&mut wire).unwrap();

        assert_eq!(parsed, request);
        assert_eq!(wire.available(), 0);
    }

    #[test]
    fn test_response_roundtrip_with_body() {
        let mut response = HttpResponse::new(200, "OK").with_header("Content-Type", "text/plain");
        response.body = b"hello body".to_vec();

        let mut wire = buffer();
        response.serialize(&mut wire).unwrap();

        let parsed = HttpResponse::parse(&mut wire).unwrap();

        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.body, b"hello body");
        assert_eq!(parsed.header("content-length"), Some("10"));
    }

    #[test]
    fn test_partial_head_rewinds() {
        let mut wire = buffer();
        wire.write(b"GET / HTTP/1.1\r\nHost: exam").unwrap();

        let mark = wire.read_position();
        assert_eq!(HttpRequest::parse(&mut wire).unwrap_err(), NetworkError::Incomplete);
        assert_eq!(wire.read_position(), mark);

        wire.write(b"ple.net\r\n\r\n").unwrap();

        let parsed = HttpRequest::parse(&mut wire).unwrap();
        assert_eq!(parsed.header("host"), Some("example.net"));
    }

    #[test]
    fn test_partial_body_rewinds() {
        let mut wire = buffer();
        wire.write(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab").unwrap();

        assert_eq!(HttpRequest::parse(&mut wire).unwrap_err(), NetworkError::Incomplete);

        wire.write(b"cde").unwrap();

        let parsed = HttpRequest::parse(&mut wire).unwrap();
        assert_eq!(parsed.body, b"abcde");
    }

    #[test]
    fn test_pipelined_messages_leave_tail() {
        let mut wire = buffer();
        wire.write(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n").unwrap();

        let first = HttpRequest::parse(&mut wire).unwrap();
        let second = HttpRequest::parse(&mut wire).unwrap();

        assert_eq!(first.path, "/a");
        assert_eq!(second.path, "/b");
        assert_eq!(wire.available(), 0);
    }

    #[test]
    fn test_malformed_start_line() {
        let mut wire = buffer();
        wire.write(b"NONSENSE\r\n\r\n").unwrap();

        assert_eq!(
            HttpRequest::parse(&mut wire).unwrap_err(),
            NetworkError::protocol(ProtocolError::Malformed)
        );
    }

    #[test]
    fn test_status_line_parse() {
        let mut wire = buffer();
        wire.write(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n")
            .unwrap();

        let parsed = HttpResponse::parse(&mut wire).unwrap();

        assert_eq!(parsed.status, 101);
        assert_eq!(parsed.reason, "Switching Protocols");
        assert_eq!(parsed.header("upgrade"), Some("websocket"));
    }
}
