//! HTTP/1.1 head parsing and body accounting.
//!
//! Both ends of a tunnel shuttle HTTP exchanges as raw bytes; only the head
//! is parsed (with `httparse`), rewritten, and re-encoded. Bodies are copied
//! verbatim, so body handling is limited to knowing where a body ends:
//! content-length, chunked boundaries, or connection close.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on parsed header count.
pub const MAX_HEADERS: usize = 100;

/// Upper bound on the size of a request or response head.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Http1Error {
    #[error("malformed head: {0}")]
    Parse(httparse::Error),

    #[error("head exceeds {MAX_HEAD_BYTES} bytes")]
    HeadTooLarge,

    #[error("connection closed before a complete head")]
    TruncatedHead,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLen {
    /// No body at all.
    None,
    /// Exactly this many bytes.
    Len(u64),
    /// Chunked transfer encoding.
    Chunked,
    /// Delimited by connection close (responses without a length).
    UntilClose,
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    for (n, v) in headers.iter_mut() {
        if n.eq_ignore_ascii_case(name) {
            *v = value.to_string();
            return;
        }
    }
    headers.push((name.to_string(), value.to_string()));
}

fn remove_header(headers: &mut Vec<(String, String)>, name: &str) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
}

/// True when a comma-separated header value contains the given token.
fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn body_from_headers(headers: &[(String, String)]) -> Option<BodyLen> {
    if let Some(te) = find_header(headers, "transfer-encoding") {
        if has_token(te, "chunked") {
            return Some(BodyLen::Chunked);
        }
    }
    if let Some(cl) = find_header(headers, "content-length") {
        if let Ok(n) = cl.trim().parse::<u64>() {
            return Some(BodyLen::Len(n));
        }
    }
    None
}

fn owned_headers(parsed: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    parsed
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect()
}

/// A parsed HTTP/1.x request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Try to parse a head out of `buf`. Returns the head and the number of
    /// bytes it occupied, or `None` when more input is needed.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, Http1Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let head = RequestHead {
                    method: req.method.unwrap_or_default().to_string(),
                    target: req.path.unwrap_or_default().to_string(),
                    version: req.version.unwrap_or(1),
                    headers: owned_headers(req.headers),
                };
                Ok(Some((head, len)))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(Http1Error::Parse(e)),
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replace a header value, appending if absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        remove_header(&mut self.headers, name);
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or(&self.target)
    }

    /// Whether this request asks for a protocol upgrade.
    pub fn is_upgrade(&self) -> bool {
        if self.header("upgrade").is_some() {
            return true;
        }
        self.header("connection")
            .map(|v| has_token(v, "upgrade"))
            .unwrap_or(false)
    }

    pub fn body(&self) -> BodyLen {
        body_from_headers(&self.headers).unwrap_or(BodyLen::None)
    }

    /// Serialize back to wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// A parsed HTTP/1.x status line and headers.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub code: u16,
    pub reason: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, Http1Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let head = ResponseHead {
                    code: resp.code.unwrap_or(0),
                    reason: resp.reason.unwrap_or_default().to_string(),
                    version: resp.version.unwrap_or(1),
                    headers: owned_headers(resp.headers),
                };
                Ok(Some((head, len)))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(Http1Error::Parse(e)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        set_header(&mut self.headers, name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        remove_header(&mut self.headers, name);
    }

    /// Append a header without replacing existing values (e.g. Set-Cookie).
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn is_upgrade(&self) -> bool {
        self.code == 101
    }

    pub fn body(&self) -> BodyLen {
        if (100..200).contains(&self.code) || self.code == 204 || self.code == 304 {
            return BodyLen::None;
        }
        body_from_headers(&self.headers).unwrap_or(BodyLen::UntilClose)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("HTTP/1.{} {} {}\r\n", self.version, self.code, self.reason).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Read a request head from `reader`, returning any body bytes that arrived
/// in the same reads.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(RequestHead, Vec<u8>), Http1Error> {
    let buf = read_until_head::<R, RequestHead>(reader, RequestHead::parse).await?;
    Ok(buf)
}

/// Read a response head from `reader`, returning leftover body bytes.
pub async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(ResponseHead, Vec<u8>), Http1Error> {
    let buf = read_until_head::<R, ResponseHead>(reader, ResponseHead::parse).await?;
    Ok(buf)
}

async fn read_until_head<R, H>(
    reader: &mut R,
    parse: fn(&[u8]) -> Result<Option<(H, usize)>, Http1Error>,
) -> Result<(H, Vec<u8>), Http1Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some((head, len)) = parse(&buf)? {
            return Ok((head, buf.split_off(len)));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(Http1Error::HeadTooLarge);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(Http1Error::TruncatedHead);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Tracks chunked-body boundaries across a verbatim byte copy.
///
/// Feed it the bytes as they are forwarded; it reports how many of them
/// belong to the body and flips to done after the terminating chunk and
/// trailer section.
#[derive(Debug)]
pub struct ChunkedTracker {
    state: ChunkState,
}

#[derive(Debug)]
enum ChunkState {
    /// Accumulating a chunk-size line.
    Size(Vec<u8>),
    /// Consuming chunk payload.
    Data(u64),
    /// Consuming the CRLF after a chunk payload.
    DataEnd(u8),
    /// Accumulating a trailer line; an empty line terminates the body.
    Trailer(Vec<u8>),
    Done,
}

impl ChunkedTracker {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size(Vec::new()),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Advance over `buf`, returning how many bytes of it belong to the body.
    pub fn feed(&mut self, buf: &[u8]) -> usize {
        let mut pos = 0;
        while pos < buf.len() {
            match &mut self.state {
                ChunkState::Size(line) => {
                    let b = buf[pos];
                    pos += 1;
                    if b == b'\n' {
                        let text = String::from_utf8_lossy(line);
                        let size_part = text
                            .trim()
                            .split(';')
                            .next()
                            .unwrap_or_default()
                            .to_string();
                        let size = u64::from_str_radix(&size_part, 16).unwrap_or(0);
                        self.state = if size == 0 {
                            ChunkState::Trailer(Vec::new())
                        } else {
                            ChunkState::Data(size)
                        };
                    } else {
                        line.push(b);
                    }
                }
                ChunkState::Data(remaining) => {
                    let take = (*remaining).min((buf.len() - pos) as u64) as usize;
                    pos += take;
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = ChunkState::DataEnd(2);
                    }
                }
                ChunkState::DataEnd(need) => {
                    let take = (*need as usize).min(buf.len() - pos);
                    pos += take;
                    *need -= take as u8;
                    if *need == 0 {
                        self.state = ChunkState::Size(Vec::new());
                    }
                }
                ChunkState::Trailer(line) => {
                    let b = buf[pos];
                    pos += 1;
                    if b == b'\n' {
                        let empty = line.iter().all(|&c| c == b'\r');
                        if empty {
                            self.state = ChunkState::Done;
                        } else {
                            self.state = ChunkState::Trailer(Vec::new());
                        }
                    } else {
                        line.push(b);
                    }
                }
                ChunkState::Done => break,
            }
        }
        pos
    }
}

impl Default for ChunkedTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_head() {
        let raw = b"GET /myapp/foo?x=1 HTTP/1.1\r\nHost: tunnel.example.com\r\nCookie: a=b\r\n\r\nBODY";
        let (head, len) = RequestHead::parse(raw).unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/myapp/foo?x=1");
        assert_eq!(head.path(), "/myapp/foo");
        assert_eq!(head.header("host"), Some("tunnel.example.com"));
        assert_eq!(head.header("HOST"), Some("tunnel.example.com"));
        assert_eq!(len, raw.len() - 4);
    }

    #[test]
    fn partial_head_needs_more() {
        assert!(RequestHead::parse(b"GET / HTTP/1.1\r\nHost: x").unwrap().is_none());
    }

    #[test]
    fn header_mutation_is_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let (mut head, _) = RequestHead::parse(raw).unwrap().unwrap();
        head.set_header("host", "b");
        assert_eq!(head.header("Host"), Some("b"));
        head.remove_header("HOST");
        assert_eq!(head.header("host"), None);
        head.set_header("X-Forwarded-Proto", "https");
        assert_eq!(head.header("x-forwarded-proto"), Some("https"));
    }

    #[test]
    fn encode_round_trips() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap().unwrap();
        let encoded = head.encode();
        let (reparsed, len) = RequestHead::parse(&encoded).unwrap().unwrap();
        assert_eq!(len, encoded.len());
        assert_eq!(reparsed.method, "POST");
        assert_eq!(reparsed.body(), BodyLen::Len(3));
    }

    #[test]
    fn body_classification() {
        let (req, _) =
            RequestHead::parse(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").unwrap().unwrap();
        assert_eq!(req.body(), BodyLen::None);

        let (req, _) = RequestHead::parse(
            b"POST / HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(req.body(), BodyLen::Chunked);

        let (resp, _) =
            ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").unwrap().unwrap();
        assert_eq!(resp.body(), BodyLen::Len(2));

        let (resp, _) = ResponseHead::parse(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap().unwrap();
        assert_eq!(resp.body(), BodyLen::None);

        let (resp, _) = ResponseHead::parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap().unwrap();
        assert_eq!(resp.body(), BodyLen::UntilClose);
    }

    #[test]
    fn upgrade_detection() {
        let (req, _) = RequestHead::parse(
            b"GET /ws HTTP/1.1\r\nHost: h\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(req.is_upgrade());

        let (req, _) =
            RequestHead::parse(b"GET / HTTP/1.1\r\nHost: h\r\nConnection: keep-alive\r\n\r\n")
                .unwrap()
                .unwrap();
        assert!(!req.is_upgrade());

        let (resp, _) = ResponseHead::parse(
            b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(resp.is_upgrade());
    }

    #[tokio::test]
    async fn read_head_returns_leftover() {
        let raw: &[u8] = b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\n\r\nBODY";
        let mut reader = raw;
        let (head, leftover) = read_request_head(&mut reader).await.unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(leftover, b"BODY");
    }

    #[tokio::test]
    async fn read_head_truncated() {
        let raw: &[u8] = b"GET / HTTP/1.1\r\nHos";
        let mut reader = raw;
        assert!(matches!(
            read_request_head(&mut reader).await,
            Err(Http1Error::TruncatedHead)
        ));
    }

    #[test]
    fn chunked_tracker_single_feed() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nEXTRA";
        let mut tracker = ChunkedTracker::new();
        let consumed = tracker.feed(body);
        assert!(tracker.is_done());
        assert_eq!(consumed, body.len() - 5);
    }

    #[test]
    fn chunked_tracker_split_feeds() {
        let body = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        for step in 1..=4 {
            let mut tracker = ChunkedTracker::new();
            let mut total = 0;
            for piece in body.chunks(step) {
                total += tracker.feed(piece);
            }
            assert!(tracker.is_done(), "step {step}");
            assert_eq!(total, body.len(), "step {step}");
        }
    }

    #[test]
    fn chunked_tracker_with_trailers() {
        let body = b"3\r\nabc\r\n0\r\nX-Meta: 1\r\n\r\n";
        let mut tracker = ChunkedTracker::new();
        let consumed = tracker.feed(body);
        assert!(tracker.is_done());
        assert_eq!(consumed, body.len());
    }
}
