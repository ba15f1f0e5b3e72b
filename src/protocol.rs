use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::Write;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Limit for the request line plus headers.
const HEAD_MAX: usize = 8 * 1024; // 8KB.

/// Limit for a message body. Requests carry everything in the query, bodies
/// are only read to keep the connection in sync.
const BODY_MAX: usize = 1024 * 1024; // 1MB.

/// Server side of the HTTP/1.1 framing: decodes requests, encodes responses.
#[derive(Debug, Default)]
pub struct ServerCodec {}

/// Client side of the HTTP/1.1 framing: encodes requests, decodes responses.
#[derive(Debug, Default)]
pub struct ClientCodec {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Vec<(Bytes, Bytes)>,
    // Connection is to be closed once the response is sent.
    pub close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    BadRequest,
    NotFound,
    InternalServerError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: Bytes,
    pub close: bool,
}

impl Request {
    pub fn new(method: &str, path: &str, query: Vec<(Bytes, Bytes)>) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            query,
            close: false,
        }
    }

    /// `GET /get?key=<key>`
    pub fn get(key: Bytes) -> Self {
        Self::new("GET", "/get", vec![(Bytes::from_static(b"key"), key)])
    }

    /// `POST /set?<key>=<value>`
    pub fn set(key: Bytes, value: Bytes) -> Self {
        Self::new("POST", "/set", vec![(key, value)])
    }

    pub fn stats() -> Self {
        Self::new("GET", "/stats", vec![])
    }

    /// All the values given for the query parameter, in order.
    pub fn query_values(&self, name: &[u8]) -> Vec<&Bytes> {
        self.query
            .iter()
            .filter(|(key, _)| key.as_ref() == name)
            .map(|(_, value)| value)
            .collect()
    }

    /// Path with the percent-encoded query string.
    pub fn target(&self) -> String {
        let mut target = self.path.clone();
        for (i, (key, value)) in self.query.iter().enumerate() {
            target.push(if i == 0 { '?' } else { '&' });
            target.push_str(&percent_encode(key));
            target.push('=');
            target.push_str(&percent_encode(value));
        }
        target
    }
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::InternalServerError => "Internal Server Error",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            201 => Some(Status::Created),
            400 => Some(Status::BadRequest),
            404 => Some(Status::NotFound),
            500 => Some(Status::InternalServerError),
            _ => None,
        }
    }
}

impl Response {
    pub fn new(status: Status, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            close: false,
        }
    }

    /// Plain text error message terminated by a newline.
    pub fn error(status: Status, msg: &str) -> Self {
        Self::new(status, format!("{}\n", msg))
    }
}

/*
Message layout. Lines end with CRLF, a bare LF is accepted on decoding.
---------------------------------------------------------------------
| Start Line | Header #1 | ... | Header #N | Empty Line | Body      |
---------------------------------------------------------------------
|   ...      | Name: Val | ... |    ...    |    CRLF    | Content-  |
|            |           |     |           |            | Length B  |
---------------------------------------------------------------------
*/
#[derive(Debug)]
struct Head {
    start_line: String,
    content_length: usize,
    close: bool,
    http10: bool,
    keep_alive: bool,
}

/// Finds the end of the head. Returns the length of the head including the
/// empty line.
fn head_len(src: &[u8]) -> Option<usize> {
    for i in 0..src.len() {
        if src[i..].starts_with(b"\r\n\r\n") {
            return Some(i + 4);
        }
        if src[i..].starts_with(b"\n\n") {
            return Some(i + 2);
        }
    }

    None
}

fn parse_head(raw: &[u8]) -> io::Result<Head> {
    let raw = std::str::from_utf8(raw).map_err(|_| invalid("message head is not utf-8"))?;
    let mut lines = raw.split('\n').map(|line| line.trim_end_matches('\r'));

    let start_line = lines.next().unwrap_or_default().to_string();
    if start_line.is_empty() {
        return Err(invalid("empty start line"));
    }

    let mut head = Head {
        http10: start_line.contains("HTTP/1.0"),
        start_line,
        content_length: 0,
        close: false,
        keep_alive: false,
    };

    for line in lines.filter(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(&format!("malformed header: {}", line)))?;
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            head.content_length = value
                .parse::<usize>()
                .map_err(|_| invalid(&format!("bad content length: {}", value)))?;
            if head.content_length > BODY_MAX {
                return Err(invalid(&format!(
                    "body of length {} is too large",
                    head.content_length
                )));
            }
        } else if name.eq_ignore_ascii_case("connection") {
            head.close = value.eq_ignore_ascii_case("close");
            head.keep_alive = value.eq_ignore_ascii_case("keep-alive");
        }
    }

    Ok(head)
}

/// Splits one complete message (head and body) off the buffer, if it has
/// fully arrived.
fn split_message(src: &mut BytesMut) -> io::Result<Option<(Head, Bytes)>> {
    let head_len = match head_len(&src[..]) {
        Some(len) => len,
        None => {
            // Check the size so that a client can not make the server buffer
            // an endless head.
            if src.len() > HEAD_MAX {
                return Err(invalid(&format!("head of {} bytes is too large", src.len())));
            }
            return Ok(None);
        }
    };

    if head_len > HEAD_MAX {
        return Err(invalid(&format!("head of {} bytes is too large", head_len)));
    }

    let head = parse_head(&src[..head_len])?;

    let total = head_len + head.content_length;
    if src.len() < total {
        // Body has not yet arrived.
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(head_len);
    let body = src.split_to(head.content_length).freeze();

    Ok(Some((head, body)))
}

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (head, _body) = match split_message(src)? {
            Some(message) => message,
            None => return Ok(None),
        };

        let mut parts = head.start_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(target), Some(version)) if parts.next().is_none() => {
                (method, target, version)
            }
            _ => return Err(invalid(&format!("malformed request line: {}", head.start_line))),
        };

        if !version.starts_with("HTTP/1.") {
            return Err(invalid(&format!("unsupported protocol: {}", version)));
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, Vec::new()),
        };

        Ok(Some(Request {
            method: method.to_string(),
            path: path.to_string(),
            query,
            close: head.close || (head.http10 && !head.keep_alive),
        }))
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut head = String::new();
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n",
            item.status.code(),
            item.status.reason(),
            item.body.len()
        );
        if item.close {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        dst.reserve(head.len() + item.body.len());
        dst.put_slice(head.as_bytes());
        dst.put_slice(&item.body);

        Ok(())
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut head = String::new();
        let _ = write!(
            head,
            "{} {} HTTP/1.1\r\nHost: lsmkv\r\nContent-Length: 0\r\n",
            item.method,
            item.target()
        );
        if item.close {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        dst.put_slice(head.as_bytes());

        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (head, body) = match split_message(src)? {
            Some(message) => message,
            None => return Ok(None),
        };

        let mut parts = head.start_line.splitn(3, ' ');
        let code = match (parts.next(), parts.next()) {
            (Some(version), Some(code)) if version.starts_with("HTTP/1.") => code,
            _ => return Err(invalid(&format!("malformed status line: {}", head.start_line))),
        };
        let status = code
            .parse::<u16>()
            .ok()
            .and_then(Status::from_code)
            .ok_or_else(|| invalid(&format!("unexpected status: {}", code)))?;

        Ok(Some(Response {
            status,
            body,
            close: head.close,
        }))
    }
}

/// Splits a query string into decoded key/value pairs, keeping their order.
/// A pair without `=` gets an empty value.
pub fn parse_query(query: &str) -> Vec<(Bytes, Bytes)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            (
                percent_decode(key.as_bytes()),
                percent_decode(value.as_bytes()),
            )
        })
        .collect()
}

/// Decodes `%XX` escapes and `+` as a space. Broken escapes are kept as they are.
pub fn percent_decode(input: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            b'+' => {
                out.put_u8(b' ');
                i += 1;
            }
            b'%' if i + 2 < input.len() => {
                match (hex_value(input[i + 1]), hex_value(input[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.put_u8(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.put_u8(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.put_u8(byte);
                i += 1;
            }
        }
    }

    out.freeze()
}

/// Escapes everything except the unreserved characters.
pub fn percent_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{:02X}", byte);
        }
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
