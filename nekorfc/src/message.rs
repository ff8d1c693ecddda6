//! Textual request/response codec carried inside frames.
//!
//! Messages borrow the shape of HTTP/1.1: a start line, `Key: Value` headers separated by CRLF,
//! a blank line and an optional body whose size is given by `Content-Length`.

use std::fmt;

/// Protocol version written on every start line
pub const VERSION: &str = "HTTP/1.1";

/// Success
pub const OK: u16 = 200;

/// Failure of any kind
pub const FORBIDDEN: u16 = 403;

const CRLF: &str = "\r\n";
const SEPARATOR: &[u8] = b"\r\n\r\n";

/// Error decoding a message payload.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message is not valid utf-8")]
    Encoding,
    #[error("malformed start line {0:?}")]
    StartLine(String),
    #[error("malformed header {0:?}")]
    Header(String),
    #[error("body shorter than Content-Length ({expected} > {got})")]
    Body { expected: usize, got: usize },
}

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    /// Set `key`, replacing an existing value in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        let key = key.into();
        let value = value.to_string();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A decoded request: `COMMAND TARGET VERSION`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(command: impl Into<String>, target: impl Into<String>) -> Self {
        Request {
            command: command.into(),
            target: target.into(),
            version: VERSION.to_owned(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Attach the informational `Host` and `OS` headers sent by every node
    pub fn with_default_headers(self, host: &str) -> Self {
        self.header("Host", host).header("OS", platform())
    }

    /// Check that the start line and headers survive encoding unchanged
    ///
    /// Command and target must be non-empty words; header names and values may not break lines.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !is_token(&self.command) || !is_token(&self.target) {
            return Err(ProtocolError::StartLine(self.to_string()));
        }
        for (key, value) in self.headers.iter() {
            if !is_token(key) || key.contains(':') || value.contains(['\r', '\n']) {
                return Err(ProtocolError::Header(format!("{key}: {value}")));
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let start = format!("{} {} {}", self.command, self.target, self.version);
        encode(&start, &self.headers, &self.body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (start, headers, body) = decode(bytes)?;
        let mut parts = start.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(command), Some(target), Some(version))
                if !command.is_empty() && !target.is_empty() && !version.contains(' ') =>
            {
                Ok(Request {
                    command: command.to_owned(),
                    target: target.to_owned(),
                    version: version.to_owned(),
                    headers,
                    body,
                })
            }
            _ => Err(ProtocolError::StartLine(start.to_owned())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.command, self.target, self.version)
    }
}

/// A decoded response: `VERSION STATUS REASON`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            version: VERSION.to_owned(),
            status,
            reason: reason(status).to_owned(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Response::new(OK)
    }

    pub fn forbidden() -> Self {
        Response::new(FORBIDDEN)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == OK
    }

    pub fn encode(&self) -> Vec<u8> {
        let start = format!("{} {} {}", self.version, self.status, self.reason);
        encode(&start, &self.headers, &self.body)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (start, headers, body) = decode(bytes)?;
        let bad = || ProtocolError::StartLine(start.to_owned());
        let mut parts = start.splitn(3, ' ');
        let version = parts.next().filter(|v| !v.is_empty()).ok_or_else(bad)?;
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(bad)?;
        let reason = parts.next().unwrap_or_default();
        Ok(Response {
            version: version.to_owned(),
            status,
            reason: reason.to_owned(),
            headers,
            body,
        })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.version, self.status, self.reason)
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        OK => "OK",
        FORBIDDEN => "Forbidden",
        _ => "Unknown",
    }
}

fn is_token(word: &str) -> bool {
    !word.is_empty() && !word.contains(char::is_whitespace)
}

fn platform() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

fn encode(start: &str, headers: &Headers, body: &[u8]) -> Vec<u8> {
    let mut head = String::from(start);
    head.push_str(CRLF);
    for (key, value) in headers.iter() {
        if key.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        head.push_str(&format!("{key}: {value}{CRLF}"));
    }
    if !body.is_empty() {
        head.push_str(&format!("Content-Length: {}{CRLF}", body.len()));
    }
    head.push_str(CRLF);

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

fn decode(bytes: &[u8]) -> Result<(&str, Headers, Vec<u8>), ProtocolError> {
    // a message without a blank line is treated as head only
    let (head, rest) = match bytes.windows(SEPARATOR.len()).position(|w| w == SEPARATOR) {
        Some(i) => (&bytes[..i], &bytes[i + SEPARATOR.len()..]),
        None => (bytes, &[][..]),
    };
    let head = std::str::from_utf8(head).map_err(|_| ProtocolError::Encoding)?;

    let mut lines = head.split(CRLF);
    let start = lines.next().unwrap_or_default();
    if start.trim().is_empty() {
        return Err(ProtocolError::StartLine(start.to_owned()));
    }

    let mut headers = Headers::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::Header(line.to_owned()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ProtocolError::Header(line.to_owned()));
        }
        headers.insert(key, value.trim());
    }

    let body = match headers.get("Content-Length") {
        Some(len) => {
            let expected: usize = len
                .parse()
                .map_err(|_| ProtocolError::Header(format!("Content-Length: {len}")))?;
            if rest.len() < expected {
                return Err(ProtocolError::Body {
                    expected,
                    got: rest.len(),
                });
            }
            rest[..expected].to_vec()
        }
        None => Vec::new(),
    };

    Ok((start, headers, body))
}
