//! Incremental parsing of HTTP/1.1 request heads.
//!
//! The connection accumulates raw bytes and re-runs [`Request::parse_head`]
//! after every read. The head is complete once a double CRLF shows up;
//! anything malformed inside it flips `valid` to false, and the request is
//! still dispatched so the client gets a `400` instead of a dropped
//! connection.

use crate::config::Method;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_HOSTNAME: &str = "localhost";
const DEFAULT_KEEP_ALIVE_SECS: u64 = 5;
const MAX_KEEP_ALIVE_SECS: u64 = 70;
const DEFAULT_RECONNECTIONS: u32 = 100;
const MAX_RECONNECTIONS: u32 = 100;

/// A parsed request head plus the fields derived from it.
#[derive(Debug, Clone)]
pub struct Request {
    /// `None` when the start line did not carry a supported method.
    pub method: Option<Method>,
    /// The request target exactly as it appeared on the start line.
    pub target: String,
    /// The sanitized target: percent-decoded, `+` replaced by space, query
    /// stripped.
    pub url: String,
    /// The raw query string (without the `?`), kept for CGI.
    pub query: String,
    /// Header fields with case-folded keys. Duplicates: last write wins.
    pub headers: BTreeMap<String, String>,
    /// Offset of the first body byte in the connection's raw buffer.
    pub body_start: usize,
    pub hostname: String,
    pub keep_alive: bool,
    pub keep_alive_timeout: Duration,
    pub max_reconnections: u32,
    pub valid: bool,
}

impl Request {
    /// Attempts to parse a request head out of `raw`. Returns `None` while
    /// the double CRLF terminating the head has not arrived yet.
    pub fn parse_head(raw: &[u8]) -> Option<Request> {
        let head_end = find_double_crlf(raw)?;
        let body_start = head_end + 4;

        let mut request = Request {
            method: None,
            target: String::new(),
            url: String::new(),
            query: String::new(),
            headers: BTreeMap::new(),
            body_start,
            hostname: DEFAULT_HOSTNAME.to_string(),
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            max_reconnections: DEFAULT_RECONNECTIONS,
            valid: true,
        };

        let Ok(head) = std::str::from_utf8(&raw[..head_end]) else {
            request.valid = false;
            return Some(request);
        };

        if let Err(()) = request.parse_lines(head) {
            log::warn!("invalid request head");
            request.valid = false;
            return Some(request);
        }

        request.hostname = request.parse_hostname();
        let (keep_alive, timeout) = request.parse_keep_alive();
        request.keep_alive = keep_alive;
        request.keep_alive_timeout = timeout;
        request.max_reconnections = request.parse_max_reconnections();
        Some(request)
    }

    fn parse_lines(&mut self, head: &str) -> Result<(), ()> {
        let mut lines = head.split("\r\n");
        let start_line = lines.next().ok_or(())?;
        self.parse_start_line(start_line)?;
        for line in lines {
            self.parse_header(line)?;
        }
        Ok(())
    }

    fn parse_start_line(&mut self, line: &str) -> Result<(), ()> {
        let mut parts = line.split_whitespace();
        let method = parts.next().ok_or(())?;
        let target = parts.next().ok_or(())?;
        let version = parts.next().ok_or(())?;
        if parts.next().is_some() {
            return Err(());
        }

        self.method = Some(Method::parse(method).ok_or(())?);
        if version != "HTTP/1.0" && version != "HTTP/1.1" {
            return Err(());
        }

        self.target = target.to_string();
        self.query = match target.find('?') {
            Some(pos) => target[pos + 1..].to_string(),
            None => String::new(),
        };
        self.url = sanitize_url(target);
        Ok(())
    }

    fn parse_header(&mut self, line: &str) -> Result<(), ()> {
        let (key, value) = line.split_once(':').ok_or(())?;
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(());
        }
        let value = value.trim_matches(|c: char| c.is_ascii_whitespace());
        if value.is_empty() {
            return Err(());
        }
        self.headers
            .insert(key.to_ascii_lowercase(), value.to_string());
        Ok(())
    }

    fn parse_hostname(&self) -> String {
        let Some(host) = self.headers.get("host") else {
            return DEFAULT_HOSTNAME.to_string();
        };
        let host = match host.split_once(':') {
            Some((name, _port)) => name,
            None => host.as_str(),
        };
        // An all-digit value is a bare port, not a hostname
        if host.bytes().all(|b| b.is_ascii_digit()) {
            return DEFAULT_HOSTNAME.to_string();
        }
        let host = host.to_ascii_lowercase();
        if !crate::config::validators::valid_hostname(&host) {
            return DEFAULT_HOSTNAME.to_string();
        }
        host
    }

    fn parse_keep_alive(&self) -> (bool, Duration) {
        if let Some(connection) = self.headers.get("connection") {
            if connection.eq_ignore_ascii_case("close") {
                return (false, Duration::ZERO);
            }
        }
        let timeout = match keep_alive_field(self.headers.get("keep-alive"), "timeout=") {
            Some(seconds) => seconds.min(MAX_KEEP_ALIVE_SECS),
            None => DEFAULT_KEEP_ALIVE_SECS,
        };
        (true, Duration::from_secs(timeout))
    }

    fn parse_max_reconnections(&self) -> u32 {
        match keep_alive_field(self.headers.get("keep-alive"), "max=") {
            Some(max) => (max as u32).min(MAX_RECONNECTIONS),
            None => DEFAULT_RECONNECTIONS,
        }
    }

    /// The body length announced by the request, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("content-length")?.parse().ok()
    }
}

/// Pulls the number after `field` (e.g. `timeout=`) out of a `Keep-Alive`
/// header value like `timeout=5, max=1000`.
fn keep_alive_field(value: Option<&String>, field: &str) -> Option<u64> {
    let value = value?;
    let rest = &value[value.find(field)? + field.len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn find_double_crlf(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Cleans a request target: strips the query, replaces `+` with space, and
/// percent-decodes `%HH` pairs (invalid pairs are left alone).
///
/// The passes repeat until the string stops changing, which makes the whole
/// function idempotent even for inputs like `%253F` whose decoding exposes
/// further encoded characters.
pub fn sanitize_url(url: &str) -> String {
    let mut current = url.to_string();
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn sanitize_pass(url: &str) -> String {
    let stripped = match url.find('?') {
        Some(pos) => &url[..pos],
        None => url,
    };

    let bytes = stripped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                out.push(hex_value(bytes[i + 1]) << 4 | hex_value(bytes[i + 2]));
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit.to_ascii_uppercase() - b'A' + 10,
    }
}
