//! Response construction and serialization.
//!
//! A [`Response`] collects a status, headers, and a body, then flattens into
//! wire bytes once. The common headers (`Server`, `Date`, `Content-Length`,
//! `Connection`) are stamped on during serialization so individual builders
//! only deal with what is specific to them.

use crate::config::Config;
use crate::pages;
use crate::resolve::Resource;
use crate::status;
use filetime::FileTime;
use std::fs;
use std::io;

const SERVER_SOFTWARE: &str = concat!("veranda/", env!("CARGO_PKG_VERSION"));
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Clone, Default)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    head_only: bool,
    keep_alive: bool,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            ..Response::default()
        }
    }

    /// Appends a response header. Serialization order follows insertion
    /// order.
    pub fn set_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Response {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn set_body(mut self, body: Vec<u8>) -> Response {
        self.body = body;
        self
    }

    pub fn set_status(mut self, status: u16) -> Response {
        self.status = status;
        self
    }

    /// Keeps the headers (including `Content-Length`) but drops the body
    /// from the wire format, as HEAD responses require.
    pub fn head_only(mut self) -> Response {
        self.head_only = true;
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Response {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Serializes the response: status line, common headers, collected
    /// headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(self.body.len() + 256);
        let reason = status::reason(self.status);
        wire.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());
        wire.extend_from_slice(format!("Server: {SERVER_SOFTWARE}\r\n").as_bytes());
        wire.extend_from_slice(format!("Date: {}\r\n", http_date()).as_bytes());
        for (key, value) in &self.headers {
            wire.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        wire.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        if self.keep_alive {
            wire.extend_from_slice(b"Connection: keep-alive\r\n");
        }
        wire.extend_from_slice(b"\r\n");
        if !self.head_only {
            wire.extend_from_slice(&self.body);
        }
        wire
    }
}

fn http_date() -> String {
    jiff::Timestamp::now().strftime(HTTP_DATE_FORMAT).to_string()
}

/// A `200` carrying the file at `path`, with its MIME type detected from the
/// extension and its mtime as `Last-Modified`.
pub fn file(path: &str) -> io::Result<Response> {
    let body = fs::read(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    let mut response = Response::new(status::OK)
        .set_header("Content-Type", mime.essence_str())
        .set_body(body);

    if let Ok(meta) = fs::metadata(path) {
        let mtime = FileTime::from_last_modification_time(&meta).unix_seconds();
        if let Ok(timestamp) = jiff::Timestamp::from_second(mtime) {
            response = response.set_header(
                "Last-Modified",
                timestamp.strftime(HTTP_DATE_FORMAT).to_string(),
            );
        }
    }
    Ok(response)
}

pub fn html(status: u16, page: String) -> Response {
    Response::new(status)
        .set_header("Content-Type", "text/html; charset=UTF-8")
        .set_body(page.into_bytes())
}

pub fn empty(status: u16) -> Response {
    Response::new(status)
}

pub fn redirect(status: u16, location: &str) -> Response {
    Response::new(status).set_header("Location", location)
}

/// An error response for `code`: the server block's configured error page
/// when one exists and is readable, the built-in stub otherwise.
pub fn error(code: u16, config: &Config, resource: &Resource) -> Response {
    let configured = resource
        .server_block(config)
        .and_then(|server| server.error_pages.get(&code))
        .and_then(|path| fs::read_to_string(path).ok());
    let page = configured.unwrap_or_else(|| pages::error_page(code));
    html(code, page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::ResourceKind;
    use std::collections::BTreeMap;

    fn wire_string(response: &Response) -> String {
        String::from_utf8(response.to_bytes()).unwrap()
    }

    #[test]
    fn status_line_and_common_headers() {
        let response = html(404, "<html>gone</html>".to_string());
        let wire = wire_string(&response);

        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("Server: veranda/"));
        assert!(wire.contains("Date: "));
        assert!(wire.contains("Content-Type: text/html; charset=UTF-8\r\n"));
        assert!(wire.contains("Content-Length: 17\r\n"));
        assert!(wire.ends_with("\r\n\r\n<html>gone</html>"));
        // Not kept alive by default
        assert!(!wire.contains("Connection: keep-alive"));
    }

    #[test]
    fn keep_alive_header() {
        let response = empty(204).keep_alive(true);
        assert!(wire_string(&response).contains("Connection: keep-alive\r\n"));
    }

    #[test]
    fn head_strips_body_but_keeps_length() {
        let response = html(200, "<html>page</html>".to_string()).head_only();
        let wire = wire_string(&response);
        assert!(wire.contains("Content-Length: 17\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn redirect_sets_location() {
        let response = redirect(302, "https://example.com/next");
        let wire = wire_string(&response);
        assert!(wire.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(wire.contains("Location: https://example.com/next\r\n"));
    }

    #[test]
    fn file_response_detects_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("style.css");
        fs::write(&path, "body {}").unwrap();

        let response = file(path.to_str().unwrap()).unwrap();
        let wire = wire_string(&response);
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Type: text/css\r\n"));
        assert!(wire.contains("Last-Modified: "));
        assert!(wire.ends_with("body {}"));

        let unknown = dir.path().join("blob.qqq");
        fs::write(&unknown, [0u8, 1, 2]).unwrap();
        let response = file(unknown.to_str().unwrap()).unwrap();
        assert!(wire_string(&response).contains("Content-Type: application/octet-stream\r\n"));
    }

    #[test]
    fn error_prefers_the_configured_page() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("404.html");
        fs::write(&page, "<html>custom 404</html>").unwrap();

        let mut config = Config::builtin();
        config.servers[0].error_pages = BTreeMap::from([(
            404,
            camino::Utf8PathBuf::from(page.to_str().unwrap()),
        )]);

        let resource = Resource {
            kind: ResourceKind::NotFound,
            original_request: "/gone".to_string(),
            path: String::new(),
            server: Some(0),
            route: Some("/".to_string()),
        };

        let wire = wire_string(&error(404, &config, &resource));
        assert!(wire.ends_with("<html>custom 404</html>"));

        // No configured page for this code: the stub is used
        let wire = wire_string(&error(405, &config, &resource));
        assert!(wire.contains("ERROR 405 Method Not Allowed"));
    }
}
