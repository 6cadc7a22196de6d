//! CGI/1.1 driver.
//!
//! A resolved CGI resource is executed as a child process: the request body
//! arrives on its stdin, its stdout is spooled to a temp file, and the
//! CGI/1.1 variables are its entire environment. Nothing here blocks the
//! event loop: [`CgiProcess::spawn`] starts the child and returns, and the
//! connection checks [`CgiProcess::poll`] once per loop tick. A child that
//! outlives the gateway timeout gets SIGTERM (then SIGKILL after a grace
//! period) and the client a `504`; a child that exits non-zero gets them a
//! `502`.

use crate::config::Config;
use crate::request::Request;
use crate::resolve::{cgi_script_end, Resource};
use crate::response::{self, Response};
use crate::status;
use convert_case::{Case, Casing};
use std::io::{self, Read, Write};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;

pub const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);
const TERM_GRACE: Duration = Duration::from_millis(500);

/// A running CGI child plus everything needed to finish the exchange.
///
/// Dropping the handle kills and reaps the child, so a connection that
/// goes away mid-script leaves no zombie behind.
pub struct CgiProcess {
    child: Child,
    spool: NamedTempFile,
    script: String,
    started: Instant,
    timeout: Duration,
    /// When SIGTERM was sent, if the child overran the timeout.
    terminated_at: Option<Instant>,
    killed: bool,
}

impl CgiProcess {
    /// Builds the environment, starts the script, and feeds it the request
    /// body. The returned handle must be polled to completion.
    pub fn spawn(
        request: &Request,
        resource: &Resource,
        config: &Config,
        peer_ip: &str,
        server_port: u16,
        body: &[u8],
        timeout: Duration,
    ) -> io::Result<CgiProcess> {
        let env = build_env(request, resource, config, peer_ip, server_port);
        let spool = NamedTempFile::new()?;
        let stdout = spool.reopen()?;

        let mut child = Command::new(&resource.path)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // A script may exit without draining its input; its exit status
            // is what decides the outcome, not this write.
            let _ = stdin.write_all(body);
        }

        Ok(CgiProcess {
            child,
            spool,
            script: resource.path.clone(),
            started: Instant::now(),
            timeout,
            terminated_at: None,
            killed: false,
        })
    }

    /// Non-blocking completion check. Returns `None` while the child is
    /// still running (sending signals along the way once the timeout is
    /// spent), and the finished response as soon as it has been reaped.
    pub fn poll(&mut self, config: &Config, resource: &Resource) -> Option<Response> {
        match self.child.try_wait() {
            Ok(Some(exit)) => {
                if self.terminated_at.is_some() {
                    log::error!("CGI error 504: `{}` timed out", self.script);
                    return Some(response::error(status::GATEWAY_TIMEOUT, config, resource));
                }
                if !exit.success() {
                    log::error!("CGI error 502: `{}` exited with {exit}", self.script);
                    return Some(response::error(status::BAD_GATEWAY, config, resource));
                }
                match self.read_output() {
                    Ok(output) => Some(merge_output(&output)),
                    Err(error) => {
                        log::error!(error:err = error; "CGI error 502: could not read script output");
                        Some(response::error(status::BAD_GATEWAY, config, resource))
                    }
                }
            }
            Ok(None) => {
                let now = Instant::now();
                match self.terminated_at {
                    // SIGTERM rather than SIGKILL so the script can clean up
                    None if self.started.elapsed() > self.timeout => {
                        unsafe {
                            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
                        }
                        self.terminated_at = Some(now);
                    }
                    Some(when) if !self.killed && now.duration_since(when) > TERM_GRACE => {
                        let _ = self.child.kill();
                        self.killed = true;
                    }
                    _ => {}
                }
                None
            }
            Err(error) => {
                log::error!(error:err = error; "CGI error 502: could not wait on `{}`", self.script);
                let _ = self.child.kill();
                let _ = self.child.wait();
                Some(response::error(status::BAD_GATEWAY, config, resource))
            }
        }
    }

    fn read_output(&self) -> io::Result<Vec<u8>> {
        let mut output = Vec::new();
        self.spool.reopen()?.read_to_end(&mut output)?;
        Ok(output)
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Builds the CGI/1.1 environment for the request, in the order the
/// variables are conventionally listed.
fn build_env(
    request: &Request,
    resource: &Resource,
    config: &Config,
    peer_ip: &str,
    server_port: u16,
) -> Vec<(String, String)> {
    let url = &resource.original_request;
    let route = resource.route_in(config);

    let script_end = route
        .and_then(|route| cgi_script_end(url, route))
        .unwrap_or(url.len());
    let script_name = &url[..script_end];
    let path_info = &url[script_end..];

    let method = request.method.map(|m| m.as_str()).unwrap_or("GET");

    let mut env: Vec<(String, String)> = vec![
        ("SERVER_SOFTWARE".into(), format!("veranda/{}", env!("CARGO_PKG_VERSION"))),
        ("GATEWAY_INTERFACE".into(), "CGI/1.1".into()),
        ("SERVER_PROTOCOL".into(), "HTTP/1.1".into()),
        ("SERVER_NAME".into(), request.hostname.clone()),
        ("SERVER_PORT".into(), server_port.to_string()),
        ("REQUEST_METHOD".into(), method.into()),
        ("REMOTE_ADDR".into(), peer_ip.into()),
        ("SCRIPT_NAME".into(), script_name.into()),
        ("SCRIPT_FILENAME".into(), resource.path.clone()),
    ];

    if !path_info.is_empty() {
        env.push(("PATH_INFO".into(), path_info.into()));
        let translated = route
            .and_then(|route| route.serve_dir())
            .map(|dir| format!("{dir}{path_info}"))
            .unwrap_or_else(|| format!(".{path_info}"));
        env.push(("PATH_TRANSLATED".into(), translated));
    }

    env.push(("QUERY_STRING".into(), request.query.clone()));
    env.push(("REQUEST_URI".into(), request.target.clone()));
    env.push(("URL".into(), format!("{script_name}{path_info}")));

    if let Some(content_type) = request.headers.get("content-type") {
        env.push(("CONTENT_TYPE".into(), content_type.clone()));
    }
    if let Some(content_length) = request.headers.get("content-length") {
        env.push(("CONTENT_LENGTH".into(), content_length.clone()));
    }

    for (key, value) in &request.headers {
        if key == "content-type" || key == "content-length" {
            continue;
        }
        let name = format!("HTTP_{}", key.to_case(Case::ScreamingSnake));
        env.push((name, value.clone()));
    }

    env
}

/// Splits CGI output at the first blank line and merges the header block
/// into an HTTP response. A `Status:` field overrides the response code.
/// Output with no header block at all becomes the whole body.
fn merge_output(output: &[u8]) -> Response {
    let Some((header_block, body)) = split_output(output) else {
        return Response::new(status::OK)
            .set_header("Content-Type", "text/html; charset=UTF-8")
            .set_body(output.to_vec());
    };

    let mut response = Response::new(status::OK).set_body(body.to_vec());
    for line in header_block.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).unwrap_or("").trim_end_matches('\r');
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("status") {
            let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(code) = digits.parse() {
                response = response.set_status(code);
            }
        } else if key.eq_ignore_ascii_case("content-length") {
            // Recomputed at serialization time
        } else {
            response = response.set_header(key, value);
        }
    }
    response
}

fn split_output(output: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = output.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = output.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if c < l => Some((&output[..c], &output[c + 4..])),
        (_, Some(l)) => Some((&output[..l], &output[l + 2..])),
        (Some(c), None) => Some((&output[..c], &output[c + 4..])),
        (None, None) => None,
    }
}
