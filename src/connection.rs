//! Per-connection state.
//!
//! A connection owns its socket, its accumulated request bytes, and the
//! response being written back. The event loop only tells it when the
//! socket is readable or writable, and checks in once per tick; everything
//! else (head detection, body accounting, dispatch, partial writes,
//! keep-alive resets) happens here. None of it blocks: a request that
//! resolves to a CGI script parks the connection in an awaiting-CGI state
//! and the child is polled from the tick, so the rest of the loop keeps
//! being served while the script runs.
//!
//! ```text
//! Accepted -> ReadingHead -> HeadParsed -> [ReadingBody] -> Dispatching
//!          -> [AwaitingCgi] -> Writing -> Idle (keep-alive) or Closing
//! ```

use crate::cgi::{self, CgiProcess};
use crate::config::{Config, Method};
use crate::pages;
use crate::request::Request;
use crate::resolve::{self, Resource, ResourceKind};
use crate::response::{self, Response};
use crate::status;
use mio::net::TcpStream;
use std::fs;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

const STAGING_BUFFER_SIZE: usize = 8 * 1024;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// A dispatched request whose response is still in the hands of a CGI
/// child. Carries what is needed to finish and log the exchange.
struct PendingCgi {
    process: CgiProcess,
    resource: Resource,
    head_only: bool,
    method: &'static str,
    target: String,
}

pub struct Connection {
    stream: TcpStream,
    peer_ip: String,
    listener_port: u16,
    raw: Vec<u8>,
    request: Option<Request>,
    body_limit: u64,
    cgi: Option<PendingCgi>,
    write_buffer: Vec<u8>,
    total_sent: usize,
    responding: bool,
    keep_alive: bool,
    timeout: Duration,
    /// Exchanges still allowed on this connection, from `Keep-Alive: max=`.
    exchanges_left: u32,
    last_activity: Instant,
    dropped: bool,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_ip: String, listener_port: u16) -> Connection {
        Connection {
            stream,
            peer_ip,
            listener_port,
            raw: Vec::new(),
            request: None,
            body_limit: u64::MAX,
            cgi: None,
            write_buffer: Vec::new(),
            total_sent: 0,
            responding: false,
            keep_alive: false,
            timeout: DEFAULT_IDLE_TIMEOUT,
            exchanges_left: u32::MAX,
            last_activity: Instant::now(),
            dropped: false,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn listener_port(&self) -> u16 {
        self.listener_port
    }

    pub fn dropped(&self) -> bool {
        self.dropped
    }

    /// Whether a CGI child is still owed a completion check.
    pub fn cgi_pending(&self) -> bool {
        self.cgi.is_some()
    }

    /// Whether the connection has sat idle past its keep-alive timeout.
    /// A connection waiting on a CGI child is not idle; the child has its
    /// own deadline.
    pub fn expired(&self, now: Instant) -> bool {
        self.cgi.is_none() && now.duration_since(self.last_activity) > self.timeout
    }

    /// Drains the socket into the raw buffer and dispatches once a full
    /// request has arrived. Reads are ignored while a response is being
    /// produced or written; request/response pairs are strictly ordered.
    pub fn on_readable(&mut self, config: &Config) {
        if self.dropped || self.responding || self.cgi.is_some() {
            return;
        }
        let mut staging = [0u8; STAGING_BUFFER_SIZE];
        loop {
            match self.stream.read(&mut staging) {
                Ok(0) => {
                    self.dropped = true;
                    return;
                }
                Ok(n) => {
                    self.raw.extend_from_slice(&staging[..n]);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.dropped = true;
                    return;
                }
            }
            if self.request_ready(config) {
                break;
            }
        }
        if self.request_ready(config) {
            self.dispatch(config);
            // The socket is usually writable right away; waiting for the
            // next writability event would stall an edge-triggered poll.
            self.on_writable();
        }
    }

    /// Continues writing the pending response. Partial writes resume on the
    /// next writability event.
    pub fn on_writable(&mut self) {
        if self.dropped || !self.responding {
            return;
        }
        while self.total_sent < self.write_buffer.len() {
            match self.stream.write(&self.write_buffer[self.total_sent..]) {
                Ok(0) => {
                    self.dropped = true;
                    return;
                }
                Ok(n) => {
                    self.total_sent += n;
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.dropped = true;
                    return;
                }
            }
        }
        self.exchanges_left = self.exchanges_left.saturating_sub(1);
        if self.keep_alive && self.exchanges_left > 0 {
            self.reset();
        } else {
            self.dropped = true;
        }
    }

    /// Non-blocking check on a pending CGI child, called once per event-loop
    /// tick. Finishes the exchange as soon as the child has been reaped.
    pub fn poll_cgi(&mut self, config: &Config) {
        let Some(pending) = self.cgi.as_mut() else {
            return;
        };
        let Some(response) = pending.process.poll(config, &pending.resource) else {
            return;
        };
        let Some(pending) = self.cgi.take() else {
            return;
        };
        let response = if pending.head_only {
            response.head_only()
        } else {
            response
        };
        log_exchange(pending.method, &pending.target, response.status());
        self.start_response(response);
        self.on_writable();
    }

    /// True once the head is parsed and the announced body has either fully
    /// arrived or overrun the route's limit.
    fn request_ready(&mut self, config: &Config) -> bool {
        if self.request.is_none() {
            match Request::parse_head(&self.raw) {
                Some(request) => {
                    self.body_limit = resolve::body_limit(&request, config, self.listener_port);
                    self.request = Some(request);
                }
                None => return false,
            }
        }
        let Some(request) = &self.request else {
            return false;
        };
        let received = self.raw.len().saturating_sub(request.body_start) as u64;
        if received > self.body_limit {
            return true;
        }
        match request.content_length() {
            Some(expected) => received >= expected,
            None => true,
        }
    }

    fn dispatch(&mut self, config: &Config) {
        let Some(request) = self.request.take() else {
            return;
        };
        self.keep_alive = request.keep_alive && request.keep_alive_timeout > Duration::ZERO;
        self.exchanges_left = self.exchanges_left.min(request.max_reconnections);
        self.timeout = if self.keep_alive {
            request.keep_alive_timeout
        } else {
            DEFAULT_IDLE_TIMEOUT
        };

        let resource = resolve::resolve(&request, config, self.listener_port);
        let body_start = request.body_start.min(self.raw.len());
        let received = (self.raw.len() - body_start) as u64;
        let method = request.method.map(|m| m.as_str()).unwrap_or("???");

        if received > self.body_limit {
            log::error!(
                "request body exceeded the limit: size={received}, limit={}",
                self.body_limit
            );
            // Whatever the client is still sending will never be drained
            self.keep_alive = false;
            let error = response::error(status::PAYLOAD_TOO_LARGE, config, &resource);
            let error = if request.method == Some(Method::Head) {
                error.head_only()
            } else {
                error
            };
            log_exchange(method, &request.target, error.status());
            self.start_response(error);
            return;
        }

        let body = &self.raw[body_start..];
        match plan(&request, &resource, config, body) {
            Action::Respond(response) => {
                log_exchange(method, &request.target, response.status());
                self.start_response(response);
            }
            Action::Execute => {
                let spawned = CgiProcess::spawn(
                    &request,
                    &resource,
                    config,
                    &self.peer_ip,
                    self.listener_port,
                    body,
                    cgi::GATEWAY_TIMEOUT,
                );
                match spawned {
                    Ok(process) => {
                        log::debug!("waiting on CGI script {}", resource.path);
                        self.cgi = Some(PendingCgi {
                            process,
                            resource,
                            head_only: request.method == Some(Method::Head),
                            method,
                            target: request.target.clone(),
                        });
                    }
                    Err(error) => {
                        log::error!(error:err = error; "CGI error 502: could not start script");
                        let response = response::error(status::BAD_GATEWAY, config, &resource);
                        let response = if request.method == Some(Method::Head) {
                            response.head_only()
                        } else {
                            response
                        };
                        log_exchange(method, &request.target, response.status());
                        self.start_response(response);
                    }
                }
            }
        }
    }

    fn start_response(&mut self, response: Response) {
        self.write_buffer = response.keep_alive(self.keep_alive).to_bytes();
        self.total_sent = 0;
        self.responding = true;
    }

    /// Back to idle for the next exchange on this connection. Buffers are
    /// reused, not reallocated.
    fn reset(&mut self) {
        self.raw.clear();
        self.request = None;
        self.body_limit = u64::MAX;
        self.write_buffer.clear();
        self.total_sent = 0;
        self.responding = false;
        self.last_activity = Instant::now();
    }
}

fn log_exchange(method: &str, target: &str, status: u16) {
    log::info!("{method} {target} -> {status}");
}

/// What dispatch decided for a request: an immediate response, or a CGI
/// execution whose response arrives once the child finishes.
#[derive(Debug)]
enum Action {
    Respond(Response),
    Execute,
}

/// The (method, resource kind) table.
fn plan(request: &Request, resource: &Resource, config: &Config, body: &[u8]) -> Action {
    let Some(method) = request.method else {
        return Action::Respond(response::error(status::BAD_REQUEST, config, resource));
    };
    match method {
        Method::Get => respond_get(resource, config),
        Method::Post => respond_post(resource, config, body),
        Method::Put => respond_put(resource, config, body),
        Method::Delete => respond_delete(resource, config),
        Method::Head => match respond_get(resource, config) {
            Action::Respond(response) => Action::Respond(response.head_only()),
            Action::Execute => Action::Execute,
        },
    }
}

fn respond_get(resource: &Resource, config: &Config) -> Action {
    let response = match resource.kind {
        ResourceKind::Cgi => return Action::Execute,
        ResourceKind::ExistingFile => response::file(&resource.path)
            .unwrap_or_else(|_| response::error(status::NOT_FOUND, config, resource)),
        ResourceKind::Directory => {
            response::html(status::OK, pages::directory_listing(&resource.path))
        }
        ResourceKind::Redirection => response::redirect(status::FOUND, &resource.path),
        ResourceKind::ForbiddenMethod => {
            response::error(status::METHOD_NOT_ALLOWED, config, resource)
        }
        ResourceKind::NotFound | ResourceKind::NoMatch => {
            response::error(status::NOT_FOUND, config, resource)
        }
        ResourceKind::InvalidRequest => response::error(status::BAD_REQUEST, config, resource),
    };
    Action::Respond(response)
}

fn respond_post(resource: &Resource, config: &Config, body: &[u8]) -> Action {
    let response = match resource.kind {
        ResourceKind::Cgi => return Action::Execute,
        ResourceKind::ExistingFile => response::error(status::CONFLICT, config, resource),
        ResourceKind::Directory | ResourceKind::ForbiddenMethod => {
            response::error(status::METHOD_NOT_ALLOWED, config, resource)
        }
        ResourceKind::Redirection => {
            response::redirect(status::TEMPORARY_REDIRECT, &resource.path)
        }
        ResourceKind::NotFound => store_body(&resource.path, body, status::CREATED, config, resource),
        ResourceKind::NoMatch => response::error(status::NOT_FOUND, config, resource),
        ResourceKind::InvalidRequest => response::error(status::BAD_REQUEST, config, resource),
    };
    Action::Respond(response)
}

fn respond_put(resource: &Resource, config: &Config, body: &[u8]) -> Action {
    let response = match resource.kind {
        // PUT writes through to the script file rather than executing it
        ResourceKind::ExistingFile | ResourceKind::Cgi => {
            store_body(&resource.path, body, status::NO_CONTENT, config, resource)
        }
        ResourceKind::NotFound => store_body(&resource.path, body, status::CREATED, config, resource),
        ResourceKind::Directory | ResourceKind::ForbiddenMethod => {
            response::error(status::METHOD_NOT_ALLOWED, config, resource)
        }
        ResourceKind::Redirection => {
            response::redirect(status::TEMPORARY_REDIRECT, &resource.path)
        }
        ResourceKind::NoMatch => response::error(status::NOT_FOUND, config, resource),
        ResourceKind::InvalidRequest => response::error(status::BAD_REQUEST, config, resource),
    };
    Action::Respond(response)
}

fn respond_delete(resource: &Resource, config: &Config) -> Action {
    let response = match resource.kind {
        ResourceKind::ExistingFile | ResourceKind::Cgi => match fs::remove_file(&resource.path) {
            Ok(()) => response::empty(status::OK),
            Err(error) => {
                log::warn!(error:err = error; "could not delete file");
                response::error(status::INTERNAL_SERVER_ERROR, config, resource)
            }
        },
        ResourceKind::Directory | ResourceKind::ForbiddenMethod => {
            response::error(status::METHOD_NOT_ALLOWED, config, resource)
        }
        ResourceKind::Redirection => {
            response::redirect(status::TEMPORARY_REDIRECT, &resource.path)
        }
        ResourceKind::NotFound | ResourceKind::NoMatch => {
            response::error(status::NOT_FOUND, config, resource)
        }
        ResourceKind::InvalidRequest => response::error(status::BAD_REQUEST, config, resource),
    };
    Action::Respond(response)
}

/// Writes the request body to `path` and answers with `success` (`201` for
/// creations, `204` for overwrites).
fn store_body(
    path: &str,
    body: &[u8],
    success: u16,
    config: &Config,
    resource: &Resource,
) -> Response {
    match fs::write(path, body) {
        Ok(()) => response::empty(success),
        Err(error) => {
            log::warn!(error:err = error; "could not store request body");
            response::error(status::INTERNAL_SERVER_ERROR, config, resource)
        }
    }
}
