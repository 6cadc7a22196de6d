//! The listener pool and the event loop.
//!
//! One non-blocking listener per distinct configured port, every accepted
//! connection registered for both readability and writability, all of it
//! multiplexed on a single thread through `mio::Poll`. The poll call wakes
//! at least once a second so idle connections can be swept even when no
//! traffic arrives, and drops to a much shorter timeout while any CGI
//! child is outstanding so completions are picked up promptly without
//! ever blocking a handler on the child.
//!
//! Graceful shutdown works the way it has to with mio: the server thread
//! blocks on `poll()`, so [`ServerHandle::stop`] wakes it with a `Waker`
//! registered under a reserved token, and a zero-capacity channel acts as
//! the rendezvous point between the two threads.

use crate::config::Config;
use crate::connection::Connection;
use crate::error::StartupError;
use crate::pages;
use crate::response;
use crate::status;
use mio::event::Events;
use mio::net::TcpListener;
use mio::{Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const SHUTDOWN: Token = Token(0);
const FIRST_LISTENER: Token = Token(1);
const TICK: Duration = Duration::from_secs(1);
/// Poll timeout while at least one connection is waiting on a CGI child.
const CGI_TICK: Duration = Duration::from_millis(20);

/// How many live connections a single listener will carry before excess
/// accepts are answered with a `503` and closed.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

struct Listener {
    socket: TcpListener,
    /// The configured port, which is also the virtual-server identity. The
    /// actually bound port can differ when the configuration says `0`.
    port: u16,
}

struct EventLoop {
    config: Config,
    poll: Poll,
    events: Events,
    listeners: HashMap<Token, Listener>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    max_connections: usize,
    signal_shutdown: SyncSender<()>,
}

/// Binds every configured port and starts the event loop on its own thread.
pub fn start(config: Config) -> Result<ServerHandle, StartupError> {
    start_with_limit(config, DEFAULT_MAX_CONNECTIONS)
}

/// [`start`], with a custom per-listener connection limit.
pub fn start_with_limit(
    config: Config,
    max_connections: usize,
) -> Result<ServerHandle, StartupError> {
    if config.servers.is_empty() {
        return Err(StartupError::Io(io::Error::from(
            io::ErrorKind::InvalidInput,
        )));
    }

    let poll = Poll::new()?;
    let events = Events::with_capacity(256);
    let server_waker = Waker::new(poll.registry(), SHUTDOWN)?;

    let mut listeners = HashMap::new();
    let mut addresses = Vec::new();
    for (index, port) in config.ports().into_iter().enumerate() {
        let requested = SocketAddr::from(([0, 0, 0, 0], port));
        let mut socket =
            TcpListener::bind(requested).map_err(|source| StartupError::Bind { port, source })?;
        let bound = socket.local_addr()?;
        let token = Token(FIRST_LISTENER.0 + index);
        poll.registry()
            .register(&mut socket, token, Interest::READABLE)?;
        log::info!("listening on {bound}");
        addresses.push(bound);
        listeners.insert(token, Listener { socket, port });
    }

    let next_token = FIRST_LISTENER.0 + listeners.len();
    let (signal_shutdown, observe_shutdown) = sync_channel(0);

    let event_loop = EventLoop {
        config,
        poll,
        events,
        listeners,
        connections: HashMap::new(),
        next_token,
        max_connections,
        signal_shutdown,
    };

    let server_loop = std::thread::spawn(move || run(event_loop));

    Ok(ServerHandle {
        addresses,
        server_loop,
        server_waker,
        observe_shutdown,
    })
}

fn run(mut evloop: EventLoop) -> ServerExitReason {
    loop {
        let tick = if evloop.connections.values().any(Connection::cgi_pending) {
            CGI_TICK
        } else {
            TICK
        };
        match evloop.poll.poll(&mut evloop.events, Some(tick)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!(error:err = err; "poll call failed. Server loop will exit");
                return ServerExitReason::Err(err);
            }
        }

        let ready: Vec<(Token, bool, bool)> = evloop
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == SHUTDOWN {
                if evloop.signal_shutdown.send(()).is_err() {
                    log::error!("failed to notify the stopping thread of shutdown");
                }
                return ServerExitReason::Normal;
            }
            if evloop.listeners.contains_key(&token) {
                evloop.accept_from(token);
                continue;
            }
            if let Some(connection) = evloop.connections.get_mut(&token) {
                if readable {
                    connection.on_readable(&evloop.config);
                }
                if writable {
                    connection.on_writable();
                }
            }
        }

        // CGI children are owned by their connections but checked from
        // here, between events, so no handler ever waits on one
        for connection in evloop.connections.values_mut() {
            connection.poll_cgi(&evloop.config);
        }

        evloop.sweep();
    }
}

impl EventLoop {
    /// Accepts until the listener would block. Each accepted socket is
    /// registered once for both interests and drained on events.
    fn accept_from(&mut self, token: Token) {
        loop {
            let (port, result) = match self.listeners.get(&token) {
                Some(listener) => (listener.port, listener.socket.accept()),
                None => return,
            };
            match result {
                Ok((mut stream, peer)) => {
                    let open = self
                        .connections
                        .values()
                        .filter(|c| c.listener_port() == port)
                        .count();
                    if open >= self.max_connections {
                        log::warn!("connection limit reached on port {port}, answering 503");
                        let wire = response::html(
                            status::SERVICE_UNAVAILABLE,
                            pages::error_page(status::SERVICE_UNAVAILABLE),
                        )
                        .to_bytes();
                        let _ = stream.write(&wire);
                        continue;
                    }

                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(err) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::warn!(error:err = err; "could not register connection");
                        continue;
                    }
                    log::debug!("accepted connection from {peer} on port {port}");
                    self.connections
                        .insert(token, Connection::new(stream, peer.ip().to_string(), port));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!(error:err = err; "accept failed");
                    break;
                }
            }
        }
    }

    /// Closes connections that were dropped by their handler or have been
    /// idle past their keep-alive timeout.
    fn sweep(&mut self) {
        let now = Instant::now();
        let dead: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.dropped() || connection.expired(now))
            .map(|(token, _)| *token)
            .collect();
        for token in dead {
            if let Some(mut connection) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(connection.stream_mut());
            }
        }
    }
}

/// The reason the server exited
#[derive(Debug, Default)]
pub enum ServerExitReason {
    /// It was gracefully shut down
    #[default]
    Normal,
    /// Polling for events failed somehow
    Err(io::Error),
    /// The server panicked. The payload will contain the panic message.
    Panic(String),
}

/// Handle to a running server
pub struct ServerHandle {
    addresses: Vec<SocketAddr>,
    server_loop: JoinHandle<ServerExitReason>,
    server_waker: Waker,
    observe_shutdown: Receiver<()>,
}

impl ServerHandle {
    /// The first bound address. Useful after binding port `0`.
    pub fn address(&self) -> SocketAddr {
        self.addresses[0]
    }

    /// Every bound address, one per distinct configured port.
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    /// Blocks until the server terminates and returns the reason.
    ///
    /// This function does not attempt to stop the server. If you want to
    /// stop it, use [`stop()`](ServerHandle::stop).
    pub fn join(self) -> ServerExitReason {
        match self.server_loop.join() {
            Ok(reason) => reason,
            Err(any) => match any.as_ref().downcast_ref::<String>() {
                Some(s) => ServerExitReason::Panic(s.clone()),
                None => match any.as_ref().downcast_ref::<&str>() {
                    Some(s) => ServerExitReason::Panic(s.to_string()),
                    None => ServerExitReason::Panic(String::new()),
                },
            },
        }
    }

    /// Stops the server after the current event-loop tick.
    ///
    /// Best effort: if the waker cannot reach the loop there is nothing
    /// more to be done, so this returns without rendezvousing.
    pub fn stop(self) {
        let Ok(()) = self.server_waker.wake() else {
            return;
        };
        let _ = self.observe_shutdown.recv();
    }
}

#[cfg(test)]
mod end_to_end_tests {
    use super::*;
    use crate::config::{Method, Route, RouteTarget, ServerBlock};
    use camino::Utf8PathBuf;
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;
    use std::io::Read;
    use std::net::TcpStream;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// One server block on port 0 serving `root` at `/`.
    fn config_for(root: &std::path::Path) -> Config {
        let mut route = Route::serve(Utf8PathBuf::from(root.to_str().unwrap()));
        route.methods = BTreeSet::from([Method::Get, Method::Head, Method::Post]);
        route.auto_index = true;
        Config {
            servers: vec![ServerBlock {
                port: 0,
                hostname: Some("localhost".to_string()),
                error_pages: BTreeMap::new(),
                routes: BTreeMap::from([("/".to_string(), route)]),
            }],
        }
    }

    /// Sends raw bytes and reads until the peer closes the connection.
    #[track_caller]
    fn exchange(address: SocketAddr, request: &str) -> String {
        let mut socket = TcpStream::connect(address).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket.write_all(request.as_bytes()).unwrap();
        let mut response = String::new();
        socket.read_to_string(&mut response).unwrap();
        response
    }

    /// Reads exactly one response off the socket, using `Content-Length` to
    /// know where it ends.
    #[track_caller]
    fn read_response(socket: &mut TcpStream) -> String {
        let mut buffer: Vec<u8> = Vec::new();
        let mut staging = [0u8; 4096];
        loop {
            if let Some(head_end) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buffer[..head_end]);
                let content_length: usize = head
                    .lines()
                    .find_map(|line| line.strip_prefix("Content-Length: "))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                if buffer.len() >= head_end + 4 + content_length {
                    return String::from_utf8_lossy(&buffer).into_owned();
                }
            }
            let n = socket.read(&mut staging).unwrap();
            assert!(n > 0, "peer closed mid-response");
            buffer.extend_from_slice(&staging[..n]);
        }
    }

    #[test]
    fn serves_a_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hello.html"), "<html>hello</html>").unwrap();
        let server = start(config_for(dir.path())).unwrap();

        let response = exchange(
            server.address(),
            "GET /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/html"));
        assert!(response.ends_with("<html>hello</html>"));

        server.stop();
    }

    #[test]
    fn lists_a_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("seen.txt"), "x").unwrap();
        let server = start(config_for(dir.path())).unwrap();

        let response = exchange(
            server.address(),
            "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("seen.txt"));

        server.stop();
    }

    #[test]
    fn missing_file_uses_the_configured_error_page() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("my404.html");
        fs::write(&page, "<html>custom not-found</html>").unwrap();

        let mut config = config_for(dir.path());
        config.servers[0].error_pages = BTreeMap::from([(
            404,
            Utf8PathBuf::from(page.to_str().unwrap()),
        )]);
        let server = start(config).unwrap();

        let response = exchange(
            server.address(),
            "GET /missing.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.ends_with("<html>custom not-found</html>"));

        server.stop();
    }

    #[test]
    fn method_not_allowed() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path());
        config.servers[0].routes.get_mut("/").unwrap().methods =
            BTreeSet::from([Method::Get]);
        let server = start(config).unwrap();

        let response = exchange(
            server.address(),
            "POST / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));

        server.stop();
    }

    #[test]
    fn redirects_with_the_spliced_path() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path());
        let redirect = Route {
            target: RouteTarget::Redirect("https://example.com/".to_string()),
            methods: BTreeSet::from([Method::Get]),
            ..Route::serve("unused")
        };
        config.servers[0]
            .routes
            .insert("/red/".to_string(), redirect);
        let server = start(config).unwrap();

        let response = exchange(
            server.address(),
            "GET /red/path?x=1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(response.contains("Location: https://example.com/path\r\n"));

        server.stop();
    }

    #[test]
    fn oversized_body_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(dir.path());
        config.servers[0].routes.get_mut("/").unwrap().body_size = 10;
        let server = start(config).unwrap();

        let body = "x".repeat(50);
        let response = exchange(
            server.address(),
            &format!(
                "POST /upload.txt HTTP/1.1\r\nHost: localhost\r\nContent-Length: 50\r\n\r\n{body}"
            ),
        );
        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));

        server.stop();
    }

    #[test]
    fn invalid_method_is_a_bad_request() {
        let dir = TempDir::new().unwrap();
        let server = start(config_for(dir.path())).unwrap();

        let response = exchange(
            server.address(),
            "BREW /pot HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        server.stop();
    }

    #[test]
    fn keep_alive_carries_a_second_request() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.html"), "<html>a</html>").unwrap();
        fs::write(dir.path().join("b.html"), "<html>b</html>").unwrap();
        let server = start(config_for(dir.path())).unwrap();

        let mut socket = TcpStream::connect(server.address()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        socket
            .write_all(b"GET /a.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let first = read_response(&mut socket);
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(first.contains("Connection: keep-alive\r\n"));
        assert!(first.ends_with("<html>a</html>"));

        // The connection stayed registered: a second exchange works
        socket
            .write_all(b"GET /b.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut second = String::new();
        socket.read_to_string(&mut second).unwrap();
        assert!(second.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(second.ends_with("<html>b</html>"));

        server.stop();
    }

    #[test]
    fn cgi_script_end_to_end() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("echo.sh");
        fs::write(
            &script,
            "#!/bin/sh\nprintf 'Content-Type: text/plain\\n\\nquery=%s' \"$QUERY_STRING\"\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = config_for(dir.path());
        config.servers[0]
            .routes
            .get_mut("/")
            .unwrap()
            .cgi_extensions = BTreeSet::from([".sh".to_string()]);
        let server = start(config).unwrap();

        let response = exchange(
            server.address(),
            "GET /echo.sh?name=hi HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/plain\r\n"));
        assert!(response.ends_with("query=name=hi"));

        server.stop();
    }

    #[test]
    fn connection_limit_answers_503() {
        let dir = TempDir::new().unwrap();
        let server = start_with_limit(config_for(dir.path()), 0).unwrap();

        let mut socket = TcpStream::connect(server.address()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut response = String::new();
        socket.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));

        server.stop();
    }

    #[test]
    fn stop_is_graceful() {
        let dir = TempDir::new().unwrap();
        let server = start(config_for(dir.path())).unwrap();
        server.stop();
    }

    #[test]
    fn empty_config_is_refused() {
        let result = start(Config { servers: vec![] });
        assert!(result.is_err());
    }
}
