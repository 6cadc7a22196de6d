//! A configurable, non-blocking HTTP/1.1 server.
//!
//! The configuration file declares virtual servers; each listens on a port,
//! matches requests to URL-prefix routes, and answers with static files,
//! directory listings, redirects, CGI output, or error pages. Everything
//! runs on a single event-loop thread; CGI work is handed to child
//! processes.

mod cgi;
mod connection;
mod error;
mod pages;
mod request;
mod resolve;
mod response;
mod server;
mod status;

pub mod config;

pub use config::{Config, ConfigError, Method, Route, RouteTarget, ServerBlock};
pub use error::StartupError;
pub use server::{start, start_with_limit, ServerExitReason, ServerHandle, DEFAULT_MAX_CONNECTIONS};
