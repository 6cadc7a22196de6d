mod parser;
mod tokenizer;
pub(crate) mod validators;

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;

pub use tokenizer::{Token, TokenKind};

/// The HTTP methods the server understands.
///
/// Anything else on a request start line marks the request invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
}

impl Method {
    /// Parses a method token. Matching is exact; methods are case-sensitive
    /// on the wire.
    pub fn parse(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a route points at. A location block must name exactly one of these,
/// so the exclusivity lives in the type rather than in a pair of optional
/// fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Serve files from this directory.
    ServeDir(Utf8PathBuf),
    /// Redirect the client to this URL.
    Redirect(String),
}

/// A URL-prefix rule inside a server block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: RouteTarget,
    /// Maximum request body size in bytes. Unlimited when not configured.
    pub body_size: u64,
    /// Generate a directory listing when a directory is requested.
    pub auto_index: bool,
    /// File served when a directory is requested.
    pub index_file: Option<String>,
    /// Extensions (with the leading dot) executed as CGI scripts.
    pub cgi_extensions: BTreeSet<String>,
    pub methods: BTreeSet<Method>,
}

impl Route {
    /// A route serving `dir`, with every other option at its default:
    /// unlimited body, no listing, no index file, no CGI, GET only.
    pub fn serve(dir: impl Into<Utf8PathBuf>) -> Route {
        Route {
            target: RouteTarget::ServeDir(dir.into()),
            body_size: u64::MAX,
            auto_index: false,
            index_file: None,
            cgi_extensions: BTreeSet::new(),
            methods: BTreeSet::from([Method::Get]),
        }
    }

    pub fn serve_dir(&self) -> Option<&Utf8Path> {
        match &self.target {
            RouteTarget::ServeDir(dir) => Some(dir),
            RouteTarget::Redirect(_) => None,
        }
    }

    pub fn redirect_to(&self) -> Option<&str> {
        match &self.target {
            RouteTarget::ServeDir(_) => None,
            RouteTarget::Redirect(url) => Some(url),
        }
    }
}

/// One virtual server: a port binding with its own routes and error pages.
#[derive(Debug, Clone)]
pub struct ServerBlock {
    pub port: u16,
    pub hostname: Option<String>,
    pub error_pages: BTreeMap<u16, Utf8PathBuf>,
    /// URL prefix → route. Never empty for a parsed config.
    pub routes: BTreeMap<String, Route>,
}

/// The validated configuration tree. Built once at startup and read-only for
/// the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerBlock>,
}

impl Config {
    /// Reads and parses a configuration file.
    pub fn from_file(path: impl AsRef<Utf8Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Config::parse(&source, path.as_str())
    }

    /// Parses configuration text. `origin` names the source in diagnostics.
    pub fn parse(source: &str, origin: &str) -> Result<Config, ConfigError> {
        let tokens = tokenizer::tokenize(source);
        let servers = parser::Parser::new(&tokens, source, origin).parse()?;
        Ok(Config { servers })
    }

    /// The built-in configuration used when no config file is given:
    /// one server on port 80 serving `./assets/web` at `/`, GET only,
    /// with a directory listing and stock error pages.
    pub fn builtin() -> Config {
        let route = Route {
            auto_index: true,
            ..Route::serve("./assets/web")
        };
        Config {
            servers: vec![ServerBlock {
                port: 80,
                hostname: None,
                error_pages: BTreeMap::from([
                    (404, Utf8PathBuf::from("./assets/404.html")),
                    (502, Utf8PathBuf::from("./assets/502.html")),
                ]),
                routes: BTreeMap::from([("/".to_string(), route)]),
            }],
        }
    }

    /// The distinct ports the configuration listens on, in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        let set: BTreeSet<u16> = self.servers.iter().map(|s| s.port).collect();
        set.into_iter().collect()
    }
}

/// A parse failure, pointing at the offending token.
#[derive(Debug)]
pub struct ParseDiagnostic {
    pub message: String,
    pub origin: String,
    pub line: u32,
    pub column: u32,
    pub source_line: String,
}

impl fmt::Display for ParseDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}:{}:{}: {}",
            self.origin, self.line, self.column, self.message
        )?;
        writeln!(f, "    {}", self.source_line)?;
        let pad = " ".repeat(self.column.saturating_sub(1) as usize);
        write!(f, "    {pad}^")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    Read {
        path: Utf8PathBuf,
        source: io::Error,
    },
    #[error("{0}")]
    Parse(ParseDiagnostic),
}
