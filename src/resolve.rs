//! Maps a parsed request to the resource it names.
//!
//! Resolution walks the config tree: match a server block by hostname (or
//! fall back to the first block on the listener's port), pick the
//! longest-prefix route, check the method, then decide between redirect,
//! CGI, and the filesystem. The outcome is deterministic for a given
//! request/config pair.

use crate::config::{Config, Method, Route, ServerBlock};
use crate::request::{sanitize_url, Request};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ExistingFile,
    Redirection,
    ForbiddenMethod,
    Directory,
    NotFound,
    InvalidRequest,
    NoMatch,
    Cgi,
}

/// The resolved meaning of a request. Carries identifiers into the config
/// tree (server index, route prefix) rather than references, so it can live
/// inside a connection without tying lifetimes together.
#[derive(Debug, Clone)]
pub struct Resource {
    pub kind: ResourceKind,
    /// The sanitized request URL the resource was resolved from.
    pub original_request: String,
    /// Meaning depends on `kind`: a filesystem path for files, directories
    /// and CGI scripts, the target URL for redirections, empty otherwise.
    pub path: String,
    pub server: Option<usize>,
    pub route: Option<String>,
}

impl Resource {
    fn bare(kind: ResourceKind, original_request: &str) -> Resource {
        Resource {
            kind,
            original_request: original_request.to_string(),
            path: String::new(),
            server: None,
            route: None,
        }
    }

    pub fn server_block<'a>(&self, config: &'a Config) -> Option<&'a ServerBlock> {
        config.servers.get(self.server?)
    }

    pub fn route_in<'a>(&self, config: &'a Config) -> Option<&'a Route> {
        self.server_block(config)?.routes.get(self.route.as_ref()?)
    }
}

/// Resolves `request` against `config` for a connection accepted on
/// `listener_port`.
pub fn resolve(request: &Request, config: &Config, listener_port: u16) -> Resource {
    if !request.valid {
        return Resource::bare(ResourceKind::InvalidRequest, "");
    }

    let url = &request.url;
    let Some(server_idx) = match_server(config, &request.hostname, listener_port) else {
        return Resource::bare(ResourceKind::NoMatch, url);
    };
    let server = &config.servers[server_idx];

    let Some((prefix, route)) = match_route(&server.routes, url) else {
        return Resource::bare(ResourceKind::NoMatch, url);
    };

    let mut resource = Resource {
        kind: ResourceKind::NoMatch,
        original_request: url.clone(),
        path: String::new(),
        server: Some(server_idx),
        route: Some(prefix.clone()),
    };

    let method_allowed = request
        .method
        .is_some_and(|method| route.methods.contains(&method));
    if !method_allowed {
        resource.kind = ResourceKind::ForbiddenMethod;
        return resource;
    }

    if let Some(redirect) = route.redirect_to() {
        let suffix = url.get(prefix.len()..).unwrap_or("");
        resource.kind = ResourceKind::Redirection;
        resource.path = sanitize_url(&format!("{redirect}{suffix}"));
        return resource;
    }

    // Route serves a directory from here on
    let serve_dir = route.serve_dir().map(|d| d.as_str()).unwrap_or(".");

    if let Some(script_end) = cgi_script_end(url, route) {
        let script = &url[..script_end];
        let relative = script.get(prefix.len()..).unwrap_or("");
        let script_path = collapse_slashes(&format!("{serve_dir}/{relative}"));
        resource.kind = if Path::new(&script_path).is_file() {
            ResourceKind::Cgi
        } else {
            ResourceKind::NotFound
        };
        resource.path = script_path;
        return resource;
    }

    let relative = url.get(prefix.len()..).unwrap_or("");
    let path = collapse_slashes(&format!("{serve_dir}/{relative}"));
    resource.path = path.clone();

    let target = Path::new(&path);
    if !target.exists() {
        resource.kind = if parent_is_dir(target) {
            ResourceKind::NotFound
        } else {
            ResourceKind::NoMatch
        };
        return resource;
    }

    if target.is_file() {
        resource.kind = ResourceKind::ExistingFile;
        return resource;
    }

    // The path is a directory
    match request.method {
        Some(Method::Get) | Some(Method::Head) => {
            if let Some(index_file) = &route.index_file {
                let index_path = collapse_slashes(&format!("{path}/{index_file}"));
                if Path::new(&index_path).is_file() {
                    resource.kind = ResourceKind::ExistingFile;
                    resource.path = index_path;
                    return resource;
                }
            }
            if route.auto_index {
                resource.kind = ResourceKind::Directory;
            } else {
                resource.kind = ResourceKind::NotFound;
            }
        }
        _ => {
            resource.kind = ResourceKind::ForbiddenMethod;
        }
    }
    resource
}

/// The body size limit that applies to `request`, before the full resource
/// is resolved. Unlimited when no server or route matches.
pub fn body_limit(request: &Request, config: &Config, listener_port: u16) -> u64 {
    let Some(server_idx) = match_server(config, &request.hostname, listener_port) else {
        return u64::MAX;
    };
    match match_route(&config.servers[server_idx].routes, &request.url) {
        Some((_, route)) => route.body_size,
        None => u64::MAX,
    }
}

fn match_server(config: &Config, hostname: &str, listener_port: u16) -> Option<usize> {
    config
        .servers
        .iter()
        .position(|server| server.hostname.as_deref() == Some(hostname))
        .or_else(|| {
            config
                .servers
                .iter()
                .position(|server| server.port == listener_port)
        })
}

/// Longest-prefix route match with normalized slashes. An exact match wins
/// outright; `/route` also matches a `/route/` key (the trailing-slash
/// case); otherwise the longest key that prefixes the URL wins.
fn match_route<'a>(
    routes: &'a BTreeMap<String, Route>,
    url: &str,
) -> Option<(&'a String, &'a Route)> {
    let url = collapse_slashes(url);
    let mut best: Option<(&'a String, &'a Route)> = None;

    for (prefix, route) in routes {
        let normalized = collapse_slashes(prefix);
        if normalized == url {
            return Some((prefix, route));
        }

        let candidate = if url.len() + 1 == normalized.len() && normalized.starts_with(&url) {
            true
        } else {
            url.len() > normalized.len() && url.starts_with(&normalized)
        };

        if candidate {
            let is_longer = best
                .map(|(current, _)| prefix.len() > current.len())
                .unwrap_or(true);
            if is_longer {
                best = Some((prefix, route));
            }
        }
    }
    best
}

/// If the URL names a CGI script on this route, returns the byte offset one
/// past the matched extension. An extension only counts when it is followed
/// by the end of the URL, a `/`, or a `?`.
pub fn cgi_script_end(url: &str, route: &Route) -> Option<usize> {
    for extension in &route.cgi_extensions {
        for (pos, _) in url.match_indices(extension.as_str()) {
            let end = pos + extension.len();
            match url.as_bytes().get(end) {
                None | Some(b'/') | Some(b'?') => return Some(end),
                _ => continue,
            }
        }
    }
    None
}

fn collapse_slashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut previous_slash = false;
    for c in s.chars() {
        if c == '/' && previous_slash {
            continue;
        }
        previous_slash = c == '/';
        out.push(c);
    }
    out
}

fn parent_is_dir(path: &Path) -> bool {
    path.parent().map(Path::is_dir).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Route, RouteTarget, ServerBlock};
    use camino::Utf8PathBuf;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::TempDir;

    fn request(method: Method, target: &str, host: &str) -> Request {
        let raw = format!("{method} {target} HTTP/1.1\r\nHost: {host}\r\n\r\n");
        Request::parse_head(raw.as_bytes()).unwrap()
    }

    /// A config with one server on port 8080 serving a scratch root at `/`,
    /// plus a redirect route and a CGI-enabled route.
    fn scratch_config() -> (TempDir, Config) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("www");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir(root.join("empty")).unwrap();
        fs::write(root.join("index.html"), "<html>home</html>").unwrap();
        fs::write(root.join("sub/page.html"), "<html>sub</html>").unwrap();
        fs::write(root.join("echo.py"), "#!/usr/bin/env python3\n").unwrap();

        let root_path = Utf8PathBuf::from(root.to_str().unwrap());
        let mut serve = Route::serve(root_path);
        serve.methods = BTreeSet::from([Method::Get, Method::Head, Method::Post]);
        serve.cgi_extensions = BTreeSet::from([".py".to_string()]);
        serve.auto_index = true;
        serve.body_size = 1024;

        let redirect = Route {
            target: RouteTarget::Redirect("https://example.com/".to_string()),
            methods: BTreeSet::from([Method::Get]),
            ..Route::serve("unused")
        };

        let config = Config {
            servers: vec![ServerBlock {
                port: 8080,
                hostname: Some("web.example".to_string()),
                error_pages: Default::default(),
                routes: BTreeMap::from([
                    ("/".to_string(), serve),
                    ("/red/".to_string(), redirect),
                ]),
            }],
        };
        (dir, config)
    }

    #[test]
    fn existing_file() {
        let (_dir, config) = scratch_config();
        let resource = resolve(&request(Method::Get, "/index.html", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::ExistingFile);
        assert!(resource.path.ends_with("/index.html"));
        assert_eq!(resource.server, Some(0));
        assert_eq!(resource.route.as_deref(), Some("/"));
    }

    #[test]
    fn hostname_fallback_to_port() {
        let (_dir, config) = scratch_config();
        // Unknown hostname, but the listener port matches the block
        let resource = resolve(&request(Method::Get, "/index.html", "other.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::ExistingFile);

        // Neither hostname nor port match
        let resource = resolve(&request(Method::Get, "/index.html", "other.example"), &config, 9090);
        assert_eq!(resource.kind, ResourceKind::NoMatch);
    }

    #[test]
    fn directory_listing_and_index() {
        let (_dir, mut config) = scratch_config();
        let resource = resolve(&request(Method::Get, "/empty/", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::Directory);

        // With an index file configured and present, the index is served
        let route = config.servers[0].routes.get_mut("/").unwrap();
        route.index_file = Some("index.html".to_string());
        let resource = resolve(&request(Method::Get, "/", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::ExistingFile);
        assert!(resource.path.ends_with("/index.html"));

        // Index configured but missing in this directory: not found
        let resource = resolve(&request(Method::Get, "/empty/", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::NotFound);
    }

    #[test]
    fn directory_without_listing_is_not_found() {
        let (_dir, mut config) = scratch_config();
        config.servers[0].routes.get_mut("/").unwrap().auto_index = false;
        let resource = resolve(&request(Method::Get, "/empty/", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::NotFound);
    }

    #[test]
    fn non_get_on_directory_is_forbidden() {
        let (_dir, config) = scratch_config();
        let resource = resolve(&request(Method::Post, "/empty/", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::ForbiddenMethod);
    }

    #[test]
    fn missing_file_with_existing_parent() {
        let (_dir, config) = scratch_config();
        let resource = resolve(&request(Method::Get, "/sub/gone.html", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::NotFound);

        let resource = resolve(&request(Method::Get, "/no/such/tree", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::NoMatch);
    }

    #[test]
    fn forbidden_method() {
        let (_dir, config) = scratch_config();
        let resource = resolve(&request(Method::Delete, "/index.html", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::ForbiddenMethod);
    }

    #[test]
    fn redirect_splices_suffix() {
        let (_dir, config) = scratch_config();
        let resource = resolve(&request(Method::Get, "/red/path?x=1", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::Redirection);
        assert_eq!(resource.path, "https://example.com/path");
    }

    #[test]
    fn cgi_script_with_path_info() {
        let (_dir, config) = scratch_config();
        let resource = resolve(
            &request(Method::Get, "/echo.py/extra?name=hi", "web.example"),
            &config,
            8080,
        );
        assert_eq!(resource.kind, ResourceKind::Cgi);
        assert!(resource.path.ends_with("/echo.py"));

        // Missing script maps to NotFound even with a matching extension
        let resource = resolve(&request(Method::Get, "/gone.py", "web.example"), &config, 8080);
        assert_eq!(resource.kind, ResourceKind::NotFound);
    }

    #[test]
    fn cgi_extension_needs_a_boundary() {
        let (_dir, config) = scratch_config();
        let route = &config.servers[0].routes["/"];
        assert_eq!(cgi_script_end("/echo.py", route), Some(8));
        assert_eq!(cgi_script_end("/echo.py/extra", route), Some(8));
        assert_eq!(cgi_script_end("/echo.py?q=1", route), Some(8));
        assert_eq!(cgi_script_end("/echo.pyc", route), None);
        assert_eq!(cgi_script_end("/plain.html", route), None);
    }

    #[test]
    fn invalid_request_resource() {
        let (_dir, config) = scratch_config();
        let raw = b"BREW / HTTP/1.1\r\nHost: web.example\r\n\r\n";
        let request = Request::parse_head(raw).unwrap();
        let resource = resolve(&request, &config, 8080);
        assert_eq!(resource.kind, ResourceKind::InvalidRequest);
    }

    #[test]
    fn longest_prefix_wins() {
        let (dir, mut config) = scratch_config();
        let sub_root = Utf8PathBuf::from(dir.path().join("www/sub").to_str().unwrap());
        let mut sub_route = Route::serve(sub_root);
        sub_route.methods = BTreeSet::from([Method::Get]);
        config.servers[0]
            .routes
            .insert("/sub/".to_string(), sub_route);

        let resource = resolve(&request(Method::Get, "/sub/page.html", "web.example"), &config, 8080);
        assert_eq!(resource.route.as_deref(), Some("/sub/"));
        assert!(resource.path.ends_with("/sub/page.html"));

        // `/sub` (no trailing slash) still picks the `/sub/` route
        let resource = resolve(&request(Method::Get, "/sub", "web.example"), &config, 8080);
        assert_eq!(resource.route.as_deref(), Some("/sub/"));
    }

    #[test]
    fn resolution_is_deterministic() {
        let (_dir, config) = scratch_config();
        let req = request(Method::Get, "/sub/page.html", "web.example");
        let a = resolve(&req, &config, 8080);
        let b = resolve(&req, &config, 8080);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.path, b.path);
        assert_eq!(a.route, b.route);
    }

    #[test]
    fn body_limit_follows_the_route() {
        let (_dir, config) = scratch_config();
        let req = request(Method::Post, "/upload", "web.example");
        assert_eq!(body_limit(&req, &config, 8080), 1024);

        // No matching server: unlimited
        assert_eq!(body_limit(&req, &config, 9090), u64::MAX);
    }

    #[test]
    fn collapse_slashes_normalizes() {
        assert_eq!(collapse_slashes("//a///b/"), "/a/b/");
        assert_eq!(collapse_slashes("/a/b"), "/a/b");
    }
}
