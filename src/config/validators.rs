//! Predicates over configuration values.
//!
//! The filesystem-touching checks (`valid_html_file`, `valid_directory`) run
//! at parse time; the config tree is immutable afterwards, so files the
//! config references must exist before the server starts.

use std::path::Path;

/// A port is a base-10 integer in `1..=65535`, nothing more: no sign, no
/// surrounding whitespace.
pub fn valid_port(s: &str) -> bool {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    matches!(s.parse::<u32>(), Ok(port) if (1..=65535).contains(&port))
}

fn valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Hostnames are dot-separated labels, 253 characters at most. Each label is
/// 1-63 alphanumeric-or-hyphen characters and may not begin or end with a
/// hyphen. Empty labels (`a..b`, `a.`) are rejected.
pub fn valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 253 {
        return false;
    }
    hostname.split('.').all(valid_label)
}

/// An error response code is exactly three digits and names a 4xx or 5xx
/// response.
pub fn valid_error_code(code: &str) -> bool {
    code.len() == 3
        && code.bytes().all(|b| b.is_ascii_digit())
        && (code.starts_with('4') || code.starts_with('5'))
}

/// The path must carry a `.html` suffix (case-insensitive) and point at an
/// existing regular file.
pub fn valid_html_file(path: &str) -> bool {
    let Some(dot) = path.rfind('.') else {
        return false;
    };
    if !path[dot..].eq_ignore_ascii_case(".html") {
        return false;
    }
    Path::new(path).is_file()
}

/// The path must name an existing directory.
pub fn valid_directory(path: &str) -> bool {
    !path.is_empty() && Path::new(path).is_dir()
}

/// URLs only need to be non-empty for now.
pub fn valid_url(url: &str) -> bool {
    !url.is_empty()
}

/// A body size is a base-10 byte count in `10..=2^32-1`.
pub fn valid_body_size(s: &str) -> bool {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    matches!(s.parse::<u64>(), Ok(size) if (10..=u32::MAX as u64).contains(&size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn ports() {
        assert!(valid_port("1"));
        assert!(valid_port("8080"));
        assert!(valid_port("65535"));

        assert!(!valid_port("0"));
        assert!(!valid_port("65536"));
        assert!(!valid_port("-1"));
        assert!(!valid_port("+80"));
        assert!(!valid_port("80 "));
        assert!(!valid_port("eighty"));
        assert!(!valid_port(""));
    }

    #[test]
    fn hostnames() {
        assert!(valid_hostname("localhost"));
        assert!(valid_hostname("example.com"));
        assert!(valid_hostname("a-b.c-d.e"));
        assert!(valid_hostname("0.0.0.0"));

        assert!(!valid_hostname(""));
        assert!(!valid_hostname("a..b"));
        assert!(!valid_hostname("a."));
        assert!(!valid_hostname(".a"));
        assert!(!valid_hostname("-leading.com"));
        assert!(!valid_hostname("trailing-.com"));
        assert!(!valid_hostname("under_score.com"));
        assert!(!valid_hostname(&"a".repeat(64)));
        assert!(!valid_hostname(&format!("{}.com", "a.".repeat(130))));
    }

    #[test]
    fn error_codes() {
        assert!(valid_error_code("404"));
        assert!(valid_error_code("500"));
        assert!(valid_error_code("599"));

        assert!(!valid_error_code("200"));
        assert!(!valid_error_code("302"));
        assert!(!valid_error_code("40"));
        assert!(!valid_error_code("4040"));
        assert!(!valid_error_code("4o4"));
    }

    #[test]
    fn html_files() {
        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("err.html");
        fs::write(&page, "<html></html>").unwrap();
        let upper = dir.path().join("UP.HTML");
        fs::write(&upper, "<html></html>").unwrap();

        assert!(valid_html_file(page.to_str().unwrap()));
        assert!(valid_html_file(upper.to_str().unwrap()));

        // Right extension, missing file
        assert!(!valid_html_file(dir.path().join("gone.html").to_str().unwrap()));
        // Existing file, wrong extension
        let text = dir.path().join("notes.txt");
        fs::write(&text, "hi").unwrap();
        assert!(!valid_html_file(text.to_str().unwrap()));
        // A directory named like a page
        assert!(!valid_html_file(dir.path().to_str().unwrap()));
        assert!(!valid_html_file("no-extension"));
    }

    #[test]
    fn directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(valid_directory(dir.path().to_str().unwrap()));

        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();
        assert!(!valid_directory(file.to_str().unwrap()));
        assert!(!valid_directory(""));
        assert!(!valid_directory("/definitely/not/here"));
    }

    #[test]
    fn body_sizes() {
        assert!(valid_body_size("10"));
        assert!(valid_body_size("1048576"));
        assert!(valid_body_size(&u32::MAX.to_string()));

        assert!(!valid_body_size("9"));
        assert!(!valid_body_size("0"));
        assert!(!valid_body_size(&(u32::MAX as u64 + 1).to_string()));
        assert!(!valid_body_size("-10"));
        assert!(!valid_body_size("ten"));
    }

    #[test]
    fn urls() {
        assert!(valid_url("/"));
        assert!(valid_url("https://example.com/"));
        assert!(!valid_url(""));
    }
}
