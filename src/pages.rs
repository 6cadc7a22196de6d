//! Generated HTML: directory listings and stock error pages.

use crate::status;
use std::fs;

const COMMON_HEAD: &str = "<html>\n\
    \t<head>\n\
    \t\t<meta http-equiv=\"Content-Type\" content=\"text/html; charset=utf-8\">\n";

/// Renders a directory listing for `dir_path`. Directories get a trailing
/// slash so relative links keep working. Entries are sorted by name.
pub fn directory_listing(dir_path: &str) -> String {
    let mut html = format!(
        "{COMMON_HEAD}\t\t<title>Directory listing for {dir_path}</title>\n\
        \t</head>\n\
        \t<body>\n\
        \t\t<h1>Directory listing for {dir_path}</h1>\n\
        \t\t<hr>\n\
        \t\t<ul>\n"
    );

    let mut names = Vec::new();
    match fs::read_dir(dir_path) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                names.push(name);
            }
        }
        Err(_) => {
            html.push_str("\t\t\t<li>could not open directory</li>\n");
        }
    }
    names.sort();
    for name in names {
        html.push_str(&format!("\t\t\t<li><a href=\"{name}\">{name}</a></li>\n"));
    }

    html.push_str("\t\t</ul>\n\t\t<hr>\n\t</body>\n</html>\n");
    html
}

/// The built-in error page used when a server block configures no page for
/// the response code.
pub fn error_page(code: u16) -> String {
    let reason = status::reason(code);
    format!(
        "{COMMON_HEAD}\t\t<title>{code} {reason}</title>\n\
        \t</head>\n\
        \t<body>\n\
        \t\t<h1>ERROR {code} {reason}</h1>\n\
        \t\t<hr>\n\
        \t</body>\n</html>\n"
    )
}
