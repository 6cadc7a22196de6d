//! Splits configuration text into typed tokens with line/column provenance.

/// The kinds of token produced from a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Single-character tokens.
    LBrace,
    RBrace,
    Semicolon,
    Pound,

    // Keywords.
    Server,
    Listen,
    ServerName,
    ErrorPage,
    Location,
    TryFiles,
    BodySize,
    Methods,
    AutoIndex,
    IndexFile,
    CgiExtension,
    Redirect,

    // Literals.
    Word,
}

/// A single token: its kind, its text, and where it was found.
/// Line and column are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub line: u32,
    pub column: u32,
}

/// The fixed keyword table. Words not listed here lex as [`TokenKind::Word`].
fn keyword(word: &str) -> Option<TokenKind> {
    let kind = match word {
        "server" => TokenKind::Server,
        "listen" => TokenKind::Listen,
        "server_name" => TokenKind::ServerName,
        "error_page" => TokenKind::ErrorPage,
        "location" => TokenKind::Location,
        "try_files" => TokenKind::TryFiles,
        "body_size" => TokenKind::BodySize,
        "methods" => TokenKind::Methods,
        "directory_listing" | "auto_index" => TokenKind::AutoIndex,
        "directory_listing_file" | "index" => TokenKind::IndexFile,
        "cgi_extensions" => TokenKind::CgiExtension,
        "redirect" | "return" => TokenKind::Redirect,
        _ => return None,
    };
    Some(kind)
}

fn single_char(c: char) -> Option<TokenKind> {
    match c {
        '{' => Some(TokenKind::LBrace),
        '}' => Some(TokenKind::RBrace),
        ';' => Some(TokenKind::Semicolon),
        '#' => Some(TokenKind::Pound),
        _ => None,
    }
}

/// Tokenizes configuration text. Comments (`#` to end of line) are discarded
/// before any token is emitted, so [`TokenKind::Pound`] never appears in the
/// output stream.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (line_idx, raw_line) in source.lines().enumerate() {
        let line_no = line_idx as u32 + 1;
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        tokenize_line(line, line_no, &mut tokens);
    }
    tokens
}

fn tokenize_line(line: &str, line_no: u32, tokens: &mut Vec<Token>) {
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if let Some(kind) = single_char(c) {
            tokens.push(Token {
                kind,
                lexeme: c.to_string(),
                line: line_no,
                column: i as u32 + 1,
            });
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() && single_char(chars[i]).is_none() {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        tokens.push(Token {
            kind: keyword(&word).unwrap_or(TokenKind::Word),
            lexeme: word,
            line: line_no,
            column: start as u32 + 1,
        });
    }
}
