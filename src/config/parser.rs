//! Recursive-descent parser over the token stream.
//!
//! Grammar:
//!
//! ```text
//! config      := server+
//! server      := "server" "{" server_opt+ "}"     ; needs listen and >=1 location
//! server_opt  := listen | server_name | error_page | location
//! listen      := "listen" valid_port ";"
//! server_name := "server_name" valid_hostname ";"
//! error_page  := "error_page" valid_error_code valid_html_path ";"
//! location    := "location" URL "{" loc_opt+ "}"  ; exactly one of try_files | redirect
//! loc_opt     := try_files | redirect | body_size | methods
//!              | auto_index | index | cgi_extensions
//! ```
//!
//! Each rule rejects duplicate occurrences within its enclosing block,
//! validates its value token, and requires the terminating `;`. Errors
//! short-circuit at the statement boundary and carry the offending token's
//! position; on unexpected end of input they point at the last token
//! consumed.

use super::tokenizer::{Token, TokenKind};
use super::validators;
use super::{ConfigError, Method, ParseDiagnostic, Route, RouteTarget, ServerBlock};
use camino::Utf8PathBuf;
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    source: &'a str,
    origin: &'a str,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token], source: &'a str, origin: &'a str) -> Parser<'a> {
        Parser {
            tokens,
            pos: 0,
            source,
            origin,
        }
    }

    pub fn parse(mut self) -> Result<Vec<ServerBlock>, ConfigError> {
        if self.tokens.is_empty() {
            return Err(ConfigError::Parse(ParseDiagnostic {
                message: "config file cannot be empty".to_string(),
                origin: self.origin.to_string(),
                line: 1,
                column: 1,
                source_line: self.source.lines().next().unwrap_or("").to_string(),
            }));
        }

        let mut servers = Vec::new();
        servers.push(self.parse_server_block()?);
        while !self.at_end() {
            servers.push(self.parse_server_block()?);
        }
        Ok(servers)
    }

    // ---- token stream helpers ----

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn bump(&mut self) -> &'a Token {
        let token = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        self.pos += 1;
        token
    }

    /// The token errors are anchored to: the current one, or the last one
    /// consumed when input ran out.
    fn anchor(&self) -> &'a Token {
        let idx = self.pos.min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn error_at(&self, token: &Token, message: &str) -> ConfigError {
        let source_line = self
            .source
            .lines()
            .nth(token.line as usize - 1)
            .unwrap_or("")
            .to_string();
        ConfigError::Parse(ParseDiagnostic {
            message: message.to_string(),
            origin: self.origin.to_string(),
            line: token.line,
            column: token.column,
            source_line,
        })
    }

    fn error_here(&self, message: &str) -> ConfigError {
        self.error_at(self.anchor(), message)
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> Result<&'a Token, ConfigError> {
        match self.peek() {
            Some(token) if token.kind == kind => {
                self.pos += 1;
                Ok(token)
            }
            _ => Err(self.error_here(message)),
        }
    }

    fn expect_semicolon(&mut self) -> Result<(), ConfigError> {
        self.expect(TokenKind::Semicolon, "expected a `;`")?;
        Ok(())
    }

    // ---- grammar rules ----

    fn at_server_option(&self) -> bool {
        matches!(
            self.peek_kind(),
            Some(
                TokenKind::Listen
                    | TokenKind::ServerName
                    | TokenKind::ErrorPage
                    | TokenKind::Location
            )
        )
    }

    fn at_location_option(&self) -> bool {
        matches!(
            self.peek_kind(),
            Some(
                TokenKind::TryFiles
                    | TokenKind::Redirect
                    | TokenKind::BodySize
                    | TokenKind::Methods
                    | TokenKind::AutoIndex
                    | TokenKind::IndexFile
                    | TokenKind::CgiExtension
            )
        )
    }

    fn parse_server_block(&mut self) -> Result<ServerBlock, ConfigError> {
        self.expect(TokenKind::Server, "expected top level `server` rule")?;
        self.expect(TokenKind::LBrace, "expected `{` to start server block")?;

        let mut seen: HashSet<TokenKind> = HashSet::new();
        let mut port: Option<u16> = None;
        let mut hostname: Option<String> = None;
        let mut error_pages: BTreeMap<u16, Utf8PathBuf> = BTreeMap::new();
        let mut routes: BTreeMap<String, Route> = BTreeMap::new();

        if !self.at_server_option() {
            return Err(self.error_here("expected a valid server option"));
        }
        while self.at_server_option() {
            match self.peek_kind() {
                Some(TokenKind::Listen) => self.parse_listen(&mut seen, &mut port)?,
                Some(TokenKind::ServerName) => self.parse_server_name(&mut seen, &mut hostname)?,
                Some(TokenKind::ErrorPage) => self.parse_error_page(&mut error_pages)?,
                Some(TokenKind::Location) => {
                    let (prefix_token, prefix, route) = self.parse_location_block()?;
                    if routes.insert(prefix, route).is_some() {
                        return Err(
                            self.error_at(prefix_token, "duplicate `location` prefix not allowed")
                        );
                    }
                }
                _ => unreachable!("at_server_option admitted an unknown option"),
            }
        }

        let closing = self.expect(TokenKind::RBrace, "unexpected token")?;
        let Some(port) = port else {
            return Err(self.error_at(closing, "server block missing `listen` rule"));
        };
        if routes.is_empty() {
            return Err(self.error_at(closing, "server block missing `location` block"));
        }

        Ok(ServerBlock {
            port,
            hostname,
            error_pages,
            routes,
        })
    }

    fn parse_listen(
        &mut self,
        seen: &mut HashSet<TokenKind>,
        port: &mut Option<u16>,
    ) -> Result<(), ConfigError> {
        let keyword = self.bump();
        if !seen.insert(TokenKind::Listen) {
            return Err(self.error_at(keyword, "duplicate `listen` rule not allowed"));
        }
        let value = self.expect(TokenKind::Word, "expected a valid port number")?;
        if !validators::valid_port(&value.lexeme) {
            return Err(self.error_at(value, "expected a valid port number"));
        }
        *port = value.lexeme.parse().ok();
        self.expect_semicolon()
    }

    fn parse_server_name(
        &mut self,
        seen: &mut HashSet<TokenKind>,
        hostname: &mut Option<String>,
    ) -> Result<(), ConfigError> {
        let keyword = self.bump();
        if !seen.insert(TokenKind::ServerName) {
            return Err(self.error_at(keyword, "duplicate `server_name` rule not allowed"));
        }
        let value = self.expect(TokenKind::Word, "expected a valid host name")?;
        if !validators::valid_hostname(&value.lexeme) {
            return Err(self.error_at(value, "expected a valid host name"));
        }
        *hostname = Some(value.lexeme.to_ascii_lowercase());
        self.expect_semicolon()
    }

    fn parse_error_page(
        &mut self,
        error_pages: &mut BTreeMap<u16, Utf8PathBuf>,
    ) -> Result<(), ConfigError> {
        self.bump();
        let code_token = self.expect(TokenKind::Word, "expected a 4XX or 5XX response code")?;
        if !validators::valid_error_code(&code_token.lexeme) {
            return Err(self.error_at(code_token, "expected a 4XX or 5XX response code"));
        }
        let code: u16 = code_token
            .lexeme
            .parse()
            .map_err(|_| self.error_at(code_token, "expected a 4XX or 5XX response code"))?;

        let path_token = self.expect(TokenKind::Word, "expected a valid path to an HTML file")?;
        if !validators::valid_html_file(&path_token.lexeme) {
            return Err(self.error_at(path_token, "expected a valid path to an HTML file"));
        }

        if error_pages
            .insert(code, Utf8PathBuf::from(&path_token.lexeme))
            .is_some()
        {
            return Err(self.error_at(code_token, "duplicate response code not allowed"));
        }
        self.expect_semicolon()
    }

    fn parse_location_block(&mut self) -> Result<(&'a Token, String, Route), ConfigError> {
        self.bump();
        let url_token = self.expect(TokenKind::Word, "expected valid URL")?;
        self.expect(TokenKind::LBrace, "expected `{` to start location block")?;

        let mut seen: HashSet<TokenKind> = HashSet::new();
        let mut serve_dir: Option<Utf8PathBuf> = None;
        let mut redirect_to: Option<String> = None;
        let mut body_size: Option<u64> = None;
        let mut auto_index: Option<bool> = None;
        let mut index_file: Option<String> = None;
        let mut cgi_extensions: BTreeSet<String> = BTreeSet::new();
        let mut methods: Option<BTreeSet<Method>> = None;

        if !self.at_location_option() {
            return Err(self.error_here("expected a valid location option"));
        }
        while self.at_location_option() {
            match self.peek_kind() {
                Some(TokenKind::TryFiles) => {
                    self.parse_try_files(&mut seen, &mut serve_dir)?;
                }
                Some(TokenKind::Redirect) => {
                    self.parse_redirect(&mut seen, &mut redirect_to)?;
                }
                Some(TokenKind::BodySize) => {
                    self.parse_body_size(&mut seen, &mut body_size)?;
                }
                Some(TokenKind::Methods) => {
                    methods = Some(self.parse_methods(&mut seen)?);
                }
                Some(TokenKind::AutoIndex) => {
                    self.parse_auto_index(&mut seen, &mut auto_index)?;
                }
                Some(TokenKind::IndexFile) => {
                    self.parse_index_file(&mut seen, &mut index_file)?;
                }
                Some(TokenKind::CgiExtension) => {
                    cgi_extensions = self.parse_cgi_extensions(&mut seen)?;
                }
                _ => unreachable!("at_location_option admitted an unknown option"),
            }
        }

        let closing = self.expect(TokenKind::RBrace, "unexpected token")?;
        let target = match (serve_dir, redirect_to) {
            (Some(dir), None) => RouteTarget::ServeDir(dir),
            (None, Some(url)) => RouteTarget::Redirect(url),
            // Having both is rejected when the second directive is parsed.
            _ => {
                return Err(self.error_at(
                    closing,
                    "location block requires either a `try_files` or a `redirect` rule",
                ))
            }
        };

        let route = Route {
            target,
            body_size: body_size.unwrap_or(u64::MAX),
            auto_index: auto_index.unwrap_or(false),
            index_file,
            cgi_extensions,
            methods: methods.unwrap_or_else(|| BTreeSet::from([Method::Get])),
        };
        Ok((url_token, url_token.lexeme.clone(), route))
    }

    fn parse_try_files(
        &mut self,
        seen: &mut HashSet<TokenKind>,
        serve_dir: &mut Option<Utf8PathBuf>,
    ) -> Result<(), ConfigError> {
        let keyword = self.bump();
        if !seen.insert(TokenKind::TryFiles) {
            return Err(self.error_at(keyword, "multiple `try_files` rules not allowed"));
        }
        if seen.contains(&TokenKind::Redirect) {
            return Err(self.error_at(
                keyword,
                "a location block cannot have both a `try_files` and a `redirect` rule",
            ));
        }
        let value = self.expect(TokenKind::Word, "expected a valid directory")?;
        if !validators::valid_directory(&value.lexeme) {
            return Err(self.error_at(value, "invalid directory"));
        }
        *serve_dir = Some(Utf8PathBuf::from(&value.lexeme));
        self.expect_semicolon()
    }

    fn parse_redirect(
        &mut self,
        seen: &mut HashSet<TokenKind>,
        redirect_to: &mut Option<String>,
    ) -> Result<(), ConfigError> {
        let keyword = self.bump();
        if !seen.insert(TokenKind::Redirect) {
            return Err(self.error_at(keyword, "multiple `redirect` rules not allowed"));
        }
        if seen.contains(&TokenKind::TryFiles) {
            return Err(self.error_at(
                keyword,
                "a location block cannot have both a `try_files` and a `redirect` rule",
            ));
        }
        let value = self.expect(TokenKind::Word, "expected a valid URL")?;
        if !validators::valid_url(&value.lexeme) {
            return Err(self.error_at(value, "expected a valid URL"));
        }
        *redirect_to = Some(value.lexeme.clone());
        self.expect_semicolon()
    }

    fn parse_body_size(
        &mut self,
        seen: &mut HashSet<TokenKind>,
        body_size: &mut Option<u64>,
    ) -> Result<(), ConfigError> {
        let keyword = self.bump();
        if !seen.insert(TokenKind::BodySize) {
            return Err(self.error_at(keyword, "multiple `body_size` rules not allowed"));
        }
        let value = self.expect(TokenKind::Word, "expected a valid body size in bytes [10 - 2^32]")?;
        if !validators::valid_body_size(&value.lexeme) {
            return Err(self.error_at(value, "expected a valid body size in bytes [10 - 2^32]"));
        }
        *body_size = value.lexeme.parse().ok();
        self.expect_semicolon()
    }

    fn parse_methods(
        &mut self,
        seen: &mut HashSet<TokenKind>,
    ) -> Result<BTreeSet<Method>, ConfigError> {
        let keyword = self.bump();
        if !seen.insert(TokenKind::Methods) {
            return Err(self.error_at(keyword, "multiple `methods` rules not allowed"));
        }
        if self.peek_kind() != Some(TokenKind::Word) {
            return Err(self.error_here("expected HTTP method"));
        }
        let mut methods = BTreeSet::new();
        while self.peek_kind() == Some(TokenKind::Word) {
            let token = self.bump();
            let Some(method) = Method::parse(&token.lexeme) else {
                return Err(self.error_at(token, "invalid HTTP `method` specified"));
            };
            if !methods.insert(method) {
                return Err(self.error_at(token, "duplicate method specified"));
            }
        }
        self.expect_semicolon()?;
        Ok(methods)
    }

    fn parse_auto_index(
        &mut self,
        seen: &mut HashSet<TokenKind>,
        auto_index: &mut Option<bool>,
    ) -> Result<(), ConfigError> {
        let keyword = self.bump();
        if !seen.insert(TokenKind::AutoIndex) {
            return Err(self.error_at(keyword, "multiple `directory_listing` rules not allowed"));
        }
        let value = self.expect(TokenKind::Word, "expected a `true` or `false`")?;
        *auto_index = match value.lexeme.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => return Err(self.error_at(value, "expected a `true` or `false`")),
        };
        self.expect_semicolon()
    }

    fn parse_index_file(
        &mut self,
        seen: &mut HashSet<TokenKind>,
        index_file: &mut Option<String>,
    ) -> Result<(), ConfigError> {
        let keyword = self.bump();
        if !seen.insert(TokenKind::IndexFile) {
            return Err(
                self.error_at(keyword, "multiple `directory_listing_file` rules not allowed")
            );
        }
        let value = self.expect(TokenKind::Word, "expected a file name")?;
        *index_file = Some(value.lexeme.clone());
        self.expect_semicolon()
    }

    fn parse_cgi_extensions(
        &mut self,
        seen: &mut HashSet<TokenKind>,
    ) -> Result<BTreeSet<String>, ConfigError> {
        let keyword = self.bump();
        if !seen.insert(TokenKind::CgiExtension) {
            return Err(self.error_at(keyword, "multiple `cgi_extensions` rules not allowed"));
        }
        if self.peek_kind() != Some(TokenKind::Word) {
            return Err(self.error_here("expected a valid CGI extension"));
        }
        let mut extensions = BTreeSet::new();
        while self.peek_kind() == Some(TokenKind::Word) {
            let token = self.bump();
            if !valid_extension(&token.lexeme) {
                return Err(self.error_at(token, "expected a valid CGI extension"));
            }
            if !extensions.insert(token.lexeme.clone()) {
                return Err(self.error_at(token, "duplicate CGI extension specified"));
            }
        }
        self.expect_semicolon()?;
        Ok(extensions)
    }
}

/// CGI extensions are written with their leading dot: `.py`, `.php`.
fn valid_extension(ext: &str) -> bool {
    ext.len() >= 2
        && ext.starts_with('.')
        && ext[1..].bytes().all(|b| b.is_ascii_alphanumeric())
}
