//! Lexer for PNL source text.
//!
//! Converts source text into a flat stream of [`Token`]s in a single pass.
//! Lexing is total: the first character that cannot start a token is
//! reported with its position instead of being skipped.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::ast::Span;

/* ===================== Tokens ===================== */

/// A token produced by the lexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Keyword {
    Def,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Parallel,
    Sync,
    Await,
    All,
    Any,
    None,
    Return,
    Validate,
    Assert,
    Recover,
    True,
    False,
    Null,
    And,
    Or,
    Not,
}

impl Keyword {
    fn from_word(word: &str) -> Option<Keyword> {
        let kw = match word {
            "DEF" => Keyword::Def,
            "IF" => Keyword::If,
            "ELIF" => Keyword::Elif,
            "ELSE" => Keyword::Else,
            "WHILE" => Keyword::While,
            "FOR" => Keyword::For,
            "IN" => Keyword::In,
            "PARALLEL" => Keyword::Parallel,
            "SYNC" => Keyword::Sync,
            "AWAIT" => Keyword::Await,
            "ALL" => Keyword::All,
            "ANY" => Keyword::Any,
            "NONE" => Keyword::None,
            "RETURN" => Keyword::Return,
            "VALIDATE" => Keyword::Validate,
            "ASSERT" => Keyword::Assert,
            "RECOVER" => Keyword::Recover,
            "TRUE" => Keyword::True,
            "FALSE" => Keyword::False,
            "NULL" => Keyword::Null,
            "AND" => Keyword::And,
            "OR" => Keyword::Or,
            "NOT" => Keyword::Not,
            _ => return None,
        };
        Some(kw)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Keyword::Def => "DEF",
            Keyword::If => "IF",
            Keyword::Elif => "ELIF",
            Keyword::Else => "ELSE",
            Keyword::While => "WHILE",
            Keyword::For => "FOR",
            Keyword::In => "IN",
            Keyword::Parallel => "PARALLEL",
            Keyword::Sync => "SYNC",
            Keyword::Await => "AWAIT",
            Keyword::All => "ALL",
            Keyword::Any => "ANY",
            Keyword::None => "NONE",
            Keyword::Return => "RETURN",
            Keyword::Validate => "VALIDATE",
            Keyword::Assert => "ASSERT",
            Keyword::Recover => "RECOVER",
            Keyword::True => "TRUE",
            Keyword::False => "FALSE",
            Keyword::Null => "NULL",
            Keyword::And => "AND",
            Keyword::Or => "OR",
            Keyword::Not => "NOT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Assign,
    Bang,
    Arrow,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Star => "*",
            Operator::Slash => "/",
            Operator::Percent => "%",
            Operator::EqEq => "==",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
            Operator::Assign => "=",
            Operator::Bang => "!",
            Operator::Arrow => "->",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delimiter {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semicolon,
    Dot,
}

impl Delimiter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Delimiter::LParen => "(",
            Delimiter::RParen => ")",
            Delimiter::LBrace => "{",
            Delimiter::RBrace => "}",
            Delimiter::LBracket => "[",
            Delimiter::RBracket => "]",
            Delimiter::Comma => ",",
            Delimiter::Colon => ":",
            Delimiter::Semicolon => ";",
            Delimiter::Dot => ".",
        }
    }
}

/// The kind of token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum TokenKind {
    Ident(String),
    Keyword(Keyword),
    Operator(Operator),
    Str(String),
    Number(f64),
    /// `@name=value`, value kept as raw text for the parser to type-check
    Annotation { name: String, value: String },
    /// `#KEY=value`
    Directive { key: String, value: String },
    Delimiter(Delimiter),
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier '{}'", name),
            TokenKind::Keyword(kw) => write!(f, "'{}'", kw.as_str()),
            TokenKind::Operator(op) => write!(f, "'{}'", op.as_str()),
            TokenKind::Str(s) => write!(f, "string \"{}\"", s),
            TokenKind::Number(n) => write!(f, "number {}", n),
            TokenKind::Annotation { name, value } => write!(f, "annotation @{}={}", name, value),
            TokenKind::Directive { key, value } => write!(f, "directive #{}={}", key, value),
            TokenKind::Delimiter(d) => write!(f, "'{}'", d.as_str()),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

/* ===================== Errors ===================== */

#[derive(Debug, Clone, PartialEq, Error)]
#[error("lex error at {span}: {message}")]
pub struct LexError {
    pub span: Span,
    /// The offending character
    pub found: char,
    pub message: String,
}

impl LexError {
    fn new(span: Span, found: char, message: impl Into<String>) -> Self {
        Self {
            span,
            found,
            message: message.into(),
        }
    }
}

/* ===================== Lexer ===================== */

/// Tokenize PNL source. The returned stream always ends with [`TokenKind::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}

pub struct Lexer<'src> {
    source: &'src str,
    chars: Vec<(usize, char)>,
    pos: usize,
    line: usize,
    col: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_trivia();

            if self.is_at_end() {
                let offset = self.source.len();
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    span: Span::new(offset, offset, self.line, self.col),
                });
                break;
            }

            let ch = self.peek();
            let start = self.mark();

            let kind = match ch {
                '(' => self.single(TokenKind::Delimiter(Delimiter::LParen)),
                ')' => self.single(TokenKind::Delimiter(Delimiter::RParen)),
                '{' => self.single(TokenKind::Delimiter(Delimiter::LBrace)),
                '}' => self.single(TokenKind::Delimiter(Delimiter::RBrace)),
                '[' => self.single(TokenKind::Delimiter(Delimiter::LBracket)),
                ']' => self.single(TokenKind::Delimiter(Delimiter::RBracket)),
                ',' => self.single(TokenKind::Delimiter(Delimiter::Comma)),
                ':' => self.single(TokenKind::Delimiter(Delimiter::Colon)),
                ';' => self.single(TokenKind::Delimiter(Delimiter::Semicolon)),
                '.' => self.single(TokenKind::Delimiter(Delimiter::Dot)),
                '+' => self.single(TokenKind::Operator(Operator::Plus)),
                '*' => self.single(TokenKind::Operator(Operator::Star)),
                '/' => self.single(TokenKind::Operator(Operator::Slash)),
                '%' => self.single(TokenKind::Operator(Operator::Percent)),
                '→' => self.single(TokenKind::Operator(Operator::Arrow)),
                '-' => {
                    self.advance();
                    if self.eat('>') {
                        TokenKind::Operator(Operator::Arrow)
                    } else {
                        TokenKind::Operator(Operator::Minus)
                    }
                }
                '=' => {
                    self.advance();
                    if self.eat('=') {
                        TokenKind::Operator(Operator::EqEq)
                    } else {
                        TokenKind::Operator(Operator::Assign)
                    }
                }
                '!' => {
                    self.advance();
                    if self.eat('=') {
                        TokenKind::Operator(Operator::NotEq)
                    } else {
                        TokenKind::Operator(Operator::Bang)
                    }
                }
                '<' => {
                    self.advance();
                    if self.eat('=') {
                        TokenKind::Operator(Operator::LtEq)
                    } else {
                        TokenKind::Operator(Operator::Lt)
                    }
                }
                '>' => {
                    self.advance();
                    if self.eat('=') {
                        TokenKind::Operator(Operator::GtEq)
                    } else {
                        TokenKind::Operator(Operator::Gt)
                    }
                }
                '"' => self.lex_string()?,
                '#' => self.lex_directive()?,
                '@' => self.lex_annotation()?,
                '0'..='9' => self.lex_number()?,
                c if c.is_alphabetic() || c == '_' => self.lex_word(),
                other => {
                    return Err(LexError::new(
                        self.span_from(start),
                        other,
                        format!("unexpected character '{}'", other),
                    ));
                }
            };

            tokens.push(Token {
                kind,
                span: self.span_from(start),
            });
        }

        Ok(tokens)
    }

    /* ===================== Cursor ===================== */

    fn peek(&self) -> char {
        self.chars[self.pos].1
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).map(|(_, c)| *c)
    }

    fn is_at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len())
    }

    fn advance(&mut self) -> char {
        let ch = self.chars[self.pos].1;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        ch
    }

    fn eat(&mut self, expected: char) -> bool {
        if !self.is_at_end() && self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    /// (offset, line, col) at the current position
    fn mark(&self) -> (usize, usize, usize) {
        (self.offset(), self.line, self.col)
    }

    fn span_from(&self, (start, line, col): (usize, usize, usize)) -> Span {
        Span::new(start, self.offset().max(start + 1).min(self.source.len()), line, col)
    }

    fn skip_trivia(&mut self) {
        while !self.is_at_end() {
            let ch = self.peek();
            if ch.is_whitespace() {
                self.advance();
            } else if ch == '/' && self.peek_next() == Some('/') {
                while !self.is_at_end() && self.peek() != '\n' {
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while !self.is_at_end() && pred(self.peek()) {
            out.push(self.advance());
        }
        out
    }

    /* ===================== Token Rules ===================== */

    fn lex_word(&mut self) -> TokenKind {
        let word = self.take_while(|c| c.is_alphanumeric() || c == '_');
        match Keyword::from_word(&word) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(word),
        }
    }

    fn lex_number(&mut self) -> Result<TokenKind, LexError> {
        let start = self.mark();
        let mut text = self.take_while(|c| c.is_ascii_digit());
        if !self.is_at_end()
            && self.peek() == '.'
            && self.peek_next().is_some_and(|c| c.is_ascii_digit())
        {
            text.push(self.advance());
            text.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| {
                LexError::new(self.span_from(start), '0', format!("invalid number '{}'", text))
            })
    }

    fn lex_string(&mut self) -> Result<TokenKind, LexError> {
        let start = self.mark();
        self.advance(); // opening quote
        let mut value = String::new();

        loop {
            if self.is_at_end() {
                return Err(LexError::new(
                    self.span_from(start),
                    '"',
                    "unterminated string literal",
                ));
            }
            match self.advance() {
                '"' => break,
                '\\' => {
                    if self.is_at_end() {
                        continue;
                    }
                    let escape_start = self.mark();
                    let escaped = self.advance();
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        '"' => '"',
                        '\\' => '\\',
                        other => {
                            return Err(LexError::new(
                                self.span_from(escape_start),
                                other,
                                format!("unknown escape sequence '\\{}'", other),
                            ));
                        }
                    });
                }
                c => value.push(c),
            }
        }

        Ok(TokenKind::Str(value))
    }

    /// `#KEY=value`
    fn lex_directive(&mut self) -> Result<TokenKind, LexError> {
        let (key, value) = self.lex_key_value('#', "directive")?;
        Ok(TokenKind::Directive { key, value })
    }

    /// `@name=value`
    fn lex_annotation(&mut self) -> Result<TokenKind, LexError> {
        let (name, value) = self.lex_key_value('@', "annotation")?;
        Ok(TokenKind::Annotation { name, value })
    }

    fn lex_key_value(&mut self, sigil: char, what: &str) -> Result<(String, String), LexError> {
        let start = self.mark();
        self.advance(); // sigil

        let key = self.take_while(|c| c.is_alphanumeric() || c == '_');
        if key.is_empty() {
            let found = if self.is_at_end() { sigil } else { self.peek() };
            return Err(LexError::new(
                self.span_from(start),
                found,
                format!("expected {} name after '{}'", what, sigil),
            ));
        }

        if !self.eat('=') {
            let found = if self.is_at_end() { sigil } else { self.peek() };
            return Err(LexError::new(
                self.span_from(start),
                found,
                format!("expected '=' after {} name '{}'", what, key),
            ));
        }

        let value = if sigil == '#' {
            self.take_while(|c| !c.is_whitespace())
        } else {
            self.take_while(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
        };
        if value.is_empty() {
            let found = if self.is_at_end() { '=' } else { self.peek() };
            return Err(LexError::new(
                self.span_from(start),
                found,
                format!("missing value for {} '{}'", what, key),
            ));
        }

        Ok((key, value))
    }
}
