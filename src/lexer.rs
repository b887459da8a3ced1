//! Lexer for Ferrule
//!
//! Converts source code into a stream of tokens. A malformed literal does
//! not abort scanning by itself: it produces an `Invalid` token and sets
//! `failed`, and the parser stops at the first such token.

use crate::error::{ErrorKind, FerruleError, Result};
use crate::token::{lookup_keyword, Span, StrPart, Token, TokenKind};

/// Marker that opens and closes an interpolated expression inside a string
pub const INTERP_MARKER: char = '$';

/// The lexer state
pub struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    module: u32,
    line: usize,
    column: usize,
    /// Set once any error token has been produced
    pub failed: bool,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer from source code
    pub fn new(source: &'a str, module: u32) -> Self {
        Self::starting_at(source, module, 1, 1)
    }

    /// Create a lexer whose first character sits at `line:column`; used for
    /// the expressions embedded in string literals
    pub fn starting_at(source: &'a str, module: u32, line: usize, column: usize) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            module,
            line,
            column,
            failed: false,
        }
    }

    /// Tokenize the entire source, failing on the first malformed token
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token();
            if let TokenKind::Invalid(kind) = &token.kind {
                return Err(FerruleError::new(kind.clone(), Some(token.span)));
            }
            let at_end = token.kind == TokenKind::Eof;
            tokens.push(token);
            if at_end {
                break;
            }
        }

        Ok(tokens)
    }

    /// Produce the next token; `Eof` once the input is exhausted
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        let span = Span::new(self.module, self.line, self.column);
        let Some(&(_, ch)) = self.chars.peek() else {
            return Token::new(TokenKind::Eof, span);
        };

        let kind = match ch {
            '(' => { self.advance(); TokenKind::LeftParen }
            ')' => { self.advance(); TokenKind::RightParen }
            '{' => { self.advance(); TokenKind::LeftBrace }
            '}' => { self.advance(); TokenKind::RightBrace }
            '[' => { self.advance(); TokenKind::LeftBracket }
            ']' => { self.advance(); TokenKind::RightBracket }
            ',' => { self.advance(); TokenKind::Comma }
            ';' => { self.advance(); TokenKind::Semicolon }
            ':' => { self.advance(); TokenKind::Colon }
            '.' => { self.advance(); TokenKind::Dot }

            '+' => self.with_equal(TokenKind::Plus, TokenKind::PlusEqual),
            '-' => self.with_equal(TokenKind::Minus, TokenKind::MinusEqual),
            '*' => self.with_equal(TokenKind::Star, TokenKind::StarEqual),
            '/' => self.with_equal(TokenKind::Slash, TokenKind::SlashEqual),
            '%' => self.with_equal(TokenKind::Percent, TokenKind::PercentEqual),
            '=' => self.with_equal(TokenKind::Equal, TokenKind::EqualEqual),
            '!' => self.with_equal(TokenKind::Bang, TokenKind::BangEqual),
            '<' => self.with_equal(TokenKind::Less, TokenKind::LessEqual),
            '>' => self.with_equal(TokenKind::Greater, TokenKind::GreaterEqual),

            '&' => {
                self.advance();
                if self.peek_char() == Some('&') {
                    self.advance();
                    TokenKind::AndAnd
                } else {
                    self.error(ErrorKind::UnexpectedCharacter('&'))
                }
            }
            '|' => {
                self.advance();
                if self.peek_char() == Some('|') {
                    self.advance();
                    TokenKind::OrOr
                } else {
                    self.error(ErrorKind::UnexpectedCharacter('|'))
                }
            }

            '"' => self.scan_string(),
            c if c.is_ascii_digit() => self.scan_number(),
            c if c.is_alphabetic() || c == '_' => self.scan_identifier(),

            _ => {
                self.advance();
                self.error(ErrorKind::UnexpectedCharacter(ch))
            }
        };

        Token::new(kind, span)
    }

    fn error(&mut self, kind: ErrorKind) -> TokenKind {
        self.failed = true;
        TokenKind::Invalid(kind)
    }

    fn with_equal(&mut self, single: TokenKind, double: TokenKind) -> TokenKind {
        self.advance();
        if self.peek_char() == Some('=') {
            self.advance();
            double
        } else {
            single
        }
    }

    /// Advance and return the current character
    fn advance(&mut self) -> Option<char> {
        let (pos, ch) = self.chars.next()?;
        self.current_pos = pos + ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    /// Peek at the next character without advancing
    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, ch)| ch)
    }

    /// Skip whitespace and line comments
    fn skip_whitespace_and_comments(&mut self) {
        while let Some(ch) = self.peek_char() {
            match ch {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '/' if self.source[self.current_pos..].starts_with("//") => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Scan a string literal, splitting it at interpolation markers
    fn scan_string(&mut self) -> TokenKind {
        self.advance(); // opening quote

        let mut parts = Vec::new();
        let mut text = String::new();

        loop {
            match self.peek_char() {
                Some('"') => {
                    self.advance();
                    if !text.is_empty() || parts.is_empty() {
                        parts.push(StrPart::Text(text));
                    }
                    return TokenKind::Str(parts);
                }
                Some('\\') => {
                    self.advance();
                    let escaped = match self.peek_char() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some(INTERP_MARKER) => INTERP_MARKER,
                        Some(other) => {
                            self.advance();
                            return self.error(ErrorKind::InvalidEscape(other));
                        }
                        None => break,
                    };
                    self.advance();
                    text.push(escaped);
                }
                Some(INTERP_MARKER) => {
                    self.advance();
                    if !text.is_empty() {
                        parts.push(StrPart::Text(std::mem::take(&mut text)));
                    }
                    let (line, column) = (self.line, self.column);
                    let start = self.current_pos;
                    loop {
                        match self.peek_char() {
                            Some(INTERP_MARKER) => break,
                            Some('"') | Some('\n') | None => {
                                return self.error(ErrorKind::UnterminatedString);
                            }
                            Some(_) => {
                                self.advance();
                            }
                        }
                    }
                    let expr = self.source[start..self.current_pos].to_string();
                    self.advance(); // closing marker
                    parts.push(StrPart::Interp(expr, line, column));
                }
                Some('\n') | None => break,
                Some(c) => {
                    text.push(c);
                    self.advance();
                }
            }
        }

        self.error(ErrorKind::UnterminatedString)
    }

    /// Scan a number literal. A single decimal point makes it a float; a
    /// second one is an error.
    fn scan_number(&mut self) -> TokenKind {
        let start = self.current_pos;
        let mut dots = 0;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.advance();
            } else if c == '.' && self.digit_follows_dot() {
                dots += 1;
                self.advance();
            } else {
                break;
            }
        }

        let text = &self.source[start..self.current_pos];
        match dots {
            0 => match text.parse::<i64>() {
                Ok(value) => TokenKind::Int(value),
                Err(_) => self.error(ErrorKind::InvalidNumber(text.to_string())),
            },
            1 => match text.parse::<f64>() {
                Ok(value) => TokenKind::Float(value),
                Err(_) => self.error(ErrorKind::InvalidNumber(text.to_string())),
            },
            _ => {
                let text = text.to_string();
                self.error(ErrorKind::InvalidNumber(text))
            }
        }
    }

    /// `1.5` continues the number, `xs.length` after a digit does not
    fn digit_follows_dot(&self) -> bool {
        self.source[self.current_pos..]
            .chars()
            .nth(1)
            .map_or(false, |c| c.is_ascii_digit())
    }

    /// Scan an identifier or keyword
    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.current_pos;

        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let text = &self.source[start..self.current_pos];
        lookup_keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source, 0);
        lexer
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .filter(|k| !matches!(k, TokenKind::Eof))
            .collect()
    }

    #[test]
    fn test_keywords() {
        let tokens = tokenize("int void struct inttype handletype import inline");
        assert_eq!(
            tokens,
            vec![
                TokenKind::IntType,
                TokenKind::Void,
                TokenKind::Struct,
                TokenKind::IntTypeDecl,
                TokenKind::HandleTypeDecl,
                TokenKind::Import,
                TokenKind::Inline,
            ]
        );
    }

    #[test]
    fn test_operators() {
        let tokens = tokenize("+ - * / = == != < <= > >= && || ! += %=");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Bang,
                TokenKind::PlusEqual,
                TokenKind::PercentEqual,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = tokenize("42 3.25 0 100.0");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Int(42),
                TokenKind::Float(3.25),
                TokenKind::Int(0),
                TokenKind::Float(100.0),
            ]
        );
    }

    #[test]
    fn test_two_decimal_points_is_an_error() {
        let mut lexer = Lexer::new("1.2.3", 0);
        let token = lexer.next_token();
        assert!(matches!(token.kind, TokenKind::Invalid(ErrorKind::InvalidNumber(_))));
        assert!(lexer.failed);
    }

    #[test]
    fn test_member_after_number_is_not_a_float() {
        let tokens = tokenize("xs.length");
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn test_strings_and_interpolation() {
        let tokens = tokenize(r#""hello" "a $x + 1$ b" "cost: \$5""#);
        assert_eq!(tokens[0], TokenKind::Str(vec![StrPart::Text("hello".into())]));
        assert_eq!(
            tokens[1],
            TokenKind::Str(vec![
                StrPart::Text("a ".into()),
                StrPart::Interp("x + 1".into(), 1, 13),
                StrPart::Text(" b".into()),
            ])
        );
        assert_eq!(tokens[2], TokenKind::Str(vec![StrPart::Text("cost: $5".into())]));
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new("\"abc", 0);
        let err = lexer.tokenize().unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnterminatedString);
    }

    #[test]
    fn test_line_tracking() {
        let mut lexer = Lexer::new("a\n// comment\n  b", 0);
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].span.line, 1);
        assert_eq!(tokens[1].span.line, 3);
        assert_eq!(tokens[1].span.column, 3);
    }
}
