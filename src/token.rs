//! Token definitions for Ferrule
//!
//! Tokens represent the atomic units of meaning in source code.

use std::fmt;

/// Location in source code for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// Index of the module the token came from
    pub module: u32,
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(module: u32, line: usize, column: usize) -> Self {
        Self { module, line, column }
    }
}

/// A piece of a string literal: literal text or an interpolated expression
#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Text(String),
    /// Source of the expression between two `$` markers, and where it starts
    Interp(String, usize, usize),
}

/// Token types in Ferrule
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Int(i64),
    Float(f64),
    Str(Vec<StrPart>),
    True,
    False,
    Null,

    // Identifiers
    Ident(String),

    // Type keywords
    IntType,    // int
    FloatType,  // float
    BoolType,   // bool
    StringType, // string
    Void,       // void
    Any,        // any
    List,       // list<T>
    Tuple,      // tuple<A, B>
    Error,      // error<T>
    Fn,         // fn<R(A)>

    // Declaration keywords
    Struct,
    IntTypeDecl,    // inttype
    HandleTypeDecl, // handletype
    Extern,
    Import,
    Inline,
    Option,
    Persist,

    // Statement keywords
    If,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    Assert,

    // Expression keywords
    As,
    New,
    Async,
    Await,
    Bind,
    Discard,
    Asserting,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Equal,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PercentEqual,
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    AndAnd,
    OrOr,
    Bang,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Semicolon,
    Colon,
    Dot,

    /// A malformed literal or character; the parser aborts when it sees one
    Invalid(crate::error::ErrorKind),
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Int(n) => write!(f, "{}", n),
            TokenKind::Float(n) => write!(f, "{}", n),
            TokenKind::Str(_) => write!(f, "string literal"),
            TokenKind::Ident(s) => write!(f, "{}", s),
            TokenKind::Invalid(kind) => write!(f, "{}", kind),
            TokenKind::Eof => write!(f, "end of file"),
            other => match keyword_text(other).or_else(|| punct_text(other)) {
                Some(text) => write!(f, "{}", text),
                None => write!(f, "{:?}", other),
            },
        }
    }
}

/// A token with its kind and location
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}

const KEYWORDS: &[(&str, TokenKind)] = &[
    ("int", TokenKind::IntType),
    ("float", TokenKind::FloatType),
    ("bool", TokenKind::BoolType),
    ("string", TokenKind::StringType),
    ("void", TokenKind::Void),
    ("any", TokenKind::Any),
    ("list", TokenKind::List),
    ("tuple", TokenKind::Tuple),
    ("error", TokenKind::Error),
    ("fn", TokenKind::Fn),
    ("struct", TokenKind::Struct),
    ("inttype", TokenKind::IntTypeDecl),
    ("handletype", TokenKind::HandleTypeDecl),
    ("extern", TokenKind::Extern),
    ("import", TokenKind::Import),
    ("inline", TokenKind::Inline),
    ("option", TokenKind::Option),
    ("persist", TokenKind::Persist),
    ("if", TokenKind::If),
    ("else", TokenKind::Else),
    ("while", TokenKind::While),
    ("for", TokenKind::For),
    ("in", TokenKind::In),
    ("return", TokenKind::Return),
    ("break", TokenKind::Break),
    ("continue", TokenKind::Continue),
    ("assert", TokenKind::Assert),
    ("as", TokenKind::As),
    ("new", TokenKind::New),
    ("async", TokenKind::Async),
    ("await", TokenKind::Await),
    ("bind", TokenKind::Bind),
    ("discard", TokenKind::Discard),
    ("asserting", TokenKind::Asserting),
    ("true", TokenKind::True),
    ("false", TokenKind::False),
    ("null", TokenKind::Null),
];

/// Check if a string is a keyword and return the corresponding token kind.
/// Candidates are compared only when their length matches.
pub fn lookup_keyword(ident: &str) -> Option<TokenKind> {
    KEYWORDS
        .iter()
        .filter(|(text, _)| text.len() == ident.len())
        .find(|(text, _)| *text == ident)
        .map(|(_, kind)| kind.clone())
}

fn keyword_text(kind: &TokenKind) -> Option<&'static str> {
    KEYWORDS.iter().find(|(_, k)| k == kind).map(|(text, _)| *text)
}

fn punct_text(kind: &TokenKind) -> Option<&'static str> {
    let text = match kind {
        TokenKind::Plus => "+",
        TokenKind::Minus => "-",
        TokenKind::Star => "*",
        TokenKind::Slash => "/",
        TokenKind::Percent => "%",
        TokenKind::Equal => "=",
        TokenKind::PlusEqual => "+=",
        TokenKind::MinusEqual => "-=",
        TokenKind::StarEqual => "*=",
        TokenKind::SlashEqual => "/=",
        TokenKind::PercentEqual => "%=",
        TokenKind::EqualEqual => "==",
        TokenKind::BangEqual => "!=",
        TokenKind::Less => "<",
        TokenKind::LessEqual => "<=",
        TokenKind::Greater => ">",
        TokenKind::GreaterEqual => ">=",
        TokenKind::AndAnd => "&&",
        TokenKind::OrOr => "||",
        TokenKind::Bang => "!",
        TokenKind::LeftParen => "(",
        TokenKind::RightParen => ")",
        TokenKind::LeftBrace => "{",
        TokenKind::RightBrace => "}",
        TokenKind::LeftBracket => "[",
        TokenKind::RightBracket => "]",
        TokenKind::Comma => ",",
        TokenKind::Semicolon => ";",
        TokenKind::Colon => ":",
        TokenKind::Dot => ".",
        _ => return None,
    };
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_keyword() {
        assert_eq!(lookup_keyword("inttype"), Some(TokenKind::IntTypeDecl));
        assert_eq!(lookup_keyword("int"), Some(TokenKind::IntType));
        assert_eq!(lookup_keyword("integer"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(TokenKind::LeftBrace.to_string(), "{");
        assert_eq!(TokenKind::Asserting.to_string(), "asserting");
        assert_eq!(TokenKind::Ident("x".into()).to_string(), "x");
    }
}
