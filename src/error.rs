//! Error types for Ferrule
//!
//! Every failure in the pipeline, from a stray character to a deadlocked
//! coroutine, is a `FerruleError`: a kind, an optional source location, the
//! literal source line and, for runtime errors, the backtraces of every live
//! coroutine.

use crate::token::Span;
use std::fmt;

/// Broad classes of errors, used by the CLI and by embedders to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Lexical and syntax errors
    Syntax,
    /// Name resolution and type errors
    Semantic,
    /// A compiler/runtime invariant was violated: an engine bug
    Internal,
    /// Failures while the script runs
    Runtime,
    /// Bad command-line bindings or configuration
    Startup,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Syntax => "syntax",
            Category::Semantic => "semantic",
            Category::Internal => "internal",
            Category::Runtime => "runtime",
            Category::Startup => "startup",
        };
        write!(f, "{}", name)
    }
}

/// Error kinds in Ferrule
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    // Lexer errors
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("unterminated string")]
    UnterminatedString,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("invalid escape sequence '\\{0}'")]
    InvalidEscape(char),

    // Parser errors
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("{0}, got '{1}'")]
    ExpectedToken(String, String),
    #[error("expected expression, got '{0}'")]
    ExpectedExpression(String),
    #[error("expected type, got '{0}'")]
    ExpectedType(String),
    #[error("invalid assignment target")]
    InvalidAssignmentTarget,

    // Resolution errors
    #[error("undeclared identifier '{0}'")]
    UndeclaredIdentifier(String),
    #[error("unknown type '{0}'")]
    UnknownType(String),
    #[error("'{0}' is already declared in this scope")]
    DuplicateDeclaration(String),
    #[error("persisted variable '{0}' is already declared in {1}")]
    DuplicatePersisted(String, String),
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    #[error("cyclic import: {0}")]
    CyclicImport(String),
    #[error("no host function named '{0}'")]
    UnknownHostFunction(String),
    #[error("break outside of loop")]
    BreakOutsideLoop,
    #[error("continue outside of loop")]
    ContinueOutsideLoop,

    // Type errors
    #[error("type mismatch: expected {0}, got {1}")]
    TypeMismatch(String, String),
    #[error("operator '{0}' cannot be applied to {1}")]
    InvalidOperands(String, String),
    #[error("expected {0} arguments, got {1}")]
    WrongArity(usize, usize),
    #[error("value of type {0} is not callable")]
    NotCallable(String),
    #[error("type {0} has no member '{1}'")]
    NoSuchMember(String, String),
    #[error("cannot cast {0} to {1}")]
    InvalidCast(String, String),
    #[error("function '{0}' does not return a value on every path")]
    MissingReturn(String),
    #[error("'{0}' is not a value")]
    NotAValue(String),
    #[error("{0}")]
    InvalidDeclaration(String),
    #[error("no function '{0}' in the main module")]
    MissingStart(String),

    // Internal defects: the checker should have made these unreachable
    #[error("internal defect: {0}")]
    InternalDefect(String),

    // Runtime errors
    #[error("division by zero")]
    DivisionByZero,
    #[error("index {0} out of bounds for length {1}")]
    IndexOutOfBounds(i64, usize),
    #[error("assertion failed")]
    AssertionFailed,
    #[error("null dereference")]
    NullDereference,
    #[error("deadlock: {0}")]
    Deadlock(String),
    #[error("stack overflow")]
    StackOverflow,
    #[error("heap exhausted ({0} entries)")]
    HeapExhausted(usize),
    #[error("cannot downcast any holding {1} to {0}")]
    BadDowncast(String, String),
    #[error("host call '{0}' failed: {1}")]
    HostFailure(String, String),
    #[error("{0}")]
    Io(String),

    // Startup errors
    #[error("invalid option binding: {0}")]
    InvalidOption(String),
}

impl ErrorKind {
    /// Which class of the taxonomy this kind belongs to
    pub fn category(&self) -> Category {
        use ErrorKind::*;
        match self {
            UnexpectedCharacter(_) | UnterminatedString | InvalidNumber(_) | InvalidEscape(_)
            | UnexpectedToken(_) | ExpectedToken(..) | ExpectedExpression(_) | ExpectedType(_)
            | InvalidAssignmentTarget => Category::Syntax,
            UndeclaredIdentifier(_) | UnknownType(_) | DuplicateDeclaration(_) | DuplicatePersisted(..)
            | ModuleNotFound(_) | CyclicImport(_) | UnknownHostFunction(_) | BreakOutsideLoop
            | ContinueOutsideLoop | TypeMismatch(..) | InvalidOperands(..) | WrongArity(..)
            | NotCallable(_) | NoSuchMember(..) | InvalidCast(..) | MissingReturn(_)
            | NotAValue(_) | InvalidDeclaration(_) | MissingStart(_) => Category::Semantic,
            InternalDefect(_) => Category::Internal,
            DivisionByZero | IndexOutOfBounds(..) | AssertionFailed | NullDereference
            | Deadlock(_) | StackOverflow | HeapExhausted(_) | BadDowncast(..)
            | HostFailure(..) | Io(_) => Category::Runtime,
            InvalidOption(_) => Category::Startup,
        }
    }
}

/// One frame of a coroutine backtrace
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub function: String,
    pub path: String,
    pub line: usize,
}

/// The call stack of one coroutine at the moment a runtime error was raised
#[derive(Debug, Clone, PartialEq)]
pub struct CoroutineTrace {
    pub id: u32,
    pub state: String,
    pub frames: Vec<TraceFrame>,
}

impl fmt::Display for CoroutineTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coroutine #{} ({})", self.id, self.state)?;
        for frame in &self.frames {
            write!(f, "\n    at {} ({}:{})", frame.function, frame.path, frame.line)?;
        }
        Ok(())
    }
}

/// A Ferrule error with location information
#[derive(Debug, Clone)]
pub struct FerruleError {
    pub kind: ErrorKind,
    pub span: Option<Span>,
    pub path: Option<String>,
    pub source_line: Option<String>,
    pub backtrace: Vec<CoroutineTrace>,
}

impl FerruleError {
    pub fn new(kind: ErrorKind, span: Option<Span>) -> Self {
        Self {
            kind,
            span,
            path: None,
            source_line: None,
            backtrace: Vec::new(),
        }
    }

    /// Shorthand for an internal defect with no location
    pub fn defect(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalDefect(message.into()), None)
    }

    pub fn category(&self) -> Category {
        self.kind.category()
    }

    /// Attach the file the span points into and copy out the offending line.
    /// Errors that already carry a path are left alone.
    pub fn with_source(mut self, path: &str, source: &str) -> Self {
        if self.path.is_some() {
            return self;
        }
        self.path = Some(path.to_string());
        if let Some(span) = &self.span {
            let lines: Vec<&str> = source.lines().collect();
            if span.line > 0 && span.line <= lines.len() {
                self.source_line = Some(lines[span.line - 1].to_string());
            }
        }
        self
    }

    pub fn with_backtrace(mut self, backtrace: Vec<CoroutineTrace>) -> Self {
        self.backtrace = backtrace;
        self
    }
}

impl fmt::Display for FerruleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let category = self.category();
        match (&self.span, &self.path) {
            (Some(span), Some(path)) => {
                write!(f, "[{}:{}:{}] {} error: {}", path, span.line, span.column, category, self.kind)?
            }
            (Some(span), None) => {
                write!(f, "[line {}:{}] {} error: {}", span.line, span.column, category, self.kind)?
            }
            _ => write!(f, "{} error: {}", category, self.kind)?,
        }

        if let (Some(span), Some(line)) = (&self.span, &self.source_line) {
            write!(f, "\n  | {}", line)?;
            write!(f, "\n  | {}^", " ".repeat(span.column.saturating_sub(1)))?;
        }

        for trace in &self.backtrace {
            write!(f, "\n{}", trace)?;
        }
        Ok(())
    }
}

impl std::error::Error for FerruleError {}

/// Result type for Ferrule operations
pub type Result<T> = std::result::Result<T, FerruleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(ErrorKind::UnterminatedString.category(), Category::Syntax);
        assert_eq!(ErrorKind::CyclicImport("a".into()).category(), Category::Semantic);
        assert_eq!(ErrorKind::InternalDefect("x".into()).category(), Category::Internal);
        assert_eq!(ErrorKind::DivisionByZero.category(), Category::Runtime);
    }

    #[test]
    fn test_display_with_source_line() {
        let span = Span::new(0, 2, 5);
        let err = FerruleError::new(ErrorKind::DivisionByZero, Some(span))
            .with_source("main.fer", "a\nb\nc\n  x / 0;\n");
        let text = err.to_string();
        assert!(text.contains("[main.fer:2:5] runtime error: division by zero"));
        assert!(text.contains("  | b"));
    }
}
