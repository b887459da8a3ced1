//! Engine configuration and command-line option binding

use crate::error::{ErrorKind, FerruleError, Result};
use std::path::{Path, PathBuf};

pub const DEFAULT_START: &str = "Start";
pub const DEFAULT_INIT: &str = "Init";

/// Tunables for compiling and running one program
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Function of the main module run after startup
    pub start: String,
    /// Optional per-module initializer
    pub init: String,
    /// `name=value` bindings for `option` globals
    pub options: Vec<(String, String)>,
    /// Persisted-variable file; defaults next to the main script
    pub persist_path: Option<PathBuf>,
    pub initial_heap: usize,
    pub max_heap: usize,
    pub max_call_depth: usize,
    pub max_operand_stack: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start: DEFAULT_START.to_string(),
            init: DEFAULT_INIT.to_string(),
            options: Vec::new(),
            persist_path: None,
            initial_heap: 256,
            max_heap: 4_194_304,
            max_call_depth: 1024,
            max_operand_stack: 65_536,
        }
    }
}

impl EngineConfig {
    pub fn with_start(mut self, name: impl Into<String>) -> Self {
        self.start = name.into();
        self
    }

    pub fn with_init(mut self, name: impl Into<String>) -> Self {
        self.init = name.into();
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }

    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    pub fn with_heap(mut self, initial: usize, max: usize) -> Self {
        self.initial_heap = initial;
        self.max_heap = max;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_max_operand_stack(mut self, depth: usize) -> Self {
        self.max_operand_stack = depth;
        self
    }

    /// Persisted-variable file for a program whose main script is `script`
    pub fn persist_path_for(&self, script: &Path) -> PathBuf {
        self.persist_path.clone().unwrap_or_else(|| script.with_extension("persist"))
    }
}

/// Split a command-line `name=value` argument
pub fn parse_binding(arg: &str) -> Result<(String, String)> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(FerruleError::new(
            ErrorKind::InvalidOption(format!("'{}' is not of the form name=value", arg)),
            None,
        )),
    }
}

/// A parsed option value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

/// Kinds of global an option can bind to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Int,
    Bool,
    Str,
}

/// Convert the text of a binding for a global of `kind`. Ints must be all
/// digits; bools look only at the first character.
pub fn parse_option(name: &str, kind: OptionKind, text: &str) -> Result<OptionValue> {
    let invalid = |why: &str| FerruleError::new(ErrorKind::InvalidOption(format!("{}={}: {}", name, text, why)), None);
    match kind {
        OptionKind::Str => Ok(OptionValue::Str(text.to_string())),
        OptionKind::Int => {
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("expected digits"));
            }
            text.parse().map(OptionValue::Int).map_err(|_| invalid("integer out of range"))
        }
        OptionKind::Bool => match text.chars().next() {
            Some('t' | 'y' | '1') => Ok(OptionValue::Bool(true)),
            Some('f' | 'n' | '0') => Ok(OptionValue::Bool(false)),
            _ => Err(invalid("expected a boolean")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = EngineConfig::default().with_start("Main").with_option("port", "80");
        assert_eq!(config.start, "Main");
        assert_eq!(config.init, "Init");
        assert_eq!(config.options, vec![("port".to_string(), "80".to_string())]);
        assert_eq!(config.persist_path_for(Path::new("dir/app.fer")), PathBuf::from("dir/app.persist"));
    }

    #[test]
    fn test_parse_binding() {
        assert_eq!(parse_binding("name=a=b").unwrap(), ("name".to_string(), "a=b".to_string()));
        assert!(parse_binding("novalue").is_err());
        assert!(parse_binding("=x").is_err());
    }

    #[test]
    fn test_option_values() {
        assert_eq!(parse_option("n", OptionKind::Int, "42").unwrap(), OptionValue::Int(42));
        assert!(parse_option("n", OptionKind::Int, "-1").is_err());
        assert!(parse_option("n", OptionKind::Int, "").is_err());
        assert_eq!(parse_option("b", OptionKind::Bool, "yes").unwrap(), OptionValue::Bool(true));
        assert_eq!(parse_option("b", OptionKind::Bool, "0").unwrap(), OptionValue::Bool(false));
        assert!(parse_option("b", OptionKind::Bool, "maybe").is_err());
        assert_eq!(parse_option("s", OptionKind::Str, "").unwrap(), OptionValue::Str(String::new()));
    }
}
