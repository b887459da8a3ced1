//! Runtime value types for Ferrule
//!
//! `Slot` is what the VM stores in globals, locals and operand stacks: a raw
//! 64-bit scalar or a heap index, with the discriminant saying which. `Value`
//! is the owned, host-facing form used for program results and host-call
//! results, printed by a type-directed printer.

use std::fmt;

/// One VM value slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// int, float bits, bool, inttype, handletype, or a null reference
    Scalar(u64),
    /// Index of a live heap entry
    Managed(u32),
}

impl Slot {
    pub const NULL: Slot = Slot::Scalar(0);

    pub fn int(value: i64) -> Self {
        Slot::Scalar(value as u64)
    }

    pub fn float(value: f64) -> Self {
        Slot::Scalar(value.to_bits())
    }

    pub fn bool(value: bool) -> Self {
        Slot::Scalar(value as u64)
    }

    /// Raw scalar bits; a managed slot reads as its heap index
    pub fn bits(self) -> u64 {
        match self {
            Slot::Scalar(bits) => bits,
            Slot::Managed(index) => index as u64,
        }
    }

    pub fn as_int(self) -> i64 {
        self.bits() as i64
    }

    pub fn as_float(self) -> f64 {
        f64::from_bits(self.bits())
    }

    pub fn as_bool(self) -> bool {
        self.bits() != 0
    }

    pub fn heap_index(self) -> Option<u32> {
        match self {
            Slot::Managed(index) => Some(index),
            Slot::Scalar(_) => None,
        }
    }
}

/// A script value detached from the VM heap
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Result of a function that returns nothing
    Void,
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Struct { name: String, fields: Vec<(String, Value)> },
    /// Success payload or failure message
    Error(Result<Box<Value>, String>),
    /// A function pointer, described by its innermost function's name
    Func(String),
    /// A value held by an `any`
    Any(Box<Value>),
    /// inttype or handletype value
    Nominal { name: String, value: i64 },
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Struct { .. } => "struct",
            Value::Error(_) => "error",
            Value::Func(_) => "function",
            Value::Any(_) => "any",
            Value::Nominal { .. } => "inttype",
        }
    }
}

/// Floats always show a fractional part so they never read as ints
pub fn format_float(value: f64) -> String {
    let text = format!("{}", value);
    if value.is_finite() && !text.contains(['.', 'e']) {
        format!("{}.0", text)
    } else {
        text
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, open: &str, items: &[Value], close: &str) -> fmt::Result {
    write!(f, "{}", open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    write!(f, "{}", close)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => write!(f, "void"),
            Value::Null => write!(f, "null"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", format_float(*n)),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => write_list(f, "[", items, "]"),
            Value::Tuple(items) => write_list(f, "(", items, ")"),
            Value::Struct { name, fields } => {
                write!(f, "{} {{", name)?;
                for (i, (field, value)) in fields.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{}{}: {}", sep, field, value)?;
                }
                if fields.is_empty() {
                    write!(f, "}}")
                } else {
                    write!(f, " }}")
                }
            }
            Value::Error(Ok(value)) => write!(f, "ok({})", value),
            Value::Error(Err(message)) => write!(f, "error({:?})", message),
            Value::Func(name) => write!(f, "<fn {}>", name),
            Value::Any(value) => write!(f, "{}", value),
            Value::Nominal { name, value } => write!(f, "{}({})", name, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_scalars() {
        assert_eq!(Slot::int(-3).as_int(), -3);
        assert_eq!(Slot::float(2.5).as_float(), 2.5);
        assert!(Slot::bool(true).as_bool());
        assert_eq!(Slot::NULL, Slot::int(0));
        assert_eq!(Slot::Managed(4).heap_index(), Some(4));
    }

    #[test]
    fn test_printer() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::Float(0.25).to_string(), "0.25");
        assert_eq!(Value::List(vec![Value::Int(1), Value::Str("a".into())]).to_string(), "[1, \"a\"]");
        let point = Value::Struct {
            name: "Point".into(),
            fields: vec![("x".into(), Value::Int(1)), ("y".into(), Value::Int(2))],
        };
        assert_eq!(point.to_string(), "Point { x: 1, y: 2 }");
        assert_eq!(Value::Error(Err("bad".into())).to_string(), "error(\"bad\")");
        assert_eq!(Value::Error(Ok(Box::new(Value::Int(5)))).to_string(), "ok(5)");
    }
}
