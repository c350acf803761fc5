use crate::runtime::{
    data_structures::quotation::QuotationId,
    error::{self, script_error},
    handle::HandleId,
    interpreter::Interpreter,
};
use std::fmt::{self, Display, Formatter};

/// Core value enumeration.  Exactly four variants, matching the closed set of things this
/// interpreter's data stack can hold: integers, owned strings, references to interned
/// quotations, and references to event-loop handles.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    /// A 64-bit signed integer.
    Int(i64),

    /// An owned, NUL-free-of-significance byte sequence -- not necessarily valid UTF-8. Each
    /// `String` value on the stack owns its bytes; `dup` deep-copies, `print`/`drop` release. Held
    /// as raw bytes rather than Rust's `String` so that data read off a TCP connection (or any
    /// other source of arbitrary bytes) is delivered unchanged rather than silently replacing
    /// invalid sequences with U+FFFD.
    String(Vec<u8>),

    /// A reference to a quotation interned in the interpreter's `QuotationStore`.
    Quote(QuotationId),

    /// A reference to a handle owned by the `HandleRegistry`.
    Handle(HandleId),
}

/// Convert an arbitrary Rust value into a `Value`.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

impl ToValue for i64 {
    fn to_value(&self) -> Value {
        Value::Int(*self)
    }
}

impl ToValue for usize {
    fn to_value(&self) -> Value {
        Value::Int(*self as i64)
    }
}

impl ToValue for &str {
    fn to_value(&self) -> Value {
        Value::String((*self).as_bytes().to_vec())
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::String(self.clone().into_bytes())
    }
}

/// Pretty print the value for display, e.g. in diagnostics and the call-stack dump. Unlike
/// `print` (which writes a `String` value's bytes verbatim), this decodes lossily -- it exists
/// only for human-readable error output, never for data actually handed back to a script.
impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Value::Int(value) => write!(f, "{}", value),
            Value::String(value) => write!(f, "{}", String::from_utf8_lossy(value)),
            Value::Quote(id) => write!(f, "[quote #{}]", id),
            Value::Handle(id) => write!(f, "[handle #{}]", id),
        }
    }
}

impl Value {
    /// Check if the value is an `Int`.
    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// Check if the value is a `String`.
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// Check if the value is a `Quote`.
    pub fn is_quote(&self) -> bool {
        matches!(self, Value::Quote(_))
    }

    /// Check if the value is a `Handle`.
    pub fn is_handle(&self) -> bool {
        matches!(self, Value::Handle(_))
    }

    /// Convert the value to a string that could be embedded directly in source code: escape
    /// sequences restored, enclosed in double quotes.  Used for debug and stack-dump printing.
    pub fn stringify(text: &str) -> String {
        let mut result = String::with_capacity(text.len() + 2);

        result.push('"');

        for character in text.chars() {
            match character {
                '"' => result.push_str("\\\""),
                '\n' => result.push_str("\\n"),
                '\r' => result.push_str("\\r"),
                '\t' => result.push_str("\\t"),
                '\\' => result.push_str("\\\\"),
                _ => result.push(character),
            }
        }

        result.push('"');

        result
    }

    /// Require this value to be an `Int`, or raise a script error against the interpreter's
    /// current location.
    pub fn as_int(&self, interpreter: &dyn Interpreter) -> error::Result<i64> {
        match self {
            Value::Int(value) => Ok(*value),
            _ => script_error(interpreter, "Expected an integer value.".to_string()),
        }
    }

    /// Require this value to be a `String`, returning its raw bytes undecoded.
    pub fn as_bytes(&self, interpreter: &dyn Interpreter) -> error::Result<&Vec<u8>> {
        match self {
            Value::String(value) => Ok(value),
            _ => script_error(interpreter, "Expected a string value.".to_string()),
        }
    }

    /// Require this value to be a `Quote`.
    pub fn as_quote(&self, interpreter: &dyn Interpreter) -> error::Result<QuotationId> {
        match self {
            Value::Quote(id) => Ok(*id),
            _ => script_error(interpreter, "Expected a quotation value.".to_string()),
        }
    }

    /// Require this value to be a `Handle`.
    pub fn as_handle(&self, interpreter: &dyn Interpreter) -> error::Result<HandleId> {
        match self {
            Value::Handle(id) => Ok(*id),
            _ => script_error(interpreter, "Expected a handle value.".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringify_escapes_special_characters() {
        assert_eq!(Value::stringify("a\nb\tc\\d\"e"), "\"a\\nb\\tc\\\\d\\\"e\"");
    }

    #[test]
    fn variant_predicates() {
        assert!(Value::Int(1).is_int());
        assert!(Value::String(b"x".to_vec()).is_string());
        assert!(Value::Quote(0).is_quote());
        assert!(Value::Handle(0).is_handle());
        assert!(!Value::Int(1).is_string());
    }
}
