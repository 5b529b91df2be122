//! The dynamic value shared by variables, object properties and scripts.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

use super::ids::FlowRef;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("type mismatch in {operation}: cannot apply to {left} and {right}")]
    TypeMismatch {
        operation: &'static str,
        left: ValueKind,
        right: ValueKind,
    },
    #[error("type mismatch: expected {expected}, found {found}")]
    Coercion {
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("division by zero in {0}")]
    DivisionByZero(&'static str),
}

/// The tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    String,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::String => "string",
        };
        f.write_str(name)
    }
}

/// A dynamically typed scalar. Object references travel as `"<id>_<clone>"` strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Default for Value {
    fn default() -> Self {
        Value::Bool(false)
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
        }
    }

    /// The zero value for a tag: `false`, `0`, `0.0` or `""`.
    pub fn zero(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
            ValueKind::String => Value::String(String::new()),
        }
    }

    /// An object reference value.
    pub fn object(r: FlowRef) -> Value {
        Value::String(r.compound_key())
    }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(coercion(ValueKind::Bool, other)),
        }
    }

    /// Int, or a Float truncated toward zero.
    pub fn as_int(&self) -> Result<i64, ValueError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) => Ok(*f as i64),
            other => Err(coercion(ValueKind::Int, other)),
        }
    }

    pub fn as_float(&self) -> Result<f64, ValueError> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            other => Err(coercion(ValueKind::Float, other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(coercion(ValueKind::String, other)),
        }
    }

    /// Interprets a string value as an object compound key.
    pub fn as_object(&self) -> Option<FlowRef> {
        match self {
            Value::String(s) => FlowRef::from_compound_key(s).ok(),
            _ => None,
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Arithmetic on two numbers; the result takes the left operand's tag.
    fn numeric(
        &self,
        rhs: &Value,
        operation: &'static str,
        int_op: impl Fn(i64, i64) -> i64,
        float_op: impl Fn(f64, f64) -> f64,
    ) -> Result<Value, ValueError> {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
            (Value::Int(a), Value::Float(b)) => Ok(Value::Int(float_op(*a as f64, *b) as i64)),
            (Value::Float(a), r) if r.is_numeric() => Ok(Value::Float(float_op(*a, r.as_float()?))),
            _ => Err(mismatch(operation, self, rhs)),
        }
    }

    fn is_zero(&self) -> bool {
        match self {
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            _ => false,
        }
    }

    /// `+`. Strings concatenate; `Bool + Bool` is logical OR.
    pub fn add(&self, rhs: &Value) -> Result<Value, ValueError> {
        match (self, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a || *b)),
            _ => self.numeric(rhs, "+", i64::wrapping_add, |a, b| a + b),
        }
    }

    pub fn sub(&self, rhs: &Value) -> Result<Value, ValueError> {
        self.numeric(rhs, "-", i64::wrapping_sub, |a, b| a - b)
    }

    /// `*`. `Bool * Bool` is logical AND.
    pub fn mul(&self, rhs: &Value) -> Result<Value, ValueError> {
        match (self, rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(*a && *b)),
            _ => self.numeric(rhs, "*", i64::wrapping_mul, |a, b| a * b),
        }
    }

    pub fn div(&self, rhs: &Value) -> Result<Value, ValueError> {
        if self.is_numeric() && rhs.is_zero() {
            return Err(ValueError::DivisionByZero("/"));
        }
        self.numeric(rhs, "/", i64::wrapping_div, |a, b| a / b)
    }

    pub fn rem(&self, rhs: &Value) -> Result<Value, ValueError> {
        if self.is_numeric() && rhs.is_zero() {
            return Err(ValueError::DivisionByZero("%"));
        }
        self.numeric(rhs, "%", i64::wrapping_rem, |a, b| a % b)
    }

    pub fn neg(&self) -> Result<Value, ValueError> {
        match self {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Bool(b) => Ok(Value::Bool(!b)),
            Value::String(_) => Err(coercion(ValueKind::Float, self)),
        }
    }

    pub fn not(&self) -> Result<Value, ValueError> {
        Ok(Value::Bool(!self.truthy("!")?))
    }

    /// Bool, or a number compared against zero.
    fn truthy(&self, operation: &'static str) -> Result<bool, ValueError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Float(f) => Ok(*f != 0.0),
            Value::String(_) => Err(mismatch(operation, self, self)),
        }
    }

    pub fn and(&self, rhs: &Value) -> Result<Value, ValueError> {
        match (self.truthy("&&"), rhs.truthy("&&")) {
            (Ok(a), Ok(b)) => Ok(Value::Bool(a && b)),
            _ => Err(mismatch("&&", self, rhs)),
        }
    }

    pub fn or(&self, rhs: &Value) -> Result<Value, ValueError> {
        match (self.truthy("||"), rhs.truthy("||")) {
            (Ok(a), Ok(b)) => Ok(Value::Bool(a || b)),
            _ => Err(mismatch("||", self, rhs)),
        }
    }

    /// `^`: defined for Bool/Bool and Int/Int only.
    pub fn xor(&self, rhs: &Value) -> Result<Value, ValueError> {
        match (self, rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a ^ b)),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a ^ b)),
            _ => Err(mismatch("^", self, rhs)),
        }
    }

    /// Three-way comparison. Int and Float compare numerically, strings
    /// lexicographically, and booleans as `false < true`.
    pub fn compare(&self, rhs: &Value) -> Result<Ordering, ValueError> {
        match (self, rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => a
                .as_float()?
                .partial_cmp(&b.as_float()?)
                .ok_or(mismatch("<=>", self, rhs)),
            _ => Err(mismatch("<=>", self, rhs)),
        }
    }

    pub fn equals(&self, rhs: &Value) -> Result<bool, ValueError> {
        match (self, rhs) {
            (a, b) if a.is_numeric() && b.is_numeric() => Ok(a.as_float()? == b.as_float()?),
            _ => self.compare(rhs).map(|o| o == Ordering::Equal),
        }
    }

    pub fn less_than(&self, rhs: &Value) -> Result<bool, ValueError> {
        self.compare(rhs).map(|o| o == Ordering::Less)
    }

    pub fn greater_than(&self, rhs: &Value) -> Result<bool, ValueError> {
        self.compare(rhs).map(|o| o == Ordering::Greater)
    }

    pub fn less_or_equal(&self, rhs: &Value) -> Result<bool, ValueError> {
        self.compare(rhs).map(|o| o != Ordering::Greater)
    }

    pub fn greater_or_equal(&self, rhs: &Value) -> Result<bool, ValueError> {
        self.compare(rhs).map(|o| o != Ordering::Less)
    }
}

fn mismatch(operation: &'static str, left: &Value, right: &Value) -> ValueError {
    ValueError::TypeMismatch {
        operation,
        left: left.kind(),
        right: right.kind(),
    }
}

fn coercion(expected: ValueKind, found: &Value) -> ValueError {
    ValueError::Coercion {
        expected,
        found: found.kind(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<FlowRef> for Value {
    fn from(r: FlowRef) -> Self {
        Value::object(r)
    }
}
