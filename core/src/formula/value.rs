//! Scalar values flowing through grade formulas.

use std::cmp::Ordering;
use std::fmt;

use chrono::DateTime;

use crate::config::LetterTable;

/// Declared result type of a formula node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Number,
    Boolean,
    Letter,
    Time,
    Duration,
    Untyped,
}

impl ValueKind {
    /// Result kind of `a + b` (or `a - b` when `subtract`).
    pub fn additive(a: ValueKind, b: ValueKind, subtract: bool) -> ValueKind {
        use ValueKind::*;
        match (a, b, subtract) {
            (Time, Duration, _) => Time,
            (Duration, Time, false) => Time,
            (Time, Time, true) => Duration,
            (Duration, Duration, _) => Duration,
            _ => Number,
        }
    }

    /// Kind shared by two alternatives, or `Untyped` when they differ.
    pub fn unify(a: ValueKind, b: ValueKind) -> ValueKind {
        if a == b {
            a
        } else {
            ValueKind::Untyped
        }
    }
}

/// Result of evaluating a formula for one student.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Null,
    Number(f64),
    Boolean(bool),
    /// Letter grade, stored as its numeric encoding.
    Letter(f64),
    /// Unix timestamp in seconds.
    Time(i64),
    /// Seconds.
    Duration(i64),
}

impl Value {
    /// Wrap a raw stored grade according to the kind of the entry it came from.
    pub fn from_raw(kind: ValueKind, v: f64) -> Value {
        if !v.is_finite() {
            return Value::Null;
        }
        match kind {
            ValueKind::Letter => Value::Letter(v),
            ValueKind::Time => Value::Time(v as i64),
            ValueKind::Duration => Value::Duration(v as i64),
            ValueKind::Boolean => Value::Boolean(v != 0.0),
            ValueKind::Number | ValueKind::Untyped => Value::Number(v),
        }
    }

    pub(crate) fn number(v: f64) -> Value {
        if v.is_finite() {
            Value::Number(v)
        } else {
            Value::Null
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Number(_) => Some(ValueKind::Number),
            Value::Boolean(_) => Some(ValueKind::Boolean),
            Value::Letter(_) => Some(ValueKind::Letter),
            Value::Time(_) => Some(ValueKind::Time),
            Value::Duration(_) => Some(ValueKind::Duration),
        }
    }

    /// The underlying numeric encoding; booleans are 0 or 1.
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            Value::Null => None,
            Value::Number(n) | Value::Letter(n) => Some(n),
            Value::Boolean(b) => Some(if b { 1.0 } else { 0.0 }),
            Value::Time(t) | Value::Duration(t) => Some(t as f64),
        }
    }

    pub fn is_truthy(&self) -> bool {
        match *self {
            Value::Null => false,
            Value::Boolean(b) => b,
            Value::Number(n) | Value::Letter(n) => n != 0.0,
            Value::Time(t) | Value::Duration(t) => t != 0,
        }
    }

    /// Format for display, naming letter grades from `letters`, then from
    /// the default table.
    pub fn render(&self, letters: &LetterTable) -> String {
        match *self {
            Value::Letter(n) => letters
                .name_of(n)
                .map(str::to_string)
                .or_else(|| LetterTable::default().name_of(n).map(str::to_string))
                .unwrap_or_else(|| format_number(n)),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::Null => f.write_str("null"),
            Value::Number(n) | Value::Letter(n) => f.write_str(&format_number(n)),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Time(t) => match DateTime::from_timestamp(t, 0) {
                Some(dt) => f.write_str(&dt.to_rfc3339()),
                None => write!(f, "@{t}"),
            },
            Value::Duration(d) => f.write_str(&format_duration(d)),
        }
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn format_duration(d: i64) -> String {
    if d == 0 {
        return "0s".to_string();
    }
    let mut parts = Vec::new();
    let mut rest = d.unsigned_abs();
    for (unit, secs) in [("d", 86_400u64), ("h", 3_600), ("m", 60), ("s", 1)] {
        if rest >= secs {
            parts.push(format!("{}{}", rest / secs, unit));
            rest %= secs;
        }
    }
    let sign = if d < 0 { "-" } else { "" };
    format!("{sign}{}", parts.join(" "))
}

pub fn add(a: Value, b: Value) -> Value {
    additive(a, b, false)
}

pub fn sub(a: Value, b: Value) -> Value {
    additive(a, b, true)
}

fn additive(a: Value, b: Value, subtract: bool) -> Value {
    let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
        return Value::Null;
    };
    let (Some(ka), Some(kb)) = (a.kind(), b.kind()) else {
        return Value::Null;
    };
    let r = if subtract { x - y } else { x + y };
    match ValueKind::additive(ka, kb, subtract) {
        ValueKind::Time => Value::Time(r as i64),
        ValueKind::Duration => Value::Duration(r as i64),
        _ => Value::number(r),
    }
}

pub fn mul(a: Value, b: Value) -> Value {
    numeric(a, b, |x, y| Some(x * y))
}

/// Division by zero is missing data, not an error.
pub fn div(a: Value, b: Value) -> Value {
    numeric(a, b, |x, y| if y == 0.0 { None } else { Some(x / y) })
}

/// Integer remainder; both operands are truncated first.
pub fn rem(a: Value, b: Value) -> Value {
    numeric(a, b, |x, y| {
        let (x, y) = (x.trunc() as i64, y.trunc() as i64);
        if y == 0 {
            None
        } else {
            Some(x.wrapping_rem(y) as f64)
        }
    })
}

pub fn pow(a: Value, b: Value) -> Value {
    numeric(a, b, |x, y| Some(x.powf(y)))
}

fn numeric(a: Value, b: Value, op: impl FnOnce(f64, f64) -> Option<f64>) -> Value {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => op(x, y).map_or(Value::Null, Value::number),
        _ => Value::Null,
    }
}

/// Ordering of two values by numeric encoding; `None` if either is null.
pub fn compare(a: Value, b: Value) -> Option<Ordering> {
    a.as_number()?.partial_cmp(&b.as_number()?)
}

/// Equality used by `==` and `!=`: null equals only null.
pub fn loose_eq(a: Value, b: Value) -> bool {
    match (a.as_number(), b.as_number()) {
        (None, None) => true,
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_propagates_null() {
        for op in [add, sub, mul, pow] {
            assert_eq!(op(Value::Null, Value::Number(2.0)), Value::Null);
            assert_eq!(op(Value::Number(2.0), Value::Null), Value::Null);
        }
    }

    #[test]
    fn test_division_by_zero_is_null() {
        assert_eq!(div(Value::Number(5.0), Value::Number(0.0)), Value::Null);
        assert_eq!(rem(Value::Number(5.0), Value::Number(0.0)), Value::Null);
        assert_eq!(div(Value::Number(5.0), Value::Number(2.0)), Value::Number(2.5));
        assert_eq!(rem(Value::Number(7.0), Value::Number(3.0)), Value::Number(1.0));
    }

    #[test]
    fn test_time_promotion() {
        let t = Value::Time(1_700_000_000);
        let d = Value::Duration(3_600);
        assert_eq!(add(t, d), Value::Time(1_700_003_600));
        assert_eq!(add(d, t), Value::Time(1_700_003_600));
        assert_eq!(sub(t, d), Value::Time(1_699_996_400));
        assert_eq!(sub(Value::Time(1_700_000_100), t), Value::Duration(100));
        assert_eq!(add(t, Value::Number(1.0)), Value::Number(1_700_000_001.0));
    }

    #[test]
    fn test_compare_and_equality() {
        assert_eq!(
            compare(Value::Boolean(true), Value::Number(3.0)),
            Some(Ordering::Less)
        );
        assert_eq!(compare(Value::Null, Value::Number(3.0)), None);
        assert!(loose_eq(Value::Null, Value::Null));
        assert!(!loose_eq(Value::Null, Value::Number(0.0)));
        assert!(loose_eq(Value::Letter(95.0), Value::Number(95.0)));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(-1.0).is_truthy());
        assert!(Value::Duration(5).is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::Duration(90_061).to_string(), "1d 1h 1m 1s");
        assert_eq!(Value::Duration(-60).to_string(), "-1m");
        assert_eq!(Value::Time(0).to_string(), "1970-01-01T00:00:00+00:00");
        assert_eq!(Value::Letter(95.0).render(&LetterTable::default()), "A");
        let custom = LetterTable::new([("A".to_string(), 4.0), ("P".to_string(), 1.0)]);
        assert_eq!(Value::Letter(4.0).render(&custom), "A");
        assert_eq!(Value::Letter(88.0).render(&custom), "B+");
        assert_eq!(Value::Letter(3.5).render(&custom), "3.5");
    }
}
