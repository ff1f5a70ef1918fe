//! Stored values and their metadata.

use bytes::Bytes;
use std::fmt;

/// A scalar value, tagged by kind.
///
/// Values arriving as text are stored as [`Value::Int`] when they are the
/// canonical decimal spelling of an `i64`, so that `INCR` does not have to
/// re-parse them. Both kinds render back to the exact bytes the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(Bytes),
    Int(i64),
}

/// The kind tag of a [`Value`], as written into snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Str = 0,
    Int = 1,
}

impl ValueKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ValueKind::Str),
            1 => Some(ValueKind::Int),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl Value {
    /// Builds a value from client bytes, choosing the integer kind when the
    /// text round-trips exactly (`"10"` yes, `"010"` or `"+1"` no).
    pub fn from_bytes(bytes: Bytes) -> Self {
        if let Some(n) = parse_canonical_i64(&bytes) {
            return Value::Int(n);
        }
        Value::Str(bytes)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::Int(_) => ValueKind::Int,
        }
    }

    /// Renders the value as the bytes a client reads back.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Value::Str(b) => b.clone(),
            Value::Int(n) => Bytes::from(n.to_string()),
        }
    }

    /// Interprets the value as an integer for `INCR`/`DECR`.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Str(b) => parse_decimal_i64(b),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<&'static str> for Value {
    fn from(s: &'static str) -> Self {
        Value::from_bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

/// Parses an optionally negative decimal integer. Unlike `str::parse`, a
/// leading `+` is rejected.
pub(crate) fn parse_decimal_i64(bytes: &[u8]) -> Option<i64> {
    if bytes.first() == Some(&b'+') {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_canonical_i64(bytes: &[u8]) -> Option<i64> {
    // Longest i64 is "-9223372036854775808" (20 bytes)
    if bytes.is_empty() || bytes.len() > 20 {
        return None;
    }
    let s = std::str::from_utf8(bytes).ok()?;
    let n: i64 = s.parse().ok()?;
    (n.to_string() == s).then_some(n)
}

/// One key's stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Value,
    /// Absolute deadline in Unix milliseconds (None = never expires)
    pub expires_at: Option<u64>,
    /// Creation time in Unix milliseconds
    pub created_at: u64,
}

impl Entry {
    pub fn new(value: Value, now: u64) -> Self {
        Self {
            value,
            expires_at: None,
            created_at: now,
        }
    }

    pub fn with_deadline(value: Value, now: u64, expires_at: u64) -> Self {
        Self {
            value,
            expires_at: Some(expires_at),
            created_at: now,
        }
    }

    /// An entry whose deadline is `<= now` is dead.
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Remaining lifetime in milliseconds, or None if there is no deadline.
    pub fn remaining_ms(&self, now: u64) -> Option<u64> {
        self.expires_at.map(|exp| exp.saturating_sub(now))
    }
}
