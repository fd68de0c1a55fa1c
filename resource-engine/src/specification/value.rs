//! Typed comparison values and raw-text conversion

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::schema::FieldKind;

/// Raw filter text could not be converted to the declared field type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot convert '{raw}' to {kind}: {reason}")]
pub struct ConversionError {
    /// Target type label
    pub kind: &'static str,
    /// Offending input
    pub raw: String,
    /// What went wrong
    pub reason: String,
}

impl ConversionError {
    fn new(kind: &FieldKind, raw: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: kind.label(),
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

/// A typed value used on the right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Absent value
    Null,
    /// Text
    String(String),
    /// 64-bit integer
    Integer(i64),
    /// 64-bit float
    Decimal(f64),
    /// Boolean
    Boolean(bool),
    /// UTC timestamp
    DateTime(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// Canonical enum variant name
    Enum(String),
}

impl FieldValue {
    /// Convert raw filter text to the declared type of a field
    pub fn parse(kind: &FieldKind, raw: &str) -> Result<Self, ConversionError> {
        let raw = raw.trim();
        match kind {
            FieldKind::String => Ok(Self::String(raw.to_string())),
            FieldKind::Integer => raw
                .parse::<i64>()
                .map(Self::Integer)
                .map_err(|e| ConversionError::new(kind, raw, e.to_string())),
            FieldKind::Decimal => match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Self::Decimal(v)),
                Ok(_) => Err(ConversionError::new(kind, raw, "not a finite number")),
                Err(e) => Err(ConversionError::new(kind, raw, e.to_string())),
            },
            FieldKind::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Self::Boolean(true)),
                "false" | "0" | "no" => Ok(Self::Boolean(false)),
                _ => Err(ConversionError::new(kind, raw, "expected true or false")),
            },
            FieldKind::DateTime => parse_datetime(raw)
                .map(Self::DateTime)
                .ok_or_else(|| ConversionError::new(kind, raw, "expected RFC 3339 or YYYY-MM-DD")),
            FieldKind::Uuid => Uuid::parse_str(raw)
                .map(Self::Uuid)
                .map_err(|e| ConversionError::new(kind, raw, e.to_string())),
            FieldKind::Enum(variants) => variants
                .iter()
                .find(|v| v.eq_ignore_ascii_case(raw))
                .map(|v| Self::Enum((*v).to_string()))
                .ok_or_else(|| {
                    ConversionError::new(
                        kind,
                        raw,
                        format!("expected one of {}", variants.join(", ")),
                    )
                }),
            FieldKind::Relation(_) => Err(ConversionError::new(
                kind,
                raw,
                "relations cannot be compared directly",
            )),
        }
    }

    /// Read a serialized attribute as the given kind
    ///
    /// JSON `null` becomes [`FieldValue::Null`]; values of an incompatible
    /// shape yield `None`.
    pub fn from_json(kind: &FieldKind, json: &Value) -> Option<Self> {
        if json.is_null() {
            return Some(Self::Null);
        }
        match kind {
            FieldKind::String => match json {
                Value::String(s) => Some(Self::String(s.clone())),
                Value::Number(n) => Some(Self::String(n.to_string())),
                Value::Bool(b) => Some(Self::String(b.to_string())),
                _ => None,
            },
            FieldKind::Integer | FieldKind::Decimal => match json {
                Value::Number(n) => n
                    .as_i64()
                    .map(Self::Integer)
                    .or_else(|| n.as_f64().map(Self::Decimal)),
                Value::String(s) => Self::parse(kind, s).ok(),
                _ => None,
            },
            FieldKind::Boolean => json.as_bool().map(Self::Boolean),
            FieldKind::DateTime => json.as_str().and_then(parse_datetime).map(Self::DateTime),
            FieldKind::Uuid => json
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(Self::Uuid),
            FieldKind::Enum(_) => json.as_str().map(|s| Self::Enum(s.to_string())),
            FieldKind::Relation(_) => None,
        }
    }

    /// The field kind this value compares as
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Null | Self::String(_) => FieldKind::String,
            Self::Integer(_) => FieldKind::Integer,
            Self::Decimal(_) => FieldKind::Decimal,
            Self::Boolean(_) => FieldKind::Boolean,
            Self::DateTime(_) => FieldKind::DateTime,
            Self::Uuid(_) => FieldKind::Uuid,
            Self::Enum(_) => FieldKind::Enum(&[]),
        }
    }

    /// Whether this is [`FieldValue::Null`]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Order two values of compatible types
    ///
    /// Integers and decimals compare numerically, enum names ignore case.
    /// Values of unrelated types are unordered.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Decimal(b)) => (*a as f64).partial_cmp(b),
            (Self::Decimal(a), Self::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Decimal(a), Self::Decimal(b)) => a.partial_cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::Uuid(a), Self::Uuid(b)) => Some(a.cmp(b)),
            (Self::Enum(a), Self::Enum(b)) => {
                Some(a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()))
            }
            _ => None,
        }
    }

    /// Equality under [`compare`](Self::compare) semantics
    pub fn matches(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS[.f]` (UTC) and `YYYY-MM-DD` (midnight UTC)
fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Decimal(d) => write!(f, "{:?}", d),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Enum(e) => write!(f, "#{}", e),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        Self::Integer(i64::from(n))
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        Self::Decimal(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::DateTime(dt)
    }
}

impl From<Uuid> for FieldValue {
    fn from(u: Uuid) -> Self {
        Self::Uuid(u)
    }
}
