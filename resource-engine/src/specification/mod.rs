//! Composable, backend-agnostic predicates
//!
//! A [`Specification`] is a predicate tree over an entity type. Leaves are
//! [`Condition`]s on dotted attribute paths; inner nodes combine them with
//! `and`/`or`/`not`. Combinators are pure: they consume their inputs and return
//! a new tree, flattening nested conjunctions and disjunctions so composition
//! is associative.
//!
//! The same tree is evaluated three ways:
//! - [`Specification::matches`] against a serialized entity (in-memory store)
//! - rendered to SQL by [`sql`] (PostgreSQL store, `database` feature)
//! - rendered to canonical text by `Display`, hashed into cache keys
//!
//! # Example
//!
//! ```rust
//! use resource_engine::specification::Specification;
//!
//! let adults = Specification::field("age").gte(18);
//! let spec = Specification::is_active().and(adults);
//! assert_eq!(spec.to_string(), "and(active eq true, age gte 18)");
//! ```

mod builder;
#[cfg(feature = "database")]
pub mod sql;
mod value;

pub use builder::SpecificationBuilder;
pub use value::{ConversionError, FieldValue};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Comparison applied to the value(s) found at a path
#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    /// Equal to
    Eq(FieldValue),
    /// Not equal to
    Ne(FieldValue),
    /// Case-insensitive substring
    Contains(String),
    /// Case-insensitive prefix
    StartsWith(String),
    /// Case-insensitive suffix
    EndsWith(String),
    /// Greater than
    Gt(FieldValue),
    /// Greater than or equal to
    Gte(FieldValue),
    /// Less than
    Lt(FieldValue),
    /// Less than or equal to
    Lte(FieldValue),
    /// Member of the set
    In(Vec<FieldValue>),
    /// Not a member of the set
    NotIn(Vec<FieldValue>),
    /// Inclusive range
    Between(FieldValue, FieldValue),
    /// Absent or null
    IsNull,
    /// Present and not null
    IsNotNull,
}

impl Comparison {
    fn token(&self) -> &'static str {
        match self {
            Self::Eq(_) => "eq",
            Self::Ne(_) => "neq",
            Self::Contains(_) => "like",
            Self::StartsWith(_) => "starts",
            Self::EndsWith(_) => "ends",
            Self::Gt(_) => "gt",
            Self::Gte(_) => "gte",
            Self::Lt(_) => "lt",
            Self::Lte(_) => "lte",
            Self::In(_) => "in",
            Self::NotIn(_) => "notin",
            Self::Between(_, _) => "between",
            Self::IsNull => "null",
            Self::IsNotNull => "notnull",
        }
    }

    /// Test one non-null serialized value
    fn test(&self, json: &Value) -> bool {
        let typed = |operand: &FieldValue| FieldValue::from_json(&operand.kind(), json);
        let ordered = |operand: &FieldValue| typed(operand).and_then(|v| v.compare(operand));

        match self {
            Self::Eq(operand) => ordered(operand) == Some(Ordering::Equal),
            Self::Ne(operand) => matches!(ordered(operand), Some(o) if o != Ordering::Equal),
            Self::Contains(needle) => text_of(json).is_some_and(|t| t.contains(&needle.to_lowercase())),
            Self::StartsWith(needle) => {
                text_of(json).is_some_and(|t| t.starts_with(&needle.to_lowercase()))
            }
            Self::EndsWith(needle) => {
                text_of(json).is_some_and(|t| t.ends_with(&needle.to_lowercase()))
            }
            Self::Gt(operand) => ordered(operand) == Some(Ordering::Greater),
            Self::Gte(operand) => matches!(
                ordered(operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt(operand) => ordered(operand) == Some(Ordering::Less),
            Self::Lte(operand) => matches!(ordered(operand), Some(Ordering::Less | Ordering::Equal)),
            Self::In(set) => set
                .iter()
                .any(|operand| ordered(operand) == Some(Ordering::Equal)),
            Self::NotIn(set) => set.iter().all(|operand| {
                matches!(ordered(operand), Some(o) if o != Ordering::Equal)
            }),
            Self::Between(low, high) => {
                matches!(ordered(low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(ordered(high), Some(Ordering::Less | Ordering::Equal))
            }
            Self::IsNull | Self::IsNotNull => false,
        }
    }
}

/// Lowercased text form of a scalar, used by the pattern comparisons
fn text_of(json: &Value) -> Option<String> {
    match json {
        Value::String(s) => Some(s.to_lowercase()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A comparison on one dotted attribute path
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Dotted attribute path
    pub path: String,
    /// Comparison applied at the path
    pub comparison: Comparison,
}

impl Condition {
    /// Create a condition
    pub fn new(path: impl Into<String>, comparison: Comparison) -> Self {
        Self {
            path: path.into(),
            comparison,
        }
    }

    fn matches(&self, document: &Value) -> bool {
        let segments: Vec<&str> = self.path.split('.').collect();
        let mut found = Vec::new();
        collect_path(document, &segments, &mut found);

        match &self.comparison {
            Comparison::IsNull => found.is_empty() || found.iter().any(|v| v.is_null()),
            Comparison::IsNotNull => found.iter().any(|v| !v.is_null()),
            comparison => found
                .iter()
                .filter(|v| !v.is_null())
                .any(|v| comparison.test(v)),
        }
    }
}

/// Gather every value reachable at `segments`, descending into arrays
fn collect_path<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    match (segments.split_first(), value) {
        (None, Value::Array(items)) => out.extend(items.iter()),
        (None, value) => out.push(value),
        (Some(_), Value::Array(items)) => {
            for item in items {
                collect_path(item, segments, out);
            }
        }
        (Some((head, rest)), Value::Object(map)) => {
            if let Some(next) = map.get(*head) {
                collect_path(next, rest, out);
            }
        }
        (Some(_), _) => {}
    }
}

/// A composable predicate over an entity type
///
/// The empty specification is [`Specification::All`], which matches every
/// entity; an empty filter never means "match nothing".
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Specification {
    /// Universal true predicate
    #[default]
    All,
    /// Single comparison
    Condition(Condition),
    /// Every child holds
    And(Vec<Specification>),
    /// At least one child holds
    Or(Vec<Specification>),
    /// The child does not hold
    Not(Box<Specification>),
}

impl Specification {
    /// Start a condition on `path`
    pub fn field(path: impl Into<String>) -> FieldRef {
        FieldRef { path: path.into() }
    }

    /// Entities that are not soft-deleted
    pub fn is_active() -> Self {
        Self::field("active").eq(true)
    }

    /// Entities with no delete timestamp
    pub fn not_deleted() -> Self {
        Self::field("deleted_at").is_null()
    }

    /// Soft-deleted entities
    pub fn deleted() -> Self {
        Self::field("active").eq(false)
    }

    /// Entities created within `[from, to]`
    pub fn created_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self::field("created_at").between(from, to)
    }

    /// Conjunction of all items (`All` when empty)
    pub fn all_of(specs: impl IntoIterator<Item = Specification>) -> Self {
        specs.into_iter().fold(Self::All, Self::and)
    }

    /// Disjunction of all items (`All` when empty)
    pub fn any_of(specs: impl IntoIterator<Item = Specification>) -> Self {
        let mut iter = specs.into_iter();
        match iter.next() {
            Some(first) => iter.fold(first, Self::or),
            None => Self::All,
        }
    }

    /// Both predicates hold
    #[must_use]
    pub fn and(self, other: Specification) -> Self {
        match (self, other) {
            (Self::All, other) => other,
            (this, Self::All) => this,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (this, Self::And(mut right)) => {
                right.insert(0, this);
                Self::And(right)
            }
            (this, other) => Self::And(vec![this, other]),
        }
    }

    /// Either predicate holds
    #[must_use]
    pub fn or(self, other: Specification) -> Self {
        match (self, other) {
            (Self::All, _) | (_, Self::All) => Self::All,
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (this, Self::Or(mut right)) => {
                right.insert(0, this);
                Self::Or(right)
            }
            (this, other) => Self::Or(vec![this, other]),
        }
    }

    /// Negation
    #[must_use]
    pub fn not(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }

    /// Whether this is the universal predicate
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Every condition in the tree, depth first
    pub fn conditions(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            Self::All => {}
            Self::Condition(condition) => out.push(condition),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_conditions(out);
                }
            }
            Self::Not(inner) => inner.collect_conditions(out),
        }
    }

    /// Evaluate against a serialized entity
    ///
    /// Dotted paths walk nested objects; when a path crosses an array the
    /// condition holds if any element satisfies it.
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Condition(condition) => condition.matches(document),
            Self::And(children) => children.iter().all(|c| c.matches(document)),
            Self::Or(children) => children.iter().any(|c| c.matches(document)),
            Self::Not(inner) => !inner.matches(document),
        }
    }

    /// Short stable digest of the canonical text, used in cache keys
    pub fn fingerprint(&self) -> String {
        if self.is_all() {
            return "all".to_string();
        }
        let hash = blake3::hash(self.to_string().as_bytes());
        hash.to_hex().as_str()[..16].to_string()
    }
}

impl From<Condition> for Specification {
    fn from(condition: Condition) -> Self {
        Self::Condition(condition)
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[FieldValue]) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str("]")
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.path, self.comparison.token())?;
        match &self.comparison {
            Comparison::Eq(v)
            | Comparison::Ne(v)
            | Comparison::Gt(v)
            | Comparison::Gte(v)
            | Comparison::Lt(v)
            | Comparison::Lte(v) => write!(f, " {}", v),
            Comparison::Contains(s) | Comparison::StartsWith(s) | Comparison::EndsWith(s) => {
                write!(f, " {}", FieldValue::String(s.clone()))
            }
            Comparison::In(items) | Comparison::NotIn(items) => {
                f.write_str(" ")?;
                write_list(f, items)
            }
            Comparison::Between(low, high) => write!(f, " {} and {}", low, high),
            Comparison::IsNull | Comparison::IsNotNull => Ok(()),
        }
    }
}

impl fmt::Display for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, children) = match self {
            Self::All => return f.write_str("all"),
            Self::Condition(condition) => return write!(f, "{}", condition),
            Self::Not(inner) => return write!(f, "not({})", inner),
            Self::And(children) => ("and", children),
            Self::Or(children) => ("or", children),
        };
        write!(f, "{}(", name)?;
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", child)?;
        }
        f.write_str(")")
    }
}

/// Builder for a single-path condition
///
/// Obtained from [`Specification::field`].
#[derive(Debug, Clone)]
pub struct FieldRef {
    path: String,
}

impl FieldRef {
    fn with(self, comparison: Comparison) -> Specification {
        Specification::Condition(Condition::new(self.path, comparison))
    }

    /// Equal to
    pub fn eq(self, value: impl Into<FieldValue>) -> Specification {
        self.with(Comparison::Eq(value.into()))
    }

    /// Not equal to
    pub fn ne(self, value: impl Into<FieldValue>) -> Specification {
        self.with(Comparison::Ne(value.into()))
    }

    /// Greater than
    pub fn gt(self, value: impl Into<FieldValue>) -> Specification {
        self.with(Comparison::Gt(value.into()))
    }

    /// Greater than or equal to
    pub fn gte(self, value: impl Into<FieldValue>) -> Specification {
        self.with(Comparison::Gte(value.into()))
    }

    /// Less than
    pub fn lt(self, value: impl Into<FieldValue>) -> Specification {
        self.with(Comparison::Lt(value.into()))
    }

    /// Less than or equal to
    pub fn lte(self, value: impl Into<FieldValue>) -> Specification {
        self.with(Comparison::Lte(value.into()))
    }

    /// Case-insensitive substring
    pub fn contains(self, needle: impl Into<String>) -> Specification {
        self.with(Comparison::Contains(needle.into()))
    }

    /// Case-insensitive prefix
    pub fn starts_with(self, prefix: impl Into<String>) -> Specification {
        self.with(Comparison::StartsWith(prefix.into()))
    }

    /// Case-insensitive suffix
    pub fn ends_with(self, suffix: impl Into<String>) -> Specification {
        self.with(Comparison::EndsWith(suffix.into()))
    }

    /// Member of the set
    pub fn is_in<V: Into<FieldValue>>(self, values: impl IntoIterator<Item = V>) -> Specification {
        self.with(Comparison::In(values.into_iter().map(Into::into).collect()))
    }

    /// Not a member of the set
    pub fn not_in<V: Into<FieldValue>>(self, values: impl IntoIterator<Item = V>) -> Specification {
        self.with(Comparison::NotIn(values.into_iter().map(Into::into).collect()))
    }

    /// Inclusive range
    pub fn between(self, low: impl Into<FieldValue>, high: impl Into<FieldValue>) -> Specification {
        self.with(Comparison::Between(low.into(), high.into()))
    }

    /// Absent or null
    pub fn is_null(self) -> Specification {
        self.with(Comparison::IsNull)
    }

    /// Present and not null
    pub fn is_not_null(self) -> Specification {
        self.with(Comparison::IsNotNull)
    }
}
