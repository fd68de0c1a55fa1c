//! Filter operators and criteria

use std::fmt;

/// Comparison operators of the filter grammar
///
/// Tokens are matched case-insensitively.
///
/// # Example
///
/// ```rust
/// use resource_engine::filter::FilterOperator;
///
/// assert_eq!(FilterOperator::from_token("GTE"), Some(FilterOperator::Gte));
/// assert_eq!(FilterOperator::NotIn.to_string(), "notin");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Neq,
    /// Case-insensitive substring match
    Like,
    /// Case-insensitive prefix match
    Starts,
    /// Case-insensitive suffix match
    Ends,
    /// Greater than
    Gt,
    /// Greater than or equal to
    Gte,
    /// Less than
    Lt,
    /// Less than or equal to
    Lte,
    /// Member of a `;`-separated set
    In,
    /// Not a member of a `;`-separated set
    NotIn,
    /// Between two `;`-separated bounds, inclusive
    Between,
    /// Value is null
    Null,
    /// Value is not null
    NotNull,
}

impl FilterOperator {
    /// Parse an operator token, ignoring ASCII case
    pub fn from_token(token: &str) -> Option<Self> {
        let op = match token.to_ascii_lowercase().as_str() {
            "eq" => Self::Eq,
            "neq" => Self::Neq,
            "like" => Self::Like,
            "starts" => Self::Starts,
            "ends" => Self::Ends,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "in" => Self::In,
            "notin" => Self::NotIn,
            "between" => Self::Between,
            "null" => Self::Null,
            "notnull" => Self::NotNull,
            _ => return None,
        };
        Some(op)
    }

    /// Canonical lowercase token
    pub fn token(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Like => "like",
            Self::Starts => "starts",
            Self::Ends => "ends",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::NotIn => "notin",
            Self::Between => "between",
            Self::Null => "null",
            Self::NotNull => "notnull",
        }
    }

    /// Whether the operator ignores any supplied value
    pub fn ignores_value(&self) -> bool {
        matches!(self, Self::Null | Self::NotNull)
    }

    /// Whether the value is a `;`-separated list
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, Self::In | Self::NotIn | Self::Between)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A single parsed filter clause
///
/// Immutable once built; the value is kept as raw text and converted to the
/// target field's type when the specification is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterCriteria {
    /// Dotted attribute path
    pub field: String,
    /// Comparison operator
    pub operator: FilterOperator,
    /// Raw value text (empty for `null`/`notnull`)
    pub value: String,
}

impl FilterCriteria {
    /// Create a criterion
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Implicit-equality criterion used for map-style input
    pub fn eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// The `;`-separated sub-values, trimmed, empty entries dropped
    pub fn values(&self) -> Vec<&str> {
        self.value
            .split(';')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect()
    }
}

impl fmt::Display for FilterCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operator.ignores_value() {
            write!(f, "{}:{}", self.field, self.operator)
        } else {
            write!(f, "{}:{}:{}", self.field, self.operator, self.value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_tokens_are_case_insensitive() {
        assert_eq!(FilterOperator::from_token("eq"), Some(FilterOperator::Eq));
        assert_eq!(FilterOperator::from_token("NotIn"), Some(FilterOperator::NotIn));
        assert_eq!(FilterOperator::from_token("NOTNULL"), Some(FilterOperator::NotNull));
        assert_eq!(FilterOperator::from_token("contains"), None);
    }

    #[test]
    fn test_operator_display_round_trips_token() {
        for token in [
            "eq", "neq", "like", "starts", "ends", "gt", "gte", "lt", "lte", "in", "notin",
            "between", "null", "notnull",
        ] {
            let op = FilterOperator::from_token(token).unwrap();
            assert_eq!(op.to_string(), token);
        }
    }

    #[test]
    fn test_values_split_and_trim() {
        let criteria = FilterCriteria::new("status", FilterOperator::In, " A ; B;;C ");
        assert_eq!(criteria.values(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_display_omits_ignored_value() {
        let criteria = FilterCriteria::new("deleted_at", FilterOperator::Null, "");
        assert_eq!(criteria.to_string(), "deleted_at:null");
        let criteria = FilterCriteria::eq("name", "John");
        assert_eq!(criteria.to_string(), "name:eq:John");
    }
}
