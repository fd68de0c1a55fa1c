//! Filter expression parser
//!
//! Grammar: `field:operator:value(;value)*(,field:operator:value)*`.
//!
//! The value is everything after the second `:`, so values may themselves
//! contain colons (timestamps, URNs). Whitespace around every token is trimmed.

use crate::config::{FilterConfig, ParseMode};
use crate::error::{ResourceError, ResourceOperation, ResourceResult};
use crate::schema::is_valid_path;

use super::criteria::{FilterCriteria, FilterOperator};

/// Key of map-style input whose value is parsed with the string grammar
pub const FILTER_KEY: &str = "filter";

/// A clause that was skipped during lenient parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    /// The offending clause as written
    pub clause: String,
    /// Why it was skipped
    pub reason: String,
}

/// Parse output: the accepted criteria and the clauses that were skipped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFilter {
    /// Criteria in input order
    pub criteria: Vec<FilterCriteria>,
    /// Skipped clauses, in input order
    pub issues: Vec<ParseIssue>,
}

impl ParsedFilter {
    /// Whether every clause was accepted
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Consume into the accepted criteria
    pub fn into_criteria(self) -> Vec<FilterCriteria> {
        self.criteria
    }
}

/// Parses filter expressions into [`FilterCriteria`]
///
/// In [`ParseMode::Lenient`] malformed clauses are logged and skipped, so the
/// request proceeds on the remaining clauses. In [`ParseMode::Strict`] the first
/// malformed clause fails the parse with a validation error.
///
/// # Example
///
/// ```rust
/// use resource_engine::filter::{FilterOperator, FilterParser};
///
/// let parser = FilterParser::default();
/// let parsed = parser.parse("age:gte:18, name:like:Jo, bogus").unwrap();
///
/// assert_eq!(parsed.criteria.len(), 2);
/// assert_eq!(parsed.criteria[0].operator, FilterOperator::Gte);
/// assert_eq!(parsed.issues.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FilterParser {
    config: FilterConfig,
}

impl FilterParser {
    /// Create a parser with the given policy
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Parser that rejects malformed clauses
    pub fn strict() -> Self {
        Self::new(FilterConfig {
            mode: ParseMode::Strict,
            ..FilterConfig::default()
        })
    }

    /// Active leniency policy
    pub fn mode(&self) -> ParseMode {
        self.config.mode
    }

    /// Parse a filter expression
    ///
    /// An empty or blank expression yields no criteria.
    pub fn parse(&self, filter: &str) -> ResourceResult<ParsedFilter> {
        let mut parsed = ParsedFilter::default();
        self.parse_into(filter, &mut parsed)?;
        self.enforce_clause_limit(&mut parsed)?;
        Ok(parsed)
    }

    /// Parse map-style input
    ///
    /// Reserved keys never become criteria. The [`FILTER_KEY`] entry (when
    /// reserved) is parsed with the string grammar; every other entry becomes an
    /// implicit `eq` criterion.
    pub fn parse_params<I, K, V>(&self, params: I) -> ResourceResult<ParsedFilter>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut parsed = ParsedFilter::default();

        for (key, value) in params {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();

            if self.is_reserved(key) {
                if key == FILTER_KEY {
                    self.parse_into(value, &mut parsed)?;
                }
                continue;
            }

            if !is_valid_path(key) {
                self.reject(&mut parsed, format!("{}={}", key, value), "invalid field path")?;
                continue;
            }

            parsed.criteria.push(FilterCriteria::eq(key, value));
        }

        self.enforce_clause_limit(&mut parsed)?;
        Ok(parsed)
    }

    fn is_reserved(&self, key: &str) -> bool {
        self.config.reserved_keys.iter().any(|k| k == key)
    }

    fn parse_into(&self, filter: &str, parsed: &mut ParsedFilter) -> ResourceResult<()> {
        for clause in filter.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            match parse_clause(clause) {
                Ok(criteria) => parsed.criteria.push(criteria),
                Err(reason) => self.reject(parsed, clause.to_string(), reason)?,
            }
        }
        Ok(())
    }

    fn reject(
        &self,
        parsed: &mut ParsedFilter,
        clause: String,
        reason: &str,
    ) -> ResourceResult<()> {
        match self.config.mode {
            ParseMode::Strict => Err(ResourceError::validation_failed(format!(
                "Malformed filter clause '{}': {}",
                clause, reason
            ))
            .with_operation(ResourceOperation::ParseFilter)),
            ParseMode::Lenient => {
                tracing::warn!(clause = %clause, reason, "Skipping malformed filter clause");
                parsed.issues.push(ParseIssue {
                    clause,
                    reason: reason.to_string(),
                });
                Ok(())
            }
        }
    }

    fn enforce_clause_limit(&self, parsed: &mut ParsedFilter) -> ResourceResult<()> {
        let max = self.config.max_clauses;
        if parsed.criteria.len() <= max {
            return Ok(());
        }

        let dropped = parsed.criteria.split_off(max);
        for criteria in dropped {
            self.reject(parsed, criteria.to_string(), "too many filter clauses")?;
        }
        Ok(())
    }
}

/// Parse one trimmed, non-empty clause
fn parse_clause(clause: &str) -> Result<FilterCriteria, &'static str> {
    let mut parts = clause.splitn(3, ':');
    let field = parts.next().map(str::trim).unwrap_or_default();
    let operator = parts.next().map(str::trim);
    let value = parts.next().map(str::trim).unwrap_or_default();

    let Some(operator) = operator else {
        return Err("expected field:operator:value");
    };
    if field.is_empty() {
        return Err("missing field");
    }
    if !is_valid_path(field) {
        return Err("invalid field path");
    }
    let Some(operator) = FilterOperator::from_token(operator) else {
        return Err("unknown operator");
    };

    if operator.ignores_value() {
        return Ok(FilterCriteria::new(field, operator, ""));
    }
    if value.is_empty() {
        return Err("missing value");
    }

    let criteria = FilterCriteria::new(field, operator, value);
    match operator {
        FilterOperator::Between if criteria.values().len() != 2 => {
            Err("between requires exactly two bounds")
        }
        FilterOperator::In | FilterOperator::NotIn if criteria.values().is_empty() => {
            Err("empty value set")
        }
        _ => Ok(criteria),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_two_clauses() {
        let parsed = FilterParser::default()
            .parse("age:gte:18,name:like:Jo")
            .unwrap();
        assert!(parsed.is_clean());
        assert_eq!(
            parsed.criteria,
            vec![
                FilterCriteria::new("age", FilterOperator::Gte, "18"),
                FilterCriteria::new("name", FilterOperator::Like, "Jo"),
            ]
        );
    }

    #[test]
    fn test_parse_trims_whitespace_and_ignores_operator_case() {
        let parsed = FilterParser::default()
            .parse("  name : EQ :  John  ,  role.name:Starts:adm ")
            .unwrap();
        assert_eq!(parsed.criteria[0], FilterCriteria::eq("name", "John"));
        assert_eq!(parsed.criteria[1].field, "role.name");
        assert_eq!(parsed.criteria[1].operator, FilterOperator::Starts);
    }

    #[test]
    fn test_value_may_contain_colons() {
        let parsed = FilterParser::default()
            .parse("created_at:gt:2024-01-01T10:30:00Z")
            .unwrap();
        assert_eq!(parsed.criteria[0].value, "2024-01-01T10:30:00Z");
    }

    #[test]
    fn test_null_operators_ignore_value() {
        let parsed = FilterParser::default()
            .parse("deleted_at:null,updated_by:notnull:whatever")
            .unwrap();
        assert_eq!(parsed.criteria.len(), 2);
        assert_eq!(parsed.criteria[0].value, "");
        assert_eq!(parsed.criteria[1].operator, FilterOperator::NotNull);
        assert_eq!(parsed.criteria[1].value, "");
    }

    #[test]
    fn test_lenient_skips_malformed_clauses() {
        let parsed = FilterParser::default()
            .parse("name:eq:John,age:almost:18,broken,price:between:1,status:in:;;,:eq:x")
            .unwrap();
        assert_eq!(parsed.criteria, vec![FilterCriteria::eq("name", "John")]);
        let reasons: Vec<_> = parsed.issues.iter().map(|i| i.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec![
                "unknown operator",
                "expected field:operator:value",
                "between requires exactly two bounds",
                "empty value set",
                "missing field",
            ]
        );
    }

    #[test]
    fn test_between_requires_exactly_two_bounds() {
        let parser = FilterParser::default();
        assert_eq!(parser.parse("age:between:1;5").unwrap().criteria.len(), 1);
        assert!(parser.parse("age:between:1;5;9").unwrap().criteria.is_empty());
    }

    #[test]
    fn test_strict_rejects_first_malformed_clause() {
        let err = FilterParser::strict()
            .parse("name:eq:John,age:almost:18")
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.operation, ResourceOperation::ParseFilter);
        assert!(err.message.contains("age:almost:18"));
    }

    #[test]
    fn test_blank_input_yields_nothing() {
        let parsed = FilterParser::default().parse("  , ,").unwrap();
        assert!(parsed.criteria.is_empty());
        assert!(parsed.is_clean());
    }

    #[test]
    fn test_clause_limit() {
        let parser = FilterParser::new(FilterConfig {
            max_clauses: 2,
            ..FilterConfig::default()
        });
        let parsed = parser.parse("a:eq:1,b:eq:2,c:eq:3").unwrap();
        assert_eq!(parsed.criteria.len(), 2);
        assert_eq!(parsed.issues[0].clause, "c:eq:3");
    }

    #[test]
    fn test_params_exclude_reserved_keys_and_parse_filter_key() {
        let mut params = BTreeMap::new();
        params.insert("page", "2");
        params.insert("size", "10");
        params.insert("sort", "name,desc");
        params.insert("fields", "id,name");
        params.insert("status", "ACTIVE");
        params.insert("filter", "age:gte:18");

        let parsed = FilterParser::default().parse_params(params).unwrap();
        assert_eq!(
            parsed.criteria,
            vec![
                FilterCriteria::new("age", FilterOperator::Gte, "18"),
                FilterCriteria::eq("status", "ACTIVE"),
            ]
        );
    }

    #[test]
    fn test_params_with_custom_reserved_keys() {
        let parser = FilterParser::new(FilterConfig {
            reserved_keys: vec!["cursor".to_string()],
            ..FilterConfig::default()
        });
        let parsed = parser
            .parse_params([("cursor", "abc"), ("page", "1")])
            .unwrap();
        assert_eq!(parsed.criteria, vec![FilterCriteria::eq("page", "1")]);
    }
}
