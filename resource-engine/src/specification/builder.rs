use crate::config::ParseMode;
use crate::entity::Entity;
use crate::error::{ResourceError, ResourceOperation, ResourceResult};
use crate::filter::{FilterCriteria, FilterOperator};
use crate::schema::{EntitySchema, FieldKind};

use super::value::{ConversionError, FieldValue};
use super::{Comparison, Condition, Specification};

/// Composes filter criteria into a [`Specification`] for one entity type
///
/// Field paths are resolved against the entity schema; an unresolvable path is
/// always a validation error. Values are converted to the declared field type;
/// a conversion failure drops the criterion with a warning in lenient mode and
/// is a validation error in strict mode.
///
/// # Example
///
/// ```rust,ignore
/// let parser = FilterParser::default();
/// let criteria = parser.parse("age:gte:18,name:like:Jo")?.into_criteria();
/// let spec = SpecificationBuilder::for_entity::<Person>().build(&criteria)?;
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SpecificationBuilder {
    schema: &'static EntitySchema,
    mode: ParseMode,
}

impl SpecificationBuilder {
    /// Builder for an explicit schema
    pub fn new(schema: &'static EntitySchema) -> Self {
        Self {
            schema,
            mode: ParseMode::Lenient,
        }
    }

    /// Builder for an entity type
    pub fn for_entity<E: Entity>() -> Self {
        Self::new(E::schema())
    }

    /// Set the value-conversion policy
    #[must_use]
    pub fn with_mode(mut self, mode: ParseMode) -> Self {
        self.mode = mode;
        self
    }

    /// Conjunction of one predicate per criterion
    ///
    /// Empty input yields [`Specification::All`].
    pub fn build(&self, criteria: &[FilterCriteria]) -> ResourceResult<Specification> {
        let mut spec = Specification::All;
        for criterion in criteria {
            if let Some(predicate) = self.build_one(criterion)? {
                spec = spec.and(predicate);
            }
        }
        Ok(spec)
    }

    /// Predicate for one criterion, `None` when it was dropped as a no-op
    pub fn build_one(&self, criterion: &FilterCriteria) -> ResourceResult<Option<Specification>> {
        let resolved = self.schema.resolve(&criterion.field)?;
        let kind = resolved.leaf.kind;

        match comparison_for(&kind, criterion) {
            Ok(comparison) => Ok(Some(Condition::new(resolved.path, comparison).into())),
            Err(error) => match self.mode {
                ParseMode::Strict => Err(ResourceError::validation_failed(format!(
                    "Invalid value for '{}': {}",
                    criterion.field, error
                ))
                .with_operation(ResourceOperation::BuildSpecification)
                .with_entity_type(self.schema.name)),
                ParseMode::Lenient => {
                    tracing::warn!(
                        entity = self.schema.name,
                        field = %criterion.field,
                        operator = %criterion.operator,
                        value = %criterion.value,
                        error = %error,
                        "Dropping filter criterion with unconvertible value"
                    );
                    Ok(None)
                }
            },
        }
    }
}

fn comparison_for(kind: &FieldKind, criterion: &FilterCriteria) -> Result<Comparison, ConversionError> {
    let one = || FieldValue::parse(kind, &criterion.value);
    let many = || {
        criterion
            .values()
            .into_iter()
            .map(|raw| FieldValue::parse(kind, raw))
            .collect::<Result<Vec<_>, _>>()
    };
    let text = || text_operand(kind, criterion);

    let comparison = match criterion.operator {
        FilterOperator::Eq => Comparison::Eq(one()?),
        FilterOperator::Neq => Comparison::Ne(one()?),
        FilterOperator::Like => Comparison::Contains(text()?),
        FilterOperator::Starts => Comparison::StartsWith(text()?),
        FilterOperator::Ends => Comparison::EndsWith(text()?),
        FilterOperator::Gt => Comparison::Gt(one()?),
        FilterOperator::Gte => Comparison::Gte(one()?),
        FilterOperator::Lt => Comparison::Lt(one()?),
        FilterOperator::Lte => Comparison::Lte(one()?),
        FilterOperator::In => Comparison::In(many()?),
        FilterOperator::NotIn => Comparison::NotIn(many()?),
        FilterOperator::Between => {
            let mut bounds = many()?.into_iter();
            match (bounds.next(), bounds.next(), bounds.next()) {
                (Some(low), Some(high), None) => Comparison::Between(low, high),
                _ => {
                    return Err(ConversionError {
                        kind: kind.label(),
                        raw: criterion.value.clone(),
                        reason: "between requires exactly two bounds".to_string(),
                    })
                }
            }
        }
        FilterOperator::Null => Comparison::IsNull,
        FilterOperator::NotNull => Comparison::IsNotNull,
    };
    Ok(comparison)
}

/// Pattern operators only apply to textual attributes
fn text_operand(kind: &FieldKind, criterion: &FilterCriteria) -> Result<String, ConversionError> {
    match kind {
        FieldKind::String | FieldKind::Enum(_) => Ok(criterion.value.trim().to_string()),
        other => Err(ConversionError {
            kind: other.label(),
            raw: criterion.value.clone(),
            reason: format!("'{}' applies to text attributes only", criterion.operator),
        }),
    }
}
