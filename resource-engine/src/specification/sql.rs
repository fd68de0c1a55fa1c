//! PostgreSQL rendering of specifications
//!
//! Every attribute path is resolved against the entity schema before any SQL
//! is produced, so only declared columns ever reach the statement and every
//! value is sent as a bind parameter. Relation paths become `LEFT JOIN`s, one
//! per distinct relation prefix, aliased `t1`, `t2`, ... (the root table is
//! `t0`).

use sqlx::{Postgres, QueryBuilder};
use std::collections::HashMap;

use crate::error::ResourceResult;
use crate::repository::{OrderDirection, PageRequest, SortOrder};
use crate::schema::{EntitySchema, FieldKind, ResolvedPath};

use super::{Comparison, Condition, FieldValue, Specification};

const ROOT_ALIAS: &str = "t0";

/// `SELECT t0.* ...` for one page of rows matching `spec`
pub fn render_select(
    schema: &'static EntitySchema,
    spec: &Specification,
    page: &PageRequest,
) -> ResourceResult<QueryBuilder<'static, Postgres>> {
    let plan = Plan::new(schema, spec, &page.sort)?;

    let mut qb = QueryBuilder::new(format!("SELECT {}.* ", ROOT_ALIAS));
    plan.push_from(&mut qb);
    qb.push(" WHERE ");
    plan.push_spec(&mut qb, spec);
    plan.push_order_by(&mut qb, &page.sort);
    qb.push(" LIMIT ");
    qb.push_bind(i64::from(page.size));
    qb.push(" OFFSET ");
    qb.push_bind(i64::try_from(page.offset()).unwrap_or(i64::MAX));
    Ok(qb)
}

/// `SELECT COUNT(*) ...` for rows matching `spec`
pub fn render_count(
    schema: &'static EntitySchema,
    spec: &Specification,
) -> ResourceResult<QueryBuilder<'static, Postgres>> {
    let plan = Plan::new(schema, spec, &[])?;

    let mut qb = QueryBuilder::new("SELECT COUNT(*) ");
    plan.push_from(&mut qb);
    qb.push(" WHERE ");
    plan.push_spec(&mut qb, spec);
    Ok(qb)
}

/// Quote an identifier
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Escape `LIKE` metacharacters with a backslash
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

struct JoinClause {
    table: &'static str,
    alias: String,
    parent_alias: String,
    join_column: &'static str,
    target_column: &'static str,
}

/// Resolved paths and join aliases for one statement
struct Plan {
    root: &'static EntitySchema,
    aliases: HashMap<String, String>,
    joins: Vec<JoinClause>,
    resolved: HashMap<String, ResolvedPath>,
}

impl Plan {
    fn new(
        root: &'static EntitySchema,
        spec: &Specification,
        sort: &[SortOrder],
    ) -> ResourceResult<Self> {
        let mut plan = Self {
            root,
            aliases: HashMap::from([(String::new(), ROOT_ALIAS.to_string())]),
            joins: Vec::new(),
            resolved: HashMap::new(),
        };
        for condition in spec.conditions() {
            plan.resolve(&condition.path)?;
        }
        for order in sort {
            plan.resolve(&order.field)?;
        }
        Ok(plan)
    }

    fn resolve(&mut self, path: &str) -> ResourceResult<()> {
        if self.resolved.contains_key(path) {
            return Ok(());
        }
        let resolved = self.root.resolve(path)?;

        let mut parent = String::new();
        for join in &resolved.joins {
            if !self.aliases.contains_key(&join.path) {
                let alias = format!("t{}", self.aliases.len());
                let parent_alias = self.alias(&parent).to_string();
                self.joins.push(JoinClause {
                    table: join.relation.target.table,
                    alias: alias.clone(),
                    parent_alias,
                    join_column: join.relation.join_column,
                    target_column: join.relation.target_column,
                });
                self.aliases.insert(join.path.clone(), alias);
            }
            parent = join.path.clone();
        }

        self.resolved.insert(path.to_string(), resolved);
        Ok(())
    }

    fn alias(&self, owner_path: &str) -> &str {
        self.aliases
            .get(owner_path)
            .map(String::as_str)
            .unwrap_or(ROOT_ALIAS)
    }

    /// Qualified column for a resolved path; enum columns compare as text
    fn column(&self, path: &str) -> String {
        match self.resolved.get(path) {
            Some(resolved) => {
                let column = format!(
                    "{}.{}",
                    self.alias(resolved.owner_path()),
                    quote_ident(resolved.leaf.column)
                );
                match resolved.leaf.kind {
                    FieldKind::Enum(_) => format!("{}::text", column),
                    _ => column,
                }
            }
            None => format!("{}.{}", ROOT_ALIAS, quote_ident(path)),
        }
    }

    fn push_from(&self, qb: &mut QueryBuilder<'static, Postgres>) {
        qb.push(format!("FROM {} {}", quote_ident(self.root.table), ROOT_ALIAS));
        for join in &self.joins {
            qb.push(format!(
                " LEFT JOIN {} {} ON {}.{} = {}.{}",
                quote_ident(join.table),
                join.alias,
                join.alias,
                quote_ident(join.target_column),
                join.parent_alias,
                quote_ident(join.join_column),
            ));
        }
    }

    fn push_spec(&self, qb: &mut QueryBuilder<'static, Postgres>, spec: &Specification) {
        match spec {
            Specification::All => {
                qb.push("TRUE");
            }
            Specification::Condition(condition) => self.push_condition(qb, condition),
            Specification::And(children) => self.push_group(qb, children, " AND ", "TRUE"),
            Specification::Or(children) => self.push_group(qb, children, " OR ", "FALSE"),
            Specification::Not(inner) => {
                qb.push("NOT (");
                self.push_spec(qb, inner);
                qb.push(")");
            }
        }
    }

    fn push_group(
        &self,
        qb: &mut QueryBuilder<'static, Postgres>,
        children: &[Specification],
        separator: &str,
        empty: &str,
    ) {
        if children.is_empty() {
            qb.push(empty);
            return;
        }
        qb.push("(");
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                qb.push(separator);
            }
            self.push_spec(qb, child);
        }
        qb.push(")");
    }

    fn push_condition(&self, qb: &mut QueryBuilder<'static, Postgres>, condition: &Condition) {
        let column = self.column(&condition.path);
        let binary = |qb: &mut QueryBuilder<'static, Postgres>, op: &str, value: &FieldValue| {
            qb.push(format!("{} {} ", column, op));
            push_value(qb, value);
        };
        let pattern = |qb: &mut QueryBuilder<'static, Postgres>, value: String| {
            qb.push(format!("{}::text ILIKE ", column.trim_end_matches("::text")));
            qb.push_bind(value);
            qb.push(" ESCAPE '\\'");
        };

        match &condition.comparison {
            Comparison::Eq(FieldValue::Null) | Comparison::IsNull => {
                qb.push(format!("{} IS NULL", column));
            }
            Comparison::Ne(FieldValue::Null) | Comparison::IsNotNull => {
                qb.push(format!("{} IS NOT NULL", column));
            }
            Comparison::Eq(value) => binary(qb, "=", value),
            Comparison::Ne(value) => binary(qb, "<>", value),
            Comparison::Gt(value) => binary(qb, ">", value),
            Comparison::Gte(value) => binary(qb, ">=", value),
            Comparison::Lt(value) => binary(qb, "<", value),
            Comparison::Lte(value) => binary(qb, "<=", value),
            Comparison::Contains(needle) => pattern(qb, format!("%{}%", escape_like(needle))),
            Comparison::StartsWith(prefix) => pattern(qb, format!("{}%", escape_like(prefix))),
            Comparison::EndsWith(suffix) => pattern(qb, format!("%{}", escape_like(suffix))),
            Comparison::In(values) if values.is_empty() => {
                qb.push("FALSE");
            }
            Comparison::NotIn(values) if values.is_empty() => {
                qb.push("TRUE");
            }
            Comparison::In(values) | Comparison::NotIn(values) => {
                let op = if matches!(condition.comparison, Comparison::In(_)) {
                    "IN"
                } else {
                    "NOT IN"
                };
                qb.push(format!("{} {} (", column, op));
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        qb.push(", ");
                    }
                    push_value(qb, value);
                }
                qb.push(")");
            }
            Comparison::Between(low, high) => {
                qb.push(format!("{} BETWEEN ", column));
                push_value(qb, low);
                qb.push(" AND ");
                push_value(qb, high);
            }
        }
    }

    fn push_order_by(&self, qb: &mut QueryBuilder<'static, Postgres>, sort: &[SortOrder]) {
        let mut terms: Vec<String> = sort
            .iter()
            .map(|order| match order.direction {
                OrderDirection::Ascending => format!("{} ASC NULLS FIRST", self.column(&order.field)),
                OrderDirection::Descending => format!("{} DESC NULLS LAST", self.column(&order.field)),
            })
            .collect();
        if let Some(id) = self.root.id_field() {
            terms.push(format!("{}.{} ASC", ROOT_ALIAS, quote_ident(id.column)));
        }
        if !terms.is_empty() {
            qb.push(format!(" ORDER BY {}", terms.join(", ")));
        }
    }
}

fn push_value(qb: &mut QueryBuilder<'static, Postgres>, value: &FieldValue) {
    match value {
        FieldValue::Null => {
            qb.push("NULL");
        }
        FieldValue::String(s) | FieldValue::Enum(s) => {
            qb.push_bind(s.clone());
        }
        FieldValue::Integer(i) => {
            qb.push_bind(*i);
        }
        FieldValue::Decimal(d) => {
            qb.push_bind(*d);
        }
        FieldValue::Boolean(b) => {
            qb.push_bind(*b);
        }
        FieldValue::DateTime(dt) => {
            qb.push_bind(*dt);
        }
        FieldValue::Uuid(u) => {
            qb.push_bind(*u);
        }
    }
}
