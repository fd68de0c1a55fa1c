//! PostgreSQL store
//!
//! Rows are mapped with [`sqlx::FromRow`]; statements are assembled with
//! [`QueryBuilder`] from the entity schema, so only declared columns are ever
//! written and every value is a bind parameter. Audit columns (`version`,
//! `active`, `created_at`, `updated_at`, `deleted_at`, `created_by`,
//! `updated_by`, `deleted_by`) must exist on every table. Enum attributes are
//! stored as text.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Encode, FromRow, PgPool, Postgres, QueryBuilder, Type};
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::entity::{Actor, Entity};
use crate::error::{Error, ResourceError, ResourceOperation, ResourceResult, Result};
use crate::schema::{FieldDef, FieldKind, AUDIT_FIELDS};
use crate::specification::sql::{quote_ident, render_count, render_select};
use crate::specification::{FieldValue, Specification};

use super::pagination::PageRequest;
use super::traits::{Store, StoreTransaction, Visibility};

/// Audit columns an update may overwrite
const UPDATABLE_AUDIT: [&str; 2] = ["updated_at", "updated_by"];

/// PostgreSQL-backed [`Store`]
pub struct PgStore<E> {
    pool: PgPool,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for PgStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> PgStore<E> {
    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            _entity: PhantomData,
        }
    }

    /// Connect with retries as configured
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        create_pool_with_retries(config, config.max_retries)
            .await
            .map(Self::from_pool)
    }

    /// The connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Create a PostgreSQL connection pool with configurable retries
///
/// Uses exponential backoff strategy for retries
async fn create_pool_with_retries(config: &DatabaseConfig, max_retries: u32) -> Result<PgPool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Database connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Database connection pool created: max={}, min={}",
                        config.max_connections,
                        config.min_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!(
                        "Failed to connect to database after {} attempts: {}",
                        max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "Database connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| {
            Error::Internal(format!(
                "Failed to connect to database at '{}': {}",
                sanitize_connection_url(&config.url),
                e
            ))
        })
}

/// Mask the password of a connection URL for logging
fn sanitize_connection_url(url: &str) -> String {
    if let (Some(scheme_end), Some(at_pos)) = (url.find("://"), url.rfind('@')) {
        // `get` is None when the '@' comes before the scheme separator
        let Some(credentials) = url.get(scheme_end + 3..at_pos) else {
            return url.to_string();
        };
        if let Some(colon) = credentials.find(':') {
            return format!(
                "{}{}:***{}",
                &url[..scheme_end + 3],
                &credentials[..colon],
                &url[at_pos..]
            );
        }
    }
    url.to_string()
}

impl<E> Store<E> for PgStore<E>
where
    E: Entity + for<'r> FromRow<'r, PgRow> + Unpin,
    E::Id: Type<Postgres> + for<'q> Encode<'q, Postgres>,
{
    type Tx = PgTransaction<E>;

    async fn begin(&self) -> ResourceResult<Self::Tx> {
        let tx = self.pool.begin().await?;
        Ok(PgTransaction {
            tx,
            _entity: PhantomData,
        })
    }
}

/// Transaction over a [`PgStore`]; rolled back when dropped uncommitted
pub struct PgTransaction<E> {
    tx: sqlx::Transaction<'static, Postgres>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> PgTransaction<E>
where
    E: Entity + for<'r> FromRow<'r, PgRow> + Unpin,
    E::Id: Type<Postgres> + for<'q> Encode<'q, Postgres>,
{
    async fn fetch_one_row(
        &mut self,
        mut qb: QueryBuilder<'static, Postgres>,
    ) -> ResourceResult<Option<E>> {
        Ok(qb
            .build_query_as::<E>()
            .fetch_optional(&mut *self.tx)
            .await?)
    }

    fn table() -> String {
        quote_ident(E::schema().table)
    }

    fn id_column() -> String {
        quote_ident(
            E::schema()
                .id_field()
                .map(|field| field.column)
                .unwrap_or("id"),
        )
    }
}

impl<E> StoreTransaction<E> for PgTransaction<E>
where
    E: Entity + for<'r> FromRow<'r, PgRow> + Unpin,
    E::Id: Type<Postgres> + for<'q> Encode<'q, Postgres>,
{
    async fn fetch(&mut self, id: &E::Id, visibility: Visibility) -> ResourceResult<Option<E>> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT * FROM {} WHERE {} = ",
            Self::table(),
            Self::id_column()
        ));
        qb.push_bind(id.clone());
        match visibility {
            Visibility::Active => {
                qb.push(" AND \"active\" = TRUE");
            }
            Visibility::Deleted => {
                qb.push(" AND \"active\" = FALSE");
            }
            Visibility::Any => {}
        }
        self.fetch_one_row(qb).await
    }

    async fn select(&mut self, spec: &Specification, page: &PageRequest) -> ResourceResult<Vec<E>> {
        let mut qb = render_select(E::schema(), spec, page)?;
        tracing::trace!(sql = qb.sql(), "select");
        Ok(qb.build_query_as::<E>().fetch_all(&mut *self.tx).await?)
    }

    async fn count(&mut self, spec: &Specification) -> ResourceResult<u64> {
        let mut qb = render_count(E::schema(), spec)?;
        tracing::trace!(sql = qb.sql(), "count");
        let count: i64 = qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn insert(&mut self, entity: E) -> ResourceResult<E> {
        let document = serde_json::to_value(&entity)?;
        let include_id = entity.id().is_some();
        let columns: Vec<(&'static FieldDef, Option<FieldValue>)> = E::schema()
            .fields
            .iter()
            .filter(|field| include_id || field.name != "id")
            .chain(AUDIT_FIELDS.iter())
            .map(|field| (field, column_value(field, &document)))
            .collect();

        let mut qb = QueryBuilder::new(format!("INSERT INTO {} (", Self::table()));
        let names: Vec<String> = columns
            .iter()
            .map(|(field, _)| quote_ident(field.column))
            .collect();
        qb.push(names.join(", "));
        qb.push(") VALUES (");
        for (i, (field, value)) in columns.into_iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            push_typed(&mut qb, &bind_kind(field), value);
        }
        qb.push(") RETURNING *");

        self.fetch_one_row(qb).await?.ok_or_else(|| {
            ResourceError::internal(ResourceOperation::Create, "Insert returned no row")
                .with_entity_type(E::entity_name())
        })
    }

    async fn update(&mut self, entity: E, expected_version: i64) -> ResourceResult<Option<E>> {
        let Some(id) = entity.id().cloned() else {
            return Ok(None);
        };
        let document = serde_json::to_value(&entity)?;

        let mut qb = QueryBuilder::new(format!("UPDATE {} SET ", Self::table()));
        let assignable = E::schema()
            .fields
            .iter()
            .filter(|field| field.name != "id")
            .chain(
                AUDIT_FIELDS
                    .iter()
                    .filter(|field| UPDATABLE_AUDIT.contains(&field.name)),
            );
        for field in assignable {
            qb.push(format!("{} = ", quote_ident(field.column)));
            push_typed(&mut qb, &bind_kind(field), column_value(field, &document));
            qb.push(", ");
        }
        qb.push(format!("\"version\" = \"version\" + 1 WHERE {} = ", Self::id_column()));
        qb.push_bind(id);
        qb.push(" AND \"version\" = ");
        qb.push_bind(expected_version);
        qb.push(" AND \"active\" = TRUE RETURNING *");

        self.fetch_one_row(qb).await
    }

    async fn mark_deleted(
        &mut self,
        id: &E::Id,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> ResourceResult<Option<E>> {
        let mut qb = QueryBuilder::new(format!(
            "UPDATE {} SET \"active\" = FALSE, \"deleted_at\" = ",
            Self::table()
        ));
        qb.push_bind(now);
        qb.push(", \"deleted_by\" = ");
        qb.push_bind(actor.to_string());
        qb.push(", \"updated_at\" = ");
        qb.push_bind(now);
        qb.push(", \"updated_by\" = ");
        qb.push_bind(actor.to_string());
        qb.push(format!(
            ", \"version\" = \"version\" + 1 WHERE {} = ",
            Self::id_column()
        ));
        qb.push_bind(id.clone());
        qb.push(" AND \"active\" = TRUE RETURNING *");
        self.fetch_one_row(qb).await
    }

    async fn mark_restored(
        &mut self,
        id: &E::Id,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> ResourceResult<Option<E>> {
        let mut qb = QueryBuilder::new(format!(
            "UPDATE {} SET \"active\" = TRUE, \"deleted_at\" = NULL, \"deleted_by\" = NULL, \"updated_at\" = ",
            Self::table()
        ));
        qb.push_bind(now);
        qb.push(", \"updated_by\" = ");
        qb.push_bind(actor.to_string());
        qb.push(format!(
            ", \"version\" = \"version\" + 1 WHERE {} = ",
            Self::id_column()
        ));
        qb.push_bind(id.clone());
        qb.push(" AND \"active\" = FALSE RETURNING *");
        self.fetch_one_row(qb).await
    }

    async fn remove(&mut self, id: &E::Id) -> ResourceResult<bool> {
        let mut qb = QueryBuilder::new(format!(
            "DELETE FROM {} WHERE {} = ",
            Self::table(),
            Self::id_column()
        ));
        qb.push_bind(id.clone());
        let result = qb.build().execute(&mut *self.tx).await?;
        Ok(result.rows_affected() > 0)
    }

    // Every statement has already been executed inside the transaction, so
    // there is no client-side buffer to push.
    async fn flush(&mut self) -> ResourceResult<()> {
        tracing::trace!(entity = E::entity_name(), "flush");
        Ok(())
    }

    async fn commit(self) -> ResourceResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Kind used to bind a column; relations bind as the referenced key
fn bind_kind(field: &FieldDef) -> FieldKind {
    match field.as_relation() {
        Some(relation) => relation_key(relation)
            .map(|key| key.kind)
            .unwrap_or(FieldKind::Integer),
        None => field.kind,
    }
}

fn relation_key(relation: &crate::schema::Relation) -> Option<&'static FieldDef> {
    relation
        .target
        .fields
        .iter()
        .find(|f| f.column == relation.target_column)
}

/// Typed value of one column taken from the serialized entity
fn column_value(field: &FieldDef, document: &Value) -> Option<FieldValue> {
    let json = document.get(field.name)?;
    let value = match field.as_relation() {
        Some(relation) => {
            let key = relation_key(relation)?;
            let reference = match json {
                Value::Object(map) => map.get(key.name)?,
                scalar => scalar,
            };
            FieldValue::from_json(&key.kind, reference)
        }
        None => FieldValue::from_json(&field.kind, json),
    };
    value.filter(|value| !value.is_null())
}

/// Bind a value, sending a typed NULL when absent
fn push_typed(qb: &mut QueryBuilder<'static, Postgres>, kind: &FieldKind, value: Option<FieldValue>) {
    match (kind, value) {
        (_, Some(FieldValue::String(s))) | (_, Some(FieldValue::Enum(s))) => {
            qb.push_bind(s);
        }
        (_, Some(FieldValue::Integer(i))) => {
            qb.push_bind(i);
        }
        (_, Some(FieldValue::Decimal(d))) => {
            qb.push_bind(d);
        }
        (_, Some(FieldValue::Boolean(b))) => {
            qb.push_bind(b);
        }
        (_, Some(FieldValue::DateTime(dt))) => {
            qb.push_bind(dt);
        }
        (_, Some(FieldValue::Uuid(u))) => {
            qb.push_bind(u);
        }
        (FieldKind::Integer, _) => {
            qb.push_bind(None::<i64>);
        }
        (FieldKind::Decimal, _) => {
            qb.push_bind(None::<f64>);
        }
        (FieldKind::Boolean, _) => {
            qb.push_bind(None::<bool>);
        }
        (FieldKind::DateTime, _) => {
            qb.push_bind(None::<DateTime<Utc>>);
        }
        (FieldKind::Uuid, _) => {
            qb.push_bind(None::<Uuid>);
        }
        (_, _) => {
            qb.push_bind(None::<String>);
        }
    }
}
