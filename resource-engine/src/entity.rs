//! Entity descriptor and audit metadata
//!
//! Every type managed by the engine implements [`Entity`]: a small descriptor
//! that exposes its identifier, its [`AuditFields`] and a static
//! [`EntitySchema`](crate::schema::EntitySchema) used for field resolution.
//!
//! # Example
//!
//! ```rust,ignore
//! use resource_engine::entity::{AuditFields, Entity};
//! use resource_engine::schema::{EntitySchema, FieldDef};
//!
//! static WIDGET_FIELDS: [FieldDef; 2] = [FieldDef::integer("id"), FieldDef::string("name")];
//! static WIDGET: EntitySchema = EntitySchema::new("Widget", "widgets", &WIDGET_FIELDS);
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Widget {
//!     id: Option<i64>,
//!     name: String,
//!     #[serde(flatten)]
//!     audit: AuditFields,
//! }
//!
//! impl Entity for Widget {
//!     type Id = i64;
//!     fn schema() -> &'static EntitySchema { &WIDGET }
//!     fn id(&self) -> Option<&i64> { self.id.as_ref() }
//!     fn set_id(&mut self, id: i64) { self.id = Some(id); }
//!     fn audit(&self) -> &AuditFields { &self.audit }
//!     fn audit_mut(&mut self) -> &mut AuditFields { &mut self.audit }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use uuid::Uuid;

use crate::schema::EntitySchema;

/// Identifier types the store can assign on insert
pub trait EntityId:
    Clone + Eq + Hash + fmt::Display + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Produce a fresh identifier; `sequence` is a store-wide monotonic counter
    fn generate(sequence: u64) -> Self;
}

impl EntityId for i64 {
    fn generate(sequence: u64) -> Self {
        i64::try_from(sequence).unwrap_or(i64::MAX)
    }
}

impl EntityId for u64 {
    fn generate(sequence: u64) -> Self {
        sequence
    }
}

impl EntityId for Uuid {
    fn generate(_sequence: u64) -> Self {
        Uuid::now_v7()
    }
}

impl EntityId for String {
    fn generate(sequence: u64) -> Self {
        sequence.to_string()
    }
}

/// A record managed by the engine
pub trait Entity:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifier type
    type Id: EntityId;

    /// Static schema used for field-path resolution and storage mapping
    fn schema() -> &'static EntitySchema;

    /// Identifier, `None` until the entity has been inserted
    fn id(&self) -> Option<&Self::Id>;

    /// Assign the identifier (called by stores on insert)
    fn set_id(&mut self, id: Self::Id);

    /// Audit metadata
    fn audit(&self) -> &AuditFields;

    /// Mutable audit metadata
    fn audit_mut(&mut self) -> &mut AuditFields;

    /// Entity name, used as cache key prefix and event label
    fn entity_name() -> &'static str {
        Self::schema().name
    }

    /// Current optimistic-concurrency version
    fn version(&self) -> i64 {
        self.audit().version
    }

    /// Whether the entity is not soft-deleted
    fn is_active(&self) -> bool {
        self.audit().active
    }

    /// Identifier rendered for logs, cache keys and error context
    fn id_string(&self) -> String {
        self.id().map(ToString::to_string).unwrap_or_default()
    }
}

/// Identifies who performed a mutation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    /// Create an actor from any identifier (user id, service account, ...)
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Actor used for engine-initiated mutations
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Actor {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle and concurrency metadata carried by every entity
///
/// `active == false` implies `deleted_at.is_some()` and vice versa.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFields {
    /// Optimistic-concurrency version, incremented on every successful update
    #[serde(default)]
    pub version: i64,
    /// Soft-delete flag
    #[serde(default = "default_active")]
    pub active: bool,
    /// Insertion timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Soft-delete timestamp
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Actor that created the entity
    #[serde(default)]
    pub created_by: Option<String>,
    /// Actor that last updated the entity
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Actor that soft-deleted the entity
    #[serde(default)]
    pub deleted_by: Option<String>,
}

fn default_active() -> bool {
    true
}

impl Default for AuditFields {
    fn default() -> Self {
        Self {
            version: 0,
            active: true,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            created_by: None,
            updated_by: None,
            deleted_by: None,
        }
    }
}

impl AuditFields {
    /// Reset to the state of a freshly created entity
    pub fn mark_created(&mut self, actor: &Actor, now: DateTime<Utc>) {
        *self = Self {
            created_at: Some(now),
            updated_at: Some(now),
            created_by: Some(actor.to_string()),
            updated_by: Some(actor.to_string()),
            ..Self::default()
        };
    }

    /// Record an update
    pub fn mark_updated(&mut self, actor: &Actor, now: DateTime<Utc>) {
        self.updated_at = Some(now);
        self.updated_by = Some(actor.to_string());
    }

    /// Flip to soft-deleted
    pub fn mark_deleted(&mut self, actor: &Actor, now: DateTime<Utc>) {
        self.active = false;
        self.deleted_at = Some(now);
        self.deleted_by = Some(actor.to_string());
        self.mark_updated(actor, now);
    }

    /// Clear delete metadata and reactivate
    pub fn mark_restored(&mut self, actor: &Actor, now: DateTime<Utc>) {
        self.active = true;
        self.deleted_at = None;
        self.deleted_by = None;
        self.mark_updated(actor, now);
    }

    /// Whether the active flag and the delete timestamp agree
    pub fn is_consistent(&self) -> bool {
        self.active == self.deleted_at.is_none()
    }
}
