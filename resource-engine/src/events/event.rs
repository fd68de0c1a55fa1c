use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::entity::{Actor, Entity};

/// Kind of state change an event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainEventKind {
    /// Entity inserted
    Created,
    /// Entity updated (full or partial)
    Updated,
    /// Entity soft-deleted, or physically removed when `permanent` is set
    Deleted,
    /// Soft-deleted entity reactivated
    Restored,
}

impl fmt::Display for DomainEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
            Self::Restored => write!(f, "restored"),
        }
    }
}

/// A committed state change of one entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent<E> {
    /// Unique event id (UUIDv7, time-ordered)
    pub id: Uuid,
    /// Entity type name
    pub entity_name: String,
    /// Entity identifier
    pub entity_id: String,
    /// Entity snapshot after the change (before it, for permanent deletes)
    pub entity: E,
    /// Who performed the change
    pub actor: Actor,
    /// When the change was recorded
    pub occurred_at: DateTime<Utc>,
    /// What happened
    pub kind: DomainEventKind,
    /// Set only on hard deletes
    #[serde(default)]
    pub permanent: bool,
}

impl<E: Entity> DomainEvent<E> {
    /// Describe a change to `entity`
    pub fn new(kind: DomainEventKind, entity: E, actor: &Actor) -> Self {
        Self {
            id: Uuid::now_v7(),
            entity_name: E::entity_name().to_string(),
            entity_id: entity.id_string(),
            entity,
            actor: actor.clone(),
            occurred_at: Utc::now(),
            kind,
            permanent: false,
        }
    }

    /// Entity inserted
    pub fn created(entity: E, actor: &Actor) -> Self {
        Self::new(DomainEventKind::Created, entity, actor)
    }

    /// Entity updated
    pub fn updated(entity: E, actor: &Actor) -> Self {
        Self::new(DomainEventKind::Updated, entity, actor)
    }

    /// Entity soft-deleted
    pub fn deleted(entity: E, actor: &Actor) -> Self {
        Self::new(DomainEventKind::Deleted, entity, actor)
    }

    /// Entity physically removed
    pub fn removed(entity: E, actor: &Actor) -> Self {
        Self {
            permanent: true,
            ..Self::new(DomainEventKind::Deleted, entity, actor)
        }
    }

    /// Entity reactivated
    pub fn restored(entity: E, actor: &Actor) -> Self {
        Self::new(DomainEventKind::Restored, entity, actor)
    }
}

/// Events collected during a unit of work, released only after commit
#[derive(Debug, Clone)]
pub struct EventBatch<E> {
    events: Vec<DomainEvent<E>>,
}

impl<E> Default for EventBatch<E> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<E> EventBatch<E> {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event
    pub fn push(&mut self, event: DomainEvent<E>) {
        self.events.push(event);
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterate in recording order
    pub fn iter(&self) -> std::slice::Iter<'_, DomainEvent<E>> {
        self.events.iter()
    }
}

impl<E> Extend<DomainEvent<E>> for EventBatch<E> {
    fn extend<I: IntoIterator<Item = DomainEvent<E>>>(&mut self, iter: I) {
        self.events.extend(iter);
    }
}

impl<E> IntoIterator for EventBatch<E> {
    type Item = DomainEvent<E>;
    type IntoIter = std::vec::IntoIter<DomainEvent<E>>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}
