//! Entities shared by the unit tests

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::entity::{AuditFields, Entity};
use crate::events::{DomainEvent, DomainEventKind, EventSink};
use crate::schema::{EntitySchema, FieldDef, Relation};

pub static CATEGORY_FIELDS: [FieldDef; 2] = [FieldDef::integer("id"), FieldDef::string("name")];
pub static CATEGORY_SCHEMA: EntitySchema =
    EntitySchema::new("Category", "categories", &CATEGORY_FIELDS);

pub static WIDGET_STATUSES: [&str; 3] = ["DRAFT", "PUBLISHED", "ARCHIVED"];

pub static WIDGET_FIELDS: [FieldDef; 6] = [
    FieldDef::integer("id"),
    FieldDef::string("name"),
    FieldDef::decimal("price"),
    FieldDef::integer("quantity"),
    FieldDef::enumeration("status", &WIDGET_STATUSES),
    FieldDef::relation("category", Relation::new(&CATEGORY_SCHEMA, "category_id", "id")),
];
pub static WIDGET_SCHEMA: EntitySchema = EntitySchema::new("Widget", "widgets", &WIDGET_FIELDS);

pub static PERSON_FIELDS: [FieldDef; 3] = [
    FieldDef::integer("id"),
    FieldDef::string("name"),
    FieldDef::integer("age"),
];
pub static PERSON_SCHEMA: EntitySchema = EntitySchema::new("Person", "people", &PERSON_FIELDS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WidgetStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub status: WidgetStatus,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(flatten)]
    pub audit: AuditFields,
}

impl Widget {
    pub fn named(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            price: 0.0,
            quantity: 0,
            status: WidgetStatus::Draft,
            category: None,
            audit: AuditFields::default(),
        }
    }

    pub fn in_category(mut self, id: i64, name: &str) -> Self {
        self.category = Some(Category {
            id: Some(id),
            name: name.to_string(),
        });
        self
    }
}

impl Entity for Widget {
    type Id = i64;

    fn schema() -> &'static EntitySchema {
        &WIDGET_SCHEMA
    }

    fn id(&self) -> Option<&i64> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn audit(&self) -> &AuditFields {
        &self.audit
    }

    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: Option<i64>,
    pub name: String,
    pub age: i64,
    #[serde(flatten)]
    pub audit: AuditFields,
}

impl Person {
    pub fn new(name: &str, age: i64) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            age,
            audit: AuditFields::default(),
        }
    }
}

impl Entity for Person {
    type Id = i64;

    fn schema() -> &'static EntitySchema {
        &PERSON_SCHEMA
    }

    fn id(&self) -> Option<&i64> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn audit(&self) -> &AuditFields {
        &self.audit
    }

    fn audit_mut(&mut self) -> &mut AuditFields {
        &mut self.audit
    }
}

/// Sink that remembers `(kind, entity_id, permanent)` for every delivered event
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(DomainEventKind, String, bool)>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<(DomainEventKind, String, bool)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl<E: Entity> EventSink<E> for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, event: &DomainEvent<E>) -> anyhow::Result<()> {
        self.delivered
            .lock()
            .unwrap()
            .push((event.kind, event.entity_id.clone(), event.permanent));
        Ok(())
    }
}
