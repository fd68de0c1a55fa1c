//! # resource-engine
//!
//! Generic resource access engine: typed CRUD over any entity with soft
//! delete, optimistic concurrency, read-through caching and post-commit
//! domain events.
//!
//! ## Features
//!
//! - **Filter grammar**: `field:operator:value(;value)*` clauses, comma separated,
//!   or map-style query parameters
//! - **Specifications**: composable predicates with dotted-path relation
//!   traversal, evaluated in memory or rendered to SQL
//! - **Repositories**: soft-delete aware reads, versioned updates, restore,
//!   hard delete and bounded batches over pluggable stores (in-memory, PostgreSQL)
//! - **Caching**: entity, list and count regions with per-entity-type
//!   eviction (in-memory, Redis)
//! - **Events**: committed changes are dispatched asynchronously to sinks
//!   (tracing, NATS)
//!
//! ## Example
//!
//! ```rust,ignore
//! use resource_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let people = GenericService::builder(InMemoryStore::<Person>::new())
//!         .config(&config)
//!         .build();
//!
//!     let actor = Actor::new("admin");
//!     people.create(Person::new("John", 30), &actor).await?;
//!     let adults = people
//!         .list("age:gte:18,name:like:Jo", &PageRequest::default())
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod filter;
pub mod observability;
pub mod repository;
pub mod schema;
pub mod service;
pub mod specification;

#[cfg(test)]
mod fixtures;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{
        CacheBackend, CacheEvictionService, CacheKeys, CacheRegion, InMemoryCacheBackend,
        ResourceCache,
    };
    #[cfg(feature = "cache")]
    pub use crate::cache::RedisCacheBackend;

    pub use crate::config::{Config, ParseMode};
    pub use crate::entity::{Actor, AuditFields, Entity, EntityId};
    pub use crate::error::{
        Error, ResourceError, ResourceErrorKind, ResourceOperation, ResourceResult, Result,
    };

    pub use crate::events::{
        DomainEvent, DomainEventKind, DomainEventPublisher, EventBatch, EventSink, TracingEventSink,
    };
    #[cfg(feature = "events")]
    pub use crate::events::NatsEventSink;

    pub use crate::filter::{FilterCriteria, FilterOperator, FilterParser};
    pub use crate::observability::init_tracing;

    pub use crate::repository::{
        GenericRepository, InMemoryStore, OrderDirection, Page, PageRequest, SortOrder, Store,
        StoreTransaction, UnitOfWork, Visibility,
    };
    #[cfg(feature = "database")]
    pub use crate::repository::PgStore;

    pub use crate::schema::{EntitySchema, FieldDef, FieldKind, Relation};
    pub use crate::service::{GenericService, GenericServiceBuilder};
    pub use crate::specification::{Specification, SpecificationBuilder};

    pub use async_trait::async_trait;
}
