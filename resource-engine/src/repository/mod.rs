//! Soft-delete aware repositories over pluggable stores
//!
//! # Features
//!
//! - **Generic data access**: [`GenericRepository`] implements reads, saves,
//!   soft delete, restore, hard delete and chunked batches for any [`Entity`](crate::entity::Entity)
//! - **Optimistic concurrency**: every update is conditioned on the version
//!   the caller read; a stale version is a `Conflict`
//! - **Transactions**: all work happens inside a [`UnitOfWork`], whose events
//!   are only released after a successful commit
//! - **Stores**: [`InMemoryStore`] for tests and embedded use, `PgStore`
//!   (PostgreSQL) with the `database` feature
//! - **Pagination**: [`PageRequest`] and [`Page`]
//!
//! # Example
//!
//! ```rust,ignore
//! use resource_engine::repository::{GenericRepository, InMemoryStore, PageRequest};
//! use resource_engine::specification::Specification;
//!
//! let repository = GenericRepository::new(InMemoryStore::<Widget>::new());
//! let mut uow = repository.begin().await?;
//! let page = repository
//!     .find_all(&mut uow, &Specification::field("quantity").gt(0), &PageRequest::default())
//!     .await?;
//! ```

mod generic;
mod memory;
mod pagination;
#[cfg(feature = "database")]
mod postgres;
mod traits;

pub use generic::{GenericRepository, RepositoryUnit, UnitOfWork};
pub use memory::{InMemoryStore, InMemoryTransaction};
pub use pagination::{OrderDirection, Page, PageRequest, SortOrder};
#[cfg(feature = "database")]
pub use postgres::{PgStore, PgTransaction};
pub use traits::{Store, StoreTransaction, Visibility};
