//! Storage backend traits
//!
//! A [`Store`] hands out [`StoreTransaction`]s; every repository operation runs
//! against one transaction and nothing becomes visible to other transactions
//! until [`StoreTransaction::commit`] succeeds. Dropping a transaction without
//! committing rolls it back.
//!
//! Both traits use RPITIT (Return Position Impl Trait In Traits), so backends
//! implement them with plain `async fn`:
//!
//! ```rust,ignore
//! impl<E: Entity> StoreTransaction<E> for MyTransaction {
//!     async fn fetch(&mut self, id: &E::Id, visibility: Visibility) -> ResourceResult<Option<E>> {
//!         // ...
//!     }
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use std::future::Future;

use crate::entity::{Actor, Entity};
use crate::error::ResourceResult;
use crate::specification::Specification;

use super::pagination::PageRequest;

/// Which rows a lookup by id may return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Only rows with `active = true`
    Active,
    /// Only soft-deleted rows
    Deleted,
    /// Any row, regardless of the soft-delete flag
    Any,
}

impl Visibility {
    /// Whether a row with the given active flag is visible
    pub fn admits(&self, active: bool) -> bool {
        match self {
            Self::Active => active,
            Self::Deleted => !active,
            Self::Any => true,
        }
    }
}

/// A transactional storage backend for one entity type
pub trait Store<E: Entity>: Send + Sync + 'static {
    /// Transaction handle
    type Tx: StoreTransaction<E>;

    /// Open a transaction
    fn begin(&self) -> impl Future<Output = ResourceResult<Self::Tx>> + Send;
}

/// Operations available inside a store transaction
///
/// Specifications passed to [`select`](Self::select) and
/// [`count`](Self::count) are applied as-is; visibility filtering is the
/// caller's responsibility.
pub trait StoreTransaction<E: Entity>: Send {
    /// Load one row by id
    fn fetch(
        &mut self,
        id: &E::Id,
        visibility: Visibility,
    ) -> impl Future<Output = ResourceResult<Option<E>>> + Send;

    /// Load the rows matching `spec`, ordered and windowed by `page`
    fn select(
        &mut self,
        spec: &Specification,
        page: &PageRequest,
    ) -> impl Future<Output = ResourceResult<Vec<E>>> + Send;

    /// Count the rows matching `spec`
    fn count(&mut self, spec: &Specification) -> impl Future<Output = ResourceResult<u64>> + Send;

    /// Insert a new row, assigning its id; returns the stored row
    fn insert(&mut self, entity: E) -> impl Future<Output = ResourceResult<E>> + Send;

    /// Overwrite the mutable attributes of an active row whose version equals
    /// `expected_version`, incrementing the version
    ///
    /// Creation metadata and the soft-delete state are preserved from the
    /// stored row. Returns `None` when no active row has that version.
    fn update(
        &mut self,
        entity: E,
        expected_version: i64,
    ) -> impl Future<Output = ResourceResult<Option<E>>> + Send;

    /// Soft-delete an active row, incrementing its version
    ///
    /// Returns `None` when no active row has that id.
    fn mark_deleted(
        &mut self,
        id: &E::Id,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> impl Future<Output = ResourceResult<Option<E>>> + Send;

    /// Reactivate a soft-deleted row, incrementing its version
    ///
    /// Returns `None` when no soft-deleted row has that id.
    fn mark_restored(
        &mut self,
        id: &E::Id,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> impl Future<Output = ResourceResult<Option<E>>> + Send;

    /// Physically remove a row; returns whether one existed
    fn remove(&mut self, id: &E::Id) -> impl Future<Output = ResourceResult<bool>> + Send;

    /// Settle the writes issued so far without committing them
    ///
    /// Called at every batch chunk boundary. Writes stay invisible to other
    /// transactions until [`commit`](Self::commit); a conflict detected here
    /// aborts the batch early.
    fn flush(&mut self) -> impl Future<Output = ResourceResult<()>> + Send;

    /// Make every staged change visible atomically
    fn commit(self) -> impl Future<Output = ResourceResult<()>> + Send;
}
