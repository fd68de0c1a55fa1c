use chrono::Utc;
use std::marker::PhantomData;

use crate::config::{BatchConfig, PaginationConfig};
use crate::entity::{Actor, Entity};
use crate::error::{ResourceError, ResourceErrorKind, ResourceOperation, ResourceResult};
use crate::events::{DomainEvent, EventBatch};
use crate::specification::Specification;

use super::pagination::{Page, PageRequest};
use super::traits::{Store, StoreTransaction, Visibility};

/// A store transaction plus the domain events recorded inside it
///
/// Events are only handed back by [`commit`](Self::commit) once the
/// transaction has committed; dropping the unit of work discards both the
/// staged writes and the events.
pub struct UnitOfWork<E: Entity, T: StoreTransaction<E>> {
    tx: T,
    events: EventBatch<E>,
}

impl<E: Entity, T: StoreTransaction<E>> UnitOfWork<E, T> {
    /// Wrap an open transaction
    pub fn new(tx: T) -> Self {
        Self {
            tx,
            events: EventBatch::new(),
        }
    }

    /// The underlying store transaction
    pub fn tx(&mut self) -> &mut T {
        &mut self.tx
    }

    /// Record an event to be released after commit
    pub fn record(&mut self, event: DomainEvent<E>) {
        self.events.push(event);
    }

    /// Events recorded so far
    pub fn pending_events(&self) -> &EventBatch<E> {
        &self.events
    }

    /// Commit the transaction and release its events
    pub async fn commit(self) -> ResourceResult<EventBatch<E>> {
        let Self { tx, events } = self;
        tx.commit()
            .await
            .map_err(|e| e.with_entity_type(E::entity_name()))?;
        Ok(events)
    }
}

/// Generic data access for one entity type
///
/// Every read excludes soft-deleted rows unless the method says otherwise.
/// Every mutation runs inside a caller-supplied [`UnitOfWork`] and records the
/// matching [`DomainEvent`] in it.
///
/// # Example
///
/// ```rust,ignore
/// let repository = GenericRepository::new(InMemoryStore::<Widget>::new());
/// let mut uow = repository.begin().await?;
/// let widget = repository.save(&mut uow, Widget::named("sprocket"), &actor).await?;
/// let events = uow.commit().await?;
/// ```
pub struct GenericRepository<E: Entity, S: Store<E>> {
    store: S,
    pagination: PaginationConfig,
    batch: BatchConfig,
    _entity: PhantomData<fn() -> E>,
}

/// Unit of work type used by a repository over store `S`
pub type RepositoryUnit<E, S> = UnitOfWork<E, <S as Store<E>>::Tx>;

impl<E: Entity, S: Store<E>> GenericRepository<E, S> {
    /// Repository with default pagination and batch limits
    pub fn new(store: S) -> Self {
        Self::with_limits(store, PaginationConfig::default(), BatchConfig::default())
    }

    /// Repository with explicit pagination and batch limits
    pub fn with_limits(store: S, pagination: PaginationConfig, batch: BatchConfig) -> Self {
        Self {
            store,
            pagination,
            batch,
            _entity: PhantomData,
        }
    }

    /// The backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Batch limits in effect
    pub fn batch_config(&self) -> &BatchConfig {
        &self.batch
    }

    /// Open a unit of work
    pub async fn begin(&self) -> ResourceResult<RepositoryUnit<E, S>> {
        let tx = self
            .store
            .begin()
            .await
            .map_err(during::<E>(ResourceOperation::Transaction))?;
        Ok(UnitOfWork::new(tx))
    }

    /// Active entity by id
    pub async fn find_by_id(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        id: &E::Id,
    ) -> ResourceResult<Option<E>> {
        uow.tx()
            .fetch(id, Visibility::Active)
            .await
            .map_err(during::<E>(ResourceOperation::FindById))
    }

    /// Entity by id regardless of soft-delete state
    pub async fn find_by_id_with_deleted(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        id: &E::Id,
    ) -> ResourceResult<Option<E>> {
        uow.tx()
            .fetch(id, Visibility::Any)
            .await
            .map_err(during::<E>(ResourceOperation::FindById))
    }

    /// Whether an active entity with this id exists
    pub async fn exists(&self, uow: &mut RepositoryUnit<E, S>, id: &E::Id) -> ResourceResult<bool> {
        uow.tx()
            .fetch(id, Visibility::Active)
            .await
            .map(|found| found.is_some())
            .map_err(during::<E>(ResourceOperation::Exists))
    }

    /// One page of active entities matching `spec`
    pub async fn find_all(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        spec: &Specification,
        page: &PageRequest,
    ) -> ResourceResult<Page<E>> {
        let scoped = Specification::is_active().and(spec.clone());
        self.page_of(uow, &scoped, page, ResourceOperation::FindAll)
            .await
    }

    /// One page of soft-deleted entities matching `spec`
    pub async fn find_deleted(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        spec: &Specification,
        page: &PageRequest,
    ) -> ResourceResult<Page<E>> {
        let scoped = Specification::deleted().and(spec.clone());
        self.page_of(uow, &scoped, page, ResourceOperation::FindAll)
            .await
    }

    /// Number of active entities matching `spec`
    pub async fn count(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        spec: &Specification,
    ) -> ResourceResult<u64> {
        let scoped = Specification::is_active().and(spec.clone());
        uow.tx()
            .count(&scoped)
            .await
            .map_err(during::<E>(ResourceOperation::Count))
    }

    async fn page_of(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        scoped: &Specification,
        page: &PageRequest,
        operation: ResourceOperation,
    ) -> ResourceResult<Page<E>> {
        let page = page.clone().normalized(&self.pagination);
        for order in &page.sort {
            E::schema()
                .resolve(&order.field)
                .map_err(|e| e.with_operation(operation))?;
        }

        let content = uow
            .tx()
            .select(scoped, &page)
            .await
            .map_err(during::<E>(operation))?;
        let total = uow
            .tx()
            .count(scoped)
            .await
            .map_err(during::<E>(operation))?;
        Ok(Page::new(content, total, &page))
    }

    /// Insert (no id) or update (with id) an entity
    ///
    /// Updates require the entity's version to match the stored version; a
    /// mismatch is a `Conflict`, a missing or soft-deleted row is `NotFound`.
    pub async fn save(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        mut entity: E,
        actor: &Actor,
    ) -> ResourceResult<E> {
        let now = Utc::now();

        let Some(id) = entity.id().cloned() else {
            entity.audit_mut().mark_created(actor, now);
            let created = uow
                .tx()
                .insert(entity)
                .await
                .map_err(during::<E>(ResourceOperation::Create))?;
            tracing::debug!(entity = E::entity_name(), id = %created.id_string(), "Entity created");
            uow.record(DomainEvent::created(created.clone(), actor));
            return Ok(created);
        };

        let expected = entity.version();
        entity.audit_mut().mark_updated(actor, now);
        let updated = uow
            .tx()
            .update(entity, expected)
            .await
            .map_err(during::<E>(ResourceOperation::Update))?;

        match updated {
            Some(updated) => {
                tracing::debug!(
                    entity = E::entity_name(),
                    id = %id,
                    version = updated.version(),
                    "Entity updated"
                );
                uow.record(DomainEvent::updated(updated.clone(), actor));
                Ok(updated)
            }
            None => Err(self.explain_rejected_update(uow, &id, expected).await),
        }
    }

    /// Work out why a versioned update matched no row
    async fn explain_rejected_update(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        id: &E::Id,
        expected: i64,
    ) -> ResourceError {
        match uow.tx().fetch(id, Visibility::Any).await {
            Ok(Some(current)) if current.is_active() => {
                ResourceError::conflict(E::entity_name(), id.to_string(), expected, current.version())
            }
            Ok(_) => ResourceError::not_found(E::entity_name(), id.to_string())
                .with_operation(ResourceOperation::Update),
            Err(e) => during::<E>(ResourceOperation::Update)(e),
        }
    }

    /// Flip an active entity to soft-deleted
    pub async fn soft_delete(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        id: &E::Id,
        actor: &Actor,
    ) -> ResourceResult<E> {
        let deleted = uow
            .tx()
            .mark_deleted(id, actor, Utc::now())
            .await
            .map_err(during::<E>(ResourceOperation::SoftDelete))?
            .ok_or_else(|| {
                ResourceError::not_found(E::entity_name(), id.to_string())
                    .with_operation(ResourceOperation::SoftDelete)
            })?;
        tracing::debug!(entity = E::entity_name(), id = %id, "Entity soft-deleted");
        uow.record(DomainEvent::deleted(deleted.clone(), actor));
        Ok(deleted)
    }

    /// Reactivate a soft-deleted entity
    pub async fn restore(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        id: &E::Id,
        actor: &Actor,
    ) -> ResourceResult<E> {
        let restored = uow
            .tx()
            .mark_restored(id, actor, Utc::now())
            .await
            .map_err(during::<E>(ResourceOperation::Restore))?
            .ok_or_else(|| {
                ResourceError::not_found(E::entity_name(), id.to_string())
                    .with_operation(ResourceOperation::Restore)
            })?;
        tracing::debug!(entity = E::entity_name(), id = %id, "Entity restored");
        uow.record(DomainEvent::restored(restored.clone(), actor));
        Ok(restored)
    }

    /// Physically remove an entity, active or not; returns its last state
    pub async fn hard_delete(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        id: &E::Id,
        actor: &Actor,
    ) -> ResourceResult<E> {
        let not_found = || {
            ResourceError::not_found(E::entity_name(), id.to_string())
                .with_operation(ResourceOperation::HardDelete)
        };
        let existing = uow
            .tx()
            .fetch(id, Visibility::Any)
            .await
            .map_err(during::<E>(ResourceOperation::HardDelete))?
            .ok_or_else(not_found)?;
        let removed = uow
            .tx()
            .remove(id)
            .await
            .map_err(during::<E>(ResourceOperation::HardDelete))?;
        if !removed {
            return Err(not_found());
        }
        tracing::debug!(entity = E::entity_name(), id = %id, "Entity permanently deleted");
        uow.record(DomainEvent::removed(existing.clone(), actor));
        Ok(existing)
    }

    /// Save every entity in chunks; any failure aborts the whole batch
    ///
    /// The unit of work is flushed after every `batch.chunk_size` entities.
    /// The returned rows and recorded events are bounded by `batch.max_size`,
    /// which is checked before anything is written.
    pub async fn save_all(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        entities: Vec<E>,
        actor: &Actor,
    ) -> ResourceResult<Vec<E>> {
        self.check_batch_size(entities.len(), ResourceOperation::SaveAll)?;
        let total = entities.len();
        let mut saved = Vec::with_capacity(total);

        for (index, entity) in entities.into_iter().enumerate() {
            let entity = self
                .save(uow, entity, actor)
                .await
                .map_err(|e| e.with_operation(ResourceOperation::SaveAll))?;
            saved.push(entity);
            self.end_of_chunk(uow, index, total, ResourceOperation::SaveAll)
                .await?;
        }
        Ok(saved)
    }

    /// Soft-delete every id in chunks; any failure aborts the whole batch
    ///
    /// Chunking and bounds are the same as for [`save_all`](Self::save_all).
    pub async fn soft_delete_all(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        ids: &[E::Id],
        actor: &Actor,
    ) -> ResourceResult<Vec<E>> {
        self.check_batch_size(ids.len(), ResourceOperation::SoftDeleteAll)?;
        let mut deleted = Vec::with_capacity(ids.len());

        for (index, id) in ids.iter().enumerate() {
            let entity = self
                .soft_delete(uow, id, actor)
                .await
                .map_err(|e| e.with_operation(ResourceOperation::SoftDeleteAll))?;
            deleted.push(entity);
            self.end_of_chunk(uow, index, ids.len(), ResourceOperation::SoftDeleteAll)
                .await?;
        }
        Ok(deleted)
    }

    fn check_batch_size(&self, size: usize, operation: ResourceOperation) -> ResourceResult<()> {
        if size > self.batch.max_size {
            return Err(ResourceError::new(
                operation,
                ResourceErrorKind::ValidationFailed,
                format!(
                    "Batch of {} exceeds the maximum of {}",
                    size, self.batch.max_size
                ),
            )
            .with_entity_type(E::entity_name()));
        }
        Ok(())
    }

    /// Flush the unit of work when `index` closes a chunk
    async fn end_of_chunk(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        index: usize,
        total: usize,
        operation: ResourceOperation,
    ) -> ResourceResult<()> {
        let done = index + 1;
        if done % self.batch.chunk_size.max(1) != 0 && done != total {
            return Ok(());
        }
        uow.tx().flush().await.map_err(during::<E>(operation))?;
        tracing::debug!(
            entity = E::entity_name(),
            operation = %operation,
            done,
            total,
            "Batch chunk flushed"
        );
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Attach operation and entity context to a store error
fn during<E: Entity>(operation: ResourceOperation) -> impl Fn(ResourceError) -> ResourceError {
    move |error| {
        let error = if error.operation == ResourceOperation::Transaction {
            error.with_operation(operation)
        } else {
            error
        };
        match error.entity_type {
            Some(_) => error,
            None => error.with_entity_type(E::entity_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DomainEventKind;
    use crate::fixtures::{Person, Widget};
    use crate::repository::{InMemoryStore, OrderDirection};

    fn repository() -> GenericRepository<Widget, InMemoryStore<Widget>> {
        GenericRepository::new(InMemoryStore::new())
    }

    async fn create(
        repository: &GenericRepository<Widget, InMemoryStore<Widget>>,
        name: &str,
    ) -> Widget {
        let mut uow = repository.begin().await.unwrap();
        let widget = repository
            .save(&mut uow, Widget::named(name), &Actor::new("alice"))
            .await
            .unwrap();
        uow.commit().await.unwrap();
        widget
    }

    #[tokio::test]
    async fn test_save_creates_with_audit_and_event() {
        let repository = repository();
        let mut uow = repository.begin().await.unwrap();
        let widget = repository
            .save(&mut uow, Widget::named("sprocket"), &Actor::new("alice"))
            .await
            .unwrap();
        assert_eq!(widget.id, Some(1));
        assert_eq!(widget.audit.version, 0);
        assert!(widget.audit.active);
        assert_eq!(widget.audit.created_by.as_deref(), Some("alice"));

        let events = uow.commit().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events.iter().next().unwrap().kind, DomainEventKind::Created);
    }

    #[tokio::test]
    async fn test_stale_version_is_conflict() {
        let repository = repository();
        let widget = create(&repository, "sprocket").await;

        let mut uow = repository.begin().await.unwrap();
        let mut first = widget.clone();
        first.name = "first".to_string();
        let updated = repository
            .save(&mut uow, first, &Actor::system())
            .await
            .unwrap();
        assert_eq!(updated.audit.version, 1);
        uow.commit().await.unwrap();

        let mut uow = repository.begin().await.unwrap();
        let err = repository
            .save(&mut uow, widget, &Actor::system())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(err.message.contains("expected 0"));
        assert!(err.message.contains("found 1"));
    }

    #[tokio::test]
    async fn test_update_of_deleted_entity_is_not_found() {
        let repository = repository();
        let widget = create(&repository, "sprocket").await;
        let id = widget.id.unwrap();

        let mut uow = repository.begin().await.unwrap();
        repository
            .soft_delete(&mut uow, &id, &Actor::system())
            .await
            .unwrap();
        let err = repository
            .save(&mut uow, widget, &Actor::system())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.operation, ResourceOperation::Update);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_from_reads() {
        let repository = repository();
        let id = create(&repository, "a").await.id.unwrap();
        create(&repository, "b").await;

        let mut uow = repository.begin().await.unwrap();
        let deleted = repository
            .soft_delete(&mut uow, &id, &Actor::new("bob"))
            .await
            .unwrap();
        assert!(!deleted.audit.active);
        assert!(deleted.audit.deleted_at.is_some());
        uow.commit().await.unwrap();

        let mut uow = repository.begin().await.unwrap();
        assert!(repository.find_by_id(&mut uow, &id).await.unwrap().is_none());
        assert!(!repository.exists(&mut uow, &id).await.unwrap());
        assert!(repository
            .find_by_id_with_deleted(&mut uow, &id)
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            repository.count(&mut uow, &Specification::All).await.unwrap(),
            1
        );
        let deleted = repository
            .find_deleted(&mut uow, &Specification::All, &PageRequest::default())
            .await
            .unwrap();
        assert_eq!(deleted.total_elements, 1);
    }

    #[tokio::test]
    async fn test_restore_and_repeat_transitions() {
        let repository = repository();
        let id = create(&repository, "a").await.id.unwrap();

        let mut uow = repository.begin().await.unwrap();
        let err = repository
            .restore(&mut uow, &id, &Actor::system())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.operation, ResourceOperation::Restore);

        repository
            .soft_delete(&mut uow, &id, &Actor::system())
            .await
            .unwrap();
        let err = repository
            .soft_delete(&mut uow, &id, &Actor::system())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let restored = repository
            .restore(&mut uow, &id, &Actor::new("carol"))
            .await
            .unwrap();
        assert!(restored.audit.active);
        assert!(restored.audit.deleted_by.is_none());
        assert_eq!(restored.audit.version, 2);
    }

    #[tokio::test]
    async fn test_hard_delete_removes_row() {
        let repository = repository();
        let id = create(&repository, "a").await.id.unwrap();

        let mut uow = repository.begin().await.unwrap();
        repository
            .soft_delete(&mut uow, &id, &Actor::system())
            .await
            .unwrap();
        repository
            .hard_delete(&mut uow, &id, &Actor::system())
            .await
            .unwrap();
        let events = uow.commit().await.unwrap();
        let last = events.into_iter().last().unwrap();
        assert!(last.permanent);

        assert_eq!(repository.store().row_count().await, 0);
        let mut uow = repository.begin().await.unwrap();
        let err = repository
            .hard_delete(&mut uow, &id, &Actor::system())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_find_all_pages_and_rejects_unknown_sort() {
        let repository = GenericRepository::new(InMemoryStore::<Person>::new());
        let mut uow = repository.begin().await.unwrap();
        for (name, age) in [("Ann", 20), ("Ben", 35), ("Cy", 50)] {
            repository
                .save(&mut uow, Person::new(name, age), &Actor::system())
                .await
                .unwrap();
        }
        uow.commit().await.unwrap();

        let mut uow = repository.begin().await.unwrap();
        let page = repository
            .find_all(
                &mut uow,
                &Specification::field("age").gt(21),
                &PageRequest::new(0, 1).sorted_by("age", OrderDirection::Descending),
            )
            .await
            .unwrap();
        assert_eq!(page.total_elements, 2);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.content[0].name, "Cy");

        let err = repository
            .find_all(
                &mut uow,
                &Specification::All,
                &PageRequest::default().sorted_by("nmae", OrderDirection::Ascending),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.operation, ResourceOperation::FindAll);
    }

    #[tokio::test]
    async fn test_batch_size_limit_and_abort() {
        let batch = BatchConfig {
            max_size: 3,
            chunk_size: 2,
            timeout_secs: 5,
        };
        let repository =
            GenericRepository::with_limits(InMemoryStore::<Widget>::new(), PaginationConfig::default(), batch);

        let mut uow = repository.begin().await.unwrap();
        let too_many = (0..4).map(|i| Widget::named(&format!("w{i}"))).collect();
        let err = repository
            .save_all(&mut uow, too_many, &Actor::system())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.operation, ResourceOperation::SaveAll);

        let saved = repository
            .save_all(
                &mut uow,
                vec![Widget::named("a"), Widget::named("b"), Widget::named("c")],
                &Actor::system(),
            )
            .await
            .unwrap();
        assert_eq!(saved.len(), 3);
        assert_eq!(uow.pending_events().len(), 3);

        let ids = vec![saved[0].id.unwrap(), 99];
        let err = repository
            .soft_delete_all(&mut uow, &ids, &Actor::system())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.operation, ResourceOperation::SoftDeleteAll);
    }

    fn chunked_repository() -> GenericRepository<Widget, InMemoryStore<Widget>> {
        let batch = BatchConfig {
            max_size: 10,
            chunk_size: 2,
            timeout_secs: 5,
        };
        GenericRepository::with_limits(InMemoryStore::new(), PaginationConfig::default(), batch)
    }

    #[tokio::test]
    async fn test_batch_flushes_once_per_chunk() {
        let repository = chunked_repository();
        let mut uow = repository.begin().await.unwrap();

        let widgets = (0..5).map(|i| Widget::named(&format!("w{i}"))).collect();
        let saved = repository
            .save_all(&mut uow, widgets, &Actor::system())
            .await
            .unwrap();
        assert_eq!(uow.tx().flushes(), 3);

        let ids: Vec<i64> = saved.iter().map(|w| w.id.unwrap()).collect();
        repository
            .soft_delete_all(&mut uow, &ids[..4], &Actor::system())
            .await
            .unwrap();
        assert_eq!(uow.tx().flushes(), 5);

        uow.commit().await.unwrap();
        assert_eq!(repository.store().row_count().await, 5);
    }

    #[tokio::test]
    async fn test_batch_aborts_at_chunk_boundary_after_concurrent_change() {
        let repository = chunked_repository();
        let seeded = create(&repository, "seed").await;
        let id = seeded.id.unwrap();

        let mut uow = repository.begin().await.unwrap();
        let mut renamed = seeded.clone();
        renamed.name = "mine".to_string();
        repository
            .save(&mut uow, renamed, &Actor::system())
            .await
            .unwrap();

        let mut other = repository.begin().await.unwrap();
        repository
            .soft_delete(&mut other, &id, &Actor::new("bob"))
            .await
            .unwrap();
        other.commit().await.unwrap();

        let widgets = (0..6).map(|i| Widget::named(&format!("w{i}"))).collect();
        let err = repository
            .save_all(&mut uow, widgets, &Actor::system())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.operation, ResourceOperation::SaveAll);
        // the rename plus the first chunk; the remaining chunks never ran
        assert_eq!(uow.tx().staged_writes(), 3);
    }
}
