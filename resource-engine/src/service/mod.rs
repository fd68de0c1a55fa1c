//! Transactional service layer over a [`GenericRepository`]
//!
//! Each public operation of [`GenericService`] runs in its own unit of work.
//! Reads go through the shared [`ResourceCache`]; writes commit first, then
//! evict the affected entity key plus every list and count of the same entity
//! type, then hand the committed events to the [`DomainEventPublisher`].
//!
//! # Example
//!
//! ```rust,ignore
//! use resource_engine::prelude::*;
//!
//! let service = GenericService::builder(InMemoryStore::<Widget>::new())
//!     .config(&config)
//!     .build();
//!
//! let widget = service.create(Widget::named("sprocket"), &actor).await?;
//! let page = service.list("name:like:sprock", &PageRequest::default()).await?;
//! ```

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::cache::{CacheEvictionService, CacheKeys, CacheRegion, ResourceCache};
use crate::config::{BatchConfig, CacheConfig, Config, EventsConfig, FilterConfig, PaginationConfig};
use crate::entity::{Actor, Entity};
use crate::error::{Error, ResourceError, ResourceErrorKind, ResourceOperation, ResourceResult};
use crate::events::{DomainEventPublisher, TracingEventSink};
use crate::filter::FilterParser;
use crate::repository::{GenericRepository, Page, PageRequest, RepositoryUnit, Store};
use crate::schema::AUDIT_FIELDS;
use crate::specification::{Specification, SpecificationBuilder};

#[cfg(test)]
mod tests;

/// Read-through cached, event-publishing access to one entity type
pub struct GenericService<E: Entity, S: Store<E>> {
    repository: GenericRepository<E, S>,
    parser: FilterParser,
    specifications: SpecificationBuilder,
    pagination: PaginationConfig,
    batch: BatchConfig,
    cache: Arc<ResourceCache>,
    eviction: CacheEvictionService,
    publisher: DomainEventPublisher<E>,
}

/// Builder for [`GenericService`]
pub struct GenericServiceBuilder<E: Entity, S: Store<E>> {
    store: S,
    filter: FilterConfig,
    pagination: PaginationConfig,
    batch: BatchConfig,
    cache_config: CacheConfig,
    events: EventsConfig,
    cache: Option<Arc<ResourceCache>>,
    publisher: Option<DomainEventPublisher<E>>,
}

impl<E: Entity, S: Store<E>> GenericServiceBuilder<E, S> {
    /// Take filter, pagination, batch, cache and event settings from `config`
    #[must_use]
    pub fn config(mut self, config: &Config) -> Self {
        self.filter = config.filter.clone();
        self.pagination = config.pagination.clone();
        self.batch = config.batch.clone();
        self.cache_config = config.cache.clone();
        self.events = config.events.clone();
        self
    }

    /// Share an existing cache (normally one per process)
    #[must_use]
    pub fn cache(mut self, cache: Arc<ResourceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a configured publisher instead of the tracing-only default
    #[must_use]
    pub fn publisher(mut self, publisher: DomainEventPublisher<E>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Build the service
    pub fn build(self) -> GenericService<E, S> {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(ResourceCache::in_memory(self.cache_config)));
        let publisher = self.publisher.unwrap_or_else(|| {
            DomainEventPublisher::new(self.events).with_sink(Arc::new(TracingEventSink))
        });
        let mode = self.filter.mode;

        GenericService {
            repository: GenericRepository::with_limits(
                self.store,
                self.pagination.clone(),
                self.batch.clone(),
            ),
            parser: FilterParser::new(self.filter),
            specifications: SpecificationBuilder::for_entity::<E>().with_mode(mode),
            pagination: self.pagination,
            batch: self.batch,
            eviction: CacheEvictionService::new(cache.clone()),
            cache,
            publisher,
        }
    }
}

impl<E: Entity, S: Store<E>> GenericService<E, S> {
    /// Start building a service over `store`
    pub fn builder(store: S) -> GenericServiceBuilder<E, S> {
        GenericServiceBuilder {
            store,
            filter: FilterConfig::default(),
            pagination: PaginationConfig::default(),
            batch: BatchConfig::default(),
            cache_config: CacheConfig::default(),
            events: EventsConfig::default(),
            cache: None,
            publisher: None,
        }
    }

    /// Underlying repository
    pub fn repository(&self) -> &GenericRepository<E, S> {
        &self.repository
    }

    /// Shared cache
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Event publisher
    pub fn publisher(&self) -> &DomainEventPublisher<E> {
        &self.publisher
    }

    /// Insert a new entity
    pub async fn create(&self, entity: E, actor: &Actor) -> ResourceResult<E> {
        if entity.id().is_some() {
            return Err(ResourceError::new(
                ResourceOperation::Create,
                ResourceErrorKind::ValidationFailed,
                "New entities must not carry an id",
            )
            .with_entity(E::entity_name(), entity.id_string()));
        }

        let mut uow = self.repository.begin().await?;
        let created = self.repository.save(&mut uow, entity, actor).await?;
        self.finish(uow, &[created.id_string()]).await?;
        Ok(created)
    }

    /// Active entity by id
    pub async fn find_by_id(&self, id: &E::Id) -> ResourceResult<E> {
        let name = E::entity_name();
        let key = CacheKeys::entity(name, id);

        let found = self
            .cache
            .get_or_load(name, CacheRegion::Entities, &key, || async {
                let mut uow = self.repository.begin().await?;
                self.repository.find_by_id(&mut uow, id).await
            })
            .await?;

        found.ok_or_else(|| ResourceError::not_found(name, id.to_string()))
    }

    /// Whether an active entity with this id exists (uncached)
    pub async fn exists(&self, id: &E::Id) -> ResourceResult<bool> {
        let mut uow = self.repository.begin().await?;
        self.repository.exists(&mut uow, id).await
    }

    /// One page of active entities matching `spec`
    pub async fn find_all(&self, spec: &Specification, page: &PageRequest) -> ResourceResult<Page<E>> {
        let name = E::entity_name();
        let page = page.clone().normalized(&self.pagination);
        let key = CacheKeys::list(name, spec, &page);

        let found = self
            .cache
            .get_or_load(name, CacheRegion::Lists, &key, || async {
                let mut uow = self.repository.begin().await?;
                self.repository.find_all(&mut uow, spec, &page).await.map(Some)
            })
            .await?;

        found.ok_or_else(|| {
            ResourceError::internal(ResourceOperation::FindAll, "List load produced no page")
                .with_entity_type(name)
        })
    }

    /// Number of active entities matching `spec`
    pub async fn count(&self, spec: &Specification) -> ResourceResult<u64> {
        let name = E::entity_name();
        let key = CacheKeys::count(name, spec);

        let found = self
            .cache
            .get_or_load(name, CacheRegion::Counts, &key, || async {
                let mut uow = self.repository.begin().await?;
                self.repository.count(&mut uow, spec).await.map(Some)
            })
            .await?;

        Ok(found.unwrap_or_default())
    }

    /// Translate a filter expression into a specification for this entity type
    pub fn specification(&self, filter: &str) -> ResourceResult<Specification> {
        let criteria = self.parser.parse(filter)?.into_criteria();
        self.specifications.build(&criteria)
    }

    /// One page of active entities matching a filter expression
    pub async fn list(&self, filter: &str, page: &PageRequest) -> ResourceResult<Page<E>> {
        let spec = self.specification(filter)?;
        self.find_all(&spec, page).await
    }

    /// One page of active entities matching map-style parameters
    pub async fn list_params<I, K, V>(&self, params: I, page: &PageRequest) -> ResourceResult<Page<E>>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let criteria = self.parser.parse_params(params)?.into_criteria();
        let spec = self.specifications.build(&criteria)?;
        self.find_all(&spec, page).await
    }

    /// One page of soft-deleted entities matching `spec` (uncached)
    pub async fn find_deleted(
        &self,
        spec: &Specification,
        page: &PageRequest,
    ) -> ResourceResult<Page<E>> {
        let mut uow = self.repository.begin().await?;
        self.repository.find_deleted(&mut uow, spec, page).await
    }

    /// Replace the state of an active entity
    ///
    /// When `expected_version` is given it must equal the stored version.
    /// Identity and audit metadata are taken from the stored entity.
    pub async fn update(
        &self,
        id: &E::Id,
        incoming: E,
        expected_version: Option<i64>,
        actor: &Actor,
    ) -> ResourceResult<E> {
        let mut uow = self.repository.begin().await?;
        let current = self
            .load_for_update(&mut uow, id, expected_version, ResourceOperation::Update)
            .await?;

        let mut incoming = incoming;
        incoming.set_id(id.clone());
        *incoming.audit_mut() = current.audit().clone();

        let updated = self.repository.save(&mut uow, incoming, actor).await?;
        self.finish(uow, &[id.to_string()]).await?;
        Ok(updated)
    }

    /// Merge the non-null fields of `patch` onto an active entity
    ///
    /// `id` and audit fields in the patch are ignored.
    pub async fn partial_update<P: Serialize>(
        &self,
        id: &E::Id,
        patch: &P,
        expected_version: Option<i64>,
        actor: &Actor,
    ) -> ResourceResult<E> {
        let mut uow = self.repository.begin().await?;
        let current = self
            .load_for_update(&mut uow, id, expected_version, ResourceOperation::PartialUpdate)
            .await?;

        let merged = merge_non_null(&current, patch).map_err(|message| {
            ResourceError::new(
                ResourceOperation::PartialUpdate,
                ResourceErrorKind::ValidationFailed,
                message,
            )
            .with_entity(E::entity_name(), id.to_string())
        })?;

        let updated = self
            .repository
            .save(&mut uow, merged, actor)
            .await
            .map_err(|e| e.with_operation(ResourceOperation::PartialUpdate))?;
        self.finish(uow, &[id.to_string()]).await?;
        Ok(updated)
    }

    async fn load_for_update(
        &self,
        uow: &mut RepositoryUnit<E, S>,
        id: &E::Id,
        expected_version: Option<i64>,
        operation: ResourceOperation,
    ) -> ResourceResult<E> {
        let name = E::entity_name();
        let current = self
            .repository
            .find_by_id(uow, id)
            .await?
            .ok_or_else(|| ResourceError::not_found(name, id.to_string()).with_operation(operation))?;

        if let Some(expected) = expected_version {
            if expected != current.version() {
                return Err(
                    ResourceError::conflict(name, id.to_string(), expected, current.version())
                        .with_operation(operation),
                );
            }
        }
        Ok(current)
    }

    /// Soft-delete an active entity
    pub async fn soft_delete(&self, id: &E::Id, actor: &Actor) -> ResourceResult<E> {
        let mut uow = self.repository.begin().await?;
        let deleted = self.repository.soft_delete(&mut uow, id, actor).await?;
        self.finish(uow, &[id.to_string()]).await?;
        Ok(deleted)
    }

    /// Reactivate a soft-deleted entity
    pub async fn restore(&self, id: &E::Id, actor: &Actor) -> ResourceResult<E> {
        let mut uow = self.repository.begin().await?;
        let restored = self.repository.restore(&mut uow, id, actor).await?;
        self.finish(uow, &[id.to_string()]).await?;
        Ok(restored)
    }

    /// Permanently remove an entity, active or soft-deleted
    pub async fn hard_delete(&self, id: &E::Id, actor: &Actor) -> ResourceResult<E> {
        let mut uow = self.repository.begin().await?;
        let removed = self.repository.hard_delete(&mut uow, id, actor).await?;
        self.finish(uow, &[id.to_string()]).await?;
        Ok(removed)
    }

    /// Save a batch atomically within the configured batch timeout
    pub async fn save_all(&self, entities: Vec<E>, actor: &Actor) -> ResourceResult<Vec<E>> {
        let mut uow = self.repository.begin().await?;
        let saved = self
            .within_batch_timeout(
                ResourceOperation::SaveAll,
                self.repository.save_all(&mut uow, entities, actor),
            )
            .await?;

        let ids: Vec<String> = saved.iter().map(E::id_string).collect();
        self.finish(uow, &ids).await?;
        Ok(saved)
    }

    /// Soft-delete a batch atomically within the configured batch timeout
    pub async fn soft_delete_all(&self, ids: &[E::Id], actor: &Actor) -> ResourceResult<Vec<E>> {
        let mut uow = self.repository.begin().await?;
        let deleted = self
            .within_batch_timeout(
                ResourceOperation::SoftDeleteAll,
                self.repository.soft_delete_all(&mut uow, ids, actor),
            )
            .await?;

        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.finish(uow, &ids).await?;
        Ok(deleted)
    }

    async fn within_batch_timeout<T>(
        &self,
        operation: ResourceOperation,
        work: impl std::future::Future<Output = ResourceResult<T>>,
    ) -> ResourceResult<T> {
        let limit = self.batch.timeout();
        match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    entity = E::entity_name(),
                    operation = %operation,
                    "Batch operation timed out after {:?}",
                    limit
                );
                Err(ResourceError::timeout(
                    operation,
                    format!("Batch did not complete within {:?}", limit),
                )
                .with_entity_type(E::entity_name()))
            }
        }
    }

    /// Commit, evict, then publish
    async fn finish(&self, uow: RepositoryUnit<E, S>, ids: &[String]) -> ResourceResult<()> {
        let events = uow.commit().await?;
        self.evict_after_write(ids).await;
        self.publisher.publish(events);
        Ok(())
    }

    async fn evict_after_write(&self, ids: &[String]) {
        let name = E::entity_name();
        let evicted = async {
            let mut removed = self
                .eviction
                .evict_all(name, ids.first().map(String::as_str))
                .await?;
            for id in ids.iter().skip(1) {
                removed += self.eviction.evict_entity(name, id).await?;
            }
            Ok::<_, Error>(removed)
        }
        .await;

        match evicted {
            Ok(removed) => tracing::debug!(entity = name, removed, "Evicted after commit"),
            Err(e) => tracing::warn!(
                entity = name,
                "Cache eviction after commit failed, entries expire by TTL: {}",
                e
            ),
        }
    }
}

/// Overlay the non-null top-level fields of `patch` on `current`
fn merge_non_null<E: Entity, P: Serialize>(current: &E, patch: &P) -> Result<E, String> {
    let mut document =
        serde_json::to_value(current).map_err(|e| format!("Entity not serializable: {}", e))?;
    let patch = serde_json::to_value(patch).map_err(|e| format!("Patch not serializable: {}", e))?;

    let Value::Object(patch) = patch else {
        return Err("Patch must be an object".to_string());
    };
    let Value::Object(target) = &mut document else {
        return Err("Entity does not serialize to an object".to_string());
    };

    for (field, value) in patch {
        let protected = field == "id" || AUDIT_FIELDS.iter().any(|f| f.name == field);
        if value.is_null() || protected {
            continue;
        }
        target.insert(field, value);
    }

    serde_json::from_value(document).map_err(|e| format!("Patch does not fit entity: {}", e))
}
