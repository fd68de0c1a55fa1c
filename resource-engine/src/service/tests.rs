use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::cache::CacheRegion;
use crate::config::ParseMode;
use crate::events::DomainEventKind;
use crate::fixtures::{Person, RecordingSink, Widget};
use crate::repository::{InMemoryStore, InMemoryTransaction, Store, StoreTransaction, Visibility};
use crate::specification::Specification;

type WidgetService = GenericService<Widget, InMemoryStore<Widget>>;
type PersonService = GenericService<Person, InMemoryStore<Person>>;

fn alice() -> Actor {
    Actor::new("alice")
}

fn widgets() -> WidgetService {
    GenericService::builder(InMemoryStore::new()).build()
}

fn widgets_with(config: &Config, cache: Arc<ResourceCache>, sink: Arc<RecordingSink>) -> WidgetService {
    GenericService::<Widget, _>::builder(InMemoryStore::new())
        .config(config)
        .cache(cache)
        .publisher(DomainEventPublisher::<Widget>::new(config.events.clone()).with_sink(sink))
        .build()
}

fn people(cache: Arc<ResourceCache>) -> PersonService {
    GenericService::builder(InMemoryStore::new()).cache(cache).build()
}

#[tokio::test]
async fn test_widget_lifecycle() {
    let service = widgets();
    let actor = alice();

    let created = service.create(Widget::named("Widget"), &actor).await.unwrap();
    assert_eq!(created.id, Some(1));
    assert_eq!(created.audit.version, 0);

    let updated = service
        .update(&1, Widget::named("Widget2"), Some(0), &actor)
        .await
        .unwrap();
    assert_eq!(updated.name, "Widget2");
    assert_eq!(updated.audit.version, 1);

    let stale = service
        .update(&1, Widget::named("Widget3"), Some(0), &actor)
        .await
        .unwrap_err();
    assert!(stale.is_conflict());

    service.soft_delete(&1, &actor).await.unwrap();
    assert!(service.find_by_id(&1).await.unwrap_err().is_not_found());

    service.restore(&1, &actor).await.unwrap();
    let restored = service.find_by_id(&1).await.unwrap();
    assert_eq!(restored.id, Some(1));
    assert_eq!(restored.name, "Widget2");
    assert!(restored.audit.active);
    assert!(restored.audit.deleted_at.is_none());
    assert!(restored.audit.deleted_by.is_none());
}

#[tokio::test]
async fn test_filter_selects_matching_people() {
    let service = people(Arc::new(ResourceCache::in_memory(CacheConfig::default())));
    let actor = alice();
    service.create(Person::new("John", 30), &actor).await.unwrap();
    service.create(Person::new("Jane", 17), &actor).await.unwrap();

    let page = service
        .list("age:gte:18,name:like:Jo", &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total_elements, 1);
    assert_eq!(page.content[0].name, "John");

    let by_params = service
        .list_params([("name", "Jane"), ("page", "3")], &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(by_params.content.len(), 1);
    assert_eq!(by_params.content[0].age, 17);

    let spec = service.specification("age:lt:18").unwrap();
    assert_eq!(service.count(&spec).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unconvertible_value_depends_on_mode() {
    let lenient = people(Arc::new(ResourceCache::in_memory(CacheConfig::default())));
    let actor = alice();
    lenient.create(Person::new("John", 30), &actor).await.unwrap();

    let page = lenient
        .list("age:gte:abc", &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(page.total_elements, 1);

    let mut config = Config::default();
    config.filter.mode = ParseMode::Strict;
    let strict = PersonService::builder(InMemoryStore::new())
        .config(&config)
        .build();
    let error = strict
        .list("age:gte:abc", &PageRequest::default())
        .await
        .unwrap_err();
    assert!(error.is_validation());

    let unknown = lenient
        .list("salary:gt:10", &PageRequest::default())
        .await
        .unwrap_err();
    assert!(unknown.is_validation());
}

#[tokio::test]
async fn test_concurrent_updates_from_same_version() {
    let service = widgets();
    let actor = alice();
    service.create(Widget::named("Widget"), &actor).await.unwrap();

    let (first, second) = tokio::join!(
        service.update(&1, Widget::named("left"), Some(0), &actor),
        service.update(&1, Widget::named("right"), Some(0), &actor),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| r.as_ref().is_err_and(|e| e.is_conflict()))
            .count(),
        1
    );
    assert_eq!(service.find_by_id(&1).await.unwrap().audit.version, 1);
}

#[tokio::test]
async fn test_hard_delete_is_terminal() {
    let service = widgets();
    let actor = alice();
    service.create(Widget::named("doomed"), &actor).await.unwrap();
    service.find_by_id(&1).await.unwrap();
    service.soft_delete(&1, &actor).await.unwrap();

    let removed = service.hard_delete(&1, &actor).await.unwrap();
    assert_eq!(removed.name, "doomed");

    assert!(service.find_by_id(&1).await.unwrap_err().is_not_found());
    assert!(!service.exists(&1).await.unwrap());
    assert!(service.restore(&1, &actor).await.unwrap_err().is_not_found());
    assert!(service.hard_delete(&1, &actor).await.unwrap_err().is_not_found());

    let repository = service.repository();
    let mut uow = repository.begin().await.unwrap();
    assert!(repository
        .find_by_id_with_deleted(&mut uow, &1)
        .await
        .unwrap()
        .is_none());

    let trash = service
        .find_deleted(&Specification::All, &PageRequest::default())
        .await
        .unwrap();
    assert!(trash.is_empty());
}

#[tokio::test]
async fn test_writes_are_visible_and_other_entities_stay_cached() {
    let cache = Arc::new(ResourceCache::in_memory(CacheConfig::default()));
    let widget_service = GenericService::<Widget, _>::builder(InMemoryStore::new())
        .cache(cache.clone())
        .build();
    let person_service = people(cache.clone());
    let actor = alice();

    person_service.create(Person::new("John", 30), &actor).await.unwrap();
    person_service.find_by_id(&1).await.unwrap();
    person_service
        .find_all(&Specification::All, &PageRequest::default())
        .await
        .unwrap();

    widget_service.create(Widget::named("before"), &actor).await.unwrap();
    assert_eq!(widget_service.find_by_id(&1).await.unwrap().name, "before");
    let listed = widget_service
        .find_all(&Specification::All, &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(listed.content[0].name, "before");

    widget_service
        .update(&1, Widget::named("after"), None, &actor)
        .await
        .unwrap();

    assert_eq!(widget_service.find_by_id(&1).await.unwrap().name, "after");
    let listed = widget_service
        .find_all(&Specification::All, &PageRequest::default())
        .await
        .unwrap();
    assert_eq!(listed.content[0].name, "after");

    let backend = cache.backend();
    assert!(backend
        .get(CacheRegion::Entities, "Person:id:1")
        .await
        .unwrap()
        .is_some());
    assert_eq!(
        backend
            .keys_with_prefix(CacheRegion::Lists, "Person:")
            .await
            .unwrap()
            .len(),
        1
    );

    let hits_before = cache.stats().await.unwrap().hits;
    person_service.find_by_id(&1).await.unwrap();
    assert_eq!(cache.stats().await.unwrap().hits, hits_before + 1);
}

#[tokio::test]
async fn test_list_and_count_reflect_new_rows() {
    let service = widgets();
    let actor = alice();
    let everything = Specification::All;

    assert_eq!(service.count(&everything).await.unwrap(), 0);
    assert!(service
        .find_all(&everything, &PageRequest::default())
        .await
        .unwrap()
        .is_empty());

    service.create(Widget::named("one"), &actor).await.unwrap();

    assert_eq!(service.count(&everything).await.unwrap(), 1);
    assert_eq!(
        service
            .find_all(&everything, &PageRequest::default())
            .await
            .unwrap()
            .total_elements,
        1
    );
}

#[tokio::test]
async fn test_not_found_is_not_cached() {
    let service = widgets();
    assert!(service.find_by_id(&1).await.unwrap_err().is_not_found());

    service.create(Widget::named("late"), &alice()).await.unwrap();
    assert_eq!(service.find_by_id(&1).await.unwrap().name, "late");
}

#[tokio::test]
async fn test_partial_update_merges_non_null_fields() {
    let service = widgets();
    let actor = alice();
    let mut original = Widget::named("gear");
    original.quantity = 2;
    service.create(original, &actor).await.unwrap();

    let patched = service
        .partial_update(
            &1,
            &json!({ "name": null, "quantity": 5, "version": 99, "id": 7 }),
            Some(0),
            &actor,
        )
        .await
        .unwrap();
    assert_eq!(patched.id, Some(1));
    assert_eq!(patched.name, "gear");
    assert_eq!(patched.quantity, 5);
    assert_eq!(patched.audit.version, 1);

    let bad = service
        .partial_update(&1, &json!({ "quantity": "many" }), None, &actor)
        .await
        .unwrap_err();
    assert!(bad.is_validation());

    let stale = service
        .partial_update(&1, &json!({ "quantity": 6 }), Some(0), &actor)
        .await
        .unwrap_err();
    assert!(stale.is_conflict());
}

#[tokio::test]
async fn test_create_and_update_reject_bad_targets() {
    let service = widgets();
    let actor = alice();

    let mut preset = Widget::named("preset");
    preset.id = Some(9);
    assert!(service.create(preset, &actor).await.unwrap_err().is_validation());

    let missing = service
        .update(&42, Widget::named("ghost"), None, &actor)
        .await
        .unwrap_err();
    assert!(missing.is_not_found());
    assert_eq!(missing.operation, ResourceOperation::Update);
}

#[tokio::test]
async fn test_batches_are_bounded_and_atomic() {
    let mut config = Config::default();
    config.batch = BatchConfig {
        max_size: 3,
        chunk_size: 2,
        timeout_secs: 5,
    };
    let sink = Arc::new(RecordingSink::default());
    let cache = Arc::new(ResourceCache::in_memory(CacheConfig::default()));
    let service = widgets_with(&config, cache, sink.clone());
    let actor = alice();

    let too_many = (0..4).map(|i| Widget::named(&format!("w{}", i))).collect();
    let error = service.save_all(too_many, &actor).await.unwrap_err();
    assert!(error.is_validation());
    assert_eq!(error.operation, ResourceOperation::SaveAll);
    assert_eq!(service.count(&Specification::All).await.unwrap(), 0);

    let saved = service
        .save_all(
            vec![Widget::named("a"), Widget::named("b"), Widget::named("c")],
            &actor,
        )
        .await
        .unwrap();
    assert_eq!(saved.len(), 3);

    let failed = service.soft_delete_all(&[1, 99], &actor).await.unwrap_err();
    assert!(failed.is_not_found());
    assert_eq!(failed.operation, ResourceOperation::SoftDeleteAll);
    assert_eq!(service.count(&Specification::All).await.unwrap(), 3);

    service.soft_delete_all(&[1, 2], &actor).await.unwrap();
    assert_eq!(service.count(&Specification::All).await.unwrap(), 1);

    service.publisher().flush().await;
    let kinds: Vec<_> = sink.delivered().into_iter().map(|(kind, _, _)| kind).collect();
    assert_eq!(
        kinds,
        vec![
            DomainEventKind::Created,
            DomainEventKind::Created,
            DomainEventKind::Created,
            DomainEventKind::Deleted,
            DomainEventKind::Deleted,
        ]
    );
}

#[tokio::test]
async fn test_events_follow_commits_only() {
    let config = Config::default();
    let sink = Arc::new(RecordingSink::default());
    let cache = Arc::new(ResourceCache::in_memory(CacheConfig::default()));
    let service = widgets_with(&config, cache, sink.clone());
    let actor = alice();

    service.create(Widget::named("w"), &actor).await.unwrap();
    service
        .update(&1, Widget::named("w2"), Some(0), &actor)
        .await
        .unwrap();
    service
        .update(&1, Widget::named("w3"), Some(0), &actor)
        .await
        .unwrap_err();
    service.soft_delete(&1, &actor).await.unwrap();
    service.soft_delete(&1, &actor).await.unwrap_err();
    service.restore(&1, &actor).await.unwrap();
    service.hard_delete(&1, &actor).await.unwrap();

    service.publisher().flush().await;
    assert_eq!(
        sink.delivered(),
        vec![
            (DomainEventKind::Created, "1".to_string(), false),
            (DomainEventKind::Updated, "1".to_string(), false),
            (DomainEventKind::Deleted, "1".to_string(), false),
            (DomainEventKind::Restored, "1".to_string(), false),
            (DomainEventKind::Deleted, "1".to_string(), true),
        ]
    );
}

/// In-memory store whose chunk flushes each take `delay`
#[derive(Clone)]
struct SlowFlushStore {
    inner: InMemoryStore<Widget>,
    delay: Duration,
}

struct SlowFlushTransaction {
    inner: InMemoryTransaction<Widget>,
    delay: Duration,
}

impl Store<Widget> for SlowFlushStore {
    type Tx = SlowFlushTransaction;

    async fn begin(&self) -> ResourceResult<SlowFlushTransaction> {
        Ok(SlowFlushTransaction {
            inner: self.inner.begin().await?,
            delay: self.delay,
        })
    }
}

impl StoreTransaction<Widget> for SlowFlushTransaction {
    async fn fetch(&mut self, id: &i64, visibility: Visibility) -> ResourceResult<Option<Widget>> {
        self.inner.fetch(id, visibility).await
    }

    async fn select(&mut self, spec: &Specification, page: &PageRequest) -> ResourceResult<Vec<Widget>> {
        self.inner.select(spec, page).await
    }

    async fn count(&mut self, spec: &Specification) -> ResourceResult<u64> {
        self.inner.count(spec).await
    }

    async fn insert(&mut self, entity: Widget) -> ResourceResult<Widget> {
        self.inner.insert(entity).await
    }

    async fn update(&mut self, entity: Widget, expected_version: i64) -> ResourceResult<Option<Widget>> {
        self.inner.update(entity, expected_version).await
    }

    async fn mark_deleted(
        &mut self,
        id: &i64,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> ResourceResult<Option<Widget>> {
        self.inner.mark_deleted(id, actor, now).await
    }

    async fn mark_restored(
        &mut self,
        id: &i64,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> ResourceResult<Option<Widget>> {
        self.inner.mark_restored(id, actor, now).await
    }

    async fn remove(&mut self, id: &i64) -> ResourceResult<bool> {
        self.inner.remove(id).await
    }

    async fn flush(&mut self) -> ResourceResult<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.flush().await
    }

    async fn commit(self) -> ResourceResult<()> {
        self.inner.commit().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_timeout_commits_and_publishes_nothing() {
    let mut config = Config::default();
    config.batch.max_size = 10;
    config.batch.chunk_size = 2;
    config.batch.timeout_secs = 3;

    let store = SlowFlushStore {
        inner: InMemoryStore::new(),
        delay: Duration::from_secs(2),
    };
    let sink = Arc::new(RecordingSink::default());
    let publisher = DomainEventPublisher::<Widget>::new(config.events.clone()).with_sink(sink.clone());
    let service = GenericService::<Widget, _>::builder(store.clone())
        .config(&config)
        .cache(Arc::new(ResourceCache::in_memory(config.cache.clone())))
        .publisher(publisher.clone())
        .build();

    // two chunk flushes need 4s against a 3s budget
    let batch = (0..4).map(|i| Widget::named(&format!("w{i}"))).collect();
    let err = service.save_all(batch, &alice()).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.operation, ResourceOperation::SaveAll);

    assert_eq!(store.inner.row_count().await, 0);
    publisher.flush().await;
    assert!(sink.delivered().is_empty());

    // one chunk fits the budget
    let saved = service
        .save_all(vec![Widget::named("a"), Widget::named("b")], &alice())
        .await
        .unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(store.inner.row_count().await, 2);
    publisher.flush().await;
    assert_eq!(sink.delivered().len(), 2);
}
