//! In-process store backed by a locked hash map
//!
//! Each transaction stages its writes privately and records the committed
//! version of every row it touches. On commit the staged writes are applied
//! under the table's write lock, but only if none of those rows changed in the
//! meantime; otherwise the whole transaction fails with a conflict and nothing
//! is applied.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::entity::{Actor, Entity, EntityId};
use crate::error::{ResourceError, ResourceErrorKind, ResourceOperation, ResourceResult};
use crate::schema::FieldKind;
use crate::specification::{FieldValue, Specification};

use super::pagination::{OrderDirection, PageRequest};
use super::traits::{Store, StoreTransaction, Visibility};

#[derive(Debug, Clone)]
struct Row<E> {
    /// Insertion order, the final tie-breaker when sorting
    order: u64,
    entity: E,
}

#[derive(Debug)]
enum Write<E> {
    Put(Row<E>),
    Remove,
}

struct Shared<E: Entity> {
    rows: RwLock<HashMap<E::Id, Row<E>>>,
    sequence: AtomicU64,
    order: AtomicU64,
}

/// In-memory [`Store`] with snapshot reads and optimistic commits
///
/// Cloning is cheap; clones share the same table.
pub struct InMemoryStore<E: Entity> {
    shared: Arc<Shared<E>>,
}

impl<E: Entity> Clone for InMemoryStore<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: Entity> Default for InMemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> InMemoryStore<E> {
    /// Empty store
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                rows: RwLock::new(HashMap::new()),
                sequence: AtomicU64::new(0),
                order: AtomicU64::new(0),
            }),
        }
    }

    /// Number of committed rows, active or not
    pub async fn row_count(&self) -> usize {
        self.shared.rows.read().await.len()
    }
}

impl<E: Entity> Store<E> for InMemoryStore<E> {
    type Tx = InMemoryTransaction<E>;

    async fn begin(&self) -> ResourceResult<Self::Tx> {
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            staged: HashMap::new(),
            base_versions: HashMap::new(),
            flushes: 0,
            committed: false,
        })
    }
}

/// Transaction over an [`InMemoryStore`]
pub struct InMemoryTransaction<E: Entity> {
    shared: Arc<Shared<E>>,
    staged: HashMap<E::Id, Write<E>>,
    /// Committed version of each touched row when it was first touched
    base_versions: HashMap<E::Id, Option<i64>>,
    flushes: usize,
    committed: bool,
}

impl<E: Entity> InMemoryTransaction<E> {
    /// Number of flushes so far
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Writes staged and not yet committed
    pub fn staged_writes(&self) -> usize {
        self.staged.len()
    }

    /// Fail if a row this transaction depends on changed since it was read
    fn check_base_versions(&self, rows: &HashMap<E::Id, Row<E>>) -> ResourceResult<()> {
        for (id, base) in &self.base_versions {
            let current = rows.get(id).map(|row| row.entity.version());
            if current != *base {
                tracing::debug!(
                    entity = E::entity_name(),
                    id = %id,
                    expected = ?base,
                    found = ?current,
                    "Row changed concurrently"
                );
                return Err(ResourceError::conflict(
                    E::entity_name(),
                    id.to_string(),
                    base.unwrap_or_default(),
                    current.unwrap_or_default(),
                )
                .with_operation(ResourceOperation::Transaction));
            }
        }
        Ok(())
    }

    /// Row as this transaction sees it
    async fn visible(&self, id: &E::Id) -> Option<Row<E>> {
        match self.staged.get(id) {
            Some(Write::Put(row)) => Some(row.clone()),
            Some(Write::Remove) => None,
            None => self.shared.rows.read().await.get(id).cloned(),
        }
    }

    /// All rows as this transaction sees them
    async fn snapshot(&self) -> Vec<Row<E>> {
        let mut rows: HashMap<E::Id, Row<E>> = self.shared.rows.read().await.clone();
        for (id, write) in &self.staged {
            match write {
                Write::Put(row) => {
                    rows.insert(id.clone(), row.clone());
                }
                Write::Remove => {
                    rows.remove(id);
                }
            }
        }
        rows.into_values().collect()
    }

    /// Row as this transaction sees it, for a write that depends on it
    ///
    /// The committed version is recorded under the same read guard that
    /// produced the row, so commit compares against exactly what was read.
    async fn visible_for_write(&mut self, id: &E::Id) -> Option<Row<E>> {
        match self.staged.get(id) {
            Some(Write::Put(row)) => return Some(row.clone()),
            Some(Write::Remove) => return None,
            None => {}
        }

        let rows = self.shared.rows.read().await;
        let row = rows.get(id).cloned();
        self.base_versions
            .entry(id.clone())
            .or_insert_with(|| row.as_ref().map(|row| row.entity.version()));
        row
    }

    /// Stage a write; rows not read through [`visible_for_write`] are pinned now
    ///
    /// [`visible_for_write`]: Self::visible_for_write
    async fn stage(&mut self, id: E::Id, write: Write<E>) {
        if !self.base_versions.contains_key(&id) {
            let version = self
                .shared
                .rows
                .read()
                .await
                .get(&id)
                .map(|row| row.entity.version());
            self.base_versions.insert(id.clone(), version);
        }
        self.staged.insert(id, write);
    }

    fn next_order(&self) -> u64 {
        self.shared.order.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Apply a lifecycle transition to a row in the expected state
    async fn transition(
        &mut self,
        id: &E::Id,
        expect_active: bool,
        apply: impl FnOnce(&mut E) + Send,
    ) -> ResourceResult<Option<E>> {
        let Some(mut row) = self.visible_for_write(id).await else {
            return Ok(None);
        };
        if row.entity.is_active() != expect_active {
            return Ok(None);
        }
        apply(&mut row.entity);
        row.entity.audit_mut().version += 1;
        let entity = row.entity.clone();
        self.stage(id.clone(), Write::Put(row)).await;
        Ok(Some(entity))
    }
}

impl<E: Entity> StoreTransaction<E> for InMemoryTransaction<E> {
    async fn fetch(&mut self, id: &E::Id, visibility: Visibility) -> ResourceResult<Option<E>> {
        Ok(self
            .visible(id)
            .await
            .map(|row| row.entity)
            .filter(|entity| visibility.admits(entity.is_active())))
    }

    async fn select(&mut self, spec: &Specification, page: &PageRequest) -> ResourceResult<Vec<E>> {
        let mut matched = Vec::new();
        for row in self.snapshot().await {
            let document = serde_json::to_value(&row.entity)?;
            if spec.matches(&document) {
                matched.push((row, document));
            }
        }

        let mut keys = Vec::with_capacity(page.sort.len());
        for order in &page.sort {
            let resolved = E::schema().resolve(&order.field)?;
            keys.push((resolved.segments, resolved.leaf.kind, order.direction));
        }

        let mut decorated: Vec<(Vec<FieldValue>, Row<E>)> = matched
            .into_iter()
            .map(|(row, document)| {
                let values = keys
                    .iter()
                    .map(|(segments, kind, _)| sort_value(&document, segments, kind))
                    .collect();
                (values, row)
            })
            .collect();

        decorated.sort_by(|(left, left_row), (right, right_row)| {
            for (i, (_, _, direction)) in keys.iter().enumerate() {
                let ordering = null_first(&left[i], &right[i]);
                let ordering = match direction {
                    OrderDirection::Ascending => ordering,
                    OrderDirection::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            left_row.order.cmp(&right_row.order)
        });

        let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
        Ok(decorated
            .into_iter()
            .skip(offset)
            .take(page.size as usize)
            .map(|(_, row)| row.entity)
            .collect())
    }

    async fn count(&mut self, spec: &Specification) -> ResourceResult<u64> {
        let mut count = 0u64;
        for row in self.snapshot().await {
            if spec.matches(&serde_json::to_value(&row.entity)?) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn insert(&mut self, mut entity: E) -> ResourceResult<E> {
        let id = match entity.id() {
            Some(id) => {
                if self.visible_for_write(id).await.is_some() {
                    return Err(ResourceError::new(
                        ResourceOperation::Create,
                        ResourceErrorKind::Conflict,
                        "Duplicate identifier",
                    )
                    .with_entity(E::entity_name(), id.to_string()));
                }
                id.clone()
            }
            None => {
                let sequence = self.shared.sequence.fetch_add(1, AtomicOrdering::Relaxed) + 1;
                let id = E::Id::generate(sequence);
                entity.set_id(id.clone());
                id
            }
        };

        let row = Row {
            order: self.next_order(),
            entity: entity.clone(),
        };
        self.stage(id, Write::Put(row)).await;
        Ok(entity)
    }

    async fn update(&mut self, mut entity: E, expected_version: i64) -> ResourceResult<Option<E>> {
        let Some(id) = entity.id().cloned() else {
            return Ok(None);
        };
        let Some(stored) = self.visible_for_write(&id).await else {
            return Ok(None);
        };
        if !stored.entity.is_active() || stored.entity.version() != expected_version {
            return Ok(None);
        }

        let previous = stored.entity.audit();
        let audit = entity.audit_mut();
        audit.version = previous.version + 1;
        audit.active = previous.active;
        audit.created_at = previous.created_at;
        audit.created_by = previous.created_by.clone();
        audit.deleted_at = previous.deleted_at;
        audit.deleted_by = previous.deleted_by.clone();

        let row = Row {
            order: stored.order,
            entity: entity.clone(),
        };
        self.stage(id, Write::Put(row)).await;
        Ok(Some(entity))
    }

    async fn mark_deleted(
        &mut self,
        id: &E::Id,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> ResourceResult<Option<E>> {
        self.transition(id, true, |entity| entity.audit_mut().mark_deleted(actor, now))
            .await
    }

    async fn mark_restored(
        &mut self,
        id: &E::Id,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> ResourceResult<Option<E>> {
        self.transition(id, false, |entity| entity.audit_mut().mark_restored(actor, now))
            .await
    }

    async fn remove(&mut self, id: &E::Id) -> ResourceResult<bool> {
        if self.visible_for_write(id).await.is_none() {
            return Ok(false);
        }
        self.stage(id.clone(), Write::Remove).await;
        Ok(true)
    }

    /// Staged rows are revalidated against the committed table, so a
    /// conflicting batch fails at its next chunk boundary instead of at commit.
    async fn flush(&mut self) -> ResourceResult<()> {
        self.flushes += 1;
        let rows = self.shared.rows.read().await;
        self.check_base_versions(&rows)
    }

    async fn commit(mut self) -> ResourceResult<()> {
        let mut rows = self.shared.rows.write().await;
        self.check_base_versions(&rows)?;

        for (id, write) in std::mem::take(&mut self.staged) {
            match write {
                Write::Put(row) => {
                    rows.insert(id, row);
                }
                Write::Remove => {
                    rows.remove(&id);
                }
            }
        }
        drop(rows);

        self.committed = true;
        Ok(())
    }
}

impl<E: Entity> Drop for InMemoryTransaction<E> {
    fn drop(&mut self) {
        if !self.committed && !self.staged.is_empty() {
            tracing::debug!(
                entity = E::entity_name(),
                writes = self.staged.len(),
                "Transaction rolled back"
            );
        }
    }
}

fn sort_value(
    document: &Value,
    segments: &[&'static str],
    kind: &FieldKind,
) -> FieldValue {
    segments
        .iter()
        .try_fold(document, |current, segment| current.get(*segment))
        .and_then(|value| FieldValue::from_json(kind, value))
        .unwrap_or(FieldValue::Null)
}

/// Nulls sort before every other value
fn null_first(left: &FieldValue, right: &FieldValue) -> Ordering {
    match (left.is_null(), right.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.compare(right).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Person, Widget};

    async fn seed(store: &InMemoryStore<Person>, people: &[(&str, i64)]) {
        let mut tx = store.begin().await.unwrap();
        for (name, age) in people {
            tx.insert(Person::new(name, *age)).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let store = InMemoryStore::<Widget>::new();
        let mut tx = store.begin().await.unwrap();
        let first = tx.insert(Widget::named("a")).await.unwrap();
        let second = tx.insert(Widget::named("b")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(first.id, Some(1));
        assert_eq!(second.id, Some(2));
        assert_eq!(store.row_count().await, 2);
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = InMemoryStore::<Widget>::new();
        let mut writer = store.begin().await.unwrap();
        let widget = writer.insert(Widget::named("a")).await.unwrap();
        let id = widget.id.unwrap();

        let mut reader = store.begin().await.unwrap();
        assert!(reader.fetch(&id, Visibility::Any).await.unwrap().is_none());
        assert!(writer.fetch(&id, Visibility::Any).await.unwrap().is_some());

        drop(writer);
        assert_eq!(store.row_count().await, 0);
    }

    #[tokio::test]
    async fn test_update_checks_version_and_increments() {
        let store = InMemoryStore::<Widget>::new();
        let mut tx = store.begin().await.unwrap();
        let widget = tx.insert(Widget::named("a")).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut changed = widget.clone();
        changed.name = "b".to_string();
        assert!(tx.update(changed.clone(), 5).await.unwrap().is_none());
        let updated = tx.update(changed, 0).await.unwrap().unwrap();
        assert_eq!(updated.audit.version, 1);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_commit_conflicts() {
        let store = InMemoryStore::<Widget>::new();
        let mut tx = store.begin().await.unwrap();
        let widget = tx.insert(Widget::named("a")).await.unwrap();
        tx.commit().await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.update(widget.clone(), 0).await.unwrap().unwrap();
        second.update(widget, 0).await.unwrap().unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_commit_after_interleaved_commit_conflicts() {
        let store = InMemoryStore::<Widget>::new();
        let mut tx = store.begin().await.unwrap();
        let widget = tx.insert(Widget::named("a")).await.unwrap();
        tx.commit().await.unwrap();
        let id = widget.id.unwrap();

        let mut slow = store.begin().await.unwrap();
        let mut renamed = widget.clone();
        renamed.name = "slow".to_string();
        slow.update(renamed, 0).await.unwrap().unwrap();

        let mut fast = store.begin().await.unwrap();
        fast.mark_deleted(&id, &Actor::new("bob"), Utc::now())
            .await
            .unwrap()
            .unwrap();
        fast.commit().await.unwrap();

        let err = slow.commit().await.unwrap_err();
        assert!(err.is_conflict());

        let mut reader = store.begin().await.unwrap();
        let stored = reader.fetch(&id, Visibility::Any).await.unwrap().unwrap();
        assert_eq!(stored.name, "a");
        assert_eq!(stored.audit.version, 1);
        assert!(!stored.audit.active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_updates_from_one_version_commit_once() {
        const ROUNDS: i64 = 50;
        const WRITERS: usize = 8;

        let store = InMemoryStore::<Widget>::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert(Widget::named("w")).await.unwrap().id.unwrap();
        tx.commit().await.unwrap();

        for round in 0..ROUNDS {
            let mut reader = store.begin().await.unwrap();
            let current = reader.fetch(&id, Visibility::Active).await.unwrap().unwrap();
            assert_eq!(current.audit.version, round);

            let writers: Vec<_> = (0..WRITERS)
                .map(|writer| {
                    let store = store.clone();
                    let mut widget = current.clone();
                    widget.name = format!("round-{}-writer-{}", round, writer);
                    tokio::spawn(async move {
                        let mut tx = store.begin().await.unwrap();
                        match tx.update(widget, round).await.unwrap() {
                            Some(_) => tx.commit().await.is_ok(),
                            None => false,
                        }
                    })
                })
                .collect();

            let mut committed = 0;
            for writer in writers {
                if writer.await.unwrap() {
                    committed += 1;
                }
            }
            assert_eq!(committed, 1, "round {} committed {} writers", round, committed);
        }

        let mut reader = store.begin().await.unwrap();
        let last = reader.fetch(&id, Visibility::Active).await.unwrap().unwrap();
        assert_eq!(last.audit.version, ROUNDS);
    }

    #[tokio::test]
    async fn test_soft_delete_and_restore_transitions() {
        let store = InMemoryStore::<Widget>::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert(Widget::named("a")).await.unwrap().id.unwrap();
        let actor = Actor::new("alice");

        let deleted = tx.mark_deleted(&id, &actor, Utc::now()).await.unwrap().unwrap();
        assert!(!deleted.audit.active);
        assert_eq!(deleted.audit.version, 1);
        assert!(tx.mark_deleted(&id, &actor, Utc::now()).await.unwrap().is_none());
        assert!(tx.fetch(&id, Visibility::Active).await.unwrap().is_none());
        assert!(tx.fetch(&id, Visibility::Deleted).await.unwrap().is_some());

        let restored = tx.mark_restored(&id, &actor, Utc::now()).await.unwrap().unwrap();
        assert!(restored.audit.active);
        assert_eq!(restored.audit.version, 2);
        assert!(tx.mark_restored(&id, &actor, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_select_sorts_filters_and_pages() {
        let store = InMemoryStore::<Person>::new();
        seed(&store, &[("Carol", 41), ("Alice", 30), ("Bob", 17), ("Dave", 30)]).await;

        let mut tx = store.begin().await.unwrap();
        let adults = Specification::field("age").gte(18);
        let page = PageRequest::new(0, 2)
            .sorted_by("age", OrderDirection::Ascending)
            .sorted_by("name", OrderDirection::Descending);
        let names: Vec<_> = tx
            .select(&adults, &page)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Dave", "Alice"]);

        let next = PageRequest::new(1, 2).sorted_by("age", OrderDirection::Ascending);
        let rest = tx.select(&adults, &next).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "Carol");
        assert_eq!(tx.count(&adults).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unsorted_select_keeps_insertion_order() {
        let store = InMemoryStore::<Person>::new();
        seed(&store, &[("Zed", 1), ("Amy", 2), ("Kim", 3)]).await;
        let mut tx = store.begin().await.unwrap();
        let names: Vec<_> = tx
            .select(&Specification::All, &PageRequest::new(0, 10))
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Zed", "Amy", "Kim"]);
    }

    #[tokio::test]
    async fn test_remove_is_physical() {
        let store = InMemoryStore::<Widget>::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert(Widget::named("a")).await.unwrap().id.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.remove(&id).await.unwrap());
        assert!(!tx.remove(&id).await.unwrap());
        tx.commit().await.unwrap();
        assert_eq!(store.row_count().await, 0);
    }
}
