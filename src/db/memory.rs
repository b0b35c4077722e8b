//! In-process database
//!
//! Collections are `BTreeMap<id, document>` behind a single async `RwLock`.
//! A transaction takes the write lock for its whole duration, runs the unit
//! of work against a staged copy and swaps the copy in on success.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Access, Condition, Database, DbError, ReadAccess, Select, UnitOfWork};

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<&'static str, BTreeMap<i64, Value>>,
    next_ids: HashMap<&'static str, i64>,
}

impl Tables {
    fn matching<'a>(
        &'a self,
        table: &str,
        condition: &'a Condition,
    ) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.values())
            .filter(move |row| condition.matches(row))
    }
}

/// A [`Database`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryDb {
    state: RwLock<Tables>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn staged(tables: Tables) -> Self {
        Self {
            state: RwLock::new(tables),
        }
    }
}

#[async_trait]
impl ReadAccess for MemoryDb {
    fn reader(&self) -> &dyn ReadAccess {
        self
    }

    async fn get_row(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<Option<Value>, DbError> {
        let state = self.state.read().await;
        Ok(state.matching(table, condition).next().cloned())
    }

    async fn select_rows(
        &self,
        table: &'static str,
        select: &Select,
    ) -> Result<Vec<Value>, DbError> {
        let state = self.state.read().await;
        let rows = state.matching(table, &select.condition).cloned().collect();
        Ok(select.apply(rows))
    }

    async fn count_rows(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<u64, DbError> {
        let state = self.state.read().await;
        Ok(state.matching(table, condition).count() as u64)
    }
}

#[async_trait]
impl Access for MemoryDb {
    fn writer(&self) -> &dyn Access {
        self
    }

    async fn insert_row(&self, table: &'static str, mut row: Value) -> Result<i64, DbError> {
        let mut state = self.state.write().await;

        let next = state.next_ids.entry(table).or_insert(0);
        *next += 1;
        let id = *next;

        match row.as_object_mut() {
            Some(doc) => {
                doc.insert("id".to_string(), Value::from(id));
            }
            None => return Err(DbError::Internal(format!("{table}: row is not an object"))),
        }

        state.rows.entry(table).or_default().insert(id, row);
        Ok(id)
    }

    async fn update_row(&self, table: &'static str, id: i64, row: Value) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        let slot = state
            .rows
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or(DbError::NotFound { entity: table })?;
        *slot = row;
        Ok(())
    }

    async fn delete_row(&self, table: &'static str, id: i64) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        state
            .rows
            .get_mut(table)
            .and_then(|rows| rows.remove(&id))
            .map(|_| ())
            .ok_or(DbError::NotFound { entity: table })
    }

    async fn delete_rows(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<u64, DbError> {
        let mut state = self.state.write().await;
        let Some(rows) = state.rows.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|_, row| !condition.matches(row));
        Ok((before - rows.len()) as u64)
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn transaction(&self, work: UnitOfWork) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        let staged = MemoryDb::staged(state.clone());

        match work(&staged).await {
            Ok(()) => {
                *state = staged.state.into_inner();
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "Rolling back in-memory transaction");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Entity, LifecycleHooks, MutHook, ReadExt, WriteExt, unit_of_work};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        #[serde(default)]
        id: i64,
        title: String,
        #[serde(default)]
        loaded: bool,
    }

    impl Entity for Note {
        const TABLE: &'static str = "notes";
        const NAME: &'static str = "note";

        fn id(&self) -> i64 {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = id;
        }

        fn hooks() -> LifecycleHooks<Self> {
            LifecycleHooks {
                before_write: Some(check_title as MutHook<Note>),
                after_read: Some(mark_loaded as MutHook<Note>),
                ..LifecycleHooks::none()
            }
        }
    }

    fn check_title<'a>(
        note: &'a mut Note,
        _db: &'a dyn ReadAccess,
    ) -> BoxFuture<'a, Result<(), DbError>> {
        async move {
            if note.title.is_empty() {
                return Err(DbError::validation("the note's title cannot be empty"));
            }
            Ok(())
        }
        .boxed()
    }

    fn mark_loaded<'a>(
        note: &'a mut Note,
        _db: &'a dyn ReadAccess,
    ) -> BoxFuture<'a, Result<(), DbError>> {
        async move {
            note.loaded = true;
            Ok(())
        }
        .boxed()
    }

    fn note(title: &str) -> Note {
        Note {
            id: 0,
            title: title.to_string(),
            loaded: false,
        }
    }

    #[tokio::test]
    async fn test_crud_with_hooks() {
        let db = MemoryDb::new();

        let mut a = note("first");
        db.insert(&mut a).await.unwrap();
        assert_eq!(a.id, 1);

        let mut b = note("second");
        db.insert(&mut b).await.unwrap();
        assert_eq!(b.id, 2);

        let fetched: Note = db.get_by_id(1).await.unwrap();
        assert_eq!(fetched.title, "first");
        assert!(fetched.loaded, "after_read hook should run on get");

        let err = db.insert(&mut note("")).await.unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
        assert_eq!(db.count::<Note>(Condition::all()).await.unwrap(), 2);

        b.title = "renamed".into();
        db.update(&mut b).await.unwrap();
        let fetched: Note = db.get(Condition::all().eq("title", "renamed")).await.unwrap();
        assert_eq!(fetched.id, 2);

        db.delete(&a).await.unwrap();
        let err = db.get_by_id::<Note>(1).await.unwrap_err();
        assert_eq!(err, DbError::NotFound { entity: "note" });
    }

    #[tokio::test]
    async fn test_select_and_delete_all() {
        let db = MemoryDb::new();
        for title in ["c", "a", "b", "a"] {
            db.insert(&mut note(title)).await.unwrap();
        }

        let notes: Vec<Note> = db
            .select(Select::new(Condition::all().ne("title", "c")).order_by("title", true))
            .await
            .unwrap();
        let titles: Vec<&str> = notes.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "a", "b"]);
        assert!(notes.iter().all(|n| n.loaded));

        let removed = db
            .delete_all::<Note>(Condition::all().eq("title", "a"))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(db.count::<Note>(Condition::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_missing_row() {
        let db = MemoryDb::new();
        let err = db.update_row("notes", 42, json!({"id": 42})).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_transaction_commit() {
        let db = MemoryDb::new();

        db.transaction(unit_of_work(|ses| {
            async move {
                ses.insert(&mut note("one")).await?;
                ses.insert(&mut note("two")).await?;
                Ok(())
            }
            .boxed()
        }))
        .await
        .unwrap();

        assert_eq!(db.count::<Note>(Condition::all()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let db = MemoryDb::new();
        db.insert(&mut note("kept")).await.unwrap();

        let err = db
            .transaction(unit_of_work(|ses| {
                async move {
                    ses.insert(&mut note("discarded")).await?;
                    ses.insert(&mut note("")).await?;
                    Ok(())
                }
                .boxed()
            }))
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::Validation(_)));
        let notes: Vec<Note> = db.select(Select::default()).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].title, "kept");
    }
}
