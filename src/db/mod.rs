//! Persistence capabilities
//!
//! The transfer core never talks to a concrete database. It consumes three
//! capabilities:
//!
//! - [`ReadAccess`]: fetch-one, fetch-many and count against a named collection
//! - [`Access`]: `ReadAccess` plus insert, update, delete and delete-many
//! - [`Database`]: `Access` plus transactions over a session-scoped `Access`
//!
//! The traits are object safe and move rows as JSON documents. Typed access
//! goes through [`ReadExt`] / [`WriteExt`], which (de)serialize [`Entity`]
//! values and run the entity's [`LifecycleHooks`] at fixed points:
//!
//! ```text
//! insert: before_write → INSERT → after_insert
//! update: before_write → UPDATE → after_read
//! delete: before_delete → DELETE
//! get/select: SELECT → after_read (per row)
//! ```
//!
//! `delete_all` deliberately bypasses hooks.

pub mod memory;
pub mod postgres;

pub use memory::MemoryDb;
pub use postgres::PgDb;

use std::cmp::Ordering;
use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Persistence errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DbError::Validation(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        DbError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Internal(format!("row codec: {}", e))
    }
}

// ============================================================================
// Conditions & selections
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Gt,
}

impl Op {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "<>",
            Op::Lt => "<",
            Op::Gt => ">",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub column: String,
    pub op: Op,
    pub value: Value,
}

/// Conjunction of column comparisons. An empty condition matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    clauses: Vec<Clause>,
}

impl Condition {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn id(id: i64) -> Self {
        Self::all().eq("id", id)
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, Op::Eq, value.into())
    }

    pub fn ne(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, Op::Ne, value.into())
    }

    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, Op::Lt, value.into())
    }

    pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, Op::Gt, value.into())
    }

    pub fn and(mut self, other: Condition) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    fn push(mut self, column: &str, op: Op, value: Value) -> Self {
        self.clauses.push(Clause {
            column: column.to_string(),
            op,
            value,
        });
        self
    }

    /// Evaluate against a JSON document. Missing columns read as `null`.
    pub fn matches(&self, row: &Value) -> bool {
        self.clauses.iter().all(|clause| {
            let field = row.get(&clause.column).unwrap_or(&Value::Null);
            match clause.op {
                Op::Eq => field == &clause.value,
                Op::Ne => field != &clause.value,
                Op::Lt => compare_values(field, &clause.value) == Some(Ordering::Less),
                Op::Gt => compare_values(field, &clause.value) == Some(Ordering::Greater),
            }
        })
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => None,
    }
}

/// Fetch-many parameters: filter, ordering, paging and distinct columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    pub condition: Condition,
    pub order_by: Vec<(String, bool)>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub distinct: Vec<String>,
}

impl Select {
    pub fn new(condition: Condition) -> Self {
        Self {
            condition,
            ..Default::default()
        }
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order_by.push((column.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn distinct(mut self, columns: &[&str]) -> Self {
        self.distinct = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Order, deduplicate and page rows that already satisfy the condition.
    ///
    /// Rows are ordered by id first so that ties keep insertion order.
    pub fn apply(&self, mut rows: Vec<Value>) -> Vec<Value> {
        rows.sort_by(|a, b| {
            let id_order = compare_values(
                a.get("id").unwrap_or(&Value::Null),
                b.get("id").unwrap_or(&Value::Null),
            )
            .unwrap_or(Ordering::Equal);

            self.order_by
                .iter()
                .map(|(column, ascending)| {
                    let ord = compare_values(
                        a.get(column).unwrap_or(&Value::Null),
                        b.get(column).unwrap_or(&Value::Null),
                    )
                    .unwrap_or(Ordering::Equal);
                    if *ascending { ord } else { ord.reverse() }
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(id_order)
        });

        if !self.distinct.is_empty() {
            let mut seen = HashSet::new();
            rows.retain(|row| {
                let key: Vec<String> = self
                    .distinct
                    .iter()
                    .map(|c| row.get(c).unwrap_or(&Value::Null).to_string())
                    .collect();
                seen.insert(key)
            });
        }

        rows.into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// Read operations against named collections.
#[async_trait]
pub trait ReadAccess: Send + Sync {
    /// Upcast helper used by the typed layer to hand `self` to hooks.
    fn reader(&self) -> &dyn ReadAccess;

    /// First row (lowest id) matching `condition`.
    async fn get_row(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<Option<Value>, DbError>;

    async fn select_rows(&self, table: &'static str, select: &Select)
    -> Result<Vec<Value>, DbError>;

    async fn count_rows(&self, table: &'static str, condition: &Condition)
    -> Result<u64, DbError>;
}

/// Write operations; a superset of [`ReadAccess`].
#[async_trait]
pub trait Access: ReadAccess {
    fn writer(&self) -> &dyn Access;

    /// Insert a document and return its newly assigned id.
    async fn insert_row(&self, table: &'static str, row: Value) -> Result<i64, DbError>;

    /// Replace the document with the given id. `NotFound` if absent.
    async fn update_row(&self, table: &'static str, id: i64, row: Value) -> Result<(), DbError>;

    async fn delete_row(&self, table: &'static str, id: i64) -> Result<(), DbError>;

    async fn delete_rows(&self, table: &'static str, condition: &Condition)
    -> Result<u64, DbError>;
}

/// A unit of work run inside a transaction against a session-scoped `Access`.
pub type UnitOfWork =
    Box<dyn for<'s> FnOnce(&'s dyn Access) -> BoxFuture<'s, Result<(), DbError>> + Send>;

/// Box a closure as a [`UnitOfWork`].
pub fn unit_of_work<F>(work: F) -> UnitOfWork
where
    F: for<'s> FnOnce(&'s dyn Access) -> BoxFuture<'s, Result<(), DbError>> + Send + 'static,
{
    Box::new(work)
}

/// Transaction capability.
#[async_trait]
pub trait Database: Access {
    /// Commit if `work` returns `Ok`, roll back on any error it returns.
    async fn transaction(&self, work: UnitOfWork) -> Result<(), DbError>;
}

// ============================================================================
// Entities & lifecycle hooks
// ============================================================================

/// Hook receiving a mutable entity (validation, serialization, decoding).
pub type MutHook<T> = for<'a> fn(&'a mut T, &'a dyn ReadAccess) -> BoxFuture<'a, Result<(), DbError>>;

/// Hook receiving a shared entity (pre-delete checks).
pub type CheckHook<T> = for<'a> fn(&'a T, &'a dyn ReadAccess) -> BoxFuture<'a, Result<(), DbError>>;

/// Per-entity table of lifecycle functions.
pub struct LifecycleHooks<T> {
    pub before_write: Option<MutHook<T>>,
    pub before_delete: Option<CheckHook<T>>,
    pub after_insert: Option<MutHook<T>>,
    pub after_read: Option<MutHook<T>>,
}

impl<T> LifecycleHooks<T> {
    pub const fn none() -> Self {
        Self {
            before_write: None,
            before_delete: None,
            after_insert: None,
            after_read: None,
        }
    }
}

impl<T> Clone for LifecycleHooks<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LifecycleHooks<T> {}

/// A persisted model type.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection name.
    const TABLE: &'static str;
    /// Human readable name used in error messages.
    const NAME: &'static str;

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);

    fn hooks() -> LifecycleHooks<Self> {
        LifecycleHooks::none()
    }
}

fn decode<T: Entity>(row: Value) -> Result<T, DbError> {
    Ok(serde_json::from_value(row)?)
}

/// Typed reads for any [`ReadAccess`].
#[async_trait]
pub trait ReadExt {
    /// Exactly one entity matching `condition`, or `NotFound`.
    async fn get<T: Entity>(&self, condition: Condition) -> Result<T, DbError>;

    async fn get_by_id<T: Entity>(&self, id: i64) -> Result<T, DbError>;

    async fn select<T: Entity>(&self, select: Select) -> Result<Vec<T>, DbError>;

    async fn count<T: Entity>(&self, condition: Condition) -> Result<u64, DbError>;
}

#[async_trait]
impl<A: ReadAccess + ?Sized> ReadExt for A {
    async fn get<T: Entity>(&self, condition: Condition) -> Result<T, DbError> {
        let row = self
            .get_row(T::TABLE, &condition)
            .await?
            .ok_or(DbError::NotFound { entity: T::NAME })?;

        let mut entity = decode::<T>(row)?;
        if let Some(hook) = T::hooks().after_read {
            hook(&mut entity, self.reader()).await?;
        }
        Ok(entity)
    }

    async fn get_by_id<T: Entity>(&self, id: i64) -> Result<T, DbError> {
        self.get(Condition::id(id)).await
    }

    async fn select<T: Entity>(&self, select: Select) -> Result<Vec<T>, DbError> {
        let rows = self.select_rows(T::TABLE, &select).await?;
        let after_read = T::hooks().after_read;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entity = decode::<T>(row)?;
            if let Some(hook) = after_read {
                hook(&mut entity, self.reader()).await?;
            }
            entities.push(entity);
        }
        Ok(entities)
    }

    async fn count<T: Entity>(&self, condition: Condition) -> Result<u64, DbError> {
        self.count_rows(T::TABLE, &condition).await
    }
}

/// Typed writes for any [`Access`].
#[async_trait]
pub trait WriteExt {
    /// Insert `entity` and store its assigned id back into it.
    async fn insert<T: Entity>(&self, entity: &mut T) -> Result<(), DbError>;

    async fn update<T: Entity>(&self, entity: &mut T) -> Result<(), DbError>;

    async fn delete<T: Entity>(&self, entity: &T) -> Result<(), DbError>;

    /// Delete every match. Hooks are not run.
    async fn delete_all<T: Entity>(&self, condition: Condition) -> Result<u64, DbError>;
}

#[async_trait]
impl<A: Access + ?Sized> WriteExt for A {
    async fn insert<T: Entity>(&self, entity: &mut T) -> Result<(), DbError> {
        let hooks = T::hooks();
        if let Some(hook) = hooks.before_write {
            hook(entity, self.reader()).await?;
        }

        let id = self
            .insert_row(T::TABLE, serde_json::to_value(&*entity)?)
            .await?;
        entity.set_id(id);

        if let Some(hook) = hooks.after_insert {
            hook(entity, self.reader()).await?;
        }
        Ok(())
    }

    async fn update<T: Entity>(&self, entity: &mut T) -> Result<(), DbError> {
        let hooks = T::hooks();
        if let Some(hook) = hooks.before_write {
            hook(entity, self.reader()).await?;
        }

        self.update_row(T::TABLE, entity.id(), serde_json::to_value(&*entity)?)
            .await?;

        if let Some(hook) = hooks.after_read {
            hook(entity, self.reader()).await?;
        }
        Ok(())
    }

    async fn delete<T: Entity>(&self, entity: &T) -> Result<(), DbError> {
        if let Some(hook) = T::hooks().before_delete {
            hook(entity, self.reader()).await?;
        }
        self.delete_row(T::TABLE, entity.id()).await
    }

    async fn delete_all<T: Entity>(&self, condition: Condition) -> Result<u64, DbError> {
        self.delete_rows(T::TABLE, &condition).await
    }
}
