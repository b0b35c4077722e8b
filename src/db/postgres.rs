//! PostgreSQL database
//!
//! Each collection is a `(id BIGSERIAL PRIMARY KEY, data JSONB NOT NULL)`
//! table. Conditions compile to `data->>'column'` comparisons; ordering,
//! distinct and paging are applied to the filtered rows by [`Select::apply`].

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Executor, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{
    Access, Clause, Condition, Database, DbError, Op, ReadAccess, Select, UnitOfWork,
};

/// A [`Database`] backed by a Postgres connection pool.
#[derive(Clone)]
pub struct PgDb {
    pool: PgPool,
}

impl PgDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create the document table of every collection that is missing.
    pub async fn migrate(&self, tables: &[&'static str]) -> Result<(), DbError> {
        for table in tables {
            check_identifier(table)?;
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {table} (id BIGSERIAL PRIMARY KEY, data JSONB NOT NULL)"
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        debug!(count = tables.len(), "Collections ensured");
        Ok(())
    }
}

/// A [`PgDb`] transaction handed to a unit of work.
pub struct PgSession {
    tx: Mutex<Transaction<'static, Postgres>>,
}

// ============================================================================
// SQL building
// ============================================================================

fn check_identifier(name: &str) -> Result<(), DbError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DbError::Internal(format!("invalid identifier \"{name}\"")))
    }
}

/// Text form of a JSON scalar as returned by the `->>` operator.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Compile a condition into a `WHERE` clause and its positional binds.
fn where_clause(condition: &Condition) -> Result<(String, Vec<String>), DbError> {
    let mut parts = Vec::with_capacity(condition.clauses().len());
    let mut binds = Vec::new();

    for Clause { column, op, value } in condition.clauses() {
        check_identifier(column)?;
        let field = if column == "id" {
            "id::text".to_string()
        } else {
            format!("data->>'{column}'")
        };

        let part = match (op, as_text(value)) {
            (Op::Eq, None) => format!("{field} IS NULL"),
            (Op::Ne, None) => format!("{field} IS NOT NULL"),
            (Op::Eq | Op::Ne, Some(text)) => {
                binds.push(text);
                format!("{field} {} ${}", op.as_sql(), binds.len())
            }
            (Op::Lt | Op::Gt, Some(text)) if value.is_number() => {
                binds.push(text);
                format!("({field})::numeric {} ${}::numeric", op.as_sql(), binds.len())
            }
            (Op::Lt | Op::Gt, Some(text)) => {
                binds.push(text);
                format!("{field} {} ${}", op.as_sql(), binds.len())
            }
            (Op::Lt | Op::Gt, None) => {
                return Err(DbError::Internal(format!(
                    "cannot order-compare \"{column}\" against null"
                )));
            }
        };
        parts.push(part);
    }

    if parts.is_empty() {
        Ok((String::new(), binds))
    } else {
        Ok((format!(" WHERE {}", parts.join(" AND ")), binds))
    }
}

fn with_id((id, Json(mut data)): (i64, Json<Value>)) -> Value {
    if let Some(doc) = data.as_object_mut() {
        doc.insert("id".to_string(), Value::from(id));
    }
    data
}

async fn fetch<'c, E>(
    executor: E,
    table: &'static str,
    condition: &Condition,
    limit: Option<usize>,
) -> Result<Vec<Value>, DbError>
where
    E: Executor<'c, Database = Postgres>,
{
    check_identifier(table)?;
    let (filter, binds) = where_clause(condition)?;
    let mut sql = format!("SELECT id, data FROM {table}{filter} ORDER BY id");
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut query = sqlx::query_as::<_, (i64, Json<Value>)>(&sql);
    for bind in binds {
        query = query.bind(bind);
    }
    let rows = query.fetch_all(executor).await?;
    Ok(rows.into_iter().map(with_id).collect())
}

async fn count<'c, E>(executor: E, table: &'static str, condition: &Condition) -> Result<u64, DbError>
where
    E: Executor<'c, Database = Postgres>,
{
    check_identifier(table)?;
    let (filter, binds) = where_clause(condition)?;
    let sql = format!("SELECT COUNT(*) FROM {table}{filter}");

    let mut query = sqlx::query_scalar::<_, i64>(&sql);
    for bind in binds {
        query = query.bind(bind);
    }
    Ok(query.fetch_one(executor).await? as u64)
}

async fn insert<'c, E>(executor: E, table: &'static str, mut row: Value) -> Result<i64, DbError>
where
    E: Executor<'c, Database = Postgres>,
{
    check_identifier(table)?;
    if let Some(doc) = row.as_object_mut() {
        doc.remove("id");
    }
    let sql = format!("INSERT INTO {table} (data) VALUES ($1) RETURNING id");
    let id = sqlx::query_scalar::<_, i64>(&sql)
        .bind(Json(row))
        .fetch_one(executor)
        .await?;
    Ok(id)
}

async fn update<'c, E>(executor: E, table: &'static str, id: i64, mut row: Value) -> Result<(), DbError>
where
    E: Executor<'c, Database = Postgres>,
{
    check_identifier(table)?;
    if let Some(doc) = row.as_object_mut() {
        doc.remove("id");
    }
    let sql = format!("UPDATE {table} SET data = $1 WHERE id = $2");
    let result = sqlx::query(&sql)
        .bind(Json(row))
        .bind(id)
        .execute(executor)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: table });
    }
    Ok(())
}

async fn delete<'c, E>(executor: E, table: &'static str, id: i64) -> Result<(), DbError>
where
    E: Executor<'c, Database = Postgres>,
{
    check_identifier(table)?;
    let sql = format!("DELETE FROM {table} WHERE id = $1");
    let result = sqlx::query(&sql).bind(id).execute(executor).await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound { entity: table });
    }
    Ok(())
}

async fn delete_matching<'c, E>(
    executor: E,
    table: &'static str,
    condition: &Condition,
) -> Result<u64, DbError>
where
    E: Executor<'c, Database = Postgres>,
{
    check_identifier(table)?;
    let (filter, binds) = where_clause(condition)?;
    let sql = format!("DELETE FROM {table}{filter}");

    let mut query = sqlx::query(&sql);
    for bind in binds {
        query = query.bind(bind);
    }
    Ok(query.execute(executor).await?.rows_affected())
}

// ============================================================================
// Capabilities
// ============================================================================

#[async_trait]
impl ReadAccess for PgDb {
    fn reader(&self) -> &dyn ReadAccess {
        self
    }

    async fn get_row(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<Option<Value>, DbError> {
        Ok(fetch(&self.pool, table, condition, Some(1)).await?.pop())
    }

    async fn select_rows(
        &self,
        table: &'static str,
        select: &Select,
    ) -> Result<Vec<Value>, DbError> {
        let rows = fetch(&self.pool, table, &select.condition, None).await?;
        Ok(select.apply(rows))
    }

    async fn count_rows(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<u64, DbError> {
        count(&self.pool, table, condition).await
    }
}

#[async_trait]
impl Access for PgDb {
    fn writer(&self) -> &dyn Access {
        self
    }

    async fn insert_row(&self, table: &'static str, row: Value) -> Result<i64, DbError> {
        insert(&self.pool, table, row).await
    }

    async fn update_row(&self, table: &'static str, id: i64, row: Value) -> Result<(), DbError> {
        update(&self.pool, table, id, row).await
    }

    async fn delete_row(&self, table: &'static str, id: i64) -> Result<(), DbError> {
        delete(&self.pool, table, id).await
    }

    async fn delete_rows(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<u64, DbError> {
        delete_matching(&self.pool, table, condition).await
    }
}

#[async_trait]
impl Database for PgDb {
    async fn transaction(&self, work: UnitOfWork) -> Result<(), DbError> {
        let session = PgSession {
            tx: Mutex::new(self.pool.begin().await?),
        };

        match work(&session).await {
            Ok(()) => {
                session.tx.into_inner().commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = session.tx.into_inner().rollback().await {
                    error!(error = %rollback, "Transaction rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ReadAccess for PgSession {
    fn reader(&self) -> &dyn ReadAccess {
        self
    }

    async fn get_row(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<Option<Value>, DbError> {
        let mut tx = self.tx.lock().await;
        Ok(fetch(&mut **tx, table, condition, Some(1)).await?.pop())
    }

    async fn select_rows(
        &self,
        table: &'static str,
        select: &Select,
    ) -> Result<Vec<Value>, DbError> {
        let mut tx = self.tx.lock().await;
        let rows = fetch(&mut **tx, table, &select.condition, None).await?;
        Ok(select.apply(rows))
    }

    async fn count_rows(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<u64, DbError> {
        let mut tx = self.tx.lock().await;
        count(&mut **tx, table, condition).await
    }
}

#[async_trait]
impl Access for PgSession {
    fn writer(&self) -> &dyn Access {
        self
    }

    async fn insert_row(&self, table: &'static str, row: Value) -> Result<i64, DbError> {
        let mut tx = self.tx.lock().await;
        insert(&mut **tx, table, row).await
    }

    async fn update_row(&self, table: &'static str, id: i64, row: Value) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        update(&mut **tx, table, id, row).await
    }

    async fn delete_row(&self, table: &'static str, id: i64) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        delete(&mut **tx, table, id).await
    }

    async fn delete_rows(
        &self,
        table: &'static str,
        condition: &Condition,
    ) -> Result<u64, DbError> {
        let mut tx = self.tx.lock().await;
        delete_matching(&mut **tx, table, condition).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Entity, ReadExt, WriteExt, unit_of_work};
    use crate::model::Rule;
    use futures::FutureExt;
    use serde_json::json;

    #[test]
    fn test_where_clause() {
        let (sql, binds) = where_clause(&Condition::all()).unwrap();
        assert_eq!(sql, "");
        assert!(binds.is_empty());

        let condition = Condition::all()
            .eq("rule_id", 3)
            .eq("chain", "PRE")
            .eq("deleted", Value::Null)
            .gt("rank", 1);
        let (sql, binds) = where_clause(&condition).unwrap();
        assert_eq!(
            sql,
            " WHERE data->>'rule_id' = $1 AND data->>'chain' = $2 \
             AND data->>'deleted' IS NULL AND (data->>'rank')::numeric > $3::numeric"
        );
        assert_eq!(binds, vec!["3", "PRE", "1"]);

        let (sql, _) = where_clause(&Condition::id(9)).unwrap();
        assert_eq!(sql, " WHERE id::text = $1");
    }

    #[test]
    fn test_rejects_injected_identifiers() {
        let err = where_clause(&Condition::all().eq("x'; DROP TABLE t; --", 1)).unwrap_err();
        assert!(matches!(err, DbError::Internal(_)));
        assert!(check_identifier("transfers").is_ok());
    }

    #[test]
    fn test_with_id_merges_column() {
        let doc = with_id((7, Json(json!({"name": "r"}))));
        assert_eq!(doc, json!({"id": 7, "name": "r"}));
    }

    async fn connect() -> Option<PgDb> {
        let url = std::env::var("DATABASE_URL").ok()?;
        match PgDb::connect(&url).await {
            Ok(db) => Some(db),
            Err(e) => {
                eprintln!("Skipping Postgres test: {}", e);
                None
            }
        }
    }

    #[tokio::test]
    async fn test_pg_roundtrip_and_rollback() {
        let Some(db) = connect().await else {
            return;
        };
        db.migrate(&[Rule::TABLE]).await.unwrap();
        db.delete_all::<Rule>(Condition::all().eq("name", "pg_test_rule"))
            .await
            .unwrap();

        let mut rule = Rule::new("pg_test_rule", true);
        db.insert(&mut rule).await.unwrap();
        let fetched: Rule = db
            .get(Condition::all().eq("name", "pg_test_rule"))
            .await
            .unwrap();
        assert_eq!(fetched.id, rule.id);

        let err = db
            .transaction(unit_of_work(|ses| {
                async move {
                    ses.insert(&mut Rule::new("pg_test_rule", false)).await?;
                    Err(DbError::validation("abort"))
                }
                .boxed()
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));

        let count = db
            .count::<Rule>(Condition::all().eq("name", "pg_test_rule"))
            .await
            .unwrap();
        assert_eq!(count, 1);

        db.delete(&rule).await.unwrap();
    }
}
