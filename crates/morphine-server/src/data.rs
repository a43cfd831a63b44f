//! Relational [`DataAccess`] backend over `sqlx`'s `any` driver.
//!
//! The URL scheme picks the driver (`sqlite:` or `mysql:`). Parameters
//! arrive as JSON values and are bound positionally; result rows come back
//! as JSON objects keyed by column name.

use async_trait::async_trait;
use morphine_extensions::{DataAccess, DataAccessError, ExecuteResult, Row};
use serde_json::Value;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row as _};
use tracing::{debug, info};

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

/// Pooled connection to the configured database.
#[derive(Debug, Clone)]
pub(crate) struct SqlDataAccess {
    pool: AnyPool,
}

impl SqlDataAccess {
    /// Connect a pool of at most `max_connections` to `url`.
    pub(crate) async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!(max_connections, "Connected to database");
        Ok(Self { pool })
    }
}

#[async_trait]
impl DataAccess for SqlDataAccess {
    async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, DataAccessError> {
        debug!(params = params.len(), "Running query");
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await
            .map_err(DataAccessError::new)?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<ExecuteResult, DataAccessError> {
        debug!(params = params.len(), "Running statement");
        let result = bind_all(sqlx::query(sql), params)
            .execute(&self.pool)
            .await
            .map_err(DataAccessError::new)?;
        Ok(ExecuteResult {
            affected_rows: result.rows_affected(),
            insert_id: result.last_insert_id(),
        })
    }
}

/// Bind JSON parameters in order. Arrays and objects are bound as their JSON
/// text.
fn bind_all(query: AnyQuery<'_>, params: Vec<Value>) -> AnyQuery<'_> {
    params.into_iter().fold(query, |query, param| match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s),
        other @ (Value::Array(_) | Value::Object(_)) => query.bind(other.to_string()),
    })
}

fn row_to_json(row: &AnyRow) -> Row {
    row.columns()
        .iter()
        .map(|column| (column.name().to_owned(), column_value(row, column.ordinal())))
        .collect()
}

/// Decode one column, trying the scalar types the `any` driver supports.
fn column_value(row: &AnyRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(Value::Null, Value::from);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(Value::Null, Value::String);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(Value::Null, Value::Bool);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(Value::Null, |bytes| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        });
    }
    Value::Null
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn memory() -> SqlDataAccess {
        // One connection: every in-memory SQLite connection is its own database.
        SqlDataAccess::connect("sqlite::memory:", 1).await.unwrap()
    }

    #[tokio::test]
    async fn test_execute_and_query_round_trip() {
        let db = memory().await;
        db.execute(
            "CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price REAL, tags TEXT)",
            vec![],
        )
        .await
        .unwrap();

        let inserted = db
            .execute(
                "INSERT INTO products (name, price, tags) VALUES (?, ?, ?)",
                vec![json!("lamp"), json!(19.5), json!(["home", "light"])],
            )
            .await
            .unwrap();
        assert_eq!(inserted.affected_rows, 1);
        assert_eq!(inserted.insert_id, Some(1));

        let rows = db
            .query("SELECT id, name, price, tags FROM products WHERE name = ?", vec![json!("lamp")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[0]["name"], "lamp");
        assert_eq!(rows[0]["price"], 19.5);
        assert_eq!(rows[0]["tags"], r#"["home","light"]"#);
    }

    #[tokio::test]
    async fn test_null_values() {
        let db = memory().await;
        db.execute("CREATE TABLE t (a TEXT)", vec![]).await.unwrap();
        db.execute("INSERT INTO t (a) VALUES (?)", vec![Value::Null])
            .await
            .unwrap();
        let rows = db.query("SELECT a FROM t", vec![]).await.unwrap();
        assert_eq!(rows[0]["a"], Value::Null);
    }

    #[tokio::test]
    async fn test_sql_error_is_reported() {
        let db = memory().await;
        let err = db.query("SELECT * FROM missing", vec![]).await.unwrap_err();
        assert!(err.0.contains("missing"), "{err}");
    }
}
