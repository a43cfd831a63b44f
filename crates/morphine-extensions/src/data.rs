//! Data-access seam between extensions and the host's relational store.
//!
//! Extensions never see a database handle. They call `utils.db.query` and
//! `utils.db.execute` with SQL text plus positional parameters; the host
//! forwards both to whatever [`DataAccess`] it was built with.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A result row as column name → JSON value.
pub type Row = Map<String, Value>;

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    /// Rows changed by the statement.
    pub affected_rows: u64,
    /// Last inserted id, when the backend reports one.
    pub insert_id: Option<i64>,
}

/// Failure reported back to the calling extension as a rejected promise.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DataAccessError(pub String);

impl DataAccessError {
    /// Wrap any displayable error.
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Parameterized query interface handed to every extension.
#[async_trait]
pub trait DataAccess: Send + Sync {
    /// Run a read statement and return its rows.
    async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, DataAccessError>;

    /// Run a write statement.
    async fn execute(&self, sql: &str, params: Vec<Value>)
    -> Result<ExecuteResult, DataAccessError>;
}

/// Backend used when no database is configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableDataAccess;

#[async_trait]
impl DataAccess for UnavailableDataAccess {
    async fn query(&self, _sql: &str, _params: Vec<Value>) -> Result<Vec<Row>, DataAccessError> {
        Err(DataAccessError("no database configured".into()))
    }

    async fn execute(
        &self,
        _sql: &str,
        _params: Vec<Value>,
    ) -> Result<ExecuteResult, DataAccessError> {
        Err(DataAccessError("no database configured".into()))
    }
}
