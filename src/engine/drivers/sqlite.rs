//! SQLite Driver
//!
//! Implements the DataEngine trait for SQLite files using SQLx.
//!
//! The session manager hands this driver a local path only; staging a remote
//! file happens before `connect` is called.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row, TypeInfo};
use tokio::sync::RwLock;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    Collection, CollectionType, ColumnInfo, ConnectionConfig, Namespace, Protocol, QueryResult,
    Row as QRow, RowUpdate, SessionId, TableColumn, TableSchema, Value,
};

const MAIN_DATABASE: &str = "main";
const MEMORY_PATH: &str = ":memory:";
const VERSION_LABEL: &str = "SQLite 3";

pub struct SqliteSession {
    pub pool: SqlitePool,
    pub path: String,
}

/// SQLite driver implementation
pub struct SqliteDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<SqliteSession>>>>,
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: &SessionId) -> EngineResult<Arc<SqliteSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session)
            .cloned()
            .ok_or_else(|| EngineError::not_connected(session.as_str()))
    }

    fn connect_options(path: &str) -> EngineResult<SqliteConnectOptions> {
        let options = if path == MEMORY_PATH {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| EngineError::connection_failed(e.to_string()))?
        } else {
            // Rollback journal keeps every change inside the single file we sync back
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Delete)
        };

        Ok(options.busy_timeout(Duration::from_secs(30)))
    }

    /// Statements that produce rows; everything else reports affected rows.
    fn is_row_returning(query: &str) -> bool {
        let head = query.trim_start().to_ascii_uppercase();
        ["SELECT", "PRAGMA", "WITH", "EXPLAIN", "VALUES"]
            .iter()
            .any(|kw| head.starts_with(kw))
    }

    fn quote_ident(ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn map_query_error(e: sqlx::Error) -> EngineError {
        let msg = e.to_string();
        if msg.contains("syntax error") {
            EngineError::syntax_error(msg)
        } else {
            EngineError::execution_error(msg)
        }
    }

    fn bind_param<'q>(
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j.to_string()),
            Value::Array(_) => query.bind(value.to_json().to_string()),
        }
    }

    fn extract_value(row: &SqliteRow, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }

        Value::Null
    }

    fn convert_row(row: &SqliteRow) -> QRow {
        QRow {
            values: row
                .columns()
                .iter()
                .map(|col| Self::extract_value(row, col.ordinal()))
                .collect(),
        }
    }

    fn get_column_info(row: &SqliteRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for SqliteDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Sqlite
    }

    fn driver_name(&self) -> &'static str {
        "SQLite"
    }

    async fn connect(&self, session: &SessionId, config: &ConnectionConfig) -> EngineResult<()> {
        let path = config
            .sqlite_file
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(MEMORY_PATH)
            .to_string();

        // One connection: the handle must be fully closed before the file is synced,
        // and an in-memory database only lives as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(Self::connect_options(&path)?)
            .await
            .map_err(|e| EngineError::connection_failed(format!("{}: {}", path, e)))?;

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.clone(), Arc::new(SqliteSession { pool, path }));

        Ok(())
    }

    async fn disconnect(&self, session: &SessionId) -> EngineResult<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session)
                .ok_or_else(|| EngineError::not_connected(session.as_str()))?
        };

        session.pool.close().await;
        Ok(())
    }

    async fn list_namespaces(&self, session: &SessionId) -> EngineResult<Vec<Namespace>> {
        self.get_session(session).await?;
        Ok(vec![Namespace::new(MAIN_DATABASE)])
    }

    async fn list_collections(
        &self,
        session: &SessionId,
        namespace: &Namespace,
    ) -> EngineResult<Vec<Collection>> {
        let sqlite_session = self.get_session(session).await?;

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT name, type
            FROM sqlite_master
            WHERE type IN ('table', 'view')
            ORDER BY name
            "#,
        )
        .fetch_all(&sqlite_session.pool)
        .await
        .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(name, kind)| Collection {
                namespace: namespace.clone(),
                name,
                collection_type: if kind == "view" {
                    CollectionType::View
                } else {
                    CollectionType::Table
                },
            })
            .collect())
    }

    async fn execute(
        &self,
        session: &SessionId,
        _namespace: Option<&Namespace>,
        query: &str,
    ) -> EngineResult<QueryResult> {
        let sqlite_session = self.get_session(session).await?;
        let start = Instant::now();

        if Self::is_row_returning(query) {
            let sqlite_rows: Vec<SqliteRow> = sqlx::raw_sql(query)
                .fetch_all(&sqlite_session.pool)
                .await
                .map_err(Self::map_query_error)?;

            let execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;

            // Column list mirrors the keys of the first row; no rows, no columns
            let Some(first) = sqlite_rows.first() else {
                return Ok(QueryResult::with_rows(Vec::new(), Vec::new(), execution_time_ms));
            };
            let columns = Self::get_column_info(first);
            let rows = sqlite_rows.iter().map(Self::convert_row).collect();
            return Ok(QueryResult::with_rows(columns, rows, execution_time_ms));
        }

        let done = sqlx::raw_sql(query)
            .execute(&sqlite_session.pool)
            .await
            .map_err(Self::map_query_error)?;

        let mut result = QueryResult::with_affected_rows(
            done.rows_affected(),
            start.elapsed().as_micros() as f64 / 1000.0,
        );
        result.insert_id = Some(Value::Int(done.last_insert_rowid()));
        Ok(result)
    }

    async fn describe_table(
        &self,
        session: &SessionId,
        _namespace: &Namespace,
        table: &str,
    ) -> EngineResult<TableSchema> {
        let sqlite_session = self.get_session(session).await?;

        let sql = format!("PRAGMA table_info({})", Self::quote_ident(table));
        let rows: Vec<(i64, String, String, i64, Option<String>, i64)> = sqlx::query_as(&sql)
            .fetch_all(&sqlite_session.pool)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let columns = rows
            .into_iter()
            .map(|(_cid, name, data_type, notnull, default_value, pk)| TableColumn {
                name,
                data_type,
                nullable: notnull == 0,
                key: if pk > 0 {
                    TableColumn::PRIMARY.to_string()
                } else {
                    String::new()
                },
                default_value,
                extra: String::new(),
            })
            .collect();

        Ok(TableSchema::from_columns(columns))
    }

    async fn server_version(&self, session: &SessionId) -> EngineResult<String> {
        self.get_session(session).await?;
        Ok(VERSION_LABEL.to_string())
    }

    async fn update_row(
        &self,
        session: &SessionId,
        _namespace: &Namespace,
        table: &str,
        update: &RowUpdate,
    ) -> EngineResult<QueryResult> {
        let sqlite_session = self.get_session(session).await?;

        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            Self::quote_ident(table),
            Self::quote_ident(&update.column),
            Self::quote_ident(&update.primary_key)
        );

        let query = sqlx::query(&sql);
        let query = Self::bind_param(query, &update.new_value);
        let query = Self::bind_param(query, &update.primary_key_value);

        let start = Instant::now();
        let result = query
            .execute(&sqlite_session.pool)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(QueryResult::with_affected_rows(
            result.rows_affected(),
            start.elapsed().as_micros() as f64 / 1000.0,
        ))
    }
}
