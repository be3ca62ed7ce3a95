//! PostgreSQL Driver
//!
//! Implements the DataEngine trait for PostgreSQL databases using SQLx.
//!
//! Each session owns a single-connection pool; queries run through
//! `raw_sql` so the shape of the result (rows or a completion count) decides
//! what is reported back, rather than guessing from the statement text.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode, Postgres};
use sqlx::{Column, Either, Row, TypeInfo};
use tokio::sync::RwLock;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    Collection, CollectionType, ColumnInfo, ConnectionConfig, Namespace, Protocol, QueryResult,
    Row as QRow, RowUpdate, SessionId, TableColumn, TableSchema, Value,
};

const DEFAULT_SCHEMA: &str = "public";

/// Holds the client handle for a PostgreSQL session.
pub struct PostgresSession {
    pub pool: PgPool,
}

/// PostgreSQL driver implementation
pub struct PostgresDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<PostgresSession>>>>,
}

impl PostgresDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: &SessionId) -> EngineResult<Arc<PostgresSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session)
            .cloned()
            .ok_or_else(|| EngineError::not_connected(session.as_str()))
    }

    /// Builds connect options field by field so credentials need no URL escaping
    fn connect_options(config: &ConnectionConfig) -> PgConnectOptions {
        let ssl_mode = if config.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        };

        PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(config.database.as_deref().unwrap_or("postgres"))
            .ssl_mode(ssl_mode)
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

    /// Converts a SQLx row to our universal Row type
    fn convert_row(pg_row: &PgRow) -> QRow {
        let values: Vec<Value> = pg_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(pg_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Helper to bind a Value to a Postgres query
    fn bind_param<'q>(
        query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
        match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(b),
            Value::Int(i) => query.bind(i),
            Value::Float(f) => query.bind(f),
            Value::Text(s) => query.bind(s),
            Value::Bytes(b) => query.bind(b),
            Value::Json(j) => query.bind(j),
            Value::Array(_) => query.bind(value.to_json()),
        }
    }

    /// Extracts a value from a PgRow at the given index
    fn extract_value(row: &PgRow, idx: usize) -> Value {
        // Integers before bool so int columns are not read as booleans
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
            return v.map(Value::Float).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
            return v.map(|f| Value::Float(f as f64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<rust_decimal::Decimal>, _>(idx) {
            return v.map(|d| Value::Text(d.to_string())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
            return v.map(Value::Text).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
            return v.map(|dt| Value::Text(dt.to_rfc3339())).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
            return v
                .map(|dt| Value::Text(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
            return v
                .map(|d| Value::Text(d.format("%Y-%m-%d").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
            return v
                .map(|t| Value::Text(t.format("%H:%M:%S").to_string()))
                .unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return v.map(Value::Bytes).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
            return v.map(Value::Json).unwrap_or(Value::Null);
        }

        Value::Null
    }

    /// Gets column info from a PgRow
    fn get_column_info(row: &PgRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true, // SQLx doesn't expose nullability at runtime
            })
            .collect()
    }

    /// "PostgreSQL 16.2 (Debian ...)" style banner from `SHOW server_version`
    fn format_version(raw: &str) -> String {
        let version = raw.split_whitespace().next().unwrap_or(raw);
        format!("PostgreSQL {}", version)
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for PostgresDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Postgresql
    }

    fn driver_name(&self) -> &'static str {
        "PostgreSQL"
    }

    async fn connect(&self, session: &SessionId, config: &ConnectionConfig) -> EngineResult<()> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(Self::connect_options(config))
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("password authentication failed") {
                    EngineError::auth_failed(msg)
                } else {
                    EngineError::connection_failed(msg)
                }
            })?;

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.clone(), Arc::new(PostgresSession { pool }));

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
        let pg_session = self.get_session(session).await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT datname::text
            FROM pg_database
            WHERE datistemplate = false
            ORDER BY datname
            "#,
        )
        .fetch_all(&pg_session.pool)
        .await
        .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(rows.into_iter().map(|(db,)| Namespace::new(db)).collect())
    }

    async fn list_collections(
        &self,
        session: &SessionId,
        namespace: &Namespace,
    ) -> EngineResult<Vec<Collection>> {
        let pg_session = self.get_session(session).await?;
        let schema = namespace.schema.as_deref().unwrap_or(DEFAULT_SCHEMA);

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT table_name::text, table_type::text
            FROM information_schema.tables
            WHERE table_schema = $1
            ORDER BY table_name
            "#,
        )
        .bind(schema)
        .fetch_all(&pg_session.pool)
        .await
        .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let collections = rows
            .into_iter()
            .map(|(name, table_type)| {
                let collection_type = match table_type.as_str() {
                    "VIEW" => CollectionType::View,
                    _ => CollectionType::Table,
                };
                Collection {
                    namespace: namespace.clone(),
                    name,
                    collection_type,
                }
            })
            .collect();

        Ok(collections)
    }

    async fn execute(
        &self,
        session: &SessionId,
        _namespace: Option<&Namespace>,
        query: &str,
    ) -> EngineResult<QueryResult> {
        let pg_session = self.get_session(session).await?;
        let start = Instant::now();

        let mut pg_rows: Vec<PgRow> = Vec::new();
        let mut affected: u64 = 0;
        {
            let mut stream = sqlx::raw_sql(query).fetch_many(&pg_session.pool);
            while let Some(step) = stream.try_next().await.map_err(Self::map_query_error)? {
                match step {
                    Either::Left(done) => affected += done.rows_affected(),
                    Either::Right(row) => pg_rows.push(row),
                }
            }
        }

        let execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;

        if pg_rows.is_empty() {
            return Ok(QueryResult::with_affected_rows(affected, execution_time_ms));
        }

        let columns = Self::get_column_info(&pg_rows[0]);
        let rows: Vec<QRow> = pg_rows.iter().map(Self::convert_row).collect();
        Ok(QueryResult::with_rows(columns, rows, execution_time_ms))
    }

    async fn describe_table(
        &self,
        session: &SessionId,
        namespace: &Namespace,
        table: &str,
    ) -> EngineResult<TableSchema> {
        let pg_session = self.get_session(session).await?;
        let pool = &pg_session.pool;
        let schema = namespace.schema.as_deref().unwrap_or(DEFAULT_SCHEMA);

        let column_rows: Vec<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT
                column_name::text,
                data_type::text,
                is_nullable::text,
                column_default::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(pool)
        .await
        .map_err(|e| EngineError::execution_error(e.to_string()))?;

        // information_schema has no key marker; primary keys come from pg_index
        let pk_rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT a.attname::text
            FROM pg_index i
            JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
            WHERE i.indrelid = format('%I.%I', $1::text, $2::text)::regclass
              AND i.indisprimary
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(pool)
        .await
        .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let pk_columns: Vec<String> = pk_rows.into_iter().map(|(name,)| name).collect();

        let columns = column_rows
            .into_iter()
            .map(|(name, data_type, is_nullable, default_value)| TableColumn {
                key: if pk_columns.contains(&name) {
                    TableColumn::PRIMARY.to_string()
                } else {
                    String::new()
                },
                name,
                data_type,
                nullable: is_nullable == "YES",
                default_value,
                extra: String::new(),
            })
            .collect();

        Ok(TableSchema::from_columns(columns))
    }

    async fn server_version(&self, session: &SessionId) -> EngineResult<String> {
        let pg_session = self.get_session(session).await?;

        let raw: String = sqlx::query_scalar("SHOW server_version")
            .fetch_one(&pg_session.pool)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(Self::format_version(&raw))
    }

    async fn update_row(
        &self,
        session: &SessionId,
        namespace: &Namespace,
        table: &str,
        update: &RowUpdate,
    ) -> EngineResult<QueryResult> {
        let pg_session = self.get_session(session).await?;

        let table_name = match namespace.schema.as_deref() {
            Some(schema) => format!("{}.{}", Self::quote_ident(schema), Self::quote_ident(table)),
            None => Self::quote_ident(table),
        };

        let sql = format!(
            "UPDATE {} SET {} = $1 WHERE {} = $2",
            table_name,
            Self::quote_ident(&update.column),
            Self::quote_ident(&update.primary_key)
        );

        let query = sqlx::query(&sql);
        let query = Self::bind_param(query, &update.new_value);
        let query = Self::bind_param(query, &update.primary_key_value);

        let start = Instant::now();
        let result = query
            .execute(&pg_session.pool)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(QueryResult::with_affected_rows(
            result.rows_affected(),
            start.elapsed().as_micros() as f64 / 1000.0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_building() {
        let mut config = ConnectionConfig::new(Protocol::Postgresql);
        config.host = "localhost".to_string();
        config.username = "user".to_string();
        config.password = "pass".to_string();
        config.database = Some("testdb".to_string());

        let options = PostgresDriver::connect_options(&config);
        assert_eq!(options.get_host(), "localhost");
        assert_eq!(options.get_port(), 5432);
        assert_eq!(options.get_database(), Some("testdb"));
        assert!(matches!(options.get_ssl_mode(), PgSslMode::Disable));
    }

    #[test]
    fn reserved_characters_in_password_do_not_move_the_host() {
        let mut config = ConnectionConfig::new(Protocol::Postgresql);
        config.host = "db.internal".to_string();
        config.username = "app".to_string();
        config.password = "p@ss/w#rd:1".to_string();

        let options = PostgresDriver::connect_options(&config);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_username(), "app");
        assert_eq!(options.get_database(), Some("postgres"));
    }

    #[test]
    fn ssl_flag_requires_tls() {
        let mut config = ConnectionConfig::new(Protocol::Postgresql);
        config.ssl = true;
        let options = PostgresDriver::connect_options(&config);
        assert!(matches!(options.get_ssl_mode(), PgSslMode::Require));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(PostgresDriver::quote_ident("users"), "\"users\"");
        assert_eq!(PostgresDriver::quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn version_banner_is_trimmed() {
        assert_eq!(
            PostgresDriver::format_version("16.2 (Debian 16.2-1.pgdg120+2)"),
            "PostgreSQL 16.2"
        );
    }

    #[tokio::test]
    async fn unknown_session_is_not_connected() {
        let driver = PostgresDriver::new();
        let err = driver
            .server_version(&SessionId::new("missing"))
            .await
            .expect_err("no session");
        assert!(matches!(err, EngineError::NotConnected { .. }));
    }
}
