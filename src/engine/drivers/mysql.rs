//! MySQL Driver
//!
//! Implements the DataEngine trait for MySQL/MariaDB databases using SQLx.
//!
//! Same architecture as PostgreSQL: a single-connection pool per session.
//! The target database can change per call, so statements are sent as one
//! batch behind an explicit `USE`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::TryStreamExt;
use rust_decimal::Decimal;
use sqlx::mysql::{
    MySql, MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode,
};
use sqlx::{Column, Either, Row, TypeInfo};
use tokio::sync::RwLock;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    Collection, CollectionType, ColumnInfo, ConnectionConfig, Namespace, Protocol, QueryResult,
    Row as QRow, RowUpdate, SessionId, TableColumn, TableSchema, Value,
};

/// Holds the client handle for a MySQL session.
pub struct MySqlSession {
    pub pool: MySqlPool,
}

/// MySQL driver implementation
pub struct MySqlDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<MySqlSession>>>>,
}

impl MySqlDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: &SessionId) -> EngineResult<Arc<MySqlSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session)
            .cloned()
            .ok_or_else(|| EngineError::not_connected(session.as_str()))
    }

    /// Helper to bind a Value to a MySQL query
    fn bind_param<'q>(
        query: sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments>,
        value: &'q Value,
    ) -> sqlx::query::Query<'q, MySql, sqlx::mysql::MySqlArguments> {
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

    /// Builds connect options field by field so credentials need no URL escaping
    fn connect_options(config: &ConnectionConfig) -> MySqlConnectOptions {
        let ssl_mode = if config.ssl {
            MySqlSslMode::Required
        } else {
            MySqlSslMode::Disabled
        };

        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .ssl_mode(ssl_mode);

        match config.database.as_deref() {
            Some(db) => options.database(db),
            None => options,
        }
    }

    fn quote_ident(ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    /// Prefixes `USE` when a database is named. The pool holds one connection,
    /// so both statements land on the same server session.
    fn statement_batch(namespace: Option<&Namespace>, query: &str) -> String {
        match namespace.filter(|ns| !ns.database.is_empty()) {
            Some(ns) => format!("USE {};\n{}", Self::quote_ident(&ns.database), query),
            None => query.to_string(),
        }
    }

    fn map_query_error(e: sqlx::Error) -> EngineError {
        let msg = e.to_string();
        if msg.contains("syntax") {
            EngineError::syntax_error(msg)
        } else {
            EngineError::execution_error(msg)
        }
    }

    /// Converts a SQLx row to our universal Row type
    fn convert_row(mysql_row: &MySqlRow) -> QRow {
        let values: Vec<Value> = mysql_row
            .columns()
            .iter()
            .map(|col| Self::extract_value(mysql_row, col.ordinal()))
            .collect();

        QRow { values }
    }

    /// Extracts a value from a MySqlRow at the given index
    fn extract_value(row: &MySqlRow, idx: usize) -> Value {
        // u64 first for BIGINT UNSIGNED columns
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(Value::Int).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u32>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u16>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
            return v.map(|i| Value::Int(i as i64)).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<Option<u8>, _>(idx) {
            return v.map(|u| Value::Int(u as i64)).unwrap_or(Value::Null);
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
        if let Ok(v) = row.try_get::<Option<Decimal>, _>(idx) {
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

    /// Gets column info from a MySqlRow
    fn get_column_info(row: &MySqlRow) -> Vec<ColumnInfo> {
        row.columns()
            .iter()
            .map(|col| ColumnInfo {
                name: col.name().to_string(),
                data_type: col.type_info().name().to_string(),
                nullable: true,
            })
            .collect()
    }

    fn format_version(raw: &str) -> String {
        // MariaDB reports e.g. "10.11.6-MariaDB-0+deb12u1"
        let number = raw.split('-').next().unwrap_or(raw);
        if raw.contains("MariaDB") {
            format!("MariaDB {}", number)
        } else {
            format!("MySQL {}", number)
        }
    }
}

impl Default for MySqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for MySqlDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Mysql
    }

    fn driver_name(&self) -> &'static str {
        "MySQL / MariaDB"
    }

    async fn connect(&self, session: &SessionId, config: &ConnectionConfig) -> EngineResult<()> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(Self::connect_options(config))
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("Access denied") {
                    EngineError::auth_failed(msg)
                } else {
                    EngineError::connection_failed(msg)
                }
            })?;

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.clone(), Arc::new(MySqlSession { pool }));

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
        let mysql_session = self.get_session(session).await?;

        // Cast to CHAR to avoid BINARY type mismatch with Rust String
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT CAST(SCHEMA_NAME AS CHAR) AS schema_name
            FROM information_schema.SCHEMATA
            ORDER BY SCHEMA_NAME
            "#,
        )
        .fetch_all(&mysql_session.pool)
        .await
        .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(rows.into_iter().map(|(db,)| Namespace::new(db)).collect())
    }

    async fn list_collections(
        &self,
        session: &SessionId,
        namespace: &Namespace,
    ) -> EngineResult<Vec<Collection>> {
        let mysql_session = self.get_session(session).await?;

        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT CAST(TABLE_NAME AS CHAR) AS table_name, CAST(TABLE_TYPE AS CHAR) AS table_type
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = COALESCE(NULLIF(?, ''), DATABASE())
            ORDER BY TABLE_NAME
            "#,
        )
        .bind(&namespace.database)
        .fetch_all(&mysql_session.pool)
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
        namespace: Option<&Namespace>,
        query: &str,
    ) -> EngineResult<QueryResult> {
        let mysql_session = self.get_session(session).await?;
        let start = Instant::now();

        let batch = Self::statement_batch(namespace, query);

        let mut mysql_rows: Vec<MySqlRow> = Vec::new();
        let mut affected: u64 = 0;
        let mut last_insert_id: u64 = 0;
        {
            let mut stream = sqlx::raw_sql(&batch).fetch_many(&mysql_session.pool);
            while let Some(step) = stream.try_next().await.map_err(Self::map_query_error)? {
                match step {
                    Either::Left(done) => {
                        affected += done.rows_affected();
                        if done.last_insert_id() != 0 {
                            last_insert_id = done.last_insert_id();
                        }
                    }
                    Either::Right(row) => mysql_rows.push(row),
                }
            }
        }

        let execution_time_ms = start.elapsed().as_micros() as f64 / 1000.0;

        if mysql_rows.is_empty() {
            let mut result = QueryResult::with_affected_rows(affected, execution_time_ms);
            if last_insert_id != 0 {
                result.insert_id = Some(Value::Int(last_insert_id as i64));
            }
            return Ok(result);
        }

        let columns = Self::get_column_info(&mysql_rows[0]);
        let rows: Vec<QRow> = mysql_rows.iter().map(Self::convert_row).collect();
        Ok(QueryResult::with_rows(columns, rows, execution_time_ms))
    }

    async fn describe_table(
        &self,
        session: &SessionId,
        namespace: &Namespace,
        table: &str,
    ) -> EngineResult<TableSchema> {
        let mysql_session = self.get_session(session).await?;

        let column_rows: Vec<(String, String, String, Option<String>, String, String)> =
            sqlx::query_as(
                r#"
                SELECT
                    CAST(c.COLUMN_NAME AS CHAR) AS column_name,
                    CAST(c.COLUMN_TYPE AS CHAR) AS column_type,
                    CAST(c.IS_NULLABLE AS CHAR) AS is_nullable,
                    CAST(c.COLUMN_DEFAULT AS CHAR) AS column_default,
                    CAST(c.COLUMN_KEY AS CHAR) AS column_key,
                    CAST(c.EXTRA AS CHAR) AS extra
                FROM information_schema.COLUMNS c
                WHERE c.TABLE_SCHEMA = COALESCE(NULLIF(?, ''), DATABASE()) AND c.TABLE_NAME = ?
                ORDER BY c.ORDINAL_POSITION
                "#,
            )
            .bind(&namespace.database)
            .bind(table)
            .fetch_all(&mysql_session.pool)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let columns = column_rows
            .into_iter()
            .map(
                |(name, data_type, is_nullable, default_value, key, extra)| TableColumn {
                    name,
                    data_type,
                    nullable: is_nullable == "YES",
                    key,
                    default_value,
                    extra,
                },
            )
            .collect();

        Ok(TableSchema::from_columns(columns))
    }

    async fn server_version(&self, session: &SessionId) -> EngineResult<String> {
        let mysql_session = self.get_session(session).await?;

        let raw: String = sqlx::query_scalar("SELECT CAST(VERSION() AS CHAR)")
            .fetch_one(&mysql_session.pool)
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
        let mysql_session = self.get_session(session).await?;

        let table_name = if namespace.database.is_empty() {
            Self::quote_ident(table)
        } else {
            format!(
                "{}.{}",
                Self::quote_ident(&namespace.database),
                Self::quote_ident(table)
            )
        };

        let sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            table_name,
            Self::quote_ident(&update.column),
            Self::quote_ident(&update.primary_key)
        );

        let query = sqlx::query(&sql);
        let query = Self::bind_param(query, &update.new_value);
        let query = Self::bind_param(query, &update.primary_key_value);

        let start = Instant::now();
        let result = query
            .execute(&mysql_session.pool)
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
    fn connect_options_omit_missing_database() {
        let mut config = ConnectionConfig::new(Protocol::Mysql);
        config.host = "db".into();
        config.username = "root".into();
        config.password = "pw".into();

        let options = MySqlDriver::connect_options(&config);
        assert_eq!(options.get_host(), "db");
        assert_eq!(options.get_port(), 3306);
        assert_eq!(options.get_database(), None);
        assert!(matches!(options.get_ssl_mode(), MySqlSslMode::Disabled));

        config.database = Some("shop".into());
        config.ssl = true;
        let options = MySqlDriver::connect_options(&config);
        assert_eq!(options.get_database(), Some("shop"));
        assert!(matches!(options.get_ssl_mode(), MySqlSslMode::Required));
    }

    #[test]
    fn reserved_characters_in_password_do_not_move_the_host() {
        let mut config = ConnectionConfig::new(Protocol::Mysql);
        config.host = "db.internal".into();
        config.username = "app".into();
        config.password = "p@ss/w#rd:1".into();

        let options = MySqlDriver::connect_options(&config);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_username(), "app");
    }

    #[test]
    fn named_database_is_selected_ahead_of_the_statement() {
        let ns = Namespace::new("shop");
        assert_eq!(
            MySqlDriver::statement_batch(Some(&ns), "SELECT 1"),
            "USE `shop`;\nSELECT 1"
        );
        assert_eq!(MySqlDriver::statement_batch(Some(&Namespace::new("")), "SELECT 1"), "SELECT 1");
        assert_eq!(MySqlDriver::statement_batch(None, "SELECT 1"), "SELECT 1");
    }

    #[test]
    fn identifiers_escape_backticks() {
        assert_eq!(MySqlDriver::quote_ident("a`b"), "`a``b`");
    }

    #[test]
    fn version_labels() {
        assert_eq!(MySqlDriver::format_version("8.0.36"), "MySQL 8.0.36");
        assert_eq!(
            MySqlDriver::format_version("10.11.6-MariaDB-0+deb12u1"),
            "MariaDB 10.11.6"
        );
    }
}
