//! Redis Driver
//!
//! Implements the DataEngine trait for Redis using `redis-rs` multiplexed
//! connections. Redis has no tables, so the adapter projects its keyspace onto
//! the uniform model: numbered databases become namespaces and key prefixes
//! (text before the first `:`) become collections.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use tokio::sync::{Mutex, RwLock};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    Collection, CollectionType, ColumnInfo, ConnectionConfig, Namespace, Protocol, QueryResult,
    Row as QRow, SessionId, TableSchema, Value,
};

const DATABASE_COUNT: u32 = 16;
const KEY_DELIMITER: u8 = b':';
const SCAN_BATCH: u32 = 500;

pub struct RedisSession {
    /// Locked for the duration of a SELECT + command pair
    pub conn: Mutex<MultiplexedConnection>,
}

/// Redis driver implementation
pub struct RedisDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<RedisSession>>>>,
}

impl RedisDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: &SessionId) -> EngineResult<Arc<RedisSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session)
            .cloned()
            .ok_or_else(|| EngineError::not_connected(session.as_str()))
    }

    fn connection_info(config: &ConnectionConfig) -> ConnectionInfo {
        let addr = if config.ssl {
            ConnectionAddr::TcpTls {
                host: config.host.clone(),
                port: config.port,
                insecure: false,
                tls_params: None,
            }
        } else {
            ConnectionAddr::Tcp(config.host.clone(), config.port)
        };
        let db = config
            .database
            .as_deref()
            .and_then(|d| Self::parse_database_index(d).ok())
            .unwrap_or(0);
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        ConnectionInfo {
            addr,
            redis: RedisConnectionInfo {
                db: i64::from(db),
                username: non_empty(&config.username),
                password: non_empty(&config.password),
                ..RedisConnectionInfo::default()
            },
        }
    }

    fn database_names() -> Vec<String> {
        (0..DATABASE_COUNT).map(|i| format!("db{}", i)).collect()
    }

    /// Accepts `db3` or `3`
    fn parse_database_index(name: &str) -> EngineResult<u32> {
        let digits = name.trim().trim_start_matches("db");
        digits
            .parse::<u32>()
            .ok()
            .filter(|i| *i < DATABASE_COUNT)
            .ok_or_else(|| EngineError::execution_error(format!("Invalid Redis database '{}'", name)))
    }

    /// Keys are binary-safe; the prefix is decoded lossily
    fn key_prefix(key: &[u8]) -> String {
        let end = key
            .iter()
            .position(|b| *b == KEY_DELIMITER)
            .unwrap_or(key.len());
        String::from_utf8_lossy(&key[..end]).into_owned()
    }

    /// Splits a command line into arguments, honouring single and double quotes.
    fn tokenize(line: &str) -> EngineResult<Vec<String>> {
        let mut args = Vec::new();
        let mut current = String::new();
        let mut in_token = false;
        let mut quote: Option<char> = None;
        let mut chars = line.trim().chars();

        while let Some(c) = chars.next() {
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) if c == '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                }
                Some(_) => current.push(c),
                None if c == '"' || c == '\'' => {
                    quote = Some(c);
                    in_token = true;
                }
                None if c.is_whitespace() => {
                    if in_token {
                        args.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                None => {
                    current.push(c);
                    in_token = true;
                }
            }
        }

        if quote.is_some() {
            return Err(EngineError::syntax_error("Unterminated quote in Redis command"));
        }
        if in_token {
            args.push(current);
        }
        if args.is_empty() {
            return Err(EngineError::syntax_error("Empty Redis command"));
        }
        Ok(args)
    }

    fn redis_to_value(value: &redis::Value) -> Value {
        match value {
            redis::Value::Nil => Value::Null,
            redis::Value::Int(i) => Value::Int(*i),
            redis::Value::BulkString(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => Value::Text(s.to_string()),
                Err(_) => Value::Bytes(bytes.clone()),
            },
            redis::Value::SimpleString(s) => Value::Text(s.clone()),
            redis::Value::Okay => Value::Text("OK".to_string()),
            redis::Value::Double(f) => Value::Float(*f),
            redis::Value::Boolean(b) => Value::Bool(*b),
            redis::Value::Array(items) | redis::Value::Set(items) => {
                Value::Array(items.iter().map(Self::redis_to_value).collect())
            }
            redis::Value::Map(pairs) => Value::Json(serde_json::Value::Object(
                pairs
                    .iter()
                    .map(|(k, v)| (Self::redis_key(k), Self::redis_to_value(v).to_json()))
                    .collect(),
            )),
            other => Value::Text(format!("{:?}", other)),
        }
    }

    fn redis_key(value: &redis::Value) -> String {
        match Self::redis_to_value(value) {
            Value::Text(s) => s,
            other => other.to_json().to_string(),
        }
    }

    fn map_result(pairs: Vec<(String, Value)>, elapsed: f64) -> QueryResult {
        let (names, values): (Vec<String>, Vec<Value>) = pairs.into_iter().unzip();
        QueryResult::with_rows(
            names.into_iter().map(ColumnInfo::untyped).collect(),
            vec![QRow { values }],
            elapsed,
        )
    }

    /// Normalizes a reply into columns + rows:
    /// maps become one row keyed by field, arrays become a `value` column,
    /// anything else a single `result` cell.
    fn normalize_reply(command: &str, reply: &redis::Value, elapsed: f64) -> QueryResult {
        match reply {
            redis::Value::Map(pairs) => Self::map_result(
                pairs
                    .iter()
                    .map(|(k, v)| (Self::redis_key(k), Self::redis_to_value(v)))
                    .collect(),
                elapsed,
            ),
            // RESP2 HGETALL replies are flat field/value arrays
            redis::Value::Array(items)
                if command.eq_ignore_ascii_case("HGETALL") && items.len() % 2 == 0 =>
            {
                Self::map_result(
                    items
                        .chunks(2)
                        .map(|pair| (Self::redis_key(&pair[0]), Self::redis_to_value(&pair[1])))
                        .collect(),
                    elapsed,
                )
            }
            redis::Value::Array(items) | redis::Value::Set(items) => QueryResult::with_rows(
                vec![ColumnInfo::untyped("value")],
                items
                    .iter()
                    .map(|item| QRow {
                        values: vec![Self::redis_to_value(item)],
                    })
                    .collect(),
                elapsed,
            ),
            scalar => QueryResult::with_rows(
                vec![ColumnInfo::untyped("result")],
                vec![QRow {
                    values: vec![Self::redis_to_value(scalar)],
                }],
                elapsed,
            ),
        }
    }

    fn parse_version(info: &str) -> Option<String> {
        info.lines()
            .find_map(|line| line.trim().strip_prefix("redis_version:"))
            .map(|v| format!("Redis {}", v.trim()))
    }

    async fn select(
        conn: &mut MultiplexedConnection,
        namespace: Option<&Namespace>,
    ) -> EngineResult<()> {
        if let Some(ns) = namespace.filter(|ns| !ns.database.is_empty()) {
            let index = Self::parse_database_index(&ns.database)?;
            let _: () = redis::cmd("SELECT")
                .arg(index)
                .query_async(conn)
                .await
                .map_err(|e| EngineError::execution_error(e.to_string()))?;
        }
        Ok(())
    }
}

impl Default for RedisDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for RedisDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Redis
    }

    fn driver_name(&self) -> &'static str {
        "Redis"
    }

    async fn connect(&self, session: &SessionId, config: &ConnectionConfig) -> EngineResult<()> {
        let client = redis::Client::open(Self::connection_info(config))
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("WRONGPASS") || msg.contains("NOAUTH") {
                    EngineError::auth_failed(msg)
                } else {
                    EngineError::connection_failed(msg)
                }
            })?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.clone(),
            Arc::new(RedisSession {
                conn: Mutex::new(conn),
            }),
        );

        Ok(())
    }

    async fn disconnect(&self, session: &SessionId) -> EngineResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .remove(session)
            .map(|_| ())
            .ok_or_else(|| EngineError::not_connected(session.as_str()))
    }

    async fn list_namespaces(&self, session: &SessionId) -> EngineResult<Vec<Namespace>> {
        self.get_session(session).await?;
        Ok(Self::database_names().into_iter().map(Namespace::new).collect())
    }

    async fn list_collections(
        &self,
        session: &SessionId,
        namespace: &Namespace,
    ) -> EngineResult<Vec<Collection>> {
        let redis_session = self.get_session(session).await?;
        let mut conn = redis_session.conn.lock().await;
        Self::select(&mut conn, Some(namespace)).await?;

        let mut prefixes: BTreeSet<String> = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await
                .map_err(|e| EngineError::execution_error(e.to_string()))?;

            prefixes.extend(keys.iter().map(|k| Self::key_prefix(k)));

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(prefixes
            .into_iter()
            .map(|name| Collection {
                namespace: namespace.clone(),
                name,
                collection_type: CollectionType::Keyspace,
            })
            .collect())
    }

    async fn execute(
        &self,
        session: &SessionId,
        namespace: Option<&Namespace>,
        query: &str,
    ) -> EngineResult<QueryResult> {
        let redis_session = self.get_session(session).await?;
        let args = Self::tokenize(query)?;
        let command = args[0].to_ascii_uppercase();

        let mut cmd = redis::cmd(&command);
        for arg in &args[1..] {
            cmd.arg(arg);
        }

        let mut conn = redis_session.conn.lock().await;
        Self::select(&mut conn, namespace).await?;

        let start = Instant::now();
        let reply: redis::Value = cmd.query_async(&mut *conn).await.map_err(|e| {
            let msg = e.to_string();
            if msg.contains("unknown command") || msg.contains("wrong number of arguments") {
                EngineError::syntax_error(msg)
            } else {
                EngineError::execution_error(msg)
            }
        })?;
        let elapsed = start.elapsed().as_micros() as f64 / 1000.0;

        Ok(Self::normalize_reply(&command, &reply, elapsed))
    }

    async fn describe_table(
        &self,
        session: &SessionId,
        _namespace: &Namespace,
        _table: &str,
    ) -> EngineResult<TableSchema> {
        // Keys carry no column structure
        self.get_session(session).await?;
        Ok(TableSchema::default())
    }

    async fn server_version(&self, session: &SessionId) -> EngineResult<String> {
        let redis_session = self.get_session(session).await?;
        let mut conn = redis_session.conn.lock().await;

        let info: String = redis::cmd("INFO")
            .arg("server")
            .query_async(&mut *conn)
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Self::parse_version(&info)
            .ok_or_else(|| EngineError::execution_error("redis_version missing from INFO reply"))
    }
}
