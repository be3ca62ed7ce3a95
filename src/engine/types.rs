//! Universal data types for the broker engine
//!
//! These types provide a normalized representation of database concepts
//! across SQL, document, key/value and embedded-file engines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-chosen identifier for a logical connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend protocol tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mysql,
    Postgresql,
    Mongodb,
    Redis,
    Sqlite,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Mysql,
        Protocol::Postgresql,
        Protocol::Mongodb,
        Protocol::Redis,
        Protocol::Sqlite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mysql => "mysql",
            Protocol::Postgresql => "postgresql",
            Protocol::Mongodb => "mongodb",
            Protocol::Redis => "redis",
            Protocol::Sqlite => "sqlite",
        }
    }

    /// Default TCP port, used when the caller leaves `port` at 0
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Mysql => 3306,
            Protocol::Postgresql => 5432,
            Protocol::Mongodb => 27017,
            Protocol::Redis => 6379,
            Protocol::Sqlite => 0,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub protocol: Protocol,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default, alias = "sslEnabled")]
    pub ssl: bool,
    /// Full MongoDB URI; overrides host/port/credentials when present.
    #[serde(default, skip_serializing)]
    pub mongo_uri: Option<String>,
    /// Path of the SQLite file, on the remote host when `ssh_tunnel` is set.
    #[serde(default)]
    pub sqlite_file: Option<String>,
    /// Only used to reach a remote SQLite file.
    #[serde(default)]
    pub ssh_tunnel: Option<SshTunnelConfig>,
}

impl ConnectionConfig {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            host: String::new(),
            port: protocol.default_port(),
            username: String::new(),
            password: String::new(),
            database: None,
            ssl: false,
            mongo_uri: None,
            sqlite_file: None,
            ssh_tunnel: None,
        }
    }

    pub fn sqlite(path: impl Into<String>) -> Self {
        let mut config = Self::new(Protocol::Sqlite);
        config.sqlite_file = Some(path.into());
        config
    }
}

/// SSH configuration used to reach a remote file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,

    /// Host key verification policy (security-critical).
    #[serde(default)]
    pub host_key_policy: SshHostKeyPolicy,

    /// Optional path to an app-owned known_hosts file.
    /// If not provided, a per-user default is used.
    #[serde(default)]
    pub known_hosts_path: Option<String>,

    /// Connection timeout in seconds for the SSH TCP handshake.
    #[serde(default = "default_ssh_connect_timeout")]
    pub connect_timeout_secs: u32,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_connect_timeout() -> u32 {
    15
}

/// Host key verification policy for SSH.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshHostKeyPolicy {
    /// Trust on first use: auto-add new hosts to an app-owned known_hosts file.
    #[default]
    AcceptNew,
    /// Strict: require the host key to already be present in known_hosts.
    Strict,
    /// Insecure: disable host key checking (dev-only).
    InsecureNoCheck,
}

/// SSH authentication method
#[derive(Clone, Serialize, Deserialize)]
pub enum SshAuth {
    Password {
        #[serde(skip_serializing)]
        password: String,
    },
    Key {
        private_key_path: String,
        #[serde(default, skip_serializing)]
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password { .. } => f.write_str("Password { .. }"),
            SshAuth::Key {
                private_key_path, ..
            } => f
                .debug_struct("Key")
                .field("private_key_path", private_key_path)
                .finish_non_exhaustive(),
        }
    }
}

/// Namespace represents the hierarchy level above collections
/// - For PostgreSQL: database + schema
/// - For MySQL / MongoDB: database
/// - For Redis: numbered keyspace (`db0`..`db15`)
/// - For SQLite: `main`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    pub database: String,
    pub schema: Option<String>,
}

impl Namespace {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            schema: None,
        }
    }

    pub fn with_schema(database: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            schema: Some(schema.into()),
        }
    }
}

/// Collection represents a table (SQL), collection (document) or key prefix (key/value)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub namespace: Namespace,
    pub name: String,
    pub collection_type: CollectionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    Table,
    View,
    Collection,
    Keyspace,
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
    Array(Vec<Value>),
}

impl Value {
    /// Maps a caller-provided JSON scalar onto the closest engine value.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            obj @ serde_json::Value::Object(_) => Value::Json(obj),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use base64::{engine::general_purpose::STANDARD, Engine};

        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(STANDARD.encode(b)),
            Value::Json(j) => j.clone(),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Column metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnInfo {
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: "mixed".to_string(),
            nullable: true,
        }
    }
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// Query execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column information
    pub columns: Vec<ColumnInfo>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Number of affected rows (for INSERT/UPDATE/DELETE)
    pub affected_rows: Option<u64>,
    /// Identifier generated by an insert, when the backend reports one
    pub insert_id: Option<Value>,
    /// Execution time in milliseconds
    pub execution_time_ms: f64,
}

impl QueryResult {
    pub fn with_rows(columns: Vec<ColumnInfo>, rows: Vec<Row>, time_ms: f64) -> Self {
        Self {
            columns,
            rows,
            affected_rows: None,
            insert_id: None,
            execution_time_ms: time_ms,
        }
    }

    pub fn with_affected_rows(affected: u64, time_ms: f64) -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: Some(affected),
            insert_id: None,
            execution_time_ms: time_ms,
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Rows keyed by column name, the shape callers consume. Keys keep column order.
    pub fn rows_as_objects(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.values.iter())
                    .map(|(col, value)| (col.name.clone(), value.to_json()))
                    .collect()
            })
            .collect()
    }
}

/// Single-cell update keyed by one primary-key column
#[derive(Debug, Clone)]
pub struct RowUpdate {
    pub primary_key: String,
    pub primary_key_value: Value,
    pub column: String,
    pub new_value: Value,
}

/// Table schema metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableSchema {
    /// Column definitions
    pub columns: Vec<TableColumn>,
    /// Primary key columns (if any)
    pub primary_key: Option<Vec<String>>,
}

impl TableSchema {
    pub fn from_columns(columns: Vec<TableColumn>) -> Self {
        let pk: Vec<String> = columns
            .iter()
            .filter(|c| c.is_primary_key())
            .map(|c| c.name.clone())
            .collect();

        Self {
            columns,
            primary_key: if pk.is_empty() { None } else { Some(pk) },
        }
    }
}

/// Column metadata for table schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    /// Data type (database-specific)
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    /// `PRI` for primary-key columns, otherwise the backend's key marker or empty
    pub key: String,
    /// Default value expression (if any)
    #[serde(rename = "default")]
    pub default_value: Option<String>,
    pub extra: String,
}

impl TableColumn {
    pub const PRIMARY: &'static str = "PRI";

    pub fn is_primary_key(&self) -> bool {
        self.key == Self::PRIMARY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_auth_deserializes_from_externally_tagged_enum() {
        let json = r#"{"Key":{"private_key_path":"/tmp/id_ed25519","passphrase":"p"}}"#;
        let auth: SshAuth = serde_json::from_str(json).expect("should parse");

        match auth {
            SshAuth::Key {
                private_key_path,
                passphrase,
            } => {
                assert_eq!(private_key_path, "/tmp/id_ed25519");
                assert_eq!(passphrase.as_deref(), Some("p"));
            }
            other => panic!("unexpected auth variant: {other:?}"),
        }
    }

    #[test]
    fn connection_config_accepts_camel_case_payload() {
        let json = r#"{
            "protocol": "sqlite",
            "sqliteFile": "/srv/app/data.db",
            "sslEnabled": true,
            "sshTunnel": {
                "host": "db.example.com",
                "username": "deploy",
                "auth": {"Password": {"password": "secret"}}
            }
        }"#;
        let config: ConnectionConfig = serde_json::from_str(json).expect("should parse");

        assert_eq!(config.protocol, Protocol::Sqlite);
        assert!(config.ssl);
        assert_eq!(config.sqlite_file.as_deref(), Some("/srv/app/data.db"));
        let ssh = config.ssh_tunnel.expect("ssh config");
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.connect_timeout_secs, 15);
        assert_eq!(ssh.host_key_policy, SshHostKeyPolicy::AcceptNew);
    }

    #[test]
    fn secrets_are_not_serialized() {
        let mut config = ConnectionConfig::new(Protocol::Mysql);
        config.password = "hunter2".into();
        let out = serde_json::to_string(&config).unwrap();
        assert!(!out.contains("hunter2"));
        let auth = SshAuth::Password {
            password: "hunter2".into(),
        };
        assert!(!format!("{auth:?}").contains("hunter2"));
    }

    #[test]
    fn rows_are_keyed_by_column_name() {
        let result = QueryResult::with_rows(
            vec![ColumnInfo::untyped("id"), ColumnInfo::untyped("name")],
            vec![Row {
                values: vec![Value::Int(1), Value::Text("ada".into())],
            }],
            0.0,
        );
        let objects = result.rows_as_objects();
        assert_eq!(objects[0]["id"], serde_json::json!(1));
        assert_eq!(objects[0]["name"], serde_json::json!("ada"));
    }

    #[test]
    fn json_numbers_prefer_integers() {
        assert_eq!(Value::from_json(serde_json::json!(42)), Value::Int(42));
        assert_eq!(Value::from_json(serde_json::json!(1.5)), Value::Float(1.5));
    }

    #[test]
    fn row_objects_follow_column_order() {
        let result = QueryResult::with_rows(
            vec![ColumnInfo::untyped("zeta"), ColumnInfo::untyped("alpha"), ColumnInfo::untyped("mid")],
            vec![Row {
                values: vec![Value::Int(1), Value::Int(2), Value::Int(3)],
            }],
            0.0,
        );

        let objects = result.rows_as_objects();
        let keys: Vec<&str> = objects[0].keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(
            serde_json::to_string(&objects[0]).unwrap(),
            r#"{"zeta":1,"alpha":2,"mid":3}"#
        );
    }
}
