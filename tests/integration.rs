//! Integration tests for qoredb-broker
//!
//! The SQLite and staging tests run anywhere. The server-backed tests require
//! local MySQL, Postgres, MongoDB and Redis instances with default credentials.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use qoredb_broker::commands::dispatch_line;
use qoredb_broker::config::BrokerConfig;
use qoredb_broker::engine::{EngineError, EngineResult, FileTransport, SshTunnelConfig};
use qoredb_broker::{AppState, SharedState};
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Serves "remote" paths from the local filesystem
struct LocalCopyTransport;

#[async_trait]
impl FileTransport for LocalCopyTransport {
    async fn download(&self, remote: &str, local: &Path, _ssh: &SshTunnelConfig) -> EngineResult<()> {
        tokio::fs::copy(remote, local)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::ssh(e.to_string()))
    }

    async fn upload(&self, local: &Path, remote: &str, _ssh: &SshTunnelConfig) -> EngineResult<()> {
        tokio::fs::copy(local, remote)
            .await
            .map(|_| ())
            .map_err(|e| EngineError::ssh(e.to_string()))
    }
}

fn broker(dir: &Path) -> SharedState {
    let config = BrokerConfig {
        temp_dir: Some(dir.join("staging")),
        ..BrokerConfig::default()
    };
    Arc::new(Mutex::new(AppState::with_transport(config, Arc::new(LocalCopyTransport))))
}

async fn send(state: &SharedState, request: Value) -> Value {
    dispatch_line(state, &request.to_string()).await
}

fn ssh_json() -> Value {
    json!({
        "host": "files.internal",
        "port": 22,
        "username": "deploy",
        "auth": {"Password": {"password": "secret"}},
        "host_key_policy": "accept_new"
    })
}

#[tokio::test]
async fn test_remote_sqlite_edit_is_synced_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = dir.path().join("remote.db").display().to_string();
    let state = broker(dir.path());

    // Build the remote file through a plain local connection
    let res = send(&state, json!({"command": "connect", "connectionId": "seed", "protocol": "sqlite", "sqliteFile": remote})).await;
    assert_eq!(res["success"], true, "{res}");
    send(&state, json!({"command": "query", "connectionId": "seed", "query": "CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT)"})).await;
    send(&state, json!({"command": "query", "connectionId": "seed", "query": "INSERT INTO kv VALUES ('a', '1')"})).await;
    send(&state, json!({"command": "disconnect", "connectionId": "seed"})).await;

    let res = send(
        &state,
        json!({"command": "connect", "connectionId": "remote", "protocol": "sqlite",
               "sqliteFile": remote, "sshTunnel": ssh_json()}),
    )
    .await;
    assert_eq!(res, json!({"success": true, "databases": ["main"]}));

    let res = send(
        &state,
        json!({"command": "updateRow", "connectionId": "remote", "table": "kv",
               "primaryKey": "k", "primaryKeyValue": "a", "column": "v", "newValue": "2"}),
    )
    .await;
    assert_eq!(res["affectedRows"], 1, "{res}");

    let res = send(&state, json!({"command": "syncSqlite", "connectionId": "remote"})).await;
    assert_eq!(res["success"], true, "{res}");

    let res = send(&state, json!({"command": "query", "connectionId": "remote", "query": "INSERT INTO kv VALUES ('b', '3')"})).await;
    assert_eq!(res["affectedRows"], 1);

    let res = send(&state, json!({"command": "disconnect", "connectionId": "remote"})).await;
    assert_eq!(res, json!({"success": true, "localFileRemoved": true}));

    // Staging directory is empty again
    let staged = std::fs::read_dir(dir.path().join("staging")).expect("staging dir").count();
    assert_eq!(staged, 0);

    send(&state, json!({"command": "connect", "connectionId": "check", "protocol": "sqlite", "sqliteFile": remote})).await;
    let res = send(&state, json!({"command": "query", "connectionId": "check", "query": "SELECT k, v FROM kv ORDER BY k"})).await;
    assert_eq!(res["rows"], json!([{"k": "a", "v": "2"}, {"k": "b", "v": "3"}]));
}

#[tokio::test]
async fn test_missing_remote_file_fails_connect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = broker(dir.path());
    let remote = dir.path().join("absent.db").display().to_string();

    let res = send(
        &state,
        json!({"command": "connect", "connectionId": "r", "protocol": "sqlite",
               "sqliteFile": remote, "sshTunnel": ssh_json()}),
    )
    .await;
    assert_eq!(res["success"], false);
    assert!(res["error"].as_str().unwrap_or_default().contains("absent.db"), "{res}");

    let res = send(&state, json!({"command": "connectionCount"})).await;
    assert_eq!(res["count"], 0);
}

#[tokio::test]
async fn test_update_on_unknown_connection_is_not_connected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = broker(dir.path());

    let res = send(
        &state,
        json!({"command": "updateRow", "connectionId": "cache", "table": "t",
               "primaryKey": "id", "primaryKeyValue": 1, "column": "c", "newValue": 2}),
    )
    .await;
    assert_eq!(res["error"], "Not connected");
}

async fn server_round_trip(state: &SharedState, connect: Value, statement: &str) {
    let res = send(state, connect).await;
    assert_eq!(res["success"], true, "{res}");
    assert!(!res["databases"].as_array().expect("databases").is_empty());

    let res = send(state, json!({"command": "getVersion", "connectionId": "it"})).await;
    assert_eq!(res["success"], true, "{res}");

    let res = send(state, json!({"command": "query", "connectionId": "it", "query": statement})).await;
    assert_eq!(res["success"], true, "{res}");

    let res = send(state, json!({"command": "disconnect", "connectionId": "it"})).await;
    assert_eq!(res["success"], true);
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_postgres_connect_and_query() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = broker(dir.path());
    server_round_trip(
        &state,
        json!({"command": "connect", "connectionId": "it", "protocol": "postgresql", "host": "localhost",
               "port": 5432, "username": "postgres", "password": "postgres", "database": "postgres"}),
        "SELECT 1 AS one",
    )
    .await;
}

#[tokio::test]
#[ignore] // Requires MySQL running
async fn test_mysql_connect_and_query() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = broker(dir.path());
    server_round_trip(
        &state,
        json!({"command": "connect", "connectionId": "it", "protocol": "mysql", "host": "localhost",
               "port": 3306, "username": "root", "password": "root"}),
        "SELECT 1 AS one",
    )
    .await;
}

#[tokio::test]
#[ignore] // Requires MongoDB running
async fn test_mongodb_connect_and_find() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = broker(dir.path());
    server_round_trip(
        &state,
        json!({"command": "connect", "connectionId": "it", "protocol": "mongodb", "host": "localhost", "port": 27017}),
        r#"{"collection": "broker_it", "find": {}, "limit": 5}"#,
    )
    .await;
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn test_redis_connect_and_ping() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = broker(dir.path());
    server_round_trip(
        &state,
        json!({"command": "connect", "connectionId": "it", "protocol": "redis", "host": "localhost", "port": 6379}),
        "PING",
    )
    .await;
}
