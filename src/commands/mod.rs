//! Broker command surface
//!
//! Every command returns a serialisable response; failures are reported as
//! `{ "success": false, "error": ..., "errorKind": ... }` and never as a transport-level error.

pub mod connection;
pub mod mutation;
pub mod query;

use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::engine::ErrorKind;

use connection::{ConnectRequest, ConnectionRequest};
use mutation::UpdateRowRequest;
use query::{QueryRequest, TableStructureRequest, TablesRequest, VersionRequest};

/// One line of host input: `{"command": "<name>", ...arguments}`
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Connect(ConnectRequest),
    Disconnect(ConnectionRequest),
    #[serde(alias = "syncSqlite")]
    SyncSqlite(ConnectionRequest),
    #[serde(alias = "getVersion")]
    GetVersion(VersionRequest),
    #[serde(alias = "getTables")]
    GetTables(TablesRequest),
    Query(QueryRequest),
    #[serde(alias = "getTableStructure")]
    GetTableStructure(TableStructureRequest),
    #[serde(alias = "updateRow")]
    UpdateRow(UpdateRowRequest),
    #[serde(alias = "listSessions")]
    ListSessions,
    #[serde(alias = "connectionCount")]
    ConnectionCount,
    #[serde(alias = "closeAllConnections")]
    CloseAllConnections,
}

/// Runs one request and serialises its response
pub async fn dispatch(state: &crate::SharedState, request: Request) -> serde_json::Value {
    let response = match request {
        Request::Connect(req) => serde_json::to_value(connection::connect(state, req).await),
        Request::Disconnect(req) => serde_json::to_value(connection::disconnect(state, req).await),
        Request::SyncSqlite(req) => serde_json::to_value(connection::sync_sqlite(state, req).await),
        Request::GetVersion(req) => serde_json::to_value(query::get_version(state, req).await),
        Request::GetTables(req) => serde_json::to_value(query::get_tables(state, req).await),
        Request::Query(req) => serde_json::to_value(query::query(state, req).await),
        Request::GetTableStructure(req) => {
            serde_json::to_value(query::get_table_structure(state, req).await)
        }
        Request::UpdateRow(req) => serde_json::to_value(mutation::update_row(state, req).await),
        Request::ListSessions => {
            let sessions = connection::list_sessions(state).await;
            Ok(json!({ "success": true, "sessions": sessions }))
        }
        Request::ConnectionCount => {
            let count = connection::connection_count(state).await;
            Ok(json!({ "success": true, "count": count }))
        }
        Request::CloseAllConnections => {
            let closed = connection::close_all_connections(state).await;
            Ok(json!({ "success": true, "closed": closed }))
        }
    };

    response.unwrap_or_else(|e| json!({ "success": false, "error": e.to_string(), "errorKind": ErrorKind::Query }))
}

/// Parses and runs one raw input line
pub async fn dispatch_line(state: &crate::SharedState, line: &str) -> serde_json::Value {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => dispatch(state, request).await,
        Err(e) => {
            warn!(error = %e, "Rejected malformed request");
            json!({ "success": false, "error": format!("Invalid request: {}", e), "errorKind": ErrorKind::Query })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::{AppState, SharedState};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn state(dir: &std::path::Path) -> SharedState {
        let config = BrokerConfig {
            temp_dir: Some(dir.join("staging")),
            ..BrokerConfig::default()
        };
        Arc::new(Mutex::new(AppState::new(config)))
    }

    async fn send(state: &SharedState, line: serde_json::Value) -> serde_json::Value {
        dispatch_line(state, &line.to_string()).await
    }

    #[tokio::test]
    async fn sqlite_command_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let file = dir.path().join("app.db").display().to_string();

        let res = send(
            &state,
            json!({"command": "connect", "connectionId": "c1", "protocol": "sqlite", "sqliteFile": file}),
        )
        .await;
        assert_eq!(res, json!({"success": true, "databases": ["main"]}));

        let res = send(
            &state,
            json!({"command": "query", "connectionId": "c1",
                   "query": "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)"}),
        )
        .await;
        assert_eq!(res["success"], true);

        let res = send(
            &state,
            json!({"command": "query", "connectionId": "c1",
                   "query": "INSERT INTO users (name) VALUES ('ada')"}),
        )
        .await;
        assert_eq!(res["affectedRows"], 1);
        assert_eq!(res["insertId"], 1);

        let res = send(
            &state,
            json!({"command": "updateRow", "connectionId": "c1", "database": "main", "table": "users",
                   "primaryKey": "id", "primaryKeyValue": 1, "column": "name", "newValue": "grace"}),
        )
        .await;
        assert_eq!(res, json!({"success": true, "affectedRows": 1}));

        let res = send(
            &state,
            json!({"command": "query", "connectionId": "c1", "query": "SELECT id, name FROM users"}),
        )
        .await;
        assert_eq!(res["columns"], json!(["id", "name"]));
        assert_eq!(res["rows"], json!([{"id": 1, "name": "grace"}]));

        let res = send(&state, json!({"command": "getTables", "connectionId": "c1", "database": "main"})).await;
        assert_eq!(res["tables"], json!([{"name": "users", "type": "table"}]));

        let res = send(
            &state,
            json!({"command": "get_table_structure", "connectionId": "c1", "table": "users"}),
        )
        .await;
        assert_eq!(res["columns"][0]["name"], "id");
        assert_eq!(res["columns"][0]["key"], "PRI");
        assert_eq!(res["primaryKey"], json!(["id"]));

        let res = send(&state, json!({"command": "getVersion", "connectionId": "c1"})).await;
        assert_eq!(res["version"], "SQLite 3");

        let res = send(&state, json!({"command": "connectionCount"})).await;
        assert_eq!(res["count"], 1);

        let res = send(&state, json!({"command": "disconnect", "connectionId": "c1"})).await;
        assert_eq!(res, json!({"success": true, "localFileRemoved": false}));
    }

    #[tokio::test]
    async fn errors_are_reported_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let res = send(&state, json!({"command": "query", "connectionId": "nope", "query": "SELECT 1"})).await;
        assert_eq!(
            res,
            json!({"success": false, "error": "Not connected", "errorKind": "not_connected"})
        );

        let res = send(&state, json!({"command": "syncSqlite", "connectionId": "nope"})).await;
        assert_eq!(res["success"], false);
        assert_eq!(res["errorKind"], "staging");
        assert!(res["error"].as_str().unwrap().contains("No remote file to sync"));

        let res = send(&state, json!({"command": "connect", "connectionId": "pg", "protocol": "postgresql"})).await;
        assert_eq!(res["error"], "Host is required");
        assert_eq!(res["errorKind"], "query");

        let res = send(&state, json!({"command": "disconnect", "connectionId": "nope"})).await;
        assert_eq!(res, json!({"success": true}));

        let res = dispatch_line(&state, "{not json").await;
        assert_eq!(res["success"], false);

        let res = send(&state, json!({"command": "launch"})).await;
        assert!(res["error"].as_str().unwrap().starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn close_all_sweeps_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        for id in ["a", "b"] {
            let res = send(&state, json!({"command": "connect", "connectionId": id, "protocol": "sqlite"})).await;
            assert_eq!(res["success"], true);
        }

        let res = send(&state, json!({"command": "listSessions"})).await;
        assert_eq!(res["sessions"].as_array().unwrap().len(), 2);
        assert_eq!(res["sessions"][0]["displayName"], ":memory:");

        let res = send(&state, json!({"command": "close_all_connections"})).await;
        assert_eq!(res["closed"], 2);
        let res = send(&state, json!({"command": "connection_count"})).await;
        assert_eq!(res["count"], 0);
    }
}
