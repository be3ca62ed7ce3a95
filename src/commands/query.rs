//! Query Commands
//!
//! Commands for executing queries and exploring database schema.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{field, instrument, Span};

use crate::engine::types::{CollectionType, Namespace, SessionId, TableColumn};
use crate::engine::{EngineResult, ErrorKind};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRequest {
    pub connection_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablesRequest {
    pub connection_id: String,
    #[serde(default)]
    pub database: Option<String>,
    /// Postgres schema; `public` when absent
    #[serde(default)]
    pub schema: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub connection_id: String,
    #[serde(default)]
    pub database: Option<String>,
    pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStructureRequest {
    pub connection_id: String,
    #[serde(default)]
    pub database: Option<String>,
    /// Postgres schema; `public` when absent
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Serialize)]
pub struct TableEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CollectionType,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TablesResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TableEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Response wrapper for query results; rows are keyed by column name
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStructureResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<TableColumn>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Namespace for a request; an empty name means the connection's current database.
pub(crate) fn namespace_for(database: Option<&str>, schema: Option<&str>) -> Namespace {
    let database = database.unwrap_or_default();
    match schema.map(str::trim).filter(|s| !s.is_empty()) {
        Some(schema) => Namespace::with_schema(database, schema),
        None => Namespace::new(database),
    }
}

/// Returns the server version label of a connection
#[instrument(skip(state, request), fields(connection_id = %request.connection_id))]
pub async fn get_version(state: &crate::SharedState, request: VersionRequest) -> VersionResponse {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };
    let id = SessionId::new(request.connection_id);

    let result: EngineResult<String> = async {
        let lease = session_manager.lease(&id).await?;
        session_manager
            .bounded(lease.driver().server_version(lease.id()))
            .await
    }
    .await;

    match result {
        Ok(version) => VersionResponse {
            success: true,
            version: Some(version),
            error: None,
            error_kind: None,
        },
        Err(e) => VersionResponse {
            success: false,
            version: None,
            error: Some(e.to_string()),
            error_kind: Some(e.kind()),
        },
    }
}

/// Lists tables, views, collections or key prefixes of one database
#[instrument(skip(state, request), fields(connection_id = %request.connection_id, database = ?request.database))]
pub async fn get_tables(state: &crate::SharedState, request: TablesRequest) -> TablesResponse {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };
    let id = SessionId::new(request.connection_id);
    let namespace = namespace_for(request.database.as_deref(), request.schema.as_deref());

    let result = async {
        let lease = session_manager.lease(&id).await?;
        session_manager
            .bounded(lease.driver().list_collections(lease.id(), &namespace))
            .await
    }
    .await;

    match result {
        Ok(collections) => TablesResponse {
            success: true,
            tables: Some(
                collections
                    .into_iter()
                    .map(|c| TableEntry {
                        name: c.name,
                        kind: c.collection_type,
                    })
                    .collect(),
            ),
            error: None,
            error_kind: None,
        },
        Err(e) => TablesResponse {
            success: false,
            tables: None,
            error: Some(e.to_string()),
            error_kind: Some(e.kind()),
        },
    }
}

/// Executes a query on the given connection
#[instrument(
    skip(state, request),
    fields(
        connection_id = %request.connection_id,
        database = ?request.database,
        query_len = request.query.len(),
        protocol = field::Empty
    )
)]
pub async fn query(state: &crate::SharedState, request: QueryRequest) -> QueryResponse {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };
    let id = SessionId::new(request.connection_id);
    let namespace = request.database.as_deref().map(Namespace::new);

    let result = async {
        let lease = session_manager.lease(&id).await?;
        Span::current().record("protocol", field::display(lease.protocol()));
        session_manager
            .bounded(
                lease
                    .driver()
                    .execute(lease.id(), namespace.as_ref(), &request.query),
            )
            .await
    }
    .await;

    match result {
        Ok(result) => QueryResponse {
            success: true,
            columns: Some(result.column_names()),
            rows: Some(result.rows_as_objects()),
            affected_rows: result.affected_rows,
            insert_id: result.insert_id.as_ref().map(|v| v.to_json()),
            execution_time_ms: Some(result.execution_time_ms),
            error: None,
            error_kind: None,
        },
        Err(e) => QueryResponse {
            success: false,
            error: Some(e.to_string()),
            error_kind: Some(e.kind()),
            ..QueryResponse::default()
        },
    }
}

/// Describes the columns of a table or collection
#[instrument(skip(state, request), fields(connection_id = %request.connection_id, table = %request.table))]
pub async fn get_table_structure(
    state: &crate::SharedState,
    request: TableStructureRequest,
) -> TableStructureResponse {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };
    let id = SessionId::new(request.connection_id);
    let namespace = namespace_for(request.database.as_deref(), request.schema.as_deref());

    let result = async {
        let lease = session_manager.lease(&id).await?;
        session_manager
            .bounded(
                lease
                    .driver()
                    .describe_table(lease.id(), &namespace, &request.table),
            )
            .await
    }
    .await;

    match result {
        Ok(schema) => TableStructureResponse {
            success: true,
            columns: Some(schema.columns),
            primary_key: schema.primary_key,
            error: None,
            error_kind: None,
        },
        Err(e) => TableStructureResponse {
            success: false,
            columns: None,
            primary_key: None,
            error: Some(e.to_string()),
            error_kind: Some(e.kind()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_carries_optional_schema() {
        assert_eq!(namespace_for(None, None), Namespace::new(""));
        assert_eq!(namespace_for(Some("app"), Some(" ")), Namespace::new("app"));
        assert_eq!(
            namespace_for(Some("app"), Some("audit")),
            Namespace::with_schema("app", "audit")
        );
    }
}
