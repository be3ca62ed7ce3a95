//! Mutation Commands
//!
//! Single-cell row updates keyed by one primary-key column.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use crate::commands::query::namespace_for;
use crate::engine::types::{RowUpdate, SessionId, Value};
use crate::engine::ErrorKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRowRequest {
    pub connection_id: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
    pub primary_key: String,
    pub primary_key_value: serde_json::Value,
    pub column: String,
    pub new_value: serde_json::Value,
}

/// Response wrapper for mutation results
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

/// Updates one column of the row whose primary key matches
#[instrument(
    skip(state, request),
    fields(connection_id = %request.connection_id, table = %request.table, column = %request.column)
)]
pub async fn update_row(state: &crate::SharedState, request: UpdateRowRequest) -> MutationResponse {
    let session_manager = {
        let state = state.lock().await;
        Arc::clone(&state.session_manager)
    };

    let id = SessionId::new(request.connection_id);
    let namespace = namespace_for(request.database.as_deref(), request.schema.as_deref());
    let update = RowUpdate {
        primary_key: request.primary_key,
        primary_key_value: Value::from_json(request.primary_key_value),
        column: request.column,
        new_value: Value::from_json(request.new_value),
    };

    let result = async {
        let lease = session_manager.lease(&id).await?;
        session_manager
            .bounded(
                lease
                    .driver()
                    .update_row(lease.id(), &namespace, &request.table, &update),
            )
            .await
    }
    .await;

    match result {
        Ok(result) => MutationResponse {
            success: true,
            affected_rows: Some(result.affected_rows.unwrap_or(0)),
            error: None,
            error_kind: None,
        },
        Err(e) => MutationResponse {
            success: false,
            affected_rows: None,
            error: Some(e.to_string()),
            error_kind: Some(e.kind()),
        },
    }
}
