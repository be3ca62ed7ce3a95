//! DataEngine trait definition
//!
//! This is the core abstraction that all protocol adapters implement.
//! It provides a unified interface for connecting, querying, and managing
//! database sessions across SQL, document, key/value and embedded engines.

use async_trait::async_trait;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{
    Collection, ConnectionConfig, Namespace, Protocol, QueryResult, RowUpdate, SessionId,
    TableSchema,
};

/// Core trait that all protocol adapters must implement
///
/// Each adapter owns the client handles of its sessions, keyed by the
/// caller-chosen `SessionId`. The session manager guarantees that calls for a
/// given session are never issued concurrently.
#[async_trait]
pub trait DataEngine: Send + Sync {
    /// Returns the protocol this adapter serves
    fn protocol(&self) -> Protocol;

    /// Returns a human-readable name for this adapter
    fn driver_name(&self) -> &'static str;

    /// Opens a client handle and stores it under `session`
    async fn connect(&self, session: &SessionId, config: &ConnectionConfig) -> EngineResult<()>;

    /// Closes a session and releases associated resources
    async fn disconnect(&self, session: &SessionId) -> EngineResult<()>;

    /// Lists the logical databases / namespaces exposed by the backend
    async fn list_namespaces(&self, session: &SessionId) -> EngineResult<Vec<Namespace>>;

    /// Lists all collections (tables/views/collections/key prefixes) in a namespace
    async fn list_collections(
        &self,
        session: &SessionId,
        namespace: &Namespace,
    ) -> EngineResult<Vec<Collection>>;

    /// Executes a query and returns the result
    ///
    /// For SQL engines: raw SQL
    /// For MongoDB: a JSON query object
    /// For Redis: a single command line
    async fn execute(
        &self,
        session: &SessionId,
        namespace: Option<&Namespace>,
        query: &str,
    ) -> EngineResult<QueryResult>;

    /// Returns the schema of a table/collection
    async fn describe_table(
        &self,
        session: &SessionId,
        namespace: &Namespace,
        table: &str,
    ) -> EngineResult<TableSchema>;

    /// Returns the server version label
    async fn server_version(&self, session: &SessionId) -> EngineResult<String>;

    /// Updates a single cell of the row identified by one primary-key column.
    async fn update_row(
        &self,
        session: &SessionId,
        namespace: &Namespace,
        table: &str,
        update: &RowUpdate,
    ) -> EngineResult<QueryResult> {
        let _ = (session, namespace, table, update);
        Err(EngineError::not_supported(
            "Update not supported for this database type",
        ))
    }
}
