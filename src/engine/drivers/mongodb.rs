//! MongoDB Driver
//!
//! Implements the DataEngine trait for MongoDB using the official MongoDB driver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::{ClientOptions, Credential, ServerAddress, Tls, TlsOptions};
use mongodb::Client;
use tokio::sync::RwLock;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::traits::DataEngine;
use crate::engine::types::{
    Collection, CollectionType, ColumnInfo, ConnectionConfig, Namespace, Protocol, QueryResult,
    Row as QRow, RowUpdate, SessionId, TableColumn, TableSchema, Value,
};

const DEFAULT_FIND_LIMIT: i64 = 100;

pub struct MongoSession {
    pub client: Client,
    /// Database used when the caller does not name one
    pub default_database: String,
}

/// The structured query objects accepted by `execute`
#[derive(Debug, PartialEq)]
enum MongoOperation {
    Find { filter: Document, limit: i64 },
    InsertOne(Document),
    Aggregate(Vec<Document>),
}

#[derive(Debug, PartialEq)]
struct MongoQuery {
    collection: String,
    operation: MongoOperation,
}

/// MongoDB driver implementation
pub struct MongoDriver {
    sessions: Arc<RwLock<HashMap<SessionId, Arc<MongoSession>>>>,
}

impl MongoDriver {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_session(&self, session: &SessionId) -> EngineResult<Arc<MongoSession>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session)
            .cloned()
            .ok_or_else(|| EngineError::not_connected(session.as_str()))
    }

    /// A configured URI wins; otherwise options are built field by field so
    /// credentials need no URL escaping.
    async fn client_options(config: &ConnectionConfig) -> EngineResult<ClientOptions> {
        match config.mongo_uri.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(uri) => ClientOptions::parse(uri)
                .await
                .map_err(|e| EngineError::connection_failed(e.to_string())),
            None => Ok(Self::field_options(config)),
        }
    }

    fn field_options(config: &ConnectionConfig) -> ClientOptions {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: config.host.clone(),
            port: Some(config.port),
        }];
        options.tls = Some(if config.ssl {
            Tls::Enabled(TlsOptions::default())
        } else {
            Tls::Disabled
        });

        if !config.username.is_empty() {
            let mut credential = Credential::default();
            credential.username = Some(config.username.clone());
            credential.password = Some(config.password.clone());
            options.credential = Some(credential);
        }

        options
    }

    /// Converts a BSON value to our universal Value type
    fn bson_to_value(bson: &Bson) -> Value {
        match bson {
            Bson::Null => Value::Null,
            Bson::Boolean(b) => Value::Bool(*b),
            Bson::Int32(i) => Value::Int(*i as i64),
            Bson::Int64(i) => Value::Int(*i),
            Bson::Double(f) => Value::Float(*f),
            Bson::String(s) => Value::Text(s.clone()),
            Bson::Binary(b) => Value::Bytes(b.bytes.clone()),
            Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
            Bson::DateTime(dt) => Value::Text(dt.to_string()),
            Bson::Array(arr) => Value::Array(arr.iter().map(Self::bson_to_value).collect()),
            Bson::Document(_) => Value::Json(bson.clone().into_relaxed_extjson()),
            _ => Value::Text(bson.to_string()),
        }
    }

    fn value_to_bson(value: &Value) -> EngineResult<Bson> {
        Ok(match value {
            Value::Null => Bson::Null,
            Value::Bool(b) => Bson::Boolean(*b),
            Value::Int(i) => Bson::Int64(*i),
            Value::Float(f) => Bson::Double(*f),
            Value::Text(s) => Bson::String(s.clone()),
            Value::Bytes(b) => Bson::Binary(mongodb::bson::Binary {
                subtype: mongodb::bson::spec::BinarySubtype::Generic,
                bytes: b.clone(),
            }),
            Value::Json(j) => Bson::try_from(j.clone())
                .map_err(|e| EngineError::syntax_error(format!("Invalid value: {}", e)))?,
            Value::Array(items) => Bson::Array(
                items
                    .iter()
                    .map(Self::value_to_bson)
                    .collect::<EngineResult<Vec<_>>>()?,
            ),
        })
    }

    fn bson_type_name(value: &Bson) -> &'static str {
        match value {
            Bson::Null => "null",
            Bson::Boolean(_) => "boolean",
            Bson::Int32(_) => "int32",
            Bson::Int64(_) => "int64",
            Bson::Double(_) => "double",
            Bson::String(_) => "string",
            Bson::ObjectId(_) => "ObjectId",
            Bson::DateTime(_) => "datetime",
            Bson::Array(_) => "array",
            Bson::Document(_) => "object",
            Bson::Binary(_) => "binary",
            _ => "mixed",
        }
    }

    fn json_to_document(json: &serde_json::Value, field: &str) -> EngineResult<Document> {
        match Bson::try_from(json.clone()) {
            Ok(Bson::Document(doc)) => Ok(doc),
            Ok(_) => Err(EngineError::syntax_error(format!(
                "'{}' must be a JSON object",
                field
            ))),
            Err(e) => Err(EngineError::syntax_error(format!(
                "Invalid '{}': {}",
                field, e
            ))),
        }
    }

    /// Parses the JSON query object: `{"collection": "c", "find": {...}, "limit": 10}`,
    /// `{"collection": "c", "insertOne": {...}}` or `{"collection": "c", "aggregate": [...]}`.
    fn parse_query(query: &str) -> EngineResult<MongoQuery> {
        let parsed: serde_json::Value = serde_json::from_str(query.trim())
            .map_err(|e| EngineError::syntax_error(format!("Invalid JSON: {}", e)))?;

        let collection = parsed
            .get("collection")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::syntax_error("Missing 'collection' field"))?
            .to_string();

        let operation = if let Some(filter) = parsed.get("find") {
            let filter = if filter.is_null() {
                Document::new()
            } else {
                Self::json_to_document(filter, "find")?
            };
            let limit = parsed
                .get("limit")
                .and_then(|v| v.as_i64())
                .filter(|l| *l > 0)
                .unwrap_or(DEFAULT_FIND_LIMIT);
            MongoOperation::Find { filter, limit }
        } else if let Some(document) = parsed.get("insertOne") {
            MongoOperation::InsertOne(Self::json_to_document(document, "insertOne")?)
        } else if let Some(pipeline) = parsed.get("aggregate") {
            let stages = pipeline
                .as_array()
                .ok_or_else(|| EngineError::syntax_error("'aggregate' must be an array"))?;
            let stages = stages
                .iter()
                .map(|stage| Self::json_to_document(stage, "aggregate"))
                .collect::<EngineResult<Vec<_>>>()?;
            MongoOperation::Aggregate(stages)
        } else {
            return Err(EngineError::not_supported("Unknown MongoDB operation"));
        };

        Ok(MongoQuery {
            collection,
            operation,
        })
    }

    /// Columns are the keys of the first document; later rows are aligned to them.
    fn documents_to_result(documents: &[Document], execution_time_ms: f64) -> QueryResult {
        let Some(first) = documents.first() else {
            return QueryResult::with_rows(Vec::new(), Vec::new(), execution_time_ms);
        };

        let names: Vec<String> = first.keys().cloned().collect();
        let rows = documents
            .iter()
            .map(|doc| QRow {
                values: names
                    .iter()
                    .map(|name| doc.get(name).map(Self::bson_to_value).unwrap_or(Value::Null))
                    .collect(),
            })
            .collect();
        let columns = names.into_iter().map(ColumnInfo::untyped).collect();

        QueryResult::with_rows(columns, rows, execution_time_ms)
    }

    fn database_name<'a>(session: &'a MongoSession, namespace: Option<&'a Namespace>) -> &'a str {
        namespace
            .map(|ns| ns.database.as_str())
            .filter(|db| !db.is_empty())
            .unwrap_or(&session.default_database)
    }
}

impl Default for MongoDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataEngine for MongoDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Mongodb
    }

    fn driver_name(&self) -> &'static str {
        "MongoDB"
    }

    async fn connect(&self, session: &SessionId, config: &ConnectionConfig) -> EngineResult<()> {
        let options = Self::client_options(config).await?;

        let client = Client::with_options(options)
            .map_err(|e| EngineError::connection_failed(e.to_string()))?;

        // The driver connects lazily; ping to surface network/auth failures now
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("Authentication failed") {
                    EngineError::auth_failed(msg)
                } else {
                    EngineError::connection_failed(msg)
                }
            })?;

        let mongo_session = MongoSession {
            client,
            default_database: config
                .database
                .clone()
                .unwrap_or_else(|| "test".to_string()),
        };

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.clone(), Arc::new(mongo_session));

        Ok(())
    }

    async fn disconnect(&self, session: &SessionId) -> EngineResult<()> {
        let mongo_session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session)
                .ok_or_else(|| EngineError::not_connected(session.as_str()))?
        };

        mongo_session.client.clone().shutdown().await;
        Ok(())
    }

    async fn list_namespaces(&self, session: &SessionId) -> EngineResult<Vec<Namespace>> {
        let mongo_session = self.get_session(session).await?;

        let databases = mongo_session
            .client
            .list_database_names()
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(databases.into_iter().map(Namespace::new).collect())
    }

    async fn list_collections(
        &self,
        session: &SessionId,
        namespace: &Namespace,
    ) -> EngineResult<Vec<Collection>> {
        let mongo_session = self.get_session(session).await?;
        let db = mongo_session
            .client
            .database(Self::database_name(&mongo_session, Some(namespace)));

        let collection_names = db
            .list_collection_names()
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(collection_names
            .into_iter()
            .map(|name| Collection {
                namespace: namespace.clone(),
                name,
                collection_type: CollectionType::Collection,
            })
            .collect())
    }

    async fn execute(
        &self,
        session: &SessionId,
        namespace: Option<&Namespace>,
        query: &str,
    ) -> EngineResult<QueryResult> {
        let mongo_session = self.get_session(session).await?;
        let parsed = Self::parse_query(query)?;
        let start = Instant::now();

        let collection = mongo_session
            .client
            .database(Self::database_name(&mongo_session, namespace))
            .collection::<Document>(&parsed.collection);

        match parsed.operation {
            MongoOperation::Find { filter, limit } => {
                let cursor = collection
                    .find(filter)
                    .limit(limit)
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;
                let documents: Vec<Document> = cursor
                    .try_collect()
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;

                let elapsed = start.elapsed().as_micros() as f64 / 1000.0;
                Ok(Self::documents_to_result(&documents, elapsed))
            }
            MongoOperation::InsertOne(document) => {
                let inserted = collection
                    .insert_one(document)
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;

                let elapsed = start.elapsed().as_micros() as f64 / 1000.0;
                let mut result = QueryResult::with_affected_rows(1, elapsed);
                result.insert_id = Some(Self::bson_to_value(&inserted.inserted_id));
                Ok(result)
            }
            MongoOperation::Aggregate(pipeline) => {
                let cursor = collection
                    .aggregate(pipeline)
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;
                let documents: Vec<Document> = cursor
                    .try_collect()
                    .await
                    .map_err(|e| EngineError::execution_error(e.to_string()))?;

                let elapsed = start.elapsed().as_micros() as f64 / 1000.0;
                Ok(Self::documents_to_result(&documents, elapsed))
            }
        }
    }

    async fn describe_table(
        &self,
        session: &SessionId,
        namespace: &Namespace,
        table: &str,
    ) -> EngineResult<TableSchema> {
        let mongo_session = self.get_session(session).await?;

        let collection = mongo_session
            .client
            .database(Self::database_name(&mongo_session, Some(namespace)))
            .collection::<Document>(table);

        // Schemaless: infer the shape from a single sample document
        let sample = collection
            .find_one(doc! {})
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let Some(sample) = sample else {
            return Ok(TableSchema::default());
        };

        let columns = sample
            .iter()
            .map(|(name, value)| TableColumn {
                key: if name == "_id" {
                    TableColumn::PRIMARY.to_string()
                } else {
                    String::new()
                },
                name: name.clone(),
                data_type: Self::bson_type_name(value).to_string(),
                nullable: true,
                default_value: None,
                extra: String::new(),
            })
            .collect();

        Ok(TableSchema::from_columns(columns))
    }

    async fn server_version(&self, session: &SessionId) -> EngineResult<String> {
        let mongo_session = self.get_session(session).await?;

        let info = mongo_session
            .client
            .database("admin")
            .run_command(doc! { "buildInfo": 1 })
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        let version = info
            .get_str("version")
            .map_err(|e| EngineError::execution_error(format!("Unexpected buildInfo: {}", e)))?;

        Ok(format!("MongoDB {}", version))
    }

    async fn update_row(
        &self,
        session: &SessionId,
        namespace: &Namespace,
        table: &str,
        update: &RowUpdate,
    ) -> EngineResult<QueryResult> {
        let mongo_session = self.get_session(session).await?;

        let collection = mongo_session
            .client
            .database(Self::database_name(&mongo_session, Some(namespace)))
            .collection::<Document>(table);

        let key_value = match (&update.primary_key_value, update.primary_key.as_str()) {
            (Value::Text(hex), "_id") => ObjectId::parse_str(hex)
                .map(Bson::ObjectId)
                .unwrap_or_else(|_| Bson::String(hex.clone())),
            (other, _) => Self::value_to_bson(other)?,
        };

        let mut filter = Document::new();
        filter.insert(update.primary_key.clone(), key_value);

        let mut set = Document::new();
        set.insert(update.column.clone(), Self::value_to_bson(&update.new_value)?);

        let start = Instant::now();
        let result = collection
            .update_one(filter, doc! { "$set": set })
            .await
            .map_err(|e| EngineError::execution_error(e.to_string()))?;

        Ok(QueryResult::with_affected_rows(
            result.modified_count,
            start.elapsed().as_micros() as f64 / 1000.0,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_find_with_default_limit() {
        let q = MongoDriver::parse_query(r#"{"collection": "users", "find": {"age": {"$gt": 30}}}"#)
            .expect("valid query");
        assert_eq!(q.collection, "users");
        assert_eq!(
            q.operation,
            MongoOperation::Find {
                filter: doc! { "age": { "$gt": 30 } },
                limit: DEFAULT_FIND_LIMIT,
            }
        );
    }

    #[test]
    fn parses_insert_and_aggregate() {
        let q = MongoDriver::parse_query(r#"{"collection": "c", "insertOne": {"a": 1}}"#).unwrap();
        assert!(matches!(q.operation, MongoOperation::InsertOne(_)));

        let q = MongoDriver::parse_query(
            r#"{"collection": "c", "aggregate": [{"$match": {}}, {"$limit": 5}]}"#,
        )
        .unwrap();
        match q.operation {
            MongoOperation::Aggregate(stages) => assert_eq!(stages.len(), 2),
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_operation() {
        let err = MongoDriver::parse_query(r#"{"collection": "c", "deleteMany": {}}"#)
            .expect_err("unsupported");
        assert!(err.to_string().contains("Unknown MongoDB operation"));
    }

    #[test]
    fn rejects_missing_collection_and_bad_json() {
        assert!(matches!(
            MongoDriver::parse_query(r#"{"find": {}}"#),
            Err(EngineError::SyntaxError { .. })
        ));
        assert!(matches!(
            MongoDriver::parse_query("db.users.find()"),
            Err(EngineError::SyntaxError { .. })
        ));
    }

    #[test]
    fn columns_come_from_first_document() {
        let docs = vec![doc! { "_id": 1, "name": "a" }, doc! { "name": "b", "extra": true }];
        let result = MongoDriver::documents_to_result(&docs, 0.0);
        assert_eq!(result.column_names(), vec!["_id", "name"]);
        assert_eq!(result.rows[1].values, vec![Value::Null, Value::Text("b".into())]);
    }

    #[test]
    fn field_options_keep_reserved_characters_in_password() {
        let mut config = ConnectionConfig::new(Protocol::Mongodb);
        config.host = "localhost".into();
        let options = MongoDriver::field_options(&config);
        assert!(matches!(
            options.hosts.as_slice(),
            [ServerAddress::Tcp { host, port: Some(27017) }] if host == "localhost"
        ));
        assert!(options.credential.is_none());
        assert!(matches!(options.tls, Some(Tls::Disabled)));

        config.username = "app".into();
        config.password = "p@ss/w#rd:1".into();
        let options = MongoDriver::field_options(&config);
        let credential = options.credential.expect("credential");
        assert_eq!(credential.username.as_deref(), Some("app"));
        assert_eq!(credential.password.as_deref(), Some("p@ss/w#rd:1"));
    }

    #[tokio::test]
    async fn configured_uri_takes_precedence() {
        let mut config = ConnectionConfig::new(Protocol::Mongodb);
        config.host = "ignored".into();
        config.mongo_uri = Some(" mongodb://replica.example.net:27018/ ".into());
        let options = MongoDriver::client_options(&config).await.unwrap();
        assert!(matches!(
            options.hosts.as_slice(),
            [ServerAddress::Tcp { host, port: Some(27018) }] if host == "replica.example.net"
        ));
    }
}
