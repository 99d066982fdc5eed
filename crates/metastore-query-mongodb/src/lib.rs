//! MongoDB driver implementation of the metastore-query `DocumentStore` trait
//!
//! Connects to DocDB either directly or through an SSH tunnel. Connections
//! use `directConnection`, disable retryable writes (unsupported by DocDB)
//! and authenticate against `admin` with SCRAM-SHA-1.
//!
//! ## Example
//!
//! ```rust,no_run
//! use metastore_query::{DocumentStore, EnvSource, Filter, SshCredentials};
//! use metastore_query_mongodb::MongoDBSource;
//!
//! # async fn example() -> metastore_query::Result<()> {
//! let credentials = SshCredentials::from_env(&EnvSource::process())?;
//! let source = MongoDBSource::connect_via_tunnel(&credentials).await?;
//!
//! let count = source.count(&Filter::new()).await?;
//! source.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod convert;
pub mod tunnel;

use async_trait::async_trait;
use convert::{to_bson_document, to_record, value_to_bson_document};
use futures::TryStreamExt;
use metastore_query::credentials::{DEFAULT_COLLECTION, DEFAULT_DATABASE};
use metastore_query::{
    Credentials, DataError, Document, DocumentStore, Filter, QueryOptions, Record, Result,
    SshCredentials, WriteResponse,
};
use mongodb::{
    bson::{doc, Document as BsonDocument},
    options::{AuthMechanism, ClientOptions, Credential, ServerAddress},
    results::UpdateResult,
    Client, Collection,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
pub use tunnel::SshTunnel;

/// Driver settings for a DocDB connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub direct_connection: bool,
    pub retry_writes: bool,
    pub auth_source: String,
    pub server_selection_timeout: Duration,
    /// Check that the database and collection exist after connecting
    pub verify_namespace: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            direct_connection: true,
            retry_writes: false,
            auth_source: "admin".to_string(),
            server_selection_timeout: Duration::from_secs(30),
            verify_namespace: false,
        }
    }
}

/// DocDB collection accessed through the MongoDB driver
pub struct MongoDBSource {
    client: Client,
    database: String,
    collection: String,
    tunnel: Mutex<Option<SshTunnel>>,
}

impl MongoDBSource {
    /// Connect directly to `credentials.host:credentials.port`
    pub async fn connect(credentials: &Credentials, options: ConnectOptions) -> Result<Self> {
        let source = Self::connect_to(
            &credentials.host,
            credentials.port,
            credentials,
            &options,
        )
        .await?;

        if options.verify_namespace {
            source.verify_namespace().await?;
        }
        Ok(source)
    }

    /// Open an SSH tunnel, then connect through its local end. The
    /// database and collection must exist.
    pub async fn connect_via_tunnel(credentials: &SshCredentials) -> Result<Self> {
        let tunnel = SshTunnel::open(credentials).await?;
        let local = tunnel.local_addr();

        // The tunnel is dropped (and forwarding stopped) if connecting fails
        let source = Self::connect_to(
            &local.ip().to_string(),
            local.port(),
            &credentials.store,
            &ConnectOptions::default(),
        )
        .await?;
        source.verify_namespace().await?;

        *source.tunnel.lock().await = Some(tunnel);
        info!(
            "Connected to {}:{} as {} through SSH tunnel",
            credentials.store.host,
            credentials.store.port,
            credentials.store.username.as_deref().unwrap_or("<anonymous>")
        );
        Ok(source)
    }

    async fn connect_to(
        host: &str,
        port: u16,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<Self> {
        debug!("Creating MongoDB client for {}:{}", host, port);

        let mut client_options = ClientOptions::default();
        client_options.hosts = vec![ServerAddress::Tcp {
            host: host.to_string(),
            port: Some(port),
        }];
        client_options.direct_connection = Some(options.direct_connection);
        client_options.retry_writes = Some(options.retry_writes);
        client_options.server_selection_timeout = Some(options.server_selection_timeout);
        client_options.app_name = Some("metastore".to_string());

        if let Some(username) = &credentials.username {
            let mut credential = Credential::default();
            credential.username = Some(username.clone());
            credential.password = credentials.password_str().map(str::to_string);
            credential.source = Some(options.auth_source.clone());
            credential.mechanism = Some(AuthMechanism::ScramSha1);
            client_options.credential = Some(credential);
        }

        let client = Client::with_options(client_options).map_err(|e| {
            error!("Failed to create MongoDB client: {}", e);
            DataError::connection(format!("Failed to create MongoDB client: {}", e))
        })?;

        // Test connection
        client.list_database_names().await.map_err(|e| {
            error!("Failed to connect to MongoDB: {}", e);
            DataError::connection(format!("Failed to connect to {}:{}: {}", host, port, e))
        })?;

        debug!("MongoDB client created successfully");

        Ok(Self {
            client,
            database: credentials
                .database
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
            collection: credentials
                .collection
                .clone()
                .unwrap_or_else(|| DEFAULT_COLLECTION.to_string()),
            tunnel: Mutex::new(None),
        })
    }

    /// Fail with `NotFound` unless the database and collection exist
    pub async fn verify_namespace(&self) -> Result<()> {
        let db_names = self.client.list_database_names().await.map_err(|e| {
            error!("Failed to list databases: {}", e);
            DataError::connection(format!("Failed to list databases: {}", e))
        })?;
        if !db_names.contains(&self.database) {
            return Err(DataError::not_found(format!(
                "Database {} not found",
                self.database
            )));
        }

        let collections = self
            .client
            .database(&self.database)
            .list_collection_names()
            .await
            .map_err(|e| {
                error!("Failed to list collections in {}: {}", self.database, e);
                DataError::connection(format!("Failed to list collections: {}", e))
            })?;
        if !collections.contains(&self.collection) {
            return Err(DataError::not_found(format!(
                "Collection {} not found",
                self.collection
            )));
        }
        Ok(())
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    fn collection(&self) -> Collection<BsonDocument> {
        self.client
            .database(&self.database)
            .collection::<BsonDocument>(&self.collection)
    }
}

fn query_error(e: mongodb::error::Error, filter: &Value) -> DataError {
    error!("MongoDB command failed: {}", e);
    DataError::query(e.to_string(), Some(filter))
}

fn write_response(record_id: &str, result: UpdateResult) -> WriteResponse {
    WriteResponse {
        record_id: record_id.to_string(),
        matched_count: result.matched_count,
        modified_count: result.modified_count,
        upserted: result.upserted_id.is_some(),
        dry_run: false,
        raw: None,
    }
}

#[async_trait]
impl DocumentStore for MongoDBSource {
    fn source_type(&self) -> &'static str {
        "mongodb"
    }

    async fn query(&self, filter: &Filter, options: &QueryOptions) -> Result<Vec<Record>> {
        let filter_json = Value::Object(filter.clone());
        debug!("find {} in {}.{}", filter_json, self.database, self.collection);

        let collection = self.collection();
        let mut find = collection.find(to_bson_document(filter)?);
        if let Some(projection) = &options.projection {
            find = find.projection(to_bson_document(projection)?);
        }
        if let Some(sort) = &options.sort {
            find = find.sort(to_bson_document(sort)?);
        }
        if let Some(limit) = options.limit {
            find = find.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(skip) = options.skip {
            find = find.skip(skip);
        }

        let cursor = find.await.map_err(|e| query_error(e, &filter_json))?;
        let docs: Vec<BsonDocument> = cursor
            .try_collect()
            .await
            .map_err(|e| query_error(e, &filter_json))?;

        Ok(docs.into_iter().map(to_record).collect())
    }

    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Record>> {
        let pipeline_json = Value::Array(pipeline.to_vec());
        let stages = pipeline
            .iter()
            .map(value_to_bson_document)
            .collect::<Result<Vec<_>>>()?;

        let cursor = self
            .collection()
            .aggregate(stages)
            .await
            .map_err(|e| query_error(e, &pipeline_json))?;
        let docs: Vec<BsonDocument> = cursor
            .try_collect()
            .await
            .map_err(|e| query_error(e, &pipeline_json))?;

        Ok(docs.into_iter().map(to_record).collect())
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let filter_json = Value::Object(filter.clone());
        self.collection()
            .count_documents(to_bson_document(filter)?)
            .await
            .map_err(|e| query_error(e, &filter_json))
    }

    async fn update_fields(&self, id: &str, set: &Document, upsert: bool) -> Result<WriteResponse> {
        let update = doc! { "$set": to_bson_document(set)? };
        let filter = doc! { "_id": id };

        let result = self
            .collection()
            .update_one(filter, update)
            .upsert(upsert)
            .await
            .map_err(|e| query_error(e, &serde_json::json!({ "_id": id })))?;

        debug!(
            "update_one {}: matched={} modified={}",
            id, result.matched_count, result.modified_count
        );
        Ok(write_response(id, result))
    }

    async fn replace_document(&self, record: &Record, upsert: bool) -> Result<WriteResponse> {
        let id = metastore_query::record_id(record)
            .ok_or_else(|| DataError::validation("record is missing a string _id", None))?;

        let result = self
            .collection()
            .replace_one(doc! { "_id": id }, to_bson_document(record)?)
            .upsert(upsert)
            .await
            .map_err(|e| query_error(e, &serde_json::json!({ "_id": id })))?;

        Ok(write_response(id, result))
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing MongoDB source");
        self.client.clone().shutdown().await;

        if let Some(tunnel) = self.tunnel.lock().await.take() {
            tunnel.close().await?;
        }
        info!("DocDB session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connect_options() {
        let options = ConnectOptions::default();
        assert!(options.direct_connection);
        assert!(!options.retry_writes);
        assert_eq!(options.auth_source, "admin");
        assert!(!options.verify_namespace);
    }
}
