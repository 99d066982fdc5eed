//! Connection builder and convenience client for the metadata store
//!
//! [`connect`] turns a [`ConnectionMode`] into a boxed [`DocumentStore`];
//! [`MetadataDbClient`] wraps one and exposes queries, pagination and
//! updates. [`MetadataDbClient::scoped`] closes the connection, and any SSH
//! tunnel behind it, whether the body succeeds or fails.
//!
//! ## Example
//!
//! ```rust,no_run
//! use metastore_client::{ConnectionMode, MetadataDbClient};
//! use metastore_query::{Filter, RestClientConfig};
//!
//! # async fn example() -> metastore_query::Result<()> {
//! let mode = ConnectionMode::Rest(RestClientConfig::new(
//!     "api.example.org",
//!     "metadata_index",
//!     "data_assets",
//! ));
//!
//! let count = MetadataDbClient::scoped(mode, |client| {
//!     Box::pin(async move { client.count(&Filter::new()).await })
//! })
//! .await?;
//! println!("{} records", count);
//! # Ok(())
//! # }
//! ```

mod secrets;

use futures::future::BoxFuture;
use metastore_query::{
    Credentials, DataError, Document, DocumentStore, Filter, Paginator, Projection, QueryOptions,
    Record, RestClientConfig, Result, SshCredentials, UpdateExecutor, UpsertOutcome,
    WriteResponse,
};
use metastore_query_mongodb::{ConnectOptions, MongoDBSource};
use metastore_query_rest::RestClient;
use serde_json::Value;
use tracing::{debug, error, info};

pub use secrets::AwsSecretsManager;

/// How to reach the document store
#[derive(Debug, Clone)]
pub enum ConnectionMode {
    /// HTTPS gateway in front of the store
    Rest(RestClientConfig),
    /// Driver connection to a reachable host
    Direct(Credentials),
    /// Driver connection through an SSH tunnel
    SshTunnel(SshCredentials),
}

impl ConnectionMode {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionMode::Rest(_) => "rest",
            ConnectionMode::Direct(_) => "direct",
            ConnectionMode::SshTunnel(_) => "ssh",
        }
    }
}

/// Open a store handle for `mode`
pub async fn connect(mode: ConnectionMode) -> Result<Box<dyn DocumentStore>> {
    debug!("Connecting in {} mode", mode.name());

    let store: Box<dyn DocumentStore> = match mode {
        ConnectionMode::Rest(config) => Box::new(RestClient::new(config)?),
        ConnectionMode::Direct(credentials) => {
            let options = ConnectOptions {
                verify_namespace: true,
                ..ConnectOptions::default()
            };
            Box::new(MongoDBSource::connect(&credentials, options).await?)
        }
        ConnectionMode::SshTunnel(credentials) => {
            Box::new(MongoDBSource::connect_via_tunnel(&credentials).await?)
        }
    };

    Ok(store)
}

/// Convenience client over any [`DocumentStore`]
pub struct MetadataDbClient {
    store: Box<dyn DocumentStore>,
}

impl MetadataDbClient {
    pub async fn connect(mode: ConnectionMode) -> Result<Self> {
        Ok(Self::from_store(connect(mode).await?))
    }

    pub fn from_store(store: Box<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Connect, run `body`, then close the connection. The close happens on
    /// both success and failure; a body error takes precedence over a close
    /// error.
    pub async fn scoped<T, F>(mode: ConnectionMode, body: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c MetadataDbClient) -> BoxFuture<'c, Result<T>>,
    {
        let client = Self::connect(mode).await?;
        client.run_scoped(body).await
    }

    /// Run `body` against this client, then close it
    pub async fn run_scoped<T, F>(self, body: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c MetadataDbClient) -> BoxFuture<'c, Result<T>>,
    {
        let outcome = body(&self).await;
        let closed = self.close().await;

        match (outcome, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                error!("Failed to close connection after error: {}", close_err);
                Err(e)
            }
        }
    }

    pub fn store(&self) -> &dyn DocumentStore {
        self.store.as_ref()
    }

    /// Records matching `filter`, optionally projected and limited
    pub async fn retrieve_records(
        &self,
        filter: &Filter,
        projection: Option<Projection>,
        limit: Option<u64>,
    ) -> Result<Vec<Record>> {
        let mut options = QueryOptions::new();
        options.projection = projection;
        options.limit = limit;
        self.store.query(filter, &options).await
    }

    pub async fn query(&self, filter: &Filter, options: &QueryOptions) -> Result<Vec<Record>> {
        self.store.query(filter, options).await
    }

    pub async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Record>> {
        self.store.aggregate(pipeline).await
    }

    pub async fn count(&self, filter: &Filter) -> Result<u64> {
        self.store.count(filter).await
    }

    /// Batches of `batch_size` records matching `filter`
    pub fn paginate(
        &self,
        filter: Filter,
        options: QueryOptions,
        batch_size: u64,
    ) -> Result<Paginator<'_>> {
        Paginator::new(self.store.as_ref(), filter, options, batch_size)
    }

    /// Executor for writes; with `dry_run` nothing is sent to the store
    pub fn executor(&self, dry_run: bool) -> UpdateExecutor<'_> {
        UpdateExecutor::new(self.store.as_ref()).with_dry_run(dry_run)
    }

    pub async fn upsert_one(&self, record: &Record) -> Result<WriteResponse> {
        self.executor(false).upsert_one(record).await
    }

    pub async fn upsert_many(&self, records: &[Record]) -> Vec<UpsertOutcome> {
        self.executor(false).upsert_many(records).await
    }

    pub async fn update_partial(&self, id: &str, fields: &Document) -> Result<WriteResponse> {
        self.executor(false).update_partial(id, fields).await
    }

    pub async fn close(self) -> Result<()> {
        let source_type = self.store.source_type();
        self.store.close().await.map_err(|e| {
            error!("Failed to close {} connection: {}", source_type, e);
            match e {
                DataError::Connection(_) => e,
                other => DataError::connection(other.to_string()),
            }
        })?;
        info!("Closed {} connection", source_type);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_query::MemoryStore;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn client_with(records: Vec<Value>) -> MetadataDbClient {
        let records = records.into_iter().map(record).collect();
        MetadataDbClient::from_store(Box::new(MemoryStore::with_records(records)))
    }

    #[tokio::test]
    async fn test_rest_mode_builds_without_network() {
        let mode = ConnectionMode::Rest(RestClientConfig::new(
            "api.example.org",
            "metadata_index",
            "data_assets",
        ));
        assert_eq!(mode.name(), "rest");

        let store = connect(mode).await.unwrap();
        assert_eq!(store.source_type(), "rest");
    }

    #[tokio::test]
    async fn test_retrieve_records_applies_projection_and_limit() {
        let client = client_with(vec![
            json!({"_id": "a", "name": "one", "extra": 1}),
            json!({"_id": "b", "name": "two", "extra": 2}),
        ]);
        let projection = record(json!({"name": 1}));

        let records = client
            .retrieve_records(&Filter::new(), Some(projection), Some(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(Value::Object(records[0].clone()), json!({"_id": "a", "name": "one"}));
    }

    #[tokio::test]
    async fn test_dry_run_executor_leaves_store_untouched() {
        let client = client_with(vec![json!({"_id": "a", "name": "one"})]);

        let response = client
            .executor(true)
            .upsert_one(&record(json!({"_id": "a", "name": "changed"})))
            .await
            .unwrap();
        assert!(response.dry_run);

        let records = client.retrieve_records(&Filter::new(), None, None).await.unwrap();
        assert_eq!(records[0]["name"], "one");
    }

    #[tokio::test]
    async fn test_run_scoped_returns_body_error() {
        let client = client_with(vec![]);
        let err = client
            .run_scoped(|_| Box::pin(async { Err::<(), _>(DataError::validation("bad", None)) }))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Validation { .. }));
    }
}
