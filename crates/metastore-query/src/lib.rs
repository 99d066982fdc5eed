//! # metastore-query
//!
//! Core abstractions for reading and writing metadata records held in a
//! document database (DocDB).
//!
//! Backends are reached in one of three ways:
//! - a REST gateway (`metastore-query-rest`)
//! - a direct driver connection (`metastore-query-mongodb`)
//! - a driver connection through an SSH tunnel (`metastore-query-mongodb`)
//!
//! ## Architecture
//!
//! - **DocumentStore**: core trait every backend implements
//! - **CredentialsBuilder**: resolves connection settings from explicit
//!   values, environment variables and a secrets store
//! - **UpdatePlan**: turns a record into a targeted `$set`
//! - **UpdateExecutor**: upserts and partial/full updates, with dry-run
//! - **Paginator**: fixed-size batches over a query
//! - **MemoryStore**: in-memory backend for tests and local runs
//!
//! ## Example
//!
//! ```rust
//! use metastore_query::{MemoryStore, Paginator, QueryOptions, UpdateExecutor};
//! use serde_json::json;
//!
//! # async fn example() -> metastore_query::Result<()> {
//! let store = MemoryStore::new();
//!
//! let record = json!({"_id": "abc-123", "name": "asset", "location": "s3://bucket/asset"});
//! let record = record.as_object().cloned().unwrap_or_default();
//! UpdateExecutor::new(&store).upsert_one(&record).await?;
//!
//! let mut pages = Paginator::new(&store, Default::default(), QueryOptions::new(), 100)?;
//! while let Some(batch) = pages.next_batch().await? {
//!     println!("{} records", batch.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod helpers;
pub mod memory;
pub mod paginate;
pub mod traits;
pub mod types;
pub mod update;

// Re-export commonly used items
pub use config::{RestClientConfig, RetryPolicy};
pub use credentials::{
    Credentials, CredentialsBuilder, EnvSource, SecretStore, SshCredentials, StaticSecretStore,
};
pub use error::{DataError, Result};
pub use executor::UpdateExecutor;
pub use memory::MemoryStore;
pub use paginate::Paginator;
pub use traits::DocumentStore;
pub use types::{
    record_id, DataAssetRecord, Document, Filter, Projection, QueryOptions, Record, RecordCounts,
    UpsertOutcome, WriteResponse, ID_FIELD, LOCATION_FIELD, NAME_FIELD,
};
pub use update::{apply_set, get_path, is_document_corrupt, is_extended_json_value, UpdatePlan};
