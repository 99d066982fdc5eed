//! REST gateway implementation of the metastore-query `DocumentStore` trait
//!
//! The gateway exposes one collection per URL:
//! `{scheme}://{host}/{version}/{database}/{collection}`.
//!
//! - `GET  {base}`: find with `filter`, `projection`, `sort`, `limit`, `skip`
//! - `GET  {base}/count_documents`: total and filtered counts
//! - `POST {base}/aggregate`: aggregation pipeline
//! - `POST {base}/update_one`: signed `$set` upsert of one record
//! - `POST {base}/bulk_write`: signed list of `UpdateOne` operations
//!
//! Every response wraps its payload as `{"body": "<json text>"}`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use metastore_query::{DocumentStore, Filter, QueryOptions, RestClientConfig};
//! use metastore_query_rest::RestClient;
//!
//! # async fn example() -> metastore_query::Result<()> {
//! let client = RestClient::new(RestClientConfig::new(
//!     "api.example.org",
//!     "metadata_index",
//!     "data_assets",
//! ))?;
//! let records = client
//!     .query(&Filter::new(), &QueryOptions::new().with_limit(10))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod signing;

pub use client::{RestClient, RetrieveOptions, DEFAULT_MAX_PAYLOAD_SIZE};
pub use signing::SigningCredentials;
