use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;
use serde_json::Value;

/// Core trait implemented by every document store backend
/// (REST gateway, direct driver connection, SSH-tunneled driver connection).
///
/// Handles are not assumed safe for concurrent use by several callers;
/// open independent handles instead.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Get the type name of this store
    fn source_type(&self) -> &'static str;

    /// Return records matching `filter`, shaped by `options`
    async fn query(&self, filter: &Filter, options: &QueryOptions) -> Result<Vec<Record>>;

    /// Run an aggregation pipeline
    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Record>>;

    /// Count records matching `filter`
    async fn count(&self, filter: &Filter) -> Result<u64>;

    /// Set the given field paths on the record with `id`.
    /// Dotted keys address nested fields; fields not named are left untouched.
    async fn update_fields(&self, id: &str, set: &Document, upsert: bool)
        -> Result<WriteResponse>;

    /// Replace the whole document identified by the record's `_id`
    async fn replace_document(&self, record: &Record, upsert: bool) -> Result<WriteResponse>;

    /// Release the handle (and any tunnel behind it)
    async fn close(&self) -> Result<()>;
}
