use crate::error::{DataError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier field present on every record
pub const ID_FIELD: &str = "_id";
/// Record name field
pub const NAME_FIELD: &str = "name";
/// Field holding the URI where the full metadata lives
pub const LOCATION_FIELD: &str = "location";

/// Insertion-ordered JSON mapping
pub type Document = serde_json::Map<String, Value>;

/// A metadata record as returned by the store
pub type Record = Document;

/// Field predicates for a query
pub type Filter = Document;

/// Subset of fields to return (`{"field": 1}` includes, `{"field": 0}` excludes)
pub type Projection = Document;

/// Return the `_id` of a record if it is a non-empty string
pub fn record_id(record: &Record) -> Option<&str> {
    record
        .get(ID_FIELD)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Build a filter matching a single field value
pub fn eq_filter(field: &str, value: impl Into<Value>) -> Filter {
    let mut filter = Filter::new();
    filter.insert(field.to_string(), value.into());
    filter
}

/// Options controlling a single query call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Fields to return
    pub projection: Option<Projection>,
    /// Sort specification (`{"field": 1}` ascending, `-1` descending)
    pub sort: Option<Document>,
    /// Maximum number of records to return
    pub limit: Option<u64>,
    /// Number of matching records to skip
    pub skip: Option<u64>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Document) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// Record counts reported by the gateway's count endpoint
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub total_record_count: u64,
    pub filtered_record_count: u64,
}

/// Outcome of a single write against the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Identifier of the written record
    pub record_id: String,
    /// Number of documents matched by the write filter
    pub matched_count: u64,
    /// Number of documents actually changed
    pub modified_count: u64,
    /// Whether the write inserted a new document
    pub upserted: bool,
    /// True when no mutating call was issued
    pub dry_run: bool,
    /// Raw backend response, when one is available
    pub raw: Option<Value>,
}

impl WriteResponse {
    /// Response recorded for a dry-run write
    pub fn dry_run(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            matched_count: 0,
            modified_count: 0,
            upserted: false,
            dry_run: true,
            raw: None,
        }
    }
}

/// Per-record result of a batch upsert
#[derive(Debug)]
pub struct UpsertOutcome {
    /// Record identifier, if the record carried one
    pub record_id: Option<String>,
    pub result: Result<WriteResponse>,
}

impl UpsertOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Typed view over the common fields of a data asset record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAssetRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Any other fields (subject, instrument, session, ...)
    #[serde(flatten)]
    pub extra: Document,
}

impl DataAssetRecord {
    /// Convert into an untyped record
    pub fn into_record(self) -> Result<Record> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(DataError::Serialization(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }
}

impl TryFrom<Record> for DataAssetRecord {
    type Error = DataError;

    fn try_from(record: Record) -> Result<Self> {
        let id = record_id(&record).map(str::to_string);
        serde_json::from_value(Value::Object(record)).map_err(|e| {
            DataError::validation(format!("not a data asset record: {}", e), id.as_deref())
        })
    }
}
