use thiserror::Error;

/// Unified error type for all metadata store operations
#[derive(Error, Debug)]
pub enum DataError {
    /// Missing or invalid credentials / configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unreachable host, tunnel setup failure, or authentication failure
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Filter or pipeline rejected by the backing store
    #[error("Query failed: {message}{}", filter_suffix(.filter))]
    Query {
        message: String,
        filter: Option<String>,
    },

    /// Retry budget exhausted on transient transport failures
    #[error("Transport error after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },

    /// Malformed update record
    #[error("Validation error: {message}{}", record_suffix(.record_id))]
    Validation {
        message: String,
        record_id: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database, collection, or table not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not supported by this backend
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),
}

fn filter_suffix(filter: &Option<String>) -> String {
    match filter {
        Some(f) => format!(" (filter: {})", f),
        None => String::new(),
    }
}

fn record_suffix(record_id: &Option<String>) -> String {
    match record_id {
        Some(id) => format!(" (record: {})", id),
        None => String::new(),
    }
}

impl DataError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        DataError::Configuration(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        DataError::Connection(msg.into())
    }

    /// Create a query error carrying the offending filter
    pub fn query(msg: impl Into<String>, filter: Option<&serde_json::Value>) -> Self {
        DataError::Query {
            message: msg.into(),
            filter: filter.map(|f| f.to_string()),
        }
    }

    /// Create a validation error for a specific record
    pub fn validation(msg: impl Into<String>, record_id: Option<&str>) -> Self {
        DataError::Validation {
            message: msg.into(),
            record_id: record_id.map(str::to_string),
        }
    }

    /// Create a transport error
    pub fn transport(attempts: u32, msg: impl Into<String>) -> Self {
        DataError::Transport {
            attempts,
            message: msg.into(),
        }
    }

    /// Create a "not found" error with custom message
    pub fn not_found(msg: impl Into<String>) -> Self {
        DataError::NotFound(msg.into())
    }

    /// Create an operation not supported error
    pub fn operation_not_supported(msg: impl Into<String>) -> Self {
        DataError::OperationNotSupported(msg.into())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_includes_filter() {
        let filter = serde_json::json!({"name": {"$bogus": 1}});
        let err = DataError::query("unknown operator $bogus", Some(&filter));
        let msg = err.to_string();
        assert!(msg.contains("unknown operator"));
        assert!(msg.contains("$bogus"));
        assert!(msg.contains("filter:"));
    }

    #[test]
    fn test_validation_error_includes_record() {
        let err = DataError::validation("missing _id", Some("abc-123"));
        assert_eq!(
            err.to_string(),
            "Validation error: missing _id (record: abc-123)"
        );

        let err = DataError::validation("missing _id", None);
        assert_eq!(err.to_string(), "Validation error: missing _id");
    }

    #[test]
    fn test_transport_error_message() {
        let err = DataError::transport(4, "status 503");
        assert_eq!(
            err.to_string(),
            "Transport error after 4 attempt(s): status 503"
        );
    }
}
