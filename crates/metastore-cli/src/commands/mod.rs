pub mod aggregate;
pub mod connection;
pub mod count;
pub mod paginate;
pub mod query;
pub mod rds;
pub mod update;

pub use aggregate::AggregateCommand;
pub use count::CountCommand;
pub use paginate::PaginateCommand;
pub use query::QueryCommand;
pub use rds::RdsCommand;
pub use update::UpdateCommand;

use metastore_query::Document;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;

/// Block on `fut` in a fresh runtime
pub(crate) fn run<T>(fut: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(fut)
}

/// Parse a JSON object argument such as `--filter`
pub(crate) fn parse_object(label: &str, raw: &str) -> anyhow::Result<Document> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => anyhow::bail!("{} must be a JSON object, got {}", label, other),
        Err(e) => anyhow::bail!("{} is not valid JSON: {}", label, e),
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object() {
        let filter = parse_object("--filter", r#"{"name": "abc"}"#).unwrap();
        assert_eq!(filter["name"], "abc");

        let err = parse_object("--filter", "[1]").unwrap_err();
        assert!(err.to_string().contains("--filter must be a JSON object"));

        assert!(parse_object("--filter", "{").is_err());
    }
}
