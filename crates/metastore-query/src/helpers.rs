//! Convenience lookups built on [`DocumentStore`]

use crate::error::{DataError, Result};
use crate::traits::DocumentStore;
use crate::types::{
    eq_filter, Projection, QueryOptions, Record, ID_FIELD, LOCATION_FIELD, NAME_FIELD,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use url::Url;

/// Bucket and prefix parsed from an `s3://bucket/prefix` location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub prefix: String,
}

/// `s3://{bucket}/{prefix}` with slashes trimmed from the prefix
pub fn s3_location(bucket: &str, prefix: &str) -> String {
    format!("s3://{}/{}", bucket, prefix.trim_matches('/'))
}

/// Split a location URL into bucket and prefix. The scheme is not checked.
pub fn s3_bucket_and_prefix(location: &str) -> Result<S3Location> {
    let url = Url::parse(location)
        .map_err(|e| DataError::validation(format!("invalid location '{}': {}", location, e), None))?;
    Ok(S3Location {
        bucket: url.host_str().unwrap_or_default().to_string(),
        prefix: url.path().trim_matches('/').to_string(),
    })
}

/// Whether any record has the location built from `bucket` and `prefix`
pub async fn record_exists_at_location(
    store: &dyn DocumentStore,
    bucket: &str,
    prefix: &str,
) -> Result<bool> {
    let filter = eq_filter(LOCATION_FIELD, s3_location(bucket, prefix));
    let options = QueryOptions::new()
        .with_projection(id_only())
        .with_limit(1);
    Ok(!store.query(&filter, &options).await?.is_empty())
}

pub async fn get_record_by_id(store: &dyn DocumentStore, id: &str) -> Result<Option<Record>> {
    let records = store
        .query(&eq_filter(ID_FIELD, id), &QueryOptions::new().with_limit(1))
        .await?;
    Ok(records.into_iter().next())
}

pub async fn get_projected_record_by_id(
    store: &dyn DocumentStore,
    id: &str,
    projection: Projection,
) -> Result<Option<Record>> {
    let options = QueryOptions::new()
        .with_projection(projection)
        .with_limit(1);
    let records = store.query(&eq_filter(ID_FIELD, id), &options).await?;
    Ok(records.into_iter().next())
}

/// Fetch a single field of a record; the result also carries `_id`
pub async fn get_field_by_id(
    store: &dyn DocumentStore,
    id: &str,
    field: &str,
) -> Result<Option<Record>> {
    let mut projection = Projection::new();
    projection.insert(field.to_string(), json!(1));
    get_projected_record_by_id(store, id, projection).await
}

/// `_id` of the first record with the given name
pub async fn get_id_from_name(store: &dyn DocumentStore, name: &str) -> Result<Option<String>> {
    let options = QueryOptions::new()
        .with_projection(id_only())
        .with_limit(1);
    let records = store.query(&eq_filter(NAME_FIELD, name), &options).await?;
    Ok(records
        .first()
        .and_then(|r| r.get(ID_FIELD))
        .and_then(Value::as_str)
        .map(str::to_string))
}

/// Records whose `key` is one of `values`, via a `$match`/`$in` pipeline
pub async fn fetch_records_by_filter_list(
    store: &dyn DocumentStore,
    key: &str,
    values: &[Value],
    projection: Option<Projection>,
) -> Result<Vec<Record>> {
    let mut pipeline = vec![json!({"$match": {key: {"$in": values}}})];
    if let Some(projection) = projection.filter(|p| !p.is_empty()) {
        pipeline.push(json!({ "$project": projection }));
    }
    store.aggregate(&pipeline).await
}

/// Map `s3://bucket/prefix` to record `_id` for each prefix that has a record.
/// Prefixes without a record are absent from the map.
pub async fn build_location_to_id_map(
    store: &dyn DocumentStore,
    bucket: &str,
    prefixes: &[&str],
) -> Result<HashMap<String, String>> {
    let locations: Vec<String> = prefixes.iter().map(|p| s3_location(bucket, p)).collect();
    let filter = match json!({ LOCATION_FIELD: { "$in": locations } }) {
        Value::Object(map) => map,
        _ => unreachable!("json! object literal"),
    };
    let mut projection = id_only();
    projection.insert(LOCATION_FIELD.to_string(), json!(1));

    let records = store
        .query(&filter, &QueryOptions::new().with_projection(projection))
        .await?;

    Ok(records
        .iter()
        .filter_map(|r| {
            let location = r.get(LOCATION_FIELD)?.as_str()?;
            let id = r.get(ID_FIELD)?.as_str()?;
            Some((location.to_string(), id.to_string()))
        })
        .collect())
}

fn id_only() -> Projection {
    let mut projection = Projection::new();
    projection.insert(ID_FIELD.to_string(), json!(1));
    projection
}
