//! In-memory [`DocumentStore`] used by tests and local dry runs.
//!
//! Supports a useful subset of the document query language: equality on
//! (dotted) paths, the comparison operators `$eq $ne $gt $gte $lt $lte`,
//! `$in $nin $exists $regex`, and the logical `$and $or`. Any other operator
//! is rejected with [`DataError::Query`].

use crate::error::{DataError, Result};
use crate::traits::DocumentStore;
use crate::types::{Document, Filter, Projection, QueryOptions, Record, WriteResponse, ID_FIELD};
use crate::update::{apply_set, get_path};
use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::RwLock;
use tracing::debug;

/// Insertion-ordered collection of records held in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<Vec<Record>>,
    mutations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Record>) -> Self {
        Self {
            records: RwLock::new(records),
            mutations: AtomicU64::new(0),
        }
    }

    /// Number of mutating calls received
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(AtomicOrdering::SeqCst)
    }

    /// Copy of every record, in insertion order
    pub async fn snapshot(&self) -> Vec<Record> {
        self.records.read().await.clone()
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, AtomicOrdering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn source_type(&self) -> &'static str {
        "memory"
    }

    async fn query(&self, filter: &Filter, options: &QueryOptions) -> Result<Vec<Record>> {
        let records = self.records.read().await;
        let mut matched = filter_records(records.iter(), filter)?;

        if let Some(sort) = &options.sort {
            sort_records(&mut matched, sort)?;
        }

        let skip = options.skip.unwrap_or(0) as usize;
        let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let page = matched.into_iter().skip(skip).take(limit);

        let results = match &options.projection {
            Some(projection) => page
                .map(|r| project(&r, projection))
                .collect::<Result<Vec<_>>>()?,
            None => page.collect(),
        };

        debug!("memory query returned {} records", results.len());
        Ok(results)
    }

    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Record>> {
        let mut current = self.records.read().await.clone();

        for stage in pipeline {
            let (name, spec) = match stage {
                Value::Object(map) if map.len() == 1 => map
                    .iter()
                    .next()
                    .ok_or_else(|| DataError::query("empty pipeline stage", Some(stage)))?,
                _ => {
                    return Err(DataError::query(
                        "pipeline stage must have exactly one key",
                        Some(stage),
                    ))
                }
            };

            current = match (name.as_str(), spec) {
                ("$match", Value::Object(filter)) => filter_records(current.iter(), filter)?,
                ("$project", Value::Object(projection)) => current
                    .iter()
                    .map(|r| project(r, projection))
                    .collect::<Result<Vec<_>>>()?,
                ("$sort", Value::Object(sort)) => {
                    sort_records(&mut current, sort)?;
                    current
                }
                ("$skip", n) => {
                    let n = as_count(n).ok_or_else(|| DataError::query("invalid $skip", Some(stage)))?;
                    current.into_iter().skip(n).collect()
                }
                ("$limit", n) => {
                    let n = as_count(n).ok_or_else(|| DataError::query("invalid $limit", Some(stage)))?;
                    current.into_iter().take(n).collect()
                }
                ("$count", Value::String(field)) => {
                    let mut doc = Document::new();
                    doc.insert(field.clone(), Value::from(current.len() as u64));
                    vec![doc]
                }
                (other, _) => {
                    return Err(DataError::query(
                        format!("unsupported pipeline stage {}", other),
                        Some(stage),
                    ))
                }
            };
        }

        Ok(current)
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        let records = self.records.read().await;
        Ok(filter_records(records.iter(), filter)?.len() as u64)
    }

    async fn update_fields(&self, id: &str, set: &Document, upsert: bool) -> Result<WriteResponse> {
        self.record_mutation();
        let mut records = self.records.write().await;

        if let Some(existing) = records.iter_mut().find(|r| has_id(r, id)) {
            let before = existing.clone();
            apply_set(existing, set);
            let modified = u64::from(*existing != before);
            return Ok(WriteResponse {
                record_id: id.to_string(),
                matched_count: 1,
                modified_count: modified,
                upserted: false,
                dry_run: false,
                raw: None,
            });
        }

        if !upsert {
            return Ok(unmatched(id));
        }

        let mut doc = Document::new();
        doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        apply_set(&mut doc, set);
        records.push(doc);

        Ok(WriteResponse {
            record_id: id.to_string(),
            matched_count: 0,
            modified_count: 0,
            upserted: true,
            dry_run: false,
            raw: None,
        })
    }

    async fn replace_document(&self, record: &Record, upsert: bool) -> Result<WriteResponse> {
        let id = crate::types::record_id(record)
            .ok_or_else(|| DataError::validation("record is missing a string _id", None))?;
        self.record_mutation();
        let mut records = self.records.write().await;

        if let Some(existing) = records.iter_mut().find(|r| has_id(r, id)) {
            let modified = u64::from(existing != record);
            *existing = record.clone();
            return Ok(WriteResponse {
                record_id: id.to_string(),
                matched_count: 1,
                modified_count: modified,
                upserted: false,
                dry_run: false,
                raw: None,
            });
        }

        if !upsert {
            return Ok(unmatched(id));
        }

        records.push(record.clone());
        Ok(WriteResponse {
            record_id: id.to_string(),
            matched_count: 0,
            modified_count: 0,
            upserted: true,
            dry_run: false,
            raw: None,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn unmatched(id: &str) -> WriteResponse {
    WriteResponse {
        record_id: id.to_string(),
        matched_count: 0,
        modified_count: 0,
        upserted: false,
        dry_run: false,
        raw: None,
    }
}

fn has_id(record: &Record, id: &str) -> bool {
    record.get(ID_FIELD).and_then(Value::as_str) == Some(id)
}

fn as_count(value: &Value) -> Option<usize> {
    value.as_u64().map(|n| n as usize)
}

fn filter_records<'a>(
    records: impl Iterator<Item = &'a Record>,
    filter: &Filter,
) -> Result<Vec<Record>> {
    let mut matched = Vec::new();
    for record in records {
        if matches_filter(record, filter)? {
            matched.push(record.clone());
        }
    }
    Ok(matched)
}

/// Evaluate `filter` against `record`
pub fn matches_filter(record: &Record, filter: &Filter) -> Result<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => logical(record, condition, filter, |mut it| it.all(|m| m))?,
            "$or" => logical(record, condition, filter, |mut it| it.any(|m| m))?,
            op if op.starts_with('$') => {
                return Err(DataError::query(
                    format!("unknown operator {}", op),
                    Some(&Value::Object(filter.clone())),
                ))
            }
            path => matches_condition(get_path(record, path), condition, filter)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical(
    record: &Record,
    condition: &Value,
    filter: &Filter,
    combine: impl Fn(std::vec::IntoIter<bool>) -> bool,
) -> Result<bool> {
    let clauses = condition.as_array().ok_or_else(|| {
        DataError::query(
            "$and/$or expects an array of filters",
            Some(&Value::Object(filter.clone())),
        )
    })?;

    let mut results = Vec::with_capacity(clauses.len());
    for clause in clauses {
        let clause = clause.as_object().ok_or_else(|| {
            DataError::query(
                "$and/$or clauses must be objects",
                Some(&Value::Object(filter.clone())),
            )
        })?;
        results.push(matches_filter(record, clause)?);
    }
    Ok(combine(results.into_iter()))
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn matches_condition(field: Option<&Value>, condition: &Value, filter: &Filter) -> Result<bool> {
    if !is_operator_object(condition) {
        return Ok(equals(field, condition));
    }

    let ops = match condition {
        Value::Object(map) => map,
        _ => return Ok(false),
    };
    let query_error = |msg: String| DataError::query(msg, Some(&Value::Object(filter.clone())));

    for (op, operand) in ops {
        let matched = match op.as_str() {
            "$eq" => equals(field, operand),
            "$ne" => !equals(field, operand),
            "$gt" => compare(field, operand) == Some(Ordering::Greater),
            "$gte" => matches!(
                compare(field, operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            "$lt" => compare(field, operand) == Some(Ordering::Less),
            "$lte" => matches!(compare(field, operand), Some(Ordering::Less | Ordering::Equal)),
            "$in" => {
                let candidates = operand
                    .as_array()
                    .ok_or_else(|| query_error("$in expects an array".to_string()))?;
                candidates.iter().any(|c| equals(field, c))
            }
            "$nin" => {
                let candidates = operand
                    .as_array()
                    .ok_or_else(|| query_error("$nin expects an array".to_string()))?;
                !candidates.iter().any(|c| equals(field, c))
            }
            "$exists" => {
                let wanted = operand.as_bool().unwrap_or(true);
                field.is_some() == wanted
            }
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or_else(|| query_error("$regex expects a string".to_string()))?;
                let case_insensitive = ops
                    .get("$options")
                    .and_then(Value::as_str)
                    .map(|o| o.contains('i'))
                    .unwrap_or(false);
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(case_insensitive)
                    .build()
                    .map_err(|e| query_error(format!("invalid $regex: {}", e)))?;
                matches!(field, Some(Value::String(s)) if re.is_match(s))
            }
            "$options" => true,
            other => return Err(query_error(format!("unknown operator {}", other))),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with array-membership semantics for array fields
fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(value) if value == expected => true,
        Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, expected)),
        Some(value) => values_equal(value, expected),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(field: Option<&Value>, operand: &Value) -> Option<Ordering> {
    match (field?, operand) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| match (a, b) {
            (Some(x), Some(y)) => compare(Some(x), y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        })
}

fn sort_records(records: &mut [Record], sort: &Document) -> Result<()> {
    let mut keys = Vec::with_capacity(sort.len());
    for (path, direction) in sort {
        let descending = match direction.as_i64() {
            Some(1) => false,
            Some(-1) => true,
            _ => {
                return Err(DataError::query(
                    format!("invalid sort direction for {}", path),
                    Some(&Value::Object(sort.clone())),
                ))
            }
        };
        keys.push((path.as_str(), descending));
    }

    records.sort_by(|a, b| {
        keys.iter()
            .map(|(path, descending)| {
                let ord = sort_order(get_path(a, path), get_path(b, path));
                if *descending {
                    ord.reverse()
                } else {
                    ord
                }
            })
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    Ok(())
}

fn is_included(flag: &Value) -> bool {
    match flag {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

/// Apply an inclusion or exclusion projection. `_id` is kept unless
/// explicitly excluded.
pub fn project(record: &Record, projection: &Projection) -> Result<Record> {
    let include_id = projection.get(ID_FIELD).map(is_included).unwrap_or(true);
    let fields: Vec<(&String, bool)> = projection
        .iter()
        .filter(|(k, _)| k.as_str() != ID_FIELD)
        .map(|(k, v)| (k, is_included(v)))
        .collect();

    if fields.iter().any(|(_, inc)| *inc) && fields.iter().any(|(_, inc)| !*inc) {
        return Err(DataError::query(
            "cannot mix inclusion and exclusion in a projection",
            Some(&Value::Object(projection.clone())),
        ));
    }

    let inclusion = fields.iter().any(|(_, inc)| *inc) || (fields.is_empty() && !include_id);

    let mut out = if inclusion {
        let mut out = Document::new();
        if include_id {
            if let Some(id) = record.get(ID_FIELD) {
                out.insert(ID_FIELD.to_string(), id.clone());
            }
        }
        for (path, _) in &fields {
            if let Some(value) = get_path(record, path) {
                let mut set = Document::new();
                set.insert((*path).clone(), value.clone());
                apply_set(&mut out, &set);
            }
        }
        out
    } else {
        let mut out = record.clone();
        for (path, _) in &fields {
            remove_path(&mut out, path);
        }
        out
    };

    if !include_id {
        out.remove(ID_FIELD);
    }
    Ok(out)
}

fn remove_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn sample_store() -> MemoryStore {
        MemoryStore::with_records(vec![
            doc(json!({"_id": "1", "name": "a", "subject": {"id": 10}, "tags": ["x", "y"]})),
            doc(json!({"_id": "2", "name": "b", "subject": {"id": 20}, "tags": ["y"]})),
            doc(json!({"_id": "3", "name": "c", "subject": {"id": 30}})),
        ])
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records
            .iter()
            .filter_map(|r| r.get("_id").and_then(Value::as_str))
            .collect()
    }

    #[tokio::test]
    async fn test_query_operators() {
        let store = sample_store();
        let opts = QueryOptions::new();

        let r = store
            .query(&doc(json!({"subject.id": {"$gte": 20}})), &opts)
            .await
            .unwrap();
        assert_eq!(ids(&r), vec!["2", "3"]);

        let r = store.query(&doc(json!({"tags": "y"})), &opts).await.unwrap();
        assert_eq!(ids(&r), vec!["1", "2"]);

        let r = store
            .query(&doc(json!({"tags": {"$exists": false}})), &opts)
            .await
            .unwrap();
        assert_eq!(ids(&r), vec!["3"]);

        let r = store
            .query(
                &doc(json!({"$or": [{"name": "a"}, {"name": {"$regex": "^C$", "$options": "i"}}]})),
                &opts,
            )
            .await
            .unwrap();
        assert_eq!(ids(&r), vec!["1", "3"]);

        let r = store
            .query(&doc(json!({"name": {"$nin": ["a", "b"]}})), &opts)
            .await
            .unwrap();
        assert_eq!(ids(&r), vec!["3"]);
    }

    #[tokio::test]
    async fn test_unknown_operator_rejected() {
        let store = sample_store();
        let err = store
            .query(&doc(json!({"name": {"$bogus": 1}})), &QueryOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Query { filter: Some(_), .. }));

        let err = store.count(&doc(json!({"$where": "1"}))).await.unwrap_err();
        assert!(matches!(err, DataError::Query { .. }));
    }

    #[tokio::test]
    async fn test_zero_matches() {
        let store = sample_store();
        let filter = doc(json!({"name": "missing"}));
        assert!(store
            .query(&filter, &QueryOptions::new())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.count(&filter).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sort_skip_limit_projection() {
        let store = sample_store();
        let opts = QueryOptions::new()
            .with_sort(doc(json!({"subject.id": -1})))
            .with_skip(1)
            .with_limit(1)
            .with_projection(doc(json!({"name": 1})));
        let r = store.query(&Filter::new(), &opts).await.unwrap();
        assert_eq!(r, vec![doc(json!({"_id": "2", "name": "b"}))]);
    }

    #[test]
    fn test_projection_modes() {
        let record = doc(json!({"_id": "1", "a": {"b": 1, "c": 2}, "d": 3}));

        let p = project(&record, &doc(json!({"a.b": 1, "_id": 0}))).unwrap();
        assert_eq!(p, doc(json!({"a": {"b": 1}})));

        let p = project(&record, &doc(json!({"a.c": 0, "d": 0}))).unwrap();
        assert_eq!(p, doc(json!({"_id": "1", "a": {"b": 1}})));

        assert!(project(&record, &doc(json!({"a": 1, "d": 0}))).is_err());
    }

    #[tokio::test]
    async fn test_aggregate_pipeline() {
        let store = sample_store();
        let pipeline = vec![
            json!({"$match": {"name": {"$in": ["a", "c"]}}}),
            json!({"$project": {"name": 1, "_id": 0}}),
        ];
        let r = store.aggregate(&pipeline).await.unwrap();
        assert_eq!(r, vec![doc(json!({"name": "a"})), doc(json!({"name": "c"}))]);

        let r = store
            .aggregate(&[json!({"$match": {}}), json!({"$count": "n"})])
            .await
            .unwrap();
        assert_eq!(r, vec![doc(json!({"n": 3}))]);

        let err = store.aggregate(&[json!({"$lookup": {}})]).await.unwrap_err();
        assert!(matches!(err, DataError::Query { .. }));
    }

    #[tokio::test]
    async fn test_update_fields_and_upsert() {
        let store = sample_store();

        let r = store
            .update_fields("1", &doc(json!({"subject.id": 11})), false)
            .await
            .unwrap();
        assert_eq!((r.matched_count, r.modified_count, r.upserted), (1, 1, false));

        let r = store
            .update_fields("9", &doc(json!({"name": "z"})), false)
            .await
            .unwrap();
        assert_eq!((r.matched_count, r.upserted), (0, false));
        assert_eq!(store.count(&Filter::new()).await.unwrap(), 3);

        let r = store
            .update_fields("9", &doc(json!({"name": "z"})), true)
            .await
            .unwrap();
        assert!(r.upserted);

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot[0]["subject"], json!({"id": 11}));
        assert_eq!(snapshot[3], doc(json!({"_id": "9", "name": "z"})));
        assert_eq!(store.mutation_count(), 3);
    }

    #[tokio::test]
    async fn test_replace_document() {
        let store = sample_store();
        let r = store
            .replace_document(&doc(json!({"_id": "2", "name": "new"})), false)
            .await
            .unwrap();
        assert_eq!(r.modified_count, 1);
        assert_eq!(store.snapshot().await[1], doc(json!({"_id": "2", "name": "new"})));
    }
}
