//! Update planning: turning a record into a targeted `$set`.
//!
//! A key containing `.` addresses a nested field (`"a.b"` sets only `b`
//! inside `a`). A plain key replaces the whole top-level value. When both
//! forms name the same root, the dotted value is merged into the top-level
//! value, so the more specific path wins and no two `$set` paths overlap.

use crate::error::{DataError, Result};
use crate::types::{record_id, Document, Record, ID_FIELD};
use serde_json::{json, Value};

/// A validated partial update for one record
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    pub record_id: String,
    /// Field paths to set, in record order; never contains `_id`
    pub set: Document,
}

impl UpdatePlan {
    /// Plan an update from a record carrying its `_id`
    pub fn from_record(record: &Record) -> Result<Self> {
        let id = record_id(record)
            .ok_or_else(|| DataError::validation("record is missing a string _id", None))?
            .to_string();

        let fields: Document = record
            .iter()
            .filter(|(k, _)| k.as_str() != ID_FIELD)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self::for_fields(id, &fields)
    }

    /// Plan an update of `fields` on the record with `record_id`
    pub fn for_fields(record_id: impl Into<String>, fields: &Document) -> Result<Self> {
        let record_id = record_id.into();
        validate_update_keys(fields).map_err(|msg| DataError::validation(msg, Some(&record_id)))?;

        let set = merge_paths(fields.iter().filter(|(k, _)| k.as_str() != ID_FIELD));
        Ok(Self { record_id, set })
    }

    /// The update document sent to the store
    pub fn update_document(&self) -> Value {
        json!({ "$set": self.set })
    }

    /// Filter selecting the planned record
    pub fn filter(&self) -> Document {
        crate::types::eq_filter(ID_FIELD, self.record_id.clone())
    }
}

/// Check that update keys can be expressed as `$set` paths
fn validate_update_keys(fields: &Document) -> std::result::Result<(), String> {
    for (key, value) in fields {
        if key.starts_with('$') {
            return Err(format!("field '{}' may not start with '$'", key));
        }
        if key.split('.').any(str::is_empty) {
            return Err(format!("field '{}' has an empty path segment", key));
        }
        validate_nested_keys(value, key)?;
    }
    Ok(())
}

/// Type wrappers produced by relaxed extended JSON (`{"$date": ...}`,
/// `{"$oid": ...}` and so on)
const EXTENDED_JSON_KEYS: [&str; 14] = [
    "$oid",
    "$date",
    "$numberLong",
    "$numberInt",
    "$numberDouble",
    "$numberDecimal",
    "$binary",
    "$uuid",
    "$timestamp",
    "$regularExpression",
    "$symbol",
    "$code",
    "$minKey",
    "$maxKey",
];

/// True for a single-key mapping that encodes a typed value in extended JSON
pub fn is_extended_json_value(map: &Document) -> bool {
    map.len() == 1
        && map
            .keys()
            .next()
            .is_some_and(|key| EXTENDED_JSON_KEYS.contains(&key.as_str()))
}

fn validate_nested_keys(value: &Value, parent: &str) -> std::result::Result<(), String> {
    match value {
        Value::Object(map) if is_extended_json_value(map) => Ok(()),
        Value::Object(map) => {
            for (key, child) in map {
                if key.starts_with('$') || key.contains('.') {
                    return Err(format!(
                        "nested field '{}' under '{}' may not contain '.' or start with '$'",
                        key, parent
                    ));
                }
                validate_nested_keys(child, key)?;
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| validate_nested_keys(item, parent)),
        _ => Ok(()),
    }
}

/// Fold paths so that none is a prefix of another, keeping record order
fn merge_paths<'a>(entries: impl Iterator<Item = (&'a String, &'a Value)>) -> Document {
    let mut ordered: Vec<(usize, &String, &Value)> = entries
        .enumerate()
        .map(|(i, (k, v))| (i, k, v))
        .collect();
    // Shorter paths first so that longer ones can be folded into them
    ordered.sort_by_key(|(i, k, _)| (k.split('.').count(), *i));

    let mut accepted: Vec<(usize, String, Value)> = Vec::new();
    for (index, path, value) in ordered {
        let owner = accepted
            .iter_mut()
            .find(|(_, existing, _)| is_path_prefix(existing, path));

        match owner {
            Some((_, existing, target)) => {
                let rest: Vec<&str> = path[existing.len() + 1..].split('.').collect();
                set_value_path(target, &rest, value.clone());
            }
            None => accepted.push((index, path.clone(), value.clone())),
        }
    }

    accepted.sort_by_key(|(i, _, _)| *i);
    accepted.into_iter().map(|(_, k, v)| (k, v)).collect()
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'.'
}

/// Set `value` at `segments` below `target`, replacing non-mapping intermediates
fn set_value_path(target: &mut Value, segments: &[&str], value: Value) {
    if !target.is_object() {
        *target = Value::Object(Document::new());
    }
    if let Value::Object(map) = target {
        set_path(map, segments, value);
    }
}

fn set_path(doc: &mut Document, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            doc.insert((*last).to_string(), value);
        }
        [head, rest @ ..] => {
            let child = doc
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            set_value_path(child, rest, value);
        }
    }
}

/// Apply a `$set` mapping to `doc` in place
pub fn apply_set(doc: &mut Document, set: &Document) {
    for (path, value) in set {
        let segments: Vec<&str> = path.split('.').collect();
        set_path(doc, &segments, value.clone());
    }
}

/// Look up a possibly dotted path
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// True if `value` is not a mapping, or any key at any depth contains `.` or
/// starts with `$`. Extended JSON type wrappers are values, not keys.
pub fn is_document_corrupt(value: &Value) -> bool {
    match value {
        Value::Object(map) => has_forbidden_keys(map),
        _ => true,
    }
}

fn has_forbidden_keys(map: &Document) -> bool {
    map.iter().any(|(key, value)| {
        key.contains('.')
            || key.starts_with('$')
            || has_forbidden_nested_keys(value)
    })
}

fn has_forbidden_nested_keys(value: &Value) -> bool {
    match value {
        Value::Object(child) if is_extended_json_value(child) => false,
        Value::Object(child) => has_forbidden_keys(child),
        Value::Array(items) => items.iter().any(has_forbidden_nested_keys),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_plan_requires_id() {
        let err = UpdatePlan::from_record(&doc(json!({"name": "x"}))).unwrap_err();
        assert!(matches!(err, DataError::Validation { record_id: None, .. }));
    }

    #[test]
    fn test_plan_excludes_id_from_set() {
        let plan = UpdatePlan::from_record(&doc(json!({"_id": "abc", "name": "x"}))).unwrap();
        assert_eq!(plan.record_id, "abc");
        assert_eq!(plan.set, doc(json!({"name": "x"})));
        assert_eq!(plan.update_document(), json!({"$set": {"name": "x"}}));
        assert_eq!(plan.filter(), doc(json!({"_id": "abc"})));
    }

    #[test]
    fn test_dotted_key_stays_targeted() {
        let plan =
            UpdatePlan::from_record(&doc(json!({"_id": "abc", "a.b": "v", "name": "n"}))).unwrap();
        assert_eq!(plan.set, doc(json!({"a.b": "v", "name": "n"})));
    }

    #[test]
    fn test_dotted_path_wins_over_top_level() {
        let plan = UpdatePlan::from_record(&doc(json!({
            "_id": "abc",
            "a.b": "dotted",
            "a": {"b": "plain", "c": 1}
        })))
        .unwrap();
        assert_eq!(plan.set, doc(json!({"a": {"b": "dotted", "c": 1}})));
    }

    #[test]
    fn test_nested_dotted_keys_fold_into_shorter_path() {
        let plan = UpdatePlan::from_record(&doc(json!({
            "_id": "abc",
            "a.b": {"x": 1},
            "a.b.y": 2
        })))
        .unwrap();
        assert_eq!(plan.set, doc(json!({"a.b": {"x": 1, "y": 2}})));
    }

    #[test]
    fn test_forbidden_keys_rejected() {
        let err = UpdatePlan::from_record(&doc(json!({"_id": "abc", "$set": {}}))).unwrap_err();
        assert!(matches!(err, DataError::Validation { record_id: Some(ref id), .. } if id == "abc"));

        let err =
            UpdatePlan::from_record(&doc(json!({"_id": "abc", "a": {"b.c": 1}}))).unwrap_err();
        assert!(err.to_string().contains("b.c"));

        assert!(UpdatePlan::from_record(&doc(json!({"_id": "abc", "a..b": 1}))).is_err());
    }

    #[test]
    fn test_apply_set_keeps_siblings() {
        let mut record = doc(json!({"_id": "X", "a": {"b": "old", "c": "keep"}}));
        let plan = UpdatePlan::from_record(&doc(json!({"_id": "X", "a.b": "v"}))).unwrap();
        apply_set(&mut record, &plan.set);
        assert_eq!(record, doc(json!({"_id": "X", "a": {"b": "v", "c": "keep"}})));
    }

    #[test]
    fn test_apply_set_replaces_scalar_intermediate() {
        let mut record = doc(json!({"a": 5}));
        apply_set(&mut record, &doc(json!({"a.b.c": true})));
        assert_eq!(record, doc(json!({"a": {"b": {"c": true}}})));
    }

    #[test]
    fn test_get_path() {
        let record = doc(json!({"a": {"b": [{"c": 1}]}, "name": "n"}));
        assert_eq!(get_path(&record, "name"), Some(&json!("n")));
        assert_eq!(get_path(&record, "a.b.0.c"), Some(&json!(1)));
        assert_eq!(get_path(&record, "a.x"), None);
        assert_eq!(get_path(&record, "name.x"), None);
    }

    #[test]
    fn test_is_document_corrupt() {
        assert!(!is_document_corrupt(&json!({"a": {"b": [{"c": 1}]}})));
        assert!(is_document_corrupt(&json!({"a": {"b.c": 1}})));
        assert!(is_document_corrupt(&json!({"$a": 1})));
        assert!(is_document_corrupt(&json!({"a": [{"$b": 1}]})));
        assert!(is_document_corrupt(&json!([1, 2])));
        assert!(is_document_corrupt(&json!("text")));
    }

    #[test]
    fn test_extended_json_values_are_not_keys() {
        let record = doc(json!({
            "_id": "abc",
            "created": {"$date": "2000-10-10T10:10:10Z"},
            "source": {"ref": {"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"}, "size": {"$numberLong": "9"}},
            "runs": [{"at": {"$date": {"$numberLong": "971172610000"}}}]
        }));

        let plan = UpdatePlan::from_record(&record).unwrap();
        assert_eq!(plan.set["created"], json!({"$date": "2000-10-10T10:10:10Z"}));
        assert!(!is_document_corrupt(&Value::Object(record)));

        // Wrappers only pass as single-key values
        assert!(UpdatePlan::from_record(&doc(json!({
            "_id": "abc",
            "created": {"$date": "2000-10-10T10:10:10Z", "extra": 1}
        })))
        .is_err());
        assert!(is_document_corrupt(&json!({"a": {"$set": 1}})));
    }
}
