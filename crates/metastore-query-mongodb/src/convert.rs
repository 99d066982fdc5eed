//! JSON <-> BSON conversion for records, filters and pipelines

use bson::{Bson, Document as BsonDocument};
use metastore_query::{DataError, Document, Record, Result};
use serde_json::Value;

/// Convert a JSON mapping into a BSON document
pub fn to_bson_document(doc: &Document) -> Result<BsonDocument> {
    bson::to_document(doc)
        .map_err(|e| DataError::Serialization(format!("Failed to convert to BSON: {}", e)))
}

/// Convert a JSON value that must be an object (e.g. a pipeline stage)
pub fn value_to_bson_document(value: &Value) -> Result<BsonDocument> {
    match value {
        Value::Object(map) => to_bson_document(map),
        other => Err(DataError::query(
            "expected a JSON object",
            Some(other),
        )),
    }
}

/// Convert a BSON document into a JSON record using relaxed extended JSON
/// (ObjectIds become `{"$oid": ...}`, dates `{"$date": ...}`)
pub fn to_record(doc: BsonDocument) -> Record {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId, DateTime};
    use metastore_query::{is_document_corrupt, UpdatePlan};
    use serde_json::json;

    #[test]
    fn test_nested_record_to_bson_and_back() {
        let record = json!({
            "_id": "abc-123",
            "subject": {"subject_id": "00000", "weights": [1.5, 2.5]},
            "count": 3
        });
        let bson_doc = value_to_bson_document(&record).unwrap();
        assert_eq!(bson_doc.get_str("_id").unwrap(), "abc-123");
        assert_eq!(
            bson_doc
                .get_document("subject")
                .unwrap()
                .get_str("subject_id")
                .unwrap(),
            "00000"
        );

        let back = to_record(bson_doc);
        assert_eq!(Value::Object(back), record);
    }

    #[test]
    fn test_object_id_becomes_extended_json() {
        let oid = ObjectId::new();
        let record = to_record(doc! {"_id": oid, "name": "x"});
        assert_eq!(record["_id"], json!({"$oid": oid.to_hex()}));
    }

    #[test]
    fn test_read_record_can_be_written_back() {
        let created = DateTime::from_millis(971_172_610_000);
        let oid = ObjectId::new();
        let record = to_record(doc! {
            "_id": "abc",
            "created": created,
            "source": {"ref": oid, "name": "asset"}
        });
        assert_eq!(record["created"], json!({"$date": "2000-10-10T10:10:10Z"}));

        let plan = UpdatePlan::from_record(&record).unwrap();
        let set = to_bson_document(&plan.set).unwrap();
        assert_eq!(set.get_datetime("created").unwrap(), &created);
        assert_eq!(
            set.get_document("source").unwrap().get_object_id("ref").unwrap(),
            oid
        );

        assert!(!is_document_corrupt(&Value::Object(record.clone())));
        let replacement = to_bson_document(&record).unwrap();
        assert_eq!(replacement.get_datetime("created").unwrap(), &created);
    }

    #[test]
    fn test_non_object_stage_rejected() {
        let err = value_to_bson_document(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, DataError::Query { .. }));
    }
}
