use super::connection::ConnectionArgs;
use super::{print_json, run};
use clap::Args;
use metastore_query::{record_id, DataError, Record, UpdateExecutor, UpsertOutcome, ID_FIELD};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Args)]
pub struct UpdateCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// JSON file holding one record or an array of records, each with an `_id`
    #[arg(long)]
    pub file: PathBuf,

    /// Validate and log only; send no writes
    #[arg(long)]
    pub dry_run: bool,

    /// Set only the given (possibly dotted) fields on existing records
    #[arg(long, conflicts_with = "replace")]
    pub partial: bool,

    /// Replace existing records wholesale
    #[arg(long)]
    pub replace: bool,
}

#[derive(Debug, Serialize)]
struct RecordResult {
    record_id: Option<String>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<UpsertOutcome> for RecordResult {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome.result {
            Ok(response) => Self {
                record_id: outcome.record_id,
                ok: true,
                modified_count: Some(response.modified_count),
                error: None,
            },
            Err(e) => Self {
                record_id: outcome.record_id,
                ok: false,
                modified_count: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct UpdateSummary {
    dry_run: bool,
    total: usize,
    succeeded: usize,
    failed: usize,
    results: Vec<RecordResult>,
}

impl UpdateSummary {
    fn new(dry_run: bool, outcomes: Vec<UpsertOutcome>) -> Self {
        let results: Vec<RecordResult> = outcomes.into_iter().map(RecordResult::from).collect();
        let failed = results.iter().filter(|r| !r.ok).count();
        Self {
            dry_run,
            total: results.len(),
            succeeded: results.len() - failed,
            failed,
            results,
        }
    }
}

/// Partially update or replace each record by its `_id`
async fn update_each(
    executor: &UpdateExecutor<'_>,
    records: &[Record],
    partial: bool,
) -> Vec<UpsertOutcome> {
    let mut outcomes = Vec::with_capacity(records.len());
    for record in records {
        let Some(id) = record_id(record) else {
            warn!("Record does not have an _id field!");
            outcomes.push(UpsertOutcome {
                record_id: None,
                result: Err(DataError::validation("record is missing a string _id", None)),
            });
            continue;
        };
        let result = if partial {
            let mut fields = record.clone();
            fields.remove(ID_FIELD);
            executor.update_partial(id, &fields).await
        } else {
            executor.replace_one(id, record).await
        };
        if let Err(e) = &result {
            warn!("Failed to update record {}: {}", id, e);
        }
        outcomes.push(UpsertOutcome {
            record_id: Some(id.to_string()),
            result,
        });
    }
    outcomes
}

pub(crate) fn load_records(path: &Path) -> anyhow::Result<Vec<Record>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;

    let values = match serde_json::from_str::<Value>(&contents)? {
        Value::Array(values) => values,
        single @ Value::Object(_) => vec![single],
        other => anyhow::bail!(
            "{} must contain a JSON object or array, got {}",
            path.display(),
            other
        ),
    };

    values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| match value {
            Value::Object(map) => Ok(map),
            other => Err(anyhow::anyhow!("entry {} is not a JSON object: {}", idx, other)),
        })
        .collect()
}

impl UpdateCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let records = load_records(&self.file)?;
        info!(
            "Loaded {} records from {}{}",
            records.len(),
            self.file.display(),
            if self.dry_run { " (dryrun)" } else { "" }
        );

        let dry_run = self.dry_run;
        let partial = self.partial;
        let replace = self.replace;

        let outcomes = run(async {
            let client = self.connection.connect().await?;
            let outcomes = client
                .run_scoped(|c| {
                    Box::pin(async move {
                        let executor = c.executor(dry_run);
                        if !partial && !replace {
                            return Ok(executor.upsert_many(&records).await);
                        }
                        Ok(update_each(&executor, &records, partial).await)
                    })
                })
                .await?;
            Ok::<_, anyhow::Error>(outcomes)
        })?;

        let summary = UpdateSummary::new(dry_run, outcomes);
        print_json(&summary)?;

        if summary.failed > 0 {
            anyhow::bail!(
                "{} of {} records failed to update",
                summary.failed,
                summary.total
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_query::MemoryStore;
    use serde_json::json;
    use std::io::Write;

    fn write_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_records_array_and_single() {
        let file = write_file(r#"[{"_id": "a"}, {"_id": "b", "name": "x"}]"#);
        assert_eq!(load_records(file.path()).unwrap().len(), 2);

        let file = write_file(r#"{"_id": "a", "data_description.name": "n"}"#);
        let records = load_records(file.path()).unwrap();
        assert_eq!(records[0]["data_description.name"], "n");
    }

    #[test]
    fn test_load_records_rejects_non_objects() {
        let file = write_file(r#"[{"_id": "a"}, 3]"#);
        let err = load_records(file.path()).unwrap_err();
        assert!(err.to_string().contains("entry 1"));

        let file = write_file("\"text\"");
        assert!(load_records(file.path()).is_err());
    }

    #[test]
    fn test_record_result_from_outcome() {
        let outcome = UpsertOutcome {
            record_id: None,
            result: Err(DataError::validation("missing _id", None)),
        };
        let result = RecordResult::from(outcome);
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("missing _id"));
    }

    fn records(value: Value) -> Vec<Record> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_record_without_id_counts_as_failed() {
        let store = MemoryStore::new();
        let executor = UpdateExecutor::new(&store).with_dry_run(true);
        let records = records(json!([{"name": "x"}, {"_id": "a", "name": "y"}]));

        for partial in [true, false] {
            let outcomes = update_each(&executor, &records, partial).await;
            let summary = UpdateSummary::new(true, outcomes);
            assert_eq!(summary.total, 2);
            assert_eq!(summary.failed, 1);
            assert_eq!(summary.succeeded, 1);
            assert_eq!(summary.results[0].record_id, None);
            assert!(summary.results[0]
                .error
                .as_deref()
                .unwrap()
                .contains("missing a string _id"));
            assert_eq!(summary.results[1].record_id.as_deref(), Some("a"));
        }
    }
}
