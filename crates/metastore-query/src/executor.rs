use crate::error::{DataError, Result};
use crate::traits::DocumentStore;
use crate::types::{record_id, Document, Record, UpsertOutcome, WriteResponse};
use crate::update::{is_document_corrupt, UpdatePlan};
use serde_json::Value;
use tracing::{info, warn};

/// Applies validated writes to a store, or only logs them in dry-run mode
pub struct UpdateExecutor<'a> {
    store: &'a dyn DocumentStore,
    dry_run: bool,
}

impl<'a> UpdateExecutor<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            dry_run: false,
        }
    }

    /// Validate and log writes without calling any mutating store method
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Insert or partially update a record keyed by its `_id`
    pub async fn upsert_one(&self, record: &Record) -> Result<WriteResponse> {
        let plan = UpdatePlan::from_record(record)?;
        self.execute(&plan, true, "upsert_one").await
    }

    /// Upsert each record independently. A failed record is logged and
    /// reported in its outcome; the remaining records are still processed.
    pub async fn upsert_many(&self, records: &[Record]) -> Vec<UpsertOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            let id = record_id(record).map(str::to_string);
            let result = self.upsert_one(record).await;
            if let Err(e) = &result {
                warn!(
                    "Failed to upsert record {}: {}",
                    id.as_deref().unwrap_or("<missing _id>"),
                    e
                );
            }
            outcomes.push(UpsertOutcome {
                record_id: id,
                result,
            });
        }

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        info!(
            "upsert_many finished: {} succeeded, {} failed{}",
            outcomes.len() - failed,
            failed,
            if self.dry_run { " (dryrun)" } else { "" }
        );
        outcomes
    }

    /// Set only `fields` on an existing record. Dotted keys such as
    /// `data_description.name` address nested fields.
    pub async fn update_partial(&self, id: &str, fields: &Document) -> Result<WriteResponse> {
        let plan = UpdatePlan::for_fields(id, fields)?;
        self.execute(&plan, false, "update_one (partial)").await
    }

    /// Replace an existing record wholesale. Corrupt records and records
    /// whose `_id` differs from `id` are rejected.
    pub async fn replace_one(&self, id: &str, record: &Record) -> Result<WriteResponse> {
        if is_document_corrupt(&Value::Object(record.clone())) {
            warn!("Attempting to update corrupt record {}! Skipping.", id);
            return Err(DataError::validation(
                "record contains keys with '.' or starting with '$'",
                Some(id),
            ));
        }
        if record_id(record) != Some(id) {
            warn!("Record _id does not match {}! Skipping.", id);
            return Err(DataError::validation(
                "record _id does not match the target id",
                Some(id),
            ));
        }

        if self.dry_run {
            info!("(dryrun) replace_one: {}", id);
            return Ok(WriteResponse::dry_run(id));
        }

        info!("replace_one: {}", id);
        self.store.replace_document(record, false).await
    }

    async fn execute(&self, plan: &UpdatePlan, upsert: bool, action: &str) -> Result<WriteResponse> {
        if self.dry_run {
            info!(
                "(dryrun) {}: {} {}",
                action,
                plan.record_id,
                plan.update_document()
            );
            return Ok(WriteResponse::dry_run(plan.record_id.clone()));
        }

        info!("{}: {}", action, plan.record_id);
        let response = self
            .store
            .update_fields(&plan.record_id, &plan.set, upsert)
            .await?;
        info!(
            "{}: {} matched={} modified={} upserted={}",
            action,
            plan.record_id,
            response.matched_count,
            response.modified_count,
            response.upserted
        );
        Ok(response)
    }
}
