//! Fixed-size batch iteration over a query.
//!
//! Pages are fetched with `skip`/`limit` over a stable order (`_id`
//! ascending unless the caller sorts), so records inserted or removed
//! between batches can shift page boundaries. To restart, build a new
//! paginator with the same filter.

use crate::error::{DataError, Result};
use crate::traits::DocumentStore;
use crate::types::{Document, Filter, QueryOptions, Record, ID_FIELD};
use futures::stream::{self, Stream};
use tracing::debug;

pub struct Paginator<'a> {
    store: &'a dyn DocumentStore,
    filter: Filter,
    options: QueryOptions,
    batch_size: u64,
    skip: u64,
    max_batches: Option<usize>,
    batches: usize,
    done: bool,
}

impl<'a> Paginator<'a> {
    /// Paginate `filter` in batches of `batch_size`. Any `skip` in `options`
    /// is used as the starting offset; `limit` is replaced by the batch size.
    /// Without a `sort`, batches are ordered by `_id`.
    pub fn new(
        store: &'a dyn DocumentStore,
        filter: Filter,
        mut options: QueryOptions,
        batch_size: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(DataError::configuration("batch size must be greater than 0"));
        }
        if options.sort.is_none() {
            options.sort = Some(Document::from_iter([(ID_FIELD.to_string(), 1.into())]));
        }
        let skip = options.skip.unwrap_or(0);
        Ok(Self {
            store,
            filter,
            options,
            batch_size,
            skip,
            max_batches: None,
            batches: 0,
            done: false,
        })
    }

    /// Stop after `max_batches` batches
    pub fn with_max_batches(mut self, max_batches: usize) -> Self {
        self.max_batches = Some(max_batches);
        self
    }

    /// Fetch the next batch, or `None` once the result set is exhausted
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Record>>> {
        if self.done {
            return Ok(None);
        }
        if self.max_batches.is_some_and(|max| self.batches >= max) {
            debug!("Reached max batches ({})", self.batches);
            self.done = true;
            return Ok(None);
        }

        let options = self
            .options
            .clone()
            .with_skip(self.skip)
            .with_limit(self.batch_size);
        let batch = self.store.query(&self.filter, &options).await?;

        self.batches += 1;
        self.skip += self.batch_size;
        debug!(
            "Fetched batch {} with {} records (next skip: {})",
            self.batches,
            batch.len(),
            self.skip
        );

        if (batch.len() as u64) < self.batch_size {
            self.done = true;
        }
        if batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(batch))
    }

    /// Lazy stream of batches. An error ends the stream after it is yielded.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Record>>> + 'a {
        stream::unfold(self, |mut paginator| async move {
            match paginator.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), paginator)),
                Ok(None) => None,
                Err(e) => {
                    paginator.done = true;
                    Some((Err(e), paginator))
                }
            }
        })
    }

    /// Concatenate every remaining batch
    pub async fn collect_all(mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            records.extend(batch);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use futures::StreamExt;
    use serde_json::{json, Value};

    fn store_with(n: usize) -> MemoryStore {
        MemoryStore::with_records(
            (0..n)
                .map(|i| match json!({"_id": format!("id-{:03}", i), "n": i}) {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let store = store_with(1);
        let err = Paginator::new(&store, Filter::new(), QueryOptions::new(), 0)
            .err()
            .unwrap();
        assert!(matches!(err, DataError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_batches_are_bounded_and_terminate() {
        let store = store_with(5);
        let mut pager = Paginator::new(&store, Filter::new(), QueryOptions::new(), 2).unwrap();

        let mut sizes = Vec::new();
        while let Some(batch) = pager.next_batch().await.unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(pager.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_fetch() {
        let store = store_with(4);
        let pager = Paginator::new(&store, Filter::new(), QueryOptions::new(), 2).unwrap();
        let batches: Vec<_> = pager.into_stream().collect().await;
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.as_ref().unwrap().len() == 2));
    }

    #[tokio::test]
    async fn test_batches_follow_id_order_by_default() {
        let store = MemoryStore::with_records(
            ["c", "a", "d", "b"]
                .iter()
                .map(|id| match json!({"_id": id}) {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                })
                .collect(),
        );

        let ids = |records: Vec<Record>| -> Vec<String> {
            records
                .iter()
                .filter_map(|r| r["_id"].as_str().map(str::to_string))
                .collect()
        };

        let records = Paginator::new(&store, Filter::new(), QueryOptions::new(), 3)
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(ids(records), vec!["a", "b", "c", "d"]);

        let descending = match json!({"_id": -1}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let records = Paginator::new(
            &store,
            Filter::new(),
            QueryOptions::new().with_sort(descending),
            3,
        )
        .unwrap()
        .collect_all()
        .await
        .unwrap();
        assert_eq!(ids(records), vec!["d", "c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_max_batches() {
        let store = store_with(10);
        let records = Paginator::new(&store, Filter::new(), QueryOptions::new(), 3)
            .unwrap()
            .with_max_batches(2)
            .collect_all()
            .await
            .unwrap();
        assert_eq!(records.len(), 6);
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let store = store_with(3);
        let filter = match json!({"n": {"$bogus": 1}}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let pager = Paginator::new(&store, filter, QueryOptions::new(), 2).unwrap();
        let items: Vec<_> = pager.into_stream().collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }
}
