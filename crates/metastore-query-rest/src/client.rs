use crate::signing::{sign_request, SigningCredentials, EXECUTE_API_SERVICE};
use async_trait::async_trait;
use chrono::Utc;
use metastore_query::{
    DataError, Document, DocumentStore, Filter, Paginator, QueryOptions, Record, RecordCounts,
    RestClientConfig, Result, UpdatePlan, WriteResponse,
};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// Default upper bound for the serialized size of one bulk write request
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10_000_000;

/// Options for [`RestClient::retrieve_records`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieveOptions {
    /// Fetch in batches instead of a single request
    pub paginate: bool,
    pub batch_size: u64,
    /// Stop after this many batches
    pub max_iterations: Option<usize>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            paginate: true,
            batch_size: 500,
            max_iterations: Some(20_000),
        }
    }
}

/// Client for the DocDB REST gateway.
///
/// Reads are plain HTTP requests. Writes are signed with AWS SigV4 using
/// explicit credentials or, on first use, the default AWS credential chain.
pub struct RestClient {
    config: RestClientConfig,
    http: Client,
    signing: OnceCell<SigningCredentials>,
}

impl RestClient {
    pub fn new(config: RestClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DataError::configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http,
            signing: OnceCell::new(),
        })
    }

    /// Use fixed signing credentials instead of the default AWS chain
    pub fn with_signing_credentials(self, credentials: SigningCredentials) -> Self {
        Self {
            signing: OnceCell::new_with(Some(credentials)),
            ..self
        }
    }

    pub fn config(&self) -> &RestClientConfig {
        &self.config
    }

    /// Total and filtered record counts
    pub async fn count_records(&self, filter: &Filter) -> Result<RecordCounts> {
        let url = self.parse_url(&self.config.count_url())?;
        let filter_json = Value::Object(filter.clone());
        let params = vec![("filter", filter_json.to_string())];

        let body = self
            .send(true, Some(&filter_json), || {
                Ok(self.http.get(url.clone()).query(&params))
            })
            .await?;
        Ok(serde_json::from_value(extract_body(body)?)?)
    }

    /// Fetch records, optionally in batches of `batch_size`
    pub async fn retrieve_records(
        &self,
        filter: &Filter,
        options: &QueryOptions,
        retrieve: RetrieveOptions,
    ) -> Result<Vec<Record>> {
        if !retrieve.paginate {
            return self.query(filter, options).await;
        }

        let mut paginator = Paginator::new(self, filter.clone(), options.clone(), retrieve.batch_size)?;
        if let Some(max) = retrieve.max_iterations {
            paginator = paginator.with_max_batches(max);
        }
        paginator.collect_all().await
    }

    /// Upsert records through `bulk_write`, splitting the operations so no
    /// request body exceeds `max_payload_size` bytes. A single operation
    /// larger than the limit is sent on its own.
    pub async fn bulk_upsert(&self, records: &[Record], max_payload_size: usize) -> Result<Vec<Value>> {
        let operations = records
            .iter()
            .map(|record| {
                let plan = UpdatePlan::from_record(record)?;
                Ok(json!({
                    "UpdateOne": {
                        "filter": plan.filter(),
                        "update": plan.update_document(),
                        "upsert": "True",
                    }
                }))
            })
            .collect::<Result<Vec<Value>>>()?;

        let chunks = chunk_by_payload_size(operations, max_payload_size)?;
        let url = self.parse_url(&self.config.bulk_write_url())?;
        let mut responses = Vec::with_capacity(chunks.len());

        for (index, chunk) in chunks.iter().enumerate() {
            info!(
                "bulk_write chunk {}/{} with {} operations",
                index + 1,
                chunks.len(),
                chunk.len()
            );
            let payload = serde_json::to_string(chunk)?;
            let response = self.send_signed(&url, payload).await?;
            responses.push(response);
        }
        Ok(responses)
    }

    fn parse_url(&self, raw: &str) -> Result<Url> {
        Url::parse(raw)
            .map_err(|e| DataError::configuration(format!("Invalid gateway URL {}: {}", raw, e)))
    }

    async fn signing_credentials(&self) -> Result<&SigningCredentials> {
        self.signing
            .get_or_try_init(|| SigningCredentials::from_default_chain(self.config.region.as_deref()))
            .await
    }

    /// POST a signed JSON payload. Writes are retried only when the policy
    /// allows retrying non-idempotent requests.
    async fn send_signed(&self, url: &Url, payload: String) -> Result<Value> {
        let credentials = self.signing_credentials().await?;

        self.send(false, None, || {
            let signed = sign_request(
                "POST",
                url,
                &payload,
                credentials,
                EXECUTE_API_SERVICE,
                Utc::now(),
            )?;
            let mut request = self
                .http
                .request(Method::POST, url.clone())
                .header("Content-Type", "application/json")
                .header("X-Amz-Date", signed.amz_date)
                .header("X-Amz-Content-Sha256", signed.content_sha256)
                .header("Authorization", signed.authorization);
            if let Some(token) = signed.session_token {
                request = request.header("X-Amz-Security-Token", token);
            }
            Ok(request.body(payload.clone()))
        })
        .await
    }

    /// Send a request built by `build`, retrying transient failures per the
    /// configured policy. `filter` is attached to query errors.
    async fn send<F>(&self, idempotent: bool, filter: Option<&Value>, build: F) -> Result<Value>
    where
        F: Fn() -> Result<RequestBuilder>,
    {
        let policy = &self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let can_retry = attempt <= policy.max_retries && policy.allows_retry(idempotent);

            match build()?.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<Value>().await.map_err(|e| {
                            DataError::Serialization(format!("Invalid JSON response: {}", e))
                        });
                    }

                    let body = response.text().await.unwrap_or_default();
                    if can_retry && policy.is_retryable_status(status.as_u16()) {
                        let delay = policy.delay_for_attempt(attempt);
                        warn!(
                            "Gateway returned {} (attempt {}), retrying in {:?}",
                            status, attempt, delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!("Gateway request failed with {}: {}", status, body);
                    return Err(status_error(status, &body, attempt, filter));
                }
                Err(e) if is_transient(&e) && can_retry => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        "Gateway request error (attempt {}): {}, retrying in {:?}",
                        attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("Gateway request error: {}", e);
                    return Err(DataError::transport(attempt, e.to_string()));
                }
            }
        }
    }
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout()
}

fn status_error(status: StatusCode, body: &str, attempts: u32, filter: Option<&Value>) -> DataError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            DataError::query(format!("status {}: {}", status, body), filter)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DataError::connection(format!("Gateway rejected credentials ({}): {}", status, body))
        }
        _ => DataError::transport(attempts, format!("status {}: {}", status, body)),
    }
}

/// Unwrap the gateway's `{"body": "<json text>"}` envelope
fn extract_body(response: Value) -> Result<Value> {
    match response.get("body") {
        Some(Value::String(text)) => Ok(serde_json::from_str(text)?),
        Some(other) => Ok(other.clone()),
        None => Err(DataError::Serialization(
            "Body not found in json response".to_string(),
        )),
    }
}

fn records_from(value: Value) -> Result<Vec<Record>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                other => Err(DataError::Serialization(format!(
                    "expected a record object, got {}",
                    other
                ))),
            })
            .collect(),
        other => Err(DataError::Serialization(format!(
            "expected a list of records, got {}",
            other
        ))),
    }
}

/// Read a write result, accepting both driver-style and raw-command keys
fn write_response(record_id: &str, raw: Value) -> WriteResponse {
    let result = match extract_body(raw.clone()) {
        Ok(Value::Object(map)) => map,
        _ => raw.as_object().cloned().unwrap_or_default(),
    };
    let count = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| result.get(*k).and_then(Value::as_u64))
            .unwrap_or(0)
    };
    let upserted = ["upserted_id", "upserted"]
        .iter()
        .any(|k| result.get(*k).is_some_and(|v| !v.is_null()));

    WriteResponse {
        record_id: record_id.to_string(),
        matched_count: count(&["matched_count", "n"]),
        modified_count: count(&["modified_count", "nModified"]),
        upserted,
        dry_run: false,
        raw: Some(raw),
    }
}

/// Group operations into chunks whose JSON array encoding stays within
/// `max_payload_size` bytes
fn chunk_by_payload_size(operations: Vec<Value>, max_payload_size: usize) -> Result<Vec<Vec<Value>>> {
    let mut chunks = Vec::new();
    let mut current: Vec<Value> = Vec::new();
    // "[" and "]"
    let mut current_size = 2;

    for op in operations {
        let size = serde_json::to_string(&op)?.len();
        let separator = usize::from(!current.is_empty());
        if !current.is_empty() && current_size + separator + size > max_payload_size {
            chunks.push(std::mem::take(&mut current));
            current_size = 2;
        }
        current_size += usize::from(!current.is_empty()) + size;
        current.push(op);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

#[async_trait]
impl DocumentStore for RestClient {
    fn source_type(&self) -> &'static str {
        "rest"
    }

    async fn query(&self, filter: &Filter, options: &QueryOptions) -> Result<Vec<Record>> {
        let url = self.parse_url(&self.config.base_url())?;
        let filter_json = Value::Object(filter.clone());

        let mut params: Vec<(&str, String)> = vec![("filter", filter_json.to_string())];
        if let Some(projection) = &options.projection {
            params.push(("projection", Value::Object(projection.clone()).to_string()));
        }
        if let Some(sort) = &options.sort {
            params.push(("sort", Value::Object(sort.clone()).to_string()));
        }
        if let Some(limit) = options.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(skip) = options.skip {
            params.push(("skip", skip.to_string()));
        }

        debug!("GET {} filter={}", url, filter_json);
        let response = self
            .send(true, Some(&filter_json), || {
                Ok(self.http.get(url.clone()).query(&params))
            })
            .await?;
        records_from(extract_body(response)?)
    }

    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Record>> {
        let url = self.parse_url(&self.config.aggregate_url())?;
        let pipeline_json = Value::Array(pipeline.to_vec());

        debug!("POST {} pipeline={}", url, pipeline_json);
        // Aggregation is read-only, so it is retried like a GET
        let response = self
            .send(true, Some(&pipeline_json), || {
                Ok(self.http.post(url.clone()).json(&pipeline_json))
            })
            .await?;
        records_from(extract_body(response)?)
    }

    async fn count(&self, filter: &Filter) -> Result<u64> {
        Ok(self.count_records(filter).await?.filtered_record_count)
    }

    async fn update_fields(&self, id: &str, set: &Document, upsert: bool) -> Result<WriteResponse> {
        let url = self.parse_url(&self.config.update_one_url())?;
        let payload = serde_json::to_string(&json!({
            "filter": {"_id": id},
            "update": {"$set": set},
            "upsert": if upsert { "True" } else { "False" },
        }))?;

        info!("POST {} for record {}", url, id);
        let raw = self.send_signed(&url, payload).await?;
        Ok(write_response(id, raw))
    }

    async fn replace_document(&self, _record: &Record, _upsert: bool) -> Result<WriteResponse> {
        Err(DataError::operation_not_supported(
            "The REST gateway only supports field updates, not whole-document replacement",
        ))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
