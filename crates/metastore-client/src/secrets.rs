//! AWS Secrets Manager backed [`SecretStore`]

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_secretsmanager::{config::Region, error::SdkError, Client};
use metastore_query::{DataError, Document, Result, SecretStore};
use serde_json::Value;
use tracing::{debug, error};

fn describe_sdk_error<E: std::fmt::Display + std::fmt::Debug>(e: &SdkError<E>) -> String {
    match e {
        SdkError::ServiceError(service_err) => format!("{}", service_err.err()),
        SdkError::TimeoutError(_) => "Request to Secrets Manager timed out".to_string(),
        SdkError::DispatchFailure(dispatch_err) => {
            if dispatch_err.is_io() {
                "Network error: unable to reach Secrets Manager".to_string()
            } else if dispatch_err.is_timeout() {
                "Connection to Secrets Manager timed out".to_string()
            } else {
                format!("Dispatch failure: {:?}", dispatch_err)
            }
        }
        _ => format!("{:?}", e),
    }
}

/// Parse a secret string, which must hold a JSON object
fn parse_secret(name: &str, secret: &str) -> Result<Document> {
    match serde_json::from_str::<Value>(secret) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(DataError::configuration(format!(
            "Secret '{}' is not a JSON object",
            name
        ))),
        Err(e) => Err(DataError::configuration(format!(
            "Secret '{}' is not valid JSON: {}",
            name, e
        ))),
    }
}

/// Reads JSON secrets with the default AWS credential chain
pub struct AwsSecretsManager {
    client: Client,
}

impl AwsSecretsManager {
    /// Load AWS configuration from the environment, optionally overriding
    /// the region
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let config = loader.load().await;

        Self {
            client: Client::new(&config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for AwsSecretsManager {
    async fn get_secret(&self, name: &str) -> Result<Document> {
        debug!("Fetching secret {}", name);

        let output = self
            .client
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
            .map_err(|e| {
                let details = describe_sdk_error(&e);
                error!("Failed to fetch secret {}: {}", name, details);
                DataError::configuration(format!("Failed to fetch secret '{}': {}", name, details))
            })?;

        let secret = output.secret_string().ok_or_else(|| {
            DataError::configuration(format!("Secret '{}' has no string value", name))
        })?;
        parse_secret(name, secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_secret_object() {
        let doc = parse_secret("docdb", r#"{"host": "h", "port": 27017}"#).unwrap();
        assert_eq!(doc["host"], "h");
        assert_eq!(doc["port"], 27017);
    }

    #[test]
    fn test_parse_secret_rejects_non_objects() {
        let err = parse_secret("docdb", "[1, 2]").unwrap_err();
        assert!(matches!(err, DataError::Configuration(_)));

        let err = parse_secret("docdb", "not json").unwrap_err();
        assert!(err.to_string().contains("docdb"));
    }
}
