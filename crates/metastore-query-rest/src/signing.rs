//! AWS Signature Version 4 for gateway write requests

use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metastore_query::{DataError, Result};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Service name the gateway is signed for
pub const EXECUTE_API_SERVICE: &str = "execute-api";

/// Credentials used to sign write requests
#[derive(Debug, Clone)]
pub struct SigningCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub session_token: Option<SecretString>,
    pub region: String,
}

impl SigningCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: SecretString::from(secret_access_key.into()),
            session_token: None,
            region: region.into(),
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(SecretString::from(token.into()));
        self
    }

    /// Resolve from the default AWS credential chain. `region` overrides the
    /// region found in the AWS profile/environment.
    pub async fn from_default_chain(region: Option<&str>) -> Result<Self> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let provider = sdk_config.credentials_provider().ok_or_else(|| {
            DataError::configuration("No AWS credentials provider found for signing requests")
        })?;
        let credentials = provider.provide_credentials().await.map_err(|e| {
            DataError::configuration(format!("Failed to load AWS credentials: {}", e))
        })?;

        let region = region
            .map(str::to_string)
            .or_else(|| sdk_config.region().map(|r| r.as_ref().to_string()))
            .ok_or_else(|| DataError::configuration("No AWS region configured for signing"))?;

        debug!("Loaded AWS signing credentials for region {}", region);

        Ok(Self {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: SecretString::from(credentials.secret_access_key().to_string()),
            session_token: credentials
                .session_token()
                .map(|t| SecretString::from(t.to_string())),
            region,
        })
    }
}

/// Headers to attach to a signed request
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub session_token: Option<String>,
}

/// Sign a request with a JSON body at the given instant
pub fn sign_request(
    method: &str,
    url: &Url,
    payload: &str,
    credentials: &SigningCredentials,
    service: &str,
    now: DateTime<Utc>,
) -> Result<SignedHeaders> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let host = host_header(url)?;
    let payload_hash = hex::encode(Sha256::digest(payload.as_bytes()));
    let session_token = credentials
        .session_token
        .as_ref()
        .map(|t| t.expose_secret().to_string());

    let mut headers: Vec<(&str, &str)> = vec![
        ("content-type", "application/json"),
        ("host", host.as_str()),
        ("x-amz-date", amz_date.as_str()),
    ];
    if let Some(token) = &session_token {
        headers.push(("x-amz-security-token", token.as_str()));
    }
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let signed_headers = headers
        .iter()
        .map(|(k, _)| *k)
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        canonical_uri(url),
        url.query().unwrap_or(""),
        canonical_headers,
        signed_headers,
        payload_hash
    );
    let canonical_request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));

    let credential_scope = format!(
        "{}/{}/{}/aws4_request",
        date_stamp, credentials.region, service
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date, credential_scope, canonical_request_hash
    );

    let secret = format!("AWS4{}", credentials.secret_access_key.expose_secret());
    let k_date = hmac_sha256(secret.as_bytes(), &date_stamp)?;
    let k_region = hmac_sha256(&k_date, &credentials.region)?;
    let k_service = hmac_sha256(&k_region, service)?;
    let k_signing = hmac_sha256(&k_service, "aws4_request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, &string_to_sign)?);

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        credentials.access_key_id, credential_scope, signed_headers, signature
    );

    Ok(SignedHeaders {
        authorization,
        amz_date,
        content_sha256: payload_hash,
        session_token,
    })
}

fn host_header(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| DataError::configuration(format!("URL has no host: {}", url)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn canonical_uri(url: &Url) -> &str {
    match url.path() {
        "" => "/",
        path => path,
    }
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| DataError::configuration(format!("Invalid signing key: {}", e)))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}
