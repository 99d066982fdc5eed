//! Credential resolution from explicit values, environment variables and a secrets store

use crate::error::{DataError, Result};
use crate::types::Document;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error};

/// Environment prefix for document store credentials
pub const DOC_STORE_ENV_PREFIX: &str = "DOC_STORE_";
/// Older prefix still accepted for SSH tunnel settings
pub const DOC_DB_ENV_PREFIX: &str = "DOC_DB_";
/// Environment prefix for relational database credentials
pub const RDS_ENV_PREFIX: &str = "RDS_";

pub const DEFAULT_DOC_STORE_PORT: u16 = 27017;
pub const DEFAULT_RDS_PORT: u16 = 5432;
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_DATABASE: &str = "metadata_index";
pub const DEFAULT_COLLECTION: &str = "data_assets";
pub const DEFAULT_LOCAL_BIND_ADDRESS: &str = "localhost";

/// Snapshot of environment variables, passed explicitly to resolvers
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    vars: HashMap<String, String>,
}

impl EnvSource {
    /// Capture the current process environment
    pub fn process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// An environment with no variables set
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a variable, treating empty values as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// First variable set among `keys`
    fn first(&self, keys: &[String]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }
}

/// Lookup of named secrets (e.g. AWS Secrets Manager)
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret whose value is a JSON object
    async fn get_secret(&self, name: &str) -> Result<Document>;
}

/// Secret store backed by a fixed map
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, Document>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: Document) -> Self {
        self.secrets.insert(name.into(), value);
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Document> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| DataError::configuration(format!("Secret '{}' not found", name)))
    }
}

/// Resolved connection credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub database: Option<String>,
    pub collection: Option<String>,
}

impl Credentials {
    /// Exposes the password for handing to a driver
    pub fn password_str(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.expose_secret())
    }

    /// Connection string for display purposes (without password)
    pub fn connection_string(&self, scheme: &str) -> String {
        let mut parts = vec![format!("{}://", scheme)];

        if let Some(username) = &self.username {
            parts.push(format!("{}@", username));
        }

        parts.push(format!("{}:{}", self.host, self.port));

        if let Some(database) = &self.database {
            parts.push(format!("/{}", database));
        }

        parts.join("")
    }
}

/// Builds [`Credentials`] from explicit values, environment variables and a
/// secret, in that order of precedence.
#[derive(Debug, Clone, Default)]
pub struct CredentialsBuilder {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<SecretString>,
    database: Option<String>,
    collection: Option<String>,
    secret_name: Option<String>,
    env_prefix: Option<String>,
    default_port: Option<u16>,
    default_database: Option<String>,
    default_collection: Option<String>,
    require_auth: bool,
    require_database: bool,
}

impl CredentialsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document store defaults: `DOC_STORE_` variables, port 27017,
    /// database `metadata_index`, collection `data_assets`
    pub fn document_store() -> Self {
        Self {
            env_prefix: Some(DOC_STORE_ENV_PREFIX.to_string()),
            default_port: Some(DEFAULT_DOC_STORE_PORT),
            default_database: Some(DEFAULT_DATABASE.to_string()),
            default_collection: Some(DEFAULT_COLLECTION.to_string()),
            ..Self::default()
        }
    }

    /// Relational database defaults: `RDS_` variables, port 5432,
    /// username/password and database required
    pub fn rds() -> Self {
        Self {
            env_prefix: Some(RDS_ENV_PREFIX.to_string()),
            default_port: Some(DEFAULT_RDS_PORT),
            require_auth: true,
            require_database: true,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Name of a secret holding any missing fields
    pub fn with_secret_name(mut self, name: impl Into<String>) -> Self {
        self.secret_name = Some(name.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    pub fn require_auth(mut self, required: bool) -> Self {
        self.require_auth = required;
        self
    }

    fn env_keys(&self, names: &[&str]) -> Vec<String> {
        match &self.env_prefix {
            Some(prefix) => names.iter().map(|n| format!("{}{}", prefix, n)).collect(),
            None => Vec::new(),
        }
    }

    /// Resolve credentials. Contacts `secrets` only when a secret name is set.
    pub async fn resolve(
        &self,
        env: &EnvSource,
        secrets: Option<&dyn SecretStore>,
    ) -> Result<Credentials> {
        let secret = match &self.secret_name {
            Some(name) => {
                let store = secrets.ok_or_else(|| {
                    DataError::configuration(format!(
                        "Secret '{}' requested but no secret store is configured",
                        name
                    ))
                })?;
                debug!("Fetching credentials from secret: {}", name);
                let secret = store.get_secret(name).await.map_err(|e| {
                    error!("Failed to fetch secret {}: {}", name, e);
                    match e {
                        DataError::Configuration(_) => e,
                        other => DataError::configuration(format!(
                            "Failed to fetch secret '{}': {}",
                            name, other
                        )),
                    }
                })?;
                Some(secret)
            }
            None => None,
        };

        let pick = |explicit: &Option<String>, env_names: &[&str], secret_keys: &[&str]| {
            explicit
                .clone()
                .or_else(|| env.first(&self.env_keys(env_names)).map(str::to_string))
                .or_else(|| {
                    secret
                        .as_ref()
                        .and_then(|s| secret_string(s, secret_keys))
                })
        };

        let host = pick(&self.host, &["HOST"], &["host"]);
        let username = pick(&self.username, &["USERNAME", "USER"], &["username", "user"]);
        let database = pick(&self.database, &["DATABASE", "DBNAME"], &["database", "dbname"])
            .or_else(|| self.default_database.clone());
        let collection = pick(&self.collection, &["COLLECTION"], &["collection"])
            .or_else(|| self.default_collection.clone());

        let password = match &self.password {
            Some(p) => Some(p.clone()),
            None => env
                .first(&self.env_keys(&["PASSWORD"]))
                .map(str::to_string)
                .or_else(|| secret.as_ref().and_then(|s| secret_string(s, &["password"])))
                .map(SecretString::from),
        };

        let port = match self.port {
            Some(port) => Some(port),
            None => match env.first(&self.env_keys(&["PORT"])) {
                Some(raw) => Some(parse_port(raw)?),
                None => match secret.as_ref().and_then(|s| s.get("port")) {
                    Some(value) => Some(port_from_value(value)?),
                    None => None,
                },
            },
        }
        .or(self.default_port);

        let mut missing = Vec::new();
        if host.is_none() {
            missing.push("host");
        }
        if port.is_none() {
            missing.push("port");
        }
        if self.require_auth && username.is_none() {
            missing.push("username");
        }
        if self.require_auth && password.is_none() {
            missing.push("password");
        }
        if self.require_database && database.is_none() {
            missing.push("database");
        }

        match (host, port) {
            (Some(host), Some(port)) if missing.is_empty() => Ok(Credentials {
                host,
                port,
                username,
                password,
                database,
                collection,
            }),
            _ => Err(DataError::configuration(format!(
                "Missing required credential fields: {}",
                missing.join(", ")
            ))),
        }
    }
}

/// Credentials for a document store reached through an SSH tunnel
#[derive(Debug, Clone)]
pub struct SshCredentials {
    /// Document store credentials as seen from the SSH server
    pub store: Credentials,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_username: String,
    pub ssh_password: SecretString,
    /// Local address the forwarded port is bound to
    pub local_bind_address: String,
}

const SSH_REQUIRED_ENV: [&str; 6] = [
    "HOST",
    "USERNAME",
    "PASSWORD",
    "SSH_HOST",
    "SSH_USERNAME",
    "SSH_PASSWORD",
];

impl SshCredentials {
    pub fn ssh_password_str(&self) -> &str {
        self.ssh_password.expose_secret()
    }

    /// Read `DOC_STORE_*` variables, falling back to `DOC_DB_*`. The host,
    /// username, password, SSH host, SSH username and SSH password must be
    /// set together.
    pub fn from_env(env: &EnvSource) -> Result<Self> {
        let lookup = |name: &str| -> Option<&str> {
            [DOC_STORE_ENV_PREFIX, DOC_DB_ENV_PREFIX]
                .iter()
                .find_map(|prefix| {
                    env.get(&format!("{}{}", prefix, name)).or_else(|| {
                        (name == "USERNAME")
                            .then(|| env.get(&format!("{}USER", prefix)))
                            .flatten()
                    })
                })
        };

        let missing: Vec<String> = SSH_REQUIRED_ENV
            .iter()
            .filter(|name| lookup(name).is_none())
            .map(|name| format!("{}{}", DOC_STORE_ENV_PREFIX, name))
            .collect();

        if missing.len() == SSH_REQUIRED_ENV.len() {
            return Err(DataError::configuration(
                "No document store SSH credentials found in environment",
            ));
        }
        if !missing.is_empty() {
            return Err(DataError::configuration(format!(
                "Incomplete document store SSH credentials, missing: {}",
                missing.join(", ")
            )));
        }

        let required = |name: &str| lookup(name).unwrap_or_default().to_string();
        let port = lookup("PORT").map(parse_port).transpose()?;
        let ssh_port = lookup("SSH_PORT").map(parse_port).transpose()?;

        Ok(Self {
            store: Credentials {
                host: required("HOST"),
                port: port.unwrap_or(DEFAULT_DOC_STORE_PORT),
                username: Some(required("USERNAME")),
                password: Some(SecretString::from(required("PASSWORD"))),
                database: Some(
                    lookup("DATABASE")
                        .unwrap_or(DEFAULT_DATABASE)
                        .to_string(),
                ),
                collection: Some(
                    lookup("COLLECTION")
                        .unwrap_or(DEFAULT_COLLECTION)
                        .to_string(),
                ),
            },
            ssh_host: required("SSH_HOST"),
            ssh_port: ssh_port.unwrap_or(DEFAULT_SSH_PORT),
            ssh_username: required("SSH_USERNAME"),
            ssh_password: SecretString::from(required("SSH_PASSWORD")),
            local_bind_address: lookup("SSH_LOCAL_BIND_ADDRESS")
                .unwrap_or(DEFAULT_LOCAL_BIND_ADDRESS)
                .to_string(),
        })
    }

    /// Build from two secrets: one with the store credentials and one with
    /// the SSH credentials (`host`, `port`, `username`, `password`).
    pub async fn from_secrets(
        secrets: &dyn SecretStore,
        store_secret_name: &str,
        ssh_secret_name: &str,
    ) -> Result<Self> {
        let store = CredentialsBuilder::document_store()
            .with_env_prefix("")
            .require_auth(true)
            .with_secret_name(store_secret_name)
            .resolve(&EnvSource::empty(), Some(secrets))
            .await?;

        let ssh_secret = secrets.get_secret(ssh_secret_name).await?;
        let field = |key: &str| {
            secret_string(&ssh_secret, &[key]).ok_or_else(|| {
                DataError::configuration(format!(
                    "Secret '{}' is missing field '{}'",
                    ssh_secret_name, key
                ))
            })
        };

        let ssh_port = match ssh_secret.get("port") {
            Some(value) => port_from_value(value)?,
            None => DEFAULT_SSH_PORT,
        };

        Ok(Self {
            store,
            ssh_host: field("host")?,
            ssh_port,
            ssh_username: field("username")?,
            ssh_password: SecretString::from(field("password")?),
            local_bind_address: secret_string(&ssh_secret, &["local_bind_address"])
                .unwrap_or_else(|| DEFAULT_LOCAL_BIND_ADDRESS.to_string()),
        })
    }
}

fn secret_string(secret: &Document, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match secret.get(*k) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn parse_port(raw: &str) -> Result<u16> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| DataError::configuration(format!("Invalid port: {}", raw)))
}

fn port_from_value(value: &Value) -> Result<u16> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| DataError::configuration(format!("Invalid port: {}", n))),
        Value::String(s) => parse_port(s),
        other => Err(DataError::configuration(format!("Invalid port: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn aws_like_store() -> StaticSecretStore {
        StaticSecretStore::new().with_secret(
            "abc/def",
            secret(json!({
                "username": "user_from_aws",
                "password": "password_from_aws",
                "host": "host_from_aws",
                "port": 12345,
                "database": "db_from_aws"
            })),
        )
    }

    #[tokio::test]
    async fn test_resolve_from_secret() {
        let store = aws_like_store();
        let creds = CredentialsBuilder::new()
            .with_secret_name("abc/def")
            .resolve(&EnvSource::empty(), Some(&store))
            .await
            .unwrap();

        assert_eq!(creds.host, "host_from_aws");
        assert_eq!(creds.port, 12345);
        assert_eq!(creds.username.as_deref(), Some("user_from_aws"));
        assert_eq!(creds.password_str(), Some("password_from_aws"));
        assert_eq!(creds.database.as_deref(), Some("db_from_aws"));
    }

    #[tokio::test]
    async fn test_explicit_values_override_secret() {
        let store = aws_like_store();
        let creds = CredentialsBuilder::new()
            .with_host("my_host")
            .with_secret_name("abc/def")
            .resolve(&EnvSource::empty(), Some(&store))
            .await
            .unwrap();

        assert_eq!(creds.host, "my_host");
        assert_eq!(creds.username.as_deref(), Some("user_from_aws"));
        assert_eq!(creds.port, 12345);
    }

    #[tokio::test]
    async fn test_missing_secret_is_configuration_error() {
        let store = StaticSecretStore::new();
        let err = CredentialsBuilder::new()
            .with_secret_name("missing")
            .resolve(&EnvSource::empty(), Some(&store))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Configuration(_)));

        let err = CredentialsBuilder::new()
            .with_secret_name("missing")
            .resolve(&EnvSource::empty(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_fields_without_secret() {
        let err = CredentialsBuilder::rds()
            .with_host("localhost")
            .resolve(&EnvSource::empty(), None)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("username"));
        assert!(msg.contains("password"));
        assert!(msg.contains("database"));
        assert!(!msg.contains("host"));
    }

    #[tokio::test]
    async fn test_rds_env_aliases_and_default_port() {
        let env = EnvSource::from_pairs([
            ("RDS_USER", "legacy_user"),
            ("RDS_PASSWORD", "pw"),
            ("RDS_HOST", "rds.local"),
            ("RDS_DBNAME", "analytics"),
        ]);
        let creds = CredentialsBuilder::rds().resolve(&env, None).await.unwrap();
        assert_eq!(creds.username.as_deref(), Some("legacy_user"));
        assert_eq!(creds.port, DEFAULT_RDS_PORT);
        assert_eq!(creds.database.as_deref(), Some("analytics"));
    }

    #[tokio::test]
    async fn test_document_store_defaults() {
        let creds = CredentialsBuilder::document_store()
            .with_host("docdb.local")
            .resolve(&EnvSource::empty(), None)
            .await
            .unwrap();
        assert_eq!(creds.port, DEFAULT_DOC_STORE_PORT);
        assert_eq!(creds.database.as_deref(), Some(DEFAULT_DATABASE));
        assert_eq!(creds.collection.as_deref(), Some(DEFAULT_COLLECTION));
        assert!(creds.username.is_none());
    }

    #[tokio::test]
    async fn test_invalid_env_port() {
        let env = EnvSource::from_pairs([("DOC_STORE_PORT", "not-a-port")]);
        let err = CredentialsBuilder::document_store()
            .with_host("docdb.local")
            .resolve(&env, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Configuration(_)));
    }

    #[test]
    fn test_password_not_in_debug() {
        let creds = Credentials {
            host: "h".to_string(),
            port: 1,
            username: Some("u".to_string()),
            password: Some(SecretString::from("hunter2".to_string())),
            database: None,
            collection: None,
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
        assert_eq!(creds.connection_string("mongodb"), "mongodb://u@h:1");
    }

    fn full_ssh_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DOC_STORE_HOST", "docdb.internal"),
            ("DOC_STORE_USERNAME", "doc_user"),
            ("DOC_STORE_PASSWORD", "doc_pw"),
            ("DOC_STORE_SSH_HOST", "bastion"),
            ("DOC_STORE_SSH_USERNAME", "ssh_user"),
            ("DOC_STORE_SSH_PASSWORD", "ssh_pw"),
        ]
    }

    #[test]
    fn test_ssh_from_env_complete() {
        let creds = SshCredentials::from_env(&EnvSource::from_pairs(full_ssh_env())).unwrap();
        assert_eq!(creds.store.host, "docdb.internal");
        assert_eq!(creds.store.port, DEFAULT_DOC_STORE_PORT);
        assert_eq!(creds.ssh_port, DEFAULT_SSH_PORT);
        assert_eq!(creds.local_bind_address, "localhost");
        assert_eq!(creds.ssh_password_str(), "ssh_pw");
        assert_eq!(creds.store.collection.as_deref(), Some("data_assets"));
    }

    #[test]
    fn test_ssh_from_env_partial_is_error() {
        let mut vars = full_ssh_env();
        vars.retain(|(k, _)| *k != "DOC_STORE_SSH_PASSWORD");
        let err = SshCredentials::from_env(&EnvSource::from_pairs(vars)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("DOC_STORE_SSH_PASSWORD"));
        assert!(!msg.contains("DOC_STORE_SSH_HOST"));
    }

    #[test]
    fn test_ssh_from_env_doc_db_prefix() {
        let vars: Vec<(String, &str)> = full_ssh_env()
            .into_iter()
            .map(|(k, v)| (k.replacen("DOC_STORE_", "DOC_DB_", 1), v))
            .chain([("DOC_DB_PORT".to_string(), "123")])
            .collect();
        let creds = SshCredentials::from_env(&EnvSource::from_pairs(vars)).unwrap();
        assert_eq!(creds.store.host, "docdb.internal");
        assert_eq!(creds.store.port, 123);
        assert_eq!(creds.ssh_username, "ssh_user");

        // DOC_STORE_ takes precedence
        let mut vars = full_ssh_env();
        vars.push(("DOC_DB_HOST", "other.internal"));
        let creds = SshCredentials::from_env(&EnvSource::from_pairs(vars)).unwrap();
        assert_eq!(creds.store.host, "docdb.internal");
    }

    #[test]
    fn test_ssh_from_env_none_set() {
        let err = SshCredentials::from_env(&EnvSource::empty()).unwrap_err();
        assert!(matches!(err, DataError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_ssh_from_secrets() {
        let store = StaticSecretStore::new()
            .with_secret(
                "docdb",
                secret(json!({"host": "docdb.internal", "username": "u", "password": "p"})),
            )
            .with_secret(
                "ssh",
                secret(json!({"host": "bastion", "username": "su", "password": "sp", "port": "2222"})),
            );
        let creds = SshCredentials::from_secrets(&store, "docdb", "ssh").await.unwrap();
        assert_eq!(creds.store.host, "docdb.internal");
        assert_eq!(creds.store.port, DEFAULT_DOC_STORE_PORT);
        assert_eq!(creds.ssh_host, "bastion");
        assert_eq!(creds.ssh_port, 2222);
        assert_eq!(creds.ssh_username, "su");
    }
}
