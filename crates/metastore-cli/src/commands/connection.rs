use clap::{Args, ValueEnum};
use metastore_client::{AwsSecretsManager, ConnectionMode, MetadataDbClient};
use metastore_query::credentials::{DEFAULT_COLLECTION, DEFAULT_DATABASE};
use metastore_query::{CredentialsBuilder, EnvSource, RestClientConfig, SshCredentials};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// HTTPS gateway
    Rest,
    /// Driver connection to a reachable host
    Direct,
    /// Driver connection through an SSH tunnel
    Ssh,
}

/// Flags shared by every document store command
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// How to reach the document store
    #[arg(long, value_enum, default_value = "rest", env = "METASTORE_MODE")]
    pub mode: Mode,

    /// Gateway host (rest) or document store host (direct)
    #[arg(long, env = "METASTORE_HOST")]
    pub host: Option<String>,

    /// Database name (default: metadata_index)
    #[arg(long, env = "METASTORE_DATABASE")]
    pub database: Option<String>,

    /// Collection name (default: data_assets)
    #[arg(long, env = "METASTORE_COLLECTION")]
    pub collection: Option<String>,

    /// Secrets Manager secret holding the document store credentials
    #[arg(long, env = "METASTORE_SECRET_NAME")]
    pub secret_name: Option<String>,

    /// Secrets Manager secret holding the SSH credentials (ssh mode)
    #[arg(long, env = "METASTORE_SSH_SECRET_NAME")]
    pub ssh_secret_name: Option<String>,

    /// AWS region for request signing and Secrets Manager
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Retry write requests on transient failures (rest)
    #[arg(long)]
    pub retry_writes: bool,
}

impl ConnectionArgs {
    /// Resolve the flags, environment and secrets into a connection mode
    pub async fn resolve(&self) -> anyhow::Result<ConnectionMode> {
        let env = EnvSource::process();
        debug!("Resolving {:?} connection", self.mode);

        match self.mode {
            Mode::Rest => {
                let host = self
                    .host
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("--host is required in rest mode"))?;
                let mut config = RestClientConfig::new(
                    host,
                    self.database.as_deref().unwrap_or(DEFAULT_DATABASE),
                    self.collection.as_deref().unwrap_or(DEFAULT_COLLECTION),
                );
                config.retry.retry_non_idempotent = self.retry_writes;
                if let Some(region) = &self.region {
                    config = config.with_region(region.clone());
                }
                Ok(ConnectionMode::Rest(config))
            }
            Mode::Direct => {
                let mut builder = CredentialsBuilder::document_store();
                if let Some(host) = &self.host {
                    builder = builder.with_host(host.clone());
                }
                if let Some(database) = &self.database {
                    builder = builder.with_database(database.clone());
                }
                if let Some(collection) = &self.collection {
                    builder = builder.with_collection(collection.clone());
                }

                let credentials = match &self.secret_name {
                    Some(name) => {
                        let secrets = AwsSecretsManager::from_env(self.region.clone()).await;
                        builder
                            .with_secret_name(name.clone())
                            .resolve(&env, Some(&secrets))
                            .await?
                    }
                    None => builder.resolve(&env, None).await?,
                };
                Ok(ConnectionMode::Direct(credentials))
            }
            Mode::Ssh => {
                let mut credentials = match (&self.secret_name, &self.ssh_secret_name) {
                    (Some(store_secret), Some(ssh_secret)) => {
                        let secrets = AwsSecretsManager::from_env(self.region.clone()).await;
                        SshCredentials::from_secrets(&secrets, store_secret, ssh_secret).await?
                    }
                    (None, None) => SshCredentials::from_env(&env)?,
                    _ => anyhow::bail!(
                        "--secret-name and --ssh-secret-name must be given together"
                    ),
                };
                if let Some(database) = &self.database {
                    credentials.store.database = Some(database.clone());
                }
                if let Some(collection) = &self.collection {
                    credentials.store.collection = Some(collection.clone());
                }
                Ok(ConnectionMode::SshTunnel(credentials))
            }
        }
    }

    pub async fn connect(&self) -> anyhow::Result<MetadataDbClient> {
        let mode = self.resolve().await?;
        Ok(MetadataDbClient::connect(mode).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(mode: Mode) -> ConnectionArgs {
        ConnectionArgs {
            mode,
            host: None,
            database: None,
            collection: None,
            secret_name: None,
            ssh_secret_name: None,
            region: None,
            retry_writes: false,
        }
    }

    #[tokio::test]
    async fn test_rest_mode_requires_host() {
        let err = args(Mode::Rest).resolve().await.unwrap_err();
        assert!(err.to_string().contains("--host"));
    }

    #[tokio::test]
    async fn test_rest_mode_defaults() {
        let mut rest = args(Mode::Rest);
        rest.host = Some("api.example.org".to_string());
        rest.retry_writes = true;

        match rest.resolve().await.unwrap() {
            ConnectionMode::Rest(config) => {
                assert_eq!(config.database, "metadata_index");
                assert_eq!(config.collection, "data_assets");
                assert!(config.retry.retry_non_idempotent);
            }
            other => panic!("unexpected mode {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_ssh_mode_requires_both_secrets() {
        let mut ssh = args(Mode::Ssh);
        ssh.secret_name = Some("docdb".to_string());
        let err = ssh.resolve().await.unwrap_err();
        assert!(err.to_string().contains("together"));
    }
}
