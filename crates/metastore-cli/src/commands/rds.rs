use super::update::load_records;
use super::{print_json, run};
use clap::{Args, Subcommand, ValueEnum};
use metastore_client::AwsSecretsManager;
use metastore_query::{CredentialsBuilder, EnvSource};
use metastore_query_postgres::{resolve_rds_credentials, PostgresClient, RdsCredentials, Table};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct RdsCommand {
    /// Secrets Manager secret holding the RDS credentials (otherwise RDS_* variables)
    #[arg(long, env = "METASTORE_RDS_SECRET_NAME", global = true)]
    secret_name: Option<String>,

    /// AWS region for Secrets Manager
    #[arg(long, env = "AWS_REGION", global = true)]
    region: Option<String>,

    #[command(subcommand)]
    command: RdsCommands,
}

#[derive(Subcommand)]
enum RdsCommands {
    /// Print every row of a table as JSON records
    Read(ReadTableArgs),
    /// Run a SQL query and print its rows
    Sql(SqlArgs),
    /// Write JSON records into a table
    Write(WriteTableArgs),
}

#[derive(Args)]
struct ReadTableArgs {
    /// Table name
    #[arg(long)]
    table: String,

    /// Optional WHERE clause, e.g. "subject_id = '123456'"
    #[arg(long = "where")]
    where_clause: Option<String>,
}

#[derive(Args)]
struct SqlArgs {
    /// SQL statement
    #[arg(long)]
    query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WriteMode {
    /// Insert into the existing table
    Append,
    /// Drop and recreate the table
    Overwrite,
}

#[derive(Args)]
struct WriteTableArgs {
    /// Table name
    #[arg(long)]
    table: String,

    /// JSON file with an array of records
    #[arg(long)]
    file: PathBuf,

    #[arg(long, value_enum, default_value = "append")]
    mode: WriteMode,
}

impl RdsCommand {
    async fn credentials(&self) -> anyhow::Result<RdsCredentials> {
        let env = EnvSource::process();
        let credentials = match &self.secret_name {
            Some(name) => {
                let secrets = AwsSecretsManager::from_env(self.region.clone()).await;
                CredentialsBuilder::rds()
                    .with_secret_name(name.clone())
                    .resolve(&env, Some(&secrets))
                    .await?
            }
            None => resolve_rds_credentials(&env, None).await?,
        };
        Ok(credentials)
    }

    pub fn execute(self) -> anyhow::Result<()> {
        run(async {
            let credentials = self.credentials().await?;
            let client = PostgresClient::connect(&credentials).await?;

            match &self.command {
                RdsCommands::Read(args) => {
                    let table = client
                        .read_table(&args.table, args.where_clause.as_deref())
                        .await?;
                    print_json(&table.to_records())
                }
                RdsCommands::Sql(args) => {
                    let table = client.execute_query(&args.query).await?;
                    print_json(&table.to_records())
                }
                RdsCommands::Write(args) => {
                    let records = load_records(&args.file)?;
                    let table = Table::from_records(&records);
                    let written = match args.mode {
                        WriteMode::Append => client.append_to_table(&args.table, &table).await?,
                        WriteMode::Overwrite => {
                            client.overwrite_table(&args.table, &table).await?
                        }
                    };
                    info!("Wrote {} rows to {}", written, args.table);
                    print_json(&json!({ "table": args.table, "rows_written": written }))
                }
            }
        })
    }
}
