//! Metastore CLI
//!
//! Queries and updates the metadata document store over REST, a direct
//! driver connection or an SSH tunnel, and reads/writes RDS tables.
//! Results are written to stdout as JSON.

mod commands;

use clap::{Parser, Subcommand};
use commands::{
    AggregateCommand, CountCommand, PaginateCommand, QueryCommand, RdsCommand, UpdateCommand,
};
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "METASTORE_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "METASTORE_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Return records matching a filter
    Query(QueryCommand),
    /// Count records matching a filter
    Count(CountCommand),
    /// Run an aggregation pipeline
    Aggregate(AggregateCommand),
    /// Fetch records in fixed-size batches
    Paginate(PaginateCommand),
    /// Upsert or partially update records from a file
    Update(UpdateCommand),
    /// Read or write relational tables
    Rds(RdsCommand),
}

fn build_filter(log_level: &str) -> anyhow::Result<tracing_subscriber::EnvFilter> {
    // RUST_LOG takes full control when set
    if std::env::var("RUST_LOG").is_ok() {
        return tracing_subscriber::EnvFilter::try_from_default_env()
            .map_err(|e| anyhow::anyhow!("Invalid RUST_LOG environment variable: {}", e));
    }

    Ok(tracing_subscriber::EnvFilter::new(format!(
        "metastore={level},\
         metastore_cli={level},\
         metastore_client={level},\
         metastore_query={level},\
         metastore_query_rest={level},\
         metastore_query_mongodb={level},\
         metastore_query_postgres={level},\
         mongodb=warn,\
         russh=warn,\
         tokio_postgres=warn,\
         hyper=warn,\
         reqwest=warn,\
         rustls=warn,\
         aws_config=warn,\
         aws_smithy_runtime=warn",
        level = log_level
    )))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = build_filter(&cli.log_level)?;

    // Logs go to stderr so stdout carries only JSON
    let fmt_layer = match cli.log_format.as_str() {
        "full" => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {}", e))?;

    match cli.command {
        Commands::Query(cmd) => cmd.execute(),
        Commands::Count(cmd) => cmd.execute(),
        Commands::Aggregate(cmd) => cmd.execute(),
        Commands::Paginate(cmd) => cmd.execute(),
        Commands::Update(cmd) => cmd.execute(),
        Commands::Rds(cmd) => cmd.execute(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_command() {
        let cli = Cli::try_parse_from([
            "metastore",
            "--log-level",
            "debug",
            "query",
            "--mode",
            "rest",
            "--host",
            "api.example.org",
            "--filter",
            r#"{"subject.subject_id": "123456"}"#,
            "--limit",
            "5",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Query(_)));
    }

    #[test]
    fn test_parse_update_command() {
        let cli = Cli::try_parse_from([
            "metastore",
            "update",
            "--file",
            "records.json",
            "--dry-run",
            "--partial",
        ])
        .unwrap();

        match cli.command {
            Commands::Update(cmd) => {
                assert!(cmd.dry_run);
                assert!(cmd.partial);
            }
            _ => panic!("expected update command"),
        }
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let result = Cli::try_parse_from(["metastore", "count", "--mode", "carrier-pigeon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_filter_accepts_level() {
        assert!(build_filter("warn").is_ok());
    }
}
