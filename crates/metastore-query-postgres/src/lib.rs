//! PostgreSQL (RDS) client for metastore
//!
//! Reads tables into [`Table`]s of JSON cells and writes them back, either
//! appending to an existing table or replacing it.
//!
//! ## Example
//!
//! ```rust,no_run
//! use metastore_query::EnvSource;
//! use metastore_query_postgres::{resolve_rds_credentials, PostgresClient};
//!
//! # async fn example() -> metastore_query::Result<()> {
//! let credentials = resolve_rds_credentials(&EnvSource::process(), None).await?;
//! let client = PostgresClient::connect(&credentials).await?;
//!
//! let table = client.read_table("spike_sorting_urls", None).await?;
//! println!("{} rows", table.len());
//! # Ok(())
//! # }
//! ```

mod table;

use metastore_query::{Credentials, CredentialsBuilder, DataError, EnvSource, Result, SecretStore};
use tokio::sync::RwLock;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Transaction};
use tracing::{debug, error, info};

use table::to_sql_param;

pub use table::{infer_column_type, Column, ColumnType, Table};

/// Credentials for the relational database, resolved from `RDS_` variables
pub type RdsCredentials = Credentials;

/// Resolve [`RdsCredentials`] from the environment and an optional secret
pub async fn resolve_rds_credentials(
    env: &EnvSource,
    secrets: Option<&dyn SecretStore>,
) -> Result<RdsCredentials> {
    CredentialsBuilder::rds().resolve(env, secrets).await
}

/// Connection to a PostgreSQL database
pub struct PostgresClient {
    client: RwLock<Client>,
    database: String,
}

impl PostgresClient {
    pub async fn connect(credentials: &RdsCredentials) -> Result<Self> {
        let database = credentials
            .database
            .clone()
            .ok_or_else(|| DataError::configuration("RDS database name is required"))?;
        let username = credentials
            .username
            .as_deref()
            .ok_or_else(|| DataError::configuration("RDS username is required"))?;

        debug!(
            "Connecting to PostgreSQL: {}",
            credentials.connection_string("postgresql")
        );

        let mut config = tokio_postgres::Config::new();
        config
            .host(&credentials.host)
            .port(credentials.port)
            .user(username)
            .dbname(&database);
        if let Some(password) = credentials.password_str() {
            config.password(password);
        }

        let (client, connection) = config.connect(NoTls).await.map_err(|e| {
            error!("PostgreSQL connection failed: {}", e);
            DataError::connection(format!(
                "PostgreSQL connection to {}:{} failed: {}",
                credentials.host, credentials.port, e
            ))
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!("Connected to PostgreSQL database: {}", database);

        Ok(Self {
            client: RwLock::new(client),
            database,
        })
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    /// `SELECT *` from a table, optionally restricted by a `WHERE` clause
    pub async fn read_table(&self, table: &str, where_clause: Option<&str>) -> Result<Table> {
        let sql = select_sql(table, where_clause)?;
        self.execute_query(&sql).await
    }

    /// Run a statement and collect its result rows
    pub async fn execute_query(&self, sql: &str) -> Result<Table> {
        let client = self.client.read().await;
        debug!("Executing SQL: {}", sql);

        let statement = client.prepare(sql).await.map_err(|e| db_error(e, sql))?;
        let rows = client
            .query(&statement, &[])
            .await
            .map_err(|e| db_error(e, sql))?;

        let table = Table::from_pg(statement.columns(), &rows)?;
        debug!("SQL returned {} rows", table.len());
        Ok(table)
    }

    /// Insert every row of `data` into an existing table. Returns the
    /// number of rows written.
    pub async fn append_to_table(&self, table: &str, data: &Table) -> Result<u64> {
        let mut client = self.client.write().await;
        let transaction = client.transaction().await.map_err(|e| {
            DataError::connection(format!("Failed to start transaction: {}", e))
        })?;

        let written = insert_rows(&transaction, table, data).await?;
        transaction
            .commit()
            .await
            .map_err(|e| DataError::connection(format!("Failed to commit: {}", e)))?;

        info!("Appended {} rows to {}", written, table);
        Ok(written)
    }

    /// Drop and recreate `table` with columns typed from `data`, then
    /// insert its rows. Nothing changes if any step fails.
    pub async fn overwrite_table(&self, table: &str, data: &Table) -> Result<u64> {
        if data.columns.is_empty() {
            return Err(DataError::validation(
                format!("cannot create table {} without columns", table),
                None,
            ));
        }

        let drop_sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table)?);
        let create_sql = create_table_sql(table, data)?;

        let mut client = self.client.write().await;
        let transaction = client.transaction().await.map_err(|e| {
            DataError::connection(format!("Failed to start transaction: {}", e))
        })?;

        transaction
            .batch_execute(&drop_sql)
            .await
            .map_err(|e| db_error(e, &drop_sql))?;
        transaction
            .batch_execute(&create_sql)
            .await
            .map_err(|e| db_error(e, &create_sql))?;
        let written = insert_rows(&transaction, table, data).await?;

        transaction
            .commit()
            .await
            .map_err(|e| DataError::connection(format!("Failed to commit: {}", e)))?;

        info!("Overwrote {} with {} rows", table, written);
        Ok(written)
    }
}

async fn insert_rows(client: &Transaction<'_>, table: &str, data: &Table) -> Result<u64> {
    if data.is_empty() {
        return Ok(0);
    }

    let sql = insert_sql(table, &data.column_names())?;
    let statement = client.prepare(&sql).await.map_err(|e| db_error(e, &sql))?;
    let types = statement.params().to_vec();

    let mut written = 0;
    for row in &data.rows {
        if row.len() != types.len() {
            return Err(DataError::validation(
                format!(
                    "row has {} cells but {} expects {} columns",
                    row.len(),
                    table,
                    types.len()
                ),
                None,
            ));
        }

        let params = row
            .iter()
            .zip(&types)
            .zip(&data.columns)
            .map(|((value, ty), column)| to_sql_param(value, ty, &column.name))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        written += client
            .execute(&statement, &refs)
            .await
            .map_err(|e| db_error(e, &sql))?;
    }
    Ok(written)
}

/// Quote an identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(DataError::validation(
            format!("invalid identifier {:?}", name),
            None,
        ));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

fn select_sql(table: &str, where_clause: Option<&str>) -> Result<String> {
    let mut sql = format!("SELECT * FROM {}", quote_ident(table)?);
    if let Some(clause) = where_clause.map(str::trim).filter(|c| !c.is_empty()) {
        sql.push_str(" WHERE ");
        sql.push_str(clause);
    }
    Ok(sql)
}

fn insert_sql(table: &str, columns: &[&str]) -> Result<String> {
    let names = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?;
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();

    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table)?,
        names.join(", "),
        placeholders.join(", ")
    ))
}

fn create_table_sql(table: &str, data: &Table) -> Result<String> {
    let columns = data
        .columns
        .iter()
        .map(|c| Ok(format!("{} {}", quote_ident(&c.name)?, c.column_type.sql_name())))
        .collect::<Result<Vec<_>>>()?;

    Ok(format!(
        "CREATE TABLE {} ({})",
        quote_ident(table)?,
        columns.join(", ")
    ))
}

fn db_error(e: tokio_postgres::Error, sql: &str) -> DataError {
    error!("PostgreSQL SQL execution failed: {}", e);
    error!("Failed SQL: {}", sql);

    let Some(db_error) = e.as_db_error() else {
        return DataError::connection(format!("{}\n\nQuery: {}", e, sql));
    };

    if db_error.code() == &SqlState::UNDEFINED_TABLE {
        return DataError::not_found(db_error.message().to_string());
    }

    let mut msg = db_error.message().to_string();
    if let Some(detail) = db_error.detail() {
        msg.push_str(&format!("\nDetail: {}", detail));
    }
    if let Some(hint) = db_error.hint() {
        msg.push_str(&format!("\nHint: {}", hint));
    }
    if let Some(position) = db_error.position() {
        msg.push_str(&format!("\nPosition: {:?}", position));
    }
    if let Some(column) = db_error.column() {
        msg.push_str(&format!("\nColumn: {}", column));
    }

    DataError::query(format!("{}\n\nQuery: {}", msg, sql), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_query::StaticSecretStore;
    use serde_json::json;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("assets").unwrap(), "\"assets\"");
        assert_eq!(quote_ident("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn test_select_sql() {
        assert_eq!(
            select_sql("spike_sorting_urls", None).unwrap(),
            "SELECT * FROM \"spike_sorting_urls\""
        );
        assert_eq!(
            select_sql("assets", Some(" id > 3 ")).unwrap(),
            "SELECT * FROM \"assets\" WHERE id > 3"
        );
        assert_eq!(
            select_sql("assets", Some("  ")).unwrap(),
            "SELECT * FROM \"assets\""
        );
    }

    #[test]
    fn test_insert_sql_numbers_placeholders() {
        assert_eq!(
            insert_sql("assets", &["name", "size"]).unwrap(),
            "INSERT INTO \"assets\" (\"name\", \"size\") VALUES ($1, $2)"
        );
    }

    #[test]
    fn test_create_table_sql_uses_inferred_types() {
        let records = vec![json!({"name": "a", "size": 3, "meta": {"k": 1}})
            .as_object()
            .cloned()
            .unwrap()];
        let table = Table::from_records(&records);

        assert_eq!(
            create_table_sql("assets", &table).unwrap(),
            "CREATE TABLE \"assets\" (\"name\" TEXT, \"size\" BIGINT, \"meta\" JSONB)"
        );
    }

    #[tokio::test]
    async fn test_rds_credentials_from_env_aliases() {
        let env = EnvSource::from_pairs([
            ("RDS_HOST", "db.example.com"),
            ("RDS_USER", "reader"),
            ("RDS_PASSWORD", "pw"),
            ("RDS_DBNAME", "metadata"),
        ]);
        let credentials = resolve_rds_credentials(&env, None).await.unwrap();

        assert_eq!(credentials.port, 5432);
        assert_eq!(credentials.username.as_deref(), Some("reader"));
        assert_eq!(credentials.database.as_deref(), Some("metadata"));
    }

    #[tokio::test]
    async fn test_rds_credentials_require_database() {
        let env = EnvSource::from_pairs([
            ("RDS_HOST", "db.example.com"),
            ("RDS_USERNAME", "reader"),
            ("RDS_PASSWORD", "pw"),
        ]);
        let store = StaticSecretStore::new();
        let err = resolve_rds_credentials(&env, Some(&store)).await.unwrap_err();
        assert!(matches!(err, DataError::Configuration(_)));
    }
}
