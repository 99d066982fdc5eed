use super::connection::ConnectionArgs;
use super::{parse_object, print_json, run};
use clap::Args;
use metastore_query::QueryOptions;
use tracing::debug;

#[derive(Args)]
pub struct QueryCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Filter as a JSON object
    #[arg(long, default_value = "{}")]
    pub filter: String,

    /// Projection as a JSON object, e.g. '{"name": 1}'
    #[arg(long)]
    pub projection: Option<String>,

    /// Sort specification as a JSON object, e.g. '{"created": -1}'
    #[arg(long)]
    pub sort: Option<String>,

    /// Maximum number of records to return
    #[arg(long)]
    pub limit: Option<u64>,

    /// Number of matching records to skip
    #[arg(long)]
    pub skip: Option<u64>,
}

impl QueryCommand {
    fn options(&self) -> anyhow::Result<QueryOptions> {
        let mut options = QueryOptions::new();
        if let Some(projection) = &self.projection {
            options = options.with_projection(parse_object("--projection", projection)?);
        }
        if let Some(sort) = &self.sort {
            options = options.with_sort(parse_object("--sort", sort)?);
        }
        options.limit = self.limit;
        options.skip = self.skip;
        Ok(options)
    }

    pub fn execute(self) -> anyhow::Result<()> {
        let filter = parse_object("--filter", &self.filter)?;
        let options = self.options()?;

        let records = run(async {
            let client = self.connection.connect().await?;
            let records = client
                .run_scoped(|c| Box::pin(async move { c.query(&filter, &options).await }))
                .await?;
            Ok::<_, anyhow::Error>(records)
        })?;

        debug!("Query returned {} records", records.len());
        print_json(&records)
    }
}
