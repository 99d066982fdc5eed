use super::connection::ConnectionArgs;
use super::{parse_object, run};
use clap::Args;
use metastore_query::QueryOptions;
use tracing::info;

#[derive(Args)]
pub struct PaginateCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Filter as a JSON object
    #[arg(long, default_value = "{}")]
    pub filter: String,

    /// Projection as a JSON object
    #[arg(long)]
    pub projection: Option<String>,

    /// Records per batch
    #[arg(long, default_value_t = 500)]
    pub batch_size: u64,

    /// Stop after this many batches
    #[arg(long)]
    pub max_batches: Option<usize>,
}

impl PaginateCommand {
    /// Prints one JSON array per batch, one batch per line
    pub fn execute(self) -> anyhow::Result<()> {
        let filter = parse_object("--filter", &self.filter)?;
        let mut options = QueryOptions::new();
        if let Some(projection) = &self.projection {
            options = options.with_projection(parse_object("--projection", projection)?);
        }
        let batch_size = self.batch_size;
        let max_batches = self.max_batches;

        let total = run(async {
            let client = self.connection.connect().await?;
            let total = client
                .run_scoped(|c| {
                    Box::pin(async move {
                        let mut paginator = c.paginate(filter, options, batch_size)?;
                        if let Some(max) = max_batches {
                            paginator = paginator.with_max_batches(max);
                        }

                        let mut total = 0;
                        while let Some(batch) = paginator.next_batch().await? {
                            total += batch.len();
                            println!("{}", serde_json::to_string(&batch)?);
                        }
                        Ok(total)
                    })
                })
                .await?;
            Ok::<_, anyhow::Error>(total)
        })?;

        info!("Fetched {} records", total);
        Ok(())
    }
}
