use super::connection::ConnectionArgs;
use super::{print_json, run};
use clap::Args;
use serde_json::Value;

#[derive(Args)]
pub struct AggregateCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Pipeline as a JSON array of stages
    #[arg(long)]
    pub pipeline: String,
}

fn parse_pipeline(raw: &str) -> anyhow::Result<Vec<Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(stages)) => Ok(stages),
        Ok(other) => anyhow::bail!("--pipeline must be a JSON array, got {}", other),
        Err(e) => anyhow::bail!("--pipeline is not valid JSON: {}", e),
    }
}

impl AggregateCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let pipeline = parse_pipeline(&self.pipeline)?;

        let records = run(async {
            let client = self.connection.connect().await?;
            let records = client
                .run_scoped(|c| Box::pin(async move { c.aggregate(&pipeline).await }))
                .await?;
            Ok::<_, anyhow::Error>(records)
        })?;

        print_json(&records)
    }
}
