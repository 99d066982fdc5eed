use super::connection::ConnectionArgs;
use super::{parse_object, print_json, run};
use clap::Args;
use serde_json::json;

#[derive(Args)]
pub struct CountCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Filter as a JSON object
    #[arg(long, default_value = "{}")]
    pub filter: String,
}

impl CountCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let filter = parse_object("--filter", &self.filter)?;

        let count = run(async {
            let client = self.connection.connect().await?;
            let count = client
                .run_scoped(|c| Box::pin(async move { c.count(&filter).await }))
                .await?;
            Ok::<_, anyhow::Error>(count)
        })?;

        print_json(&json!({ "count": count }))
    }
}
