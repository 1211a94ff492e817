use anyhow::Result;
use rds_metric_collector::cli::{actions::run, start};

#[tokio::main]
async fn main() -> Result<()> {
    let action = start()?;

    run::handle(action).await
}
