use anyhow::Result;
use assemblit_db::StoreConfig;
use clap::Parser;

mod commands;
mod telemetry;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init("assemblit-admin")?;

    let output = commands::run(cli.command, StoreConfig::from_env()).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
