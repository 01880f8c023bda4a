use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = distfile_proxy::cli::Cli::parse();
    cli.run().await
}
