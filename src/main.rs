use anyhow::Result;
use testgpt::cli;

#[tokio::main]
async fn main() -> Result<()> {
    cli::Cli::run().await
}
