use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

mod analyzer;
mod chain;
mod classify;
mod config;
mod error;
mod ingest;
mod normalize;
mod validators;

use crate::analyzer::Analyzer;
use crate::config::{load_config, CLIArguments};
use crate::error::AnalyzerError;

#[tokio::main]
async fn main() -> Result<(), AnalyzerError> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli_args = CLIArguments::parse();
    let config_path = cli_args.config_path.unwrap_or(String::new());
    let config = load_config(&config_path).expect("Irrecoverable error: fail to load config.toml");

    let analyzer = Analyzer::new(config).await?;
    if let Some(address) = cli_args.reclassify {
        analyzer.reclassify(&address).await?;
        return Ok(());
    }
    analyzer.run().await?;

    Ok(())
}
