mod cli;
mod compare;
mod config;
mod dataset;
mod error;
mod evaluation;
mod ingest;
mod ingredients;
mod pipeline;
mod recipe;
mod sampling;
mod scoring;
mod signal;
mod store;

use clap::Parser;
use tracing::error;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rag_harness=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = cli::Cli::parse();
    let config = config::Config::from_env();
    config.print_banner();

    if let Err(e) = cli::run(cli, &config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
