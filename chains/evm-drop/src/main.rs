use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use drop_core::setup_logger;
use evm_drop::cli::{Args, Command};
use evm_drop::commands::{run_commitment, DropApp};
use evm_drop::config::DropCliConfig;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    match args.command {
        Command::Commitment(command) => {
            let _log_guard = setup_logger("logs");
            run_commitment(command).await
        }
        command => run_with_store(&args.config, command).await,
    }
}

async fn run_with_store(config_path: &str, command: Command) -> Result<()> {
    let config = match DropCliConfig::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            // Logger is not up yet; its directory comes from the config.
            eprintln!("Failed to load config {}: {:#}", config_path, e);
            std::process::exit(1);
        }
    };
    let _log_guard = setup_logger(&config.log_dir);
    info!(
        "Configuration loaded for '{}' on chain ID {}",
        config.collection, config.chain_id
    );

    let app = DropApp::open(config).await?;
    let result = match command {
        Command::Phases(command) => app.phases(command).await,
        Command::Allowlist(command) => app.allow_list(command).await,
        Command::Mint(mint) => app.mint(mint).await,
        Command::Commitment(command) => run_commitment(command).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    app.close().await;
    result
}
