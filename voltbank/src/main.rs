use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use voltbank::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    // construct a subscriber that prints formatted traces to stdout
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global tracing subscriber.");

    let config = Config::parse();

    match voltbank::voltbank(&config).await {
        Ok(summary) => {
            info!("Done: {} cycles{}.", summary.cycles, if summary.cancelled { ", interrupted" } else { "" });
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
