use clap::Parser;
use iot_load_test::cli::{run_load_test, run_validate, Cli};
use iot_load_test::error::LoadTestError;
use iot_load_test::sink::StatsCollector;
use iot_load_test::worker;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli {
        Cli::Run { config, output } => run_load_test(&config, output.as_deref()).await,
        Cli::Validate { config } => run_validate(&config),
        Cli::Worker => run_worker().await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Hidden worker entry point: run the device population configured through
/// LOADTEST_* environment variables and print the final stats.
async fn run_worker() -> Result<(), LoadTestError> {
    let stats = worker::run_from_env().await?;
    StatsCollector::display_final_summary(&stats.snapshot());
    Ok(())
}
