mod config;
mod environment;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Interval at which each environment's big segment health is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(about = "Feature flag relay with big segment synchronization")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short)]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let raw = match std::fs::read_to_string(&cli.config) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::error!(path = %cli.config.display(), error = %err, "Failed to read configuration");
            std::process::exit(1);
        }
    };
    let config: config::Config = match serde_yaml::from_str(&raw) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "Failed to parse configuration");
            std::process::exit(1);
        }
    };
    if let Err(err) = config.validate() {
        tracing::error!(error = %err, "Invalid configuration");
        std::process::exit(1);
    }

    let client = reqwest::Client::new();
    let mut environments = Vec::new();
    for environment_config in &config.environments {
        match environment::Environment::new(environment_config, &config, client.clone()).await {
            Ok(environment) => {
                tracing::info!(environment = %environment.name(), "Environment configured");
                environments.push(environment);
            }
            Err(err) => {
                tracing::error!(
                    environment = %environment_config.name,
                    error = %err,
                    "Failed to configure environment"
                );
                std::process::exit(1);
            }
        }
    }
    let environments = Arc::new(environments);

    // Periodic health report; the flag data plane (out of scope here) is
    // what calls Environment::note_big_segment_reference to begin
    // synchronization once a big segment shows up in streamed data.
    let report_environments = environments.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            for environment in report_environments.iter() {
                let status = environment.big_segments_status().await;
                tracing::debug!(
                    environment = %environment.name(),
                    available = status.available,
                    stale = status.stale,
                    "Big segment status"
                );
            }
        }
    });

    tracing::info!(environments = environments.len(), "Relay started");
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
    }

    for environment in environments.iter() {
        environment.shutdown().await;
    }
    tracing::info!("Relay stopped");
}
