use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use alertpipe::config::AppConfig;
use alertpipe::pipeline::{Alert, PipelineResult};

#[derive(Parser)]
#[command(
    name = "alertpipe",
    about = "Security alert processing pipeline with rate-limited HTTP intake",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults: $ALERTPIPE_CONFIG, /etc/alertpipe/alertpipe.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + queue worker)
    Serve {
        /// Bind address, overriding [server].bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Process alerts from a JSON file (one alert or an array)
    Process {
        /// Path to the alert file
        file: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Check readiness of every collaborator service
    Health,

    /// Print the effective configuration as TOML
    ShowConfig,
}

fn read_alerts(path: &Path) -> Result<Vec<Alert>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read alert file: {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("alert file is not valid JSON: {}", path.display()))?;
    let alerts = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(alerts)
}

fn print_result(result: &PipelineResult) {
    let severity = result
        .severity()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<24} | {:<10} | {:<9} | {:>9.1} | {}",
        result.alert_id,
        result.final_status.as_str(),
        severity,
        result.processing_time_ms,
        result.actions.join(", ")
    );
    if let Some(error) = &result.error {
        println!("{:<24} |   -> error: {}", "", error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::resolve(cli.config.as_deref())?;
    alertpipe::init_tracing(&config.logging)?;

    match cli.command {
        Commands::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting alertpipe daemon");
            alertpipe::serve(config).await?;
        }
        Commands::Process { file, json } => {
            let alerts = read_alerts(&file)?;
            tracing::info!(count = alerts.len(), file = %file.display(), "Processing alerts");
            let pipeline = alertpipe::build_pipeline(&config).await?;
            let results = pipeline.batch_process(&alerts).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                println!("\nalertpipe results");
                println!(
                    "{:<24} | {:<10} | {:<9} | {:>9} | Actions",
                    "Alert", "Status", "Severity", "Time (ms)"
                );
                println!("{:-<24}-|-{:-<10}-|-{:-<9}-|-{:->9}-|-{:-<30}", "", "", "", "", "");
                for result in &results {
                    print_result(result);
                }
                let snapshot = pipeline.metrics().snapshot();
                println!(
                    "\nProcessed: {}  Failed: {}  Success rate: {:.0}%",
                    snapshot.total_processed,
                    snapshot.total_failed,
                    snapshot.success_rate * 100.0
                );
            }
        }
        Commands::Health => {
            let pipeline = alertpipe::build_pipeline(&config).await?;
            let readiness = pipeline.readiness().await;
            for (service, ok) in &readiness.services {
                println!("{:<16} : {}", service, if *ok { "READY" } else { "UNAVAILABLE" });
            }
            if !readiness.ready {
                anyhow::bail!("one or more collaborator services are unavailable");
            }
        }
        Commands::ShowConfig => {
            let rendered = toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
        }
    }

    Ok(())
}
