use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pulse_ingest::{IngestConfig, SourceKind};
use pulse_store::Store;

#[derive(Debug, Parser)]
#[command(name = "pulse-cli")]
#[command(about = "Public Health Pulse command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass for a source: fluview, hospital, fda, or air.
    Ingest {
        source: String,
        /// Window start (YYYY-MM-DD); defaults to the source's lookback.
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,
        /// Window end (YYYY-MM-DD).
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
    },
    /// Run one ingestion pass for every source, in order.
    IngestAll,
    /// Serve the dashboard API.
    Serve,
    /// Create the database schema if it does not exist.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command {
        Commands::Ingest { source, start, end } => {
            let kind = SourceKind::parse(&source).ok_or_else(|| {
                anyhow::anyhow!(
                    "unknown source {source:?}, expected one of: fluview, hospital, fda, air"
                )
            })?;
            let bounds = start.zip(end);
            let summary = pulse_ingest::run_source(kind, &config, bounds).await?;
            print_summary(&summary);
        }
        Commands::IngestAll => {
            for kind in SourceKind::ALL {
                match pulse_ingest::run_source(kind, &config, None).await {
                    Ok(summary) => print_summary(&summary),
                    Err(err) => eprintln!("{}: run failed: {err}", kind.as_str()),
                }
            }
        }
        Commands::Serve => {
            pulse_web::serve_from_env().await?;
        }
        Commands::InitDb => {
            let store = Store::connect(&config.database_url).await?;
            store.init_schema().await?;
            println!("schema ready at {}", config.database_url);
        }
    }

    Ok(())
}

fn print_summary(summary: &pulse_ingest::RunSummary) {
    println!(
        "{}: {} processed={} inserted={} updated={} errors={} in {}ms",
        summary.source_name,
        summary.status.as_str(),
        summary.records_processed,
        summary.records_inserted,
        summary.records_updated,
        summary.record_errors,
        summary.duration_ms
    );
}
