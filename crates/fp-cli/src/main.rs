use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use fp_core::{DeviceReport, VersionDimension};
use fp_stats::{reset_lines, StatsEngine};
use fp_storage::StatsStore;
use std::io::BufRead;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetpulse")]
#[command(about = "Device heartbeat and crash-report statistics", long_about = None)]
struct Cli {
    /// Path to the SQLite database.
    #[arg(long, default_value = "fleetpulse.db")]
    db: PathBuf,

    /// Emit per-entity created/updated report lines.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate reports ingested since the last checkpoint.
    Update,
    /// Delete all aggregates and checkpoints, then rebuild from scratch.
    Reset,
    /// Ingest device reports as JSON lines from a file or stdin.
    Ingest {
        /// File to read; stdin when omitted.
        file: Option<PathBuf>,
    },
    /// Print the aggregates for one version identifier.
    Show {
        #[arg(value_enum)]
        dimension: DimensionArg,
        version_identifier: String,
    },
    /// Set the release date of a version, freezing it against backdating.
    SetReleasedOn {
        #[arg(value_enum)]
        dimension: DimensionArg,
        version_identifier: String,
        released_on: NaiveDate,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum DimensionArg {
    Os,
    Radio,
}

impl From<DimensionArg> for VersionDimension {
    fn from(value: DimensionArg) -> Self {
        match value {
            DimensionArg::Os => VersionDimension::OsBuild,
            DimensionArg::Radio => VersionDimension::Radio,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = StatsStore::open(&cli.db)
        .with_context(|| format!("failed to open database at {}", cli.db.display()))?;

    match cli.command {
        Commands::Update => {
            let engine = StatsEngine::standard()?;
            let report = engine.update(&store)?;
            if cli.verbose {
                for line in report.lines() {
                    println!("{line}");
                }
            }
        }
        Commands::Reset => {
            let engine = StatsEngine::standard()?;
            let (deleted, report) = engine.reset(&store)?;
            if cli.verbose {
                for line in reset_lines(&deleted) {
                    println!("{line}");
                }
                for line in report.lines() {
                    println!("{line}");
                }
            }
        }
        Commands::Ingest { file } => {
            let (inserted, skipped) = match file {
                Some(path) => {
                    let reader = std::io::BufReader::new(
                        std::fs::File::open(&path)
                            .with_context(|| format!("failed to open {}", path.display()))?,
                    );
                    ingest(&store, reader)?
                }
                None => ingest(&store, std::io::stdin().lock())?,
            };
            if cli.verbose {
                println!("{inserted} reports ingested, {skipped} duplicates skipped");
            }
        }
        Commands::Show {
            dimension,
            version_identifier,
        } => {
            let dimension = VersionDimension::from(dimension);
            match store.general_stats(dimension, &version_identifier)? {
                None => println!("no {} for {version_identifier}", dimension.entity_name()),
                Some(general) => {
                    println!(
                        "{} {}: first seen {}, released {}",
                        dimension.entity_name(),
                        general.version_identifier,
                        general.first_seen_on,
                        general.released_on,
                    );
                    println!(
                        "  lifetime: {} heartbeats, {} scheduled resets, {} unexpected resets, {} other",
                        general.heartbeats,
                        general.scheduled_resets,
                        general.unexpected_resets,
                        general.other,
                    );
                    for daily in store.daily_stats(dimension, &version_identifier)? {
                        println!(
                            "  {}: {} heartbeats, {} scheduled resets, {} unexpected resets, {} other",
                            daily.day,
                            daily.heartbeats,
                            daily.scheduled_resets,
                            daily.unexpected_resets,
                            daily.other,
                        );
                    }
                }
            }
        }
        Commands::SetReleasedOn {
            dimension,
            version_identifier,
            released_on,
        } => {
            let dimension = VersionDimension::from(dimension);
            let changed = store.set_released_on(dimension, &version_identifier, released_on)?;
            if !changed {
                anyhow::bail!(
                    "no {} found for {version_identifier}",
                    dimension.entity_name()
                );
            }
            if cli.verbose {
                println!(
                    "{} {version_identifier} released_on set to {released_on}",
                    dimension.entity_name()
                );
            }
        }
    }

    Ok(())
}

fn ingest(store: &StatsStore, reader: impl BufRead) -> Result<(u64, u64)> {
    let mut inserted = 0u64;
    let mut skipped = 0u64;
    for (number, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input line")?;
        if line.trim().is_empty() {
            continue;
        }
        let report: DeviceReport = serde_json::from_str(&line)
            .with_context(|| format!("invalid device report on line {}", number + 1))?;
        let fresh = match &report {
            DeviceReport::Heartbeat(heartbeat) => store.insert_heartbeat(heartbeat)?,
            DeviceReport::CrashReport(crash) => store.insert_crash_report(crash)?,
        };
        if fresh {
            inserted += 1;
        } else {
            skipped += 1;
            tracing::debug!(line = number + 1, "duplicate report skipped");
        }
    }
    Ok((inserted, skipped))
}
