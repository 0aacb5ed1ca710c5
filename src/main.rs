use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use scd_dimension::{
    db, CsvSnapshot, EntityId, GateReport, Pipeline, PipelineConfig, ScdError, VersionRecord,
};

#[derive(Parser)]
#[command(name = "scd-dimension", version, about = "Historized dimension maintenance (SCD Type-2)")]
struct Cli {
    /// Pipeline config (JSON); product catalog defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite store, overrides storage.db_path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Merge a full snapshot, gate the result, back up on success
    Run {
        #[arg(long)]
        snapshot: PathBuf,
        /// Logical run timestamp (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Run the quality gate over the stored table
    Gate,
    /// Every version of one entity
    History { entity_id: String },
    /// Versions valid at a point in time
    AsOf { at: DateTime<Utc> },
    /// Write a config file with the defaults
    InitConfig { path: PathBuf },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<ScdError>() {
            Some(ScdError::QualityGateFailure { report }) => {
                print_report(report);
                eprintln!("❌ {}", err);
                ExitCode::from(2)
            }
            Some(scd) => {
                eprintln!("❌ {}: {:#}", scd.kind(), err);
                ExitCode::FAILURE
            }
            None => {
                eprintln!("❌ {:#}", err);
                ExitCode::FAILURE
            }
        },
    }
}

fn run(cli: Cli) -> Result<()> {
    let command = match cli.command {
        Command::InitConfig { path } => {
            PipelineConfig::write_default(&path)?;
            println!("✓ Config written to {}", path.display());
            return Ok(());
        }
        other => other,
    };

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(db_path) = cli.db {
        config.storage.db_path = db_path;
    }

    let mut conn = db::open_database(&config.storage.db_path)?;
    let pipeline = Pipeline::new(config);

    match command {
        Command::Run { snapshot, at } => {
            let run_timestamp = at.unwrap_or_else(Utc::now);
            let source = CsvSnapshot::new(
                snapshot,
                pipeline.config().key_column.clone(),
                pipeline.config().attributes.clone(),
            );
            let run = pipeline.run_source(&mut conn, &source, run_timestamp)?;

            println!("✓ {}", run.summary());
            if !run.flagged_missing.is_empty() {
                println!(
                    "⚠️  {} entities missing from snapshot (flagged)",
                    run.flagged_missing.len()
                );
            }
            print_report(&run.report);
            if let Some(path) = &run.backup_path {
                println!("✓ Backup: {}", path.display());
            }
        }
        Command::Gate => {
            let report = pipeline.check(&conn, Utc::now())?;
            if !report.passed() {
                return Err(ScdError::gate_failure(report).into());
            }
            print_report(&report);
        }
        Command::History { entity_id } => {
            let versions = db::load_entity_history(&conn, &EntityId::new(entity_id.clone()))?;
            if versions.is_empty() {
                println!("No versions for entity {}", entity_id);
            }
            print_versions(&versions)?;
        }
        Command::AsOf { at } => {
            let versions = db::load_versions_as_of(&conn, at)?;
            println!("{} versions valid at {}", versions.len(), at.to_rfc3339());
            print_versions(&versions)?;
        }
        // Handled before the store is opened
        Command::InitConfig { .. } => {}
    }

    Ok(())
}

fn print_report(report: &GateReport) {
    println!("{}", report.summary());
    for finding in &report.findings {
        println!("  {}", finding);
    }
}

fn print_versions(versions: &[VersionRecord]) -> Result<()> {
    for version in versions {
        let line = serde_json::to_string(version).context("serialize version")?;
        println!("{}", line);
    }
    Ok(())
}
