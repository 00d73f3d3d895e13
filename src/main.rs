use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

use ehealth_warehouse_lib::config::{ConfigError, PipelineConfig};
use ehealth_warehouse_lib::db::sqlite::{
    count_rows, open_database, verify_schema, OPERATIONAL_TABLES, WAREHOUSE_TABLES,
};
use ehealth_warehouse_lib::db::DatabaseError;
use ehealth_warehouse_lib::pipeline::reference::seed_reference_data;
use ehealth_warehouse_lib::pipeline::{
    procedure_counts_by_source, simulate, ImagingEtl, IngestStats, PipelineError,
};
use ehealth_warehouse_lib::warehouse::{run_qa, PopulateError, QaReport, WarehousePopulator};

#[derive(Parser, Debug)]
#[command(
    name = "ehealth-warehouse",
    version,
    about = "Load imaging extracts into the operational store, populate the star-schema warehouse and run QA."
)]
struct Cli {
    /// SQLite database file (overrides EHEALTH_DB_PATH).
    #[arg(long, global = true, value_hint = clap::ValueHint::FilePath)]
    db: Option<PathBuf>,

    /// Imaging CSV extract (overrides EHEALTH_INPUT_CSV).
    #[arg(long, global = true, value_hint = clap::ValueHint::FilePath)]
    input: Option<PathBuf>,

    /// Records per load transaction (overrides EHEALTH_BATCH_SIZE).
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Skip the existing-key lookup and offer every record to the loader.
    #[arg(long, global = true)]
    full_reload: bool,

    /// Seconds to wait on a locked database (overrides EHEALTH_STATEMENT_TIMEOUT_SECS).
    #[arg(long, global = true)]
    statement_timeout: Option<u64>,

    /// Anchor date for generated encounter dates, YYYY-MM-DD. Defaults to today.
    #[arg(long, global = true)]
    reference_date: Option<NaiveDate>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create both schemas and report which tables exist.
    Init,
    /// Insert the diagnosis catalog and facility registry.
    Seed,
    /// Run one incremental ingest of the imaging extract.
    Ingest,
    /// Run the ingest several times to show incremental behaviour.
    Simulate {
        #[arg(long, default_value_t = 3)]
        runs: usize,

        /// Seconds to wait between runs.
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },
    /// Populate dimensions, fact and bridges in dependency order.
    Populate {
        /// Clear the warehouse first.
        #[arg(long)]
        rebuild: bool,
    },
    /// Run the QA battery.
    Qa {
        /// Write a markdown summary to this file.
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        summary: Option<PathBuf>,

        /// Emit JSON instead of markdown.
        #[arg(long)]
        json: bool,
    },
    /// Print row counts per table and procedures per source.
    Status,
    /// Seed, ingest, populate and QA in one go.
    RunAll {
        #[arg(long)]
        rebuild: bool,

        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        summary: Option<PathBuf>,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Populate(#[from] PopulateError),

    #[error("Cannot write output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot encode output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema incomplete, missing tables: {0}")]
    SchemaIncomplete(String),
}

impl CliError {
    /// 2 for a failed load, 3 for a population ordering violation, 1 otherwise.
    fn exit_code(&self) -> u8 {
        match self {
            Self::Pipeline(PipelineError::LoadFailed { .. }) => 2,
            Self::Populate(PopulateError::OrderingViolation { .. }) => 3,
            _ => 1,
        }
    }
}

#[derive(Serialize)]
struct TableCount {
    table: &'static str,
    rows: i64,
}

#[derive(Serialize)]
struct StatusReport {
    tables: Vec<TableCount>,
    procedures_by_source: Vec<(String, i64)>,
}

fn main() -> ExitCode {
    ehealth_warehouse_lib::init_tracing();
    let cli = Cli::parse();

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn pipeline_config(cli: &Cli) -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }
    if let Some(input) = &cli.input {
        config.input_path = input.clone();
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if cli.full_reload {
        config.incremental = false;
    }
    if let Some(secs) = cli.statement_timeout {
        config.statement_timeout = Duration::from_secs(secs);
    }
    config.validate()?;
    Ok(config)
}

fn execute(cli: Cli) -> Result<(), CliError> {
    let config = pipeline_config(&cli)?;
    let reference_date = cli.reference_date.unwrap_or_else(|| Local::now().date_naive());
    tracing::info!(db = %config.database_path.display(), "Opening database");
    let conn = open_database(&config.database_path, config.statement_timeout)?;

    match cli.command {
        Commands::Init => {
            let report = verify_schema(&conn)?;
            print_json(&report)?;
            if !report.is_complete() {
                let missing: Vec<&str> = report
                    .operational
                    .iter()
                    .chain(&report.warehouse)
                    .filter(|t| !t.exists)
                    .map(|t| t.name)
                    .collect();
                return Err(CliError::SchemaIncomplete(missing.join(", ")));
            }
        }
        Commands::Seed => print_json(&seed_reference_data(&conn)?)?,
        Commands::Ingest => {
            let etl = ImagingEtl::new(config, reference_date)?;
            print_json(&etl.run(&conn)?)?;
        }
        Commands::Simulate { runs, delay } => {
            let etl = ImagingEtl::new(config, reference_date)?;
            let history = simulate(&etl, &conn, runs, Duration::from_secs(delay))?;
            print_simulation(&history);
        }
        Commands::Populate { rebuild } => {
            print_json(&WarehousePopulator::new(&conn).run(rebuild)?)?;
        }
        Commands::Qa { summary, json } => {
            let report = qa(&conn, summary)?;
            if json {
                print_json(&report)?;
            } else {
                println!("{}", report.to_markdown());
            }
        }
        Commands::Status => print_json(&status(&conn)?)?,
        Commands::RunAll { rebuild, summary } => {
            seed_reference_data(&conn)?;
            let etl = ImagingEtl::new(config, reference_date)?;
            let stats = etl.run(&conn)?;
            let populated = WarehousePopulator::new(&conn).run(rebuild)?;
            let report = qa(&conn, summary)?;
            print_json(&serde_json::json!({
                "ingest": stats,
                "populate": populated,
                "qa": report,
            }))?;
        }
    }
    Ok(())
}

fn qa(conn: &Connection, summary: Option<PathBuf>) -> Result<QaReport, CliError> {
    let report = run_qa(conn)?;
    if let Some(path) = summary {
        report.write_summary(&path)?;
        tracing::info!(path = %path.display(), "QA summary written");
    }
    Ok(report)
}

fn status(conn: &Connection) -> Result<StatusReport, DatabaseError> {
    let tables = OPERATIONAL_TABLES
        .iter()
        .chain(WAREHOUSE_TABLES)
        .map(|&table| Ok(TableCount { table, rows: count_rows(conn, table)? }))
        .collect::<Result<Vec<_>, DatabaseError>>()?;
    Ok(StatusReport {
        tables,
        procedures_by_source: procedure_counts_by_source(conn)?,
    })
}

fn print_simulation(history: &[IngestStats]) {
    println!(
        "{:>4} {:>10} {:>10} {:>10} {:>10} {:>8}",
        "run", "processed", "skipped", "patients", "encounters", "errors"
    );
    for (i, stats) in history.iter().enumerate() {
        println!(
            "{:>4} {:>10} {:>10} {:>10} {:>10} {:>8}",
            i + 1,
            stats.records_processed,
            stats.records_skipped,
            stats.written.patients_created,
            stats.written.encounters_created,
            stats.transform_error_count(),
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
