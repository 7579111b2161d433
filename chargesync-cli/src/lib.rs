//! Command-line interface for the chargesync delta pipeline.
//!
//! Every subcommand layers its options with `ortho_config`: CLI flags win
//! over `CHARGESYNC_CMDS_<COMMAND>_<FIELD>` environment variables, which win
//! over configuration files. Reports are written to stdout as pretty JSON.
#![forbid(unsafe_code)]

mod apply;
mod detect;
mod error;
mod init;
mod queue;

use std::io::Write;

use camino::Utf8Path;
use chargesync_data::{SqliteStore, TargetTables};
use clap::{Parser, Subcommand};
use serde::Serialize;

pub use error::CliError;

use apply::ApplyArgs;
use detect::DetectArgs;
use init::InitArgs;
use queue::{QueueStatusArgs, RequeueArgs};

pub(crate) const ARG_DB: &str = "db";
pub(crate) const ARG_INPUT: &str = "input";
pub(crate) const ARG_SOURCE: &str = "source";
pub(crate) const ARG_SOURCE_VERSION: &str = "source-version";
pub(crate) const ARG_LIMIT: &str = "limit";
pub(crate) const ARG_BATCH_SIZE: &str = "batch-size";
pub(crate) const ARG_MAX_BATCHES: &str = "max-batches";
pub(crate) const ARG_STATIONS_TABLE: &str = "stations-table";
pub(crate) const ARG_CONNECTORS_TABLE: &str = "connectors-table";
pub(crate) const ARG_CREATE_TARGET_TABLES: &str = "create-target-tables";
pub(crate) const ARG_STALE_PROCESSING: &str = "stale-processing";

/// Run the chargesync CLI with the current process arguments and environment.
///
/// # Errors
/// Returns [`CliError`] when argument parsing, configuration or the command
/// itself fails.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    let mut stdout = std::io::stdout().lock();
    run_command(cli.command, &mut stdout)
}

fn run_command(command: Command, writer: &mut dyn Write) -> Result<(), CliError> {
    match command {
        Command::Init(args) => init::run_init(args, writer),
        Command::Detect(args) => detect::run_detect(args, writer),
        Command::Apply(args) => apply::run_apply(args, writer),
        Command::QueueStatus(args) => queue::run_queue_status(args, writer),
        Command::Requeue(args) => queue::run_requeue(args, writer),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "chargesync",
    about = "Detect and apply changes to EV charging-station feeds",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the state database and, optionally, the target tables.
    Init(InitArgs),
    /// Classify an NDJSON feed against the index and queue the changes.
    Detect(DetectArgs),
    /// Apply queued changes to the station and connector tables.
    Apply(ApplyArgs),
    /// Report queue item counts per status.
    QueueStatus(QueueStatusArgs),
    /// Move failed items back to pending.
    Requeue(RequeueArgs),
}

/// Reject a missing state database before opening it, so a typo does not
/// silently create an empty one.
pub(crate) fn open_existing_store(path: &Utf8Path) -> Result<SqliteStore, CliError> {
    match chargesync_fs::file_is_file(path) {
        Ok(true) => Ok(SqliteStore::open(path)?),
        Ok(false) => Err(CliError::MissingDatabase {
            path: path.to_path_buf(),
        }),
        Err(source) => Err(CliError::InspectPath {
            field: ARG_DB,
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub(crate) fn require_file(path: &Utf8Path, field: &'static str) -> Result<(), CliError> {
    match chargesync_fs::file_is_file(path) {
        Ok(true) => Ok(()),
        Ok(false) => Err(CliError::MissingSourceFile {
            field,
            path: path.to_path_buf(),
        }),
        Err(source) => Err(CliError::InspectPath {
            field,
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub(crate) fn target_tables(
    stations: Option<&str>,
    connectors: Option<&str>,
) -> Result<TargetTables, CliError> {
    match (stations, connectors) {
        (None, None) => Ok(TargetTables::default()),
        _ => TargetTables::new(
            stations.unwrap_or(chargesync_data::DEFAULT_STATIONS_TABLE),
            connectors.unwrap_or(chargesync_data::DEFAULT_CONNECTORS_TABLE),
        )
        .map_err(CliError::TargetTables),
    }
}

pub(crate) fn write_report<T: Serialize>(
    writer: &mut dyn Write,
    report: &T,
) -> Result<(), CliError> {
    let payload = serde_json::to_string_pretty(report).map_err(CliError::SerialiseOutput)?;
    writer
        .write_all(payload.as_bytes())
        .map_err(CliError::WriteOutput)?;
    writer.write_all(b"\n").map_err(CliError::WriteOutput)?;
    Ok(())
}

#[cfg(test)]
mod tests;
