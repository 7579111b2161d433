//! `apply` command: drain the queue into the target tables.

use std::io::Write;

use camino::Utf8PathBuf;
use chargesync_core::{DEFAULT_BATCH_SIZE, ProcessOptions};
use chargesync_data::TargetTables;
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_BATCH_SIZE, ARG_CONNECTORS_TABLE, ARG_DB, ARG_MAX_BATCHES, ARG_SOURCE,
    ARG_STATIONS_TABLE, CliError, open_existing_store, target_tables, write_report,
};

pub(crate) const ENV_APPLY_DB: &str = "CHARGESYNC_CMDS_APPLY_DB";

/// CLI arguments for the `apply` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "apply",
    long_about = "Claim pending queue items in batches and apply each one \
                 to the station and connector tables in its own \
                 transaction. Failed items are recorded and never retried \
                 automatically.",
    about = "Apply queued changes"
)]
#[ortho_config(prefix = "CHARGESYNC")]
pub(crate) struct ApplyArgs {
    /// Path to the state database.
    #[arg(long = ARG_DB, value_name = "path")]
    #[serde(default)]
    pub(crate) db: Option<Utf8PathBuf>,
    /// Only apply items from this source.
    #[arg(long = ARG_SOURCE, value_name = "name")]
    #[serde(default)]
    pub(crate) source: Option<String>,
    /// Items claimed per batch.
    #[arg(long = ARG_BATCH_SIZE, value_name = "items")]
    #[serde(default)]
    pub(crate) batch_size: Option<usize>,
    /// Stop after this many batches instead of draining the queue.
    #[arg(long = ARG_MAX_BATCHES, value_name = "batches")]
    #[serde(default)]
    pub(crate) max_batches: Option<usize>,
    /// Name of the station table.
    #[arg(long = ARG_STATIONS_TABLE, value_name = "table")]
    #[serde(default)]
    pub(crate) stations_table: Option<String>,
    /// Name of the connector table.
    #[arg(long = ARG_CONNECTORS_TABLE, value_name = "table")]
    #[serde(default)]
    pub(crate) connectors_table: Option<String>,
}

impl ApplyArgs {
    fn into_config(self) -> Result<ApplyConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ApplyConfig::try_from(merged)
    }
}

/// Resolved `apply` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ApplyConfig {
    pub(crate) db: Utf8PathBuf,
    pub(crate) options: ProcessOptions,
    pub(crate) max_batches: Option<usize>,
    pub(crate) tables: TargetTables,
}

impl TryFrom<ApplyArgs> for ApplyConfig {
    type Error = CliError;

    fn try_from(args: ApplyArgs) -> Result<Self, Self::Error> {
        let db = args.db.ok_or(CliError::MissingArgument {
            field: ARG_DB,
            env: ENV_APPLY_DB,
        })?;
        let batch_size = args.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(CliError::InvalidArgument {
                field: ARG_BATCH_SIZE,
                reason: "must be at least 1",
            });
        }
        if args.max_batches == Some(0) {
            return Err(CliError::InvalidArgument {
                field: ARG_MAX_BATCHES,
                reason: "must be at least 1",
            });
        }
        let tables = target_tables(
            args.stations_table.as_deref(),
            args.connectors_table.as_deref(),
        )?;
        Ok(Self {
            db,
            options: ProcessOptions {
                source: args.source,
                batch_size,
            },
            max_batches: args.max_batches,
            tables,
        })
    }
}

pub(crate) fn run_apply(args: ApplyArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let config = args.into_config()?;
    execute_apply(&config, writer)
}

pub(crate) fn execute_apply(config: &ApplyConfig, writer: &mut dyn Write) -> Result<(), CliError> {
    let store = open_existing_store(&config.db)?.with_target_tables(config.tables.clone());
    let summary = chargesync_data::apply_pending(&store, &config.options, config.max_batches)?;
    write_report(writer, &summary)
}
