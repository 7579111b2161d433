//! `init` command: create the state database.

use std::io::Write;

use camino::Utf8PathBuf;
use chargesync_data::{SCHEMA_VERSION, SchemaError, SqliteStore, StoreError, TargetTables};
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_CONNECTORS_TABLE, ARG_CREATE_TARGET_TABLES, ARG_DB, ARG_STATIONS_TABLE, CliError,
    target_tables, write_report,
};

pub(crate) const ENV_INIT_DB: &str = "CHARGESYNC_CMDS_INIT_DB";

/// CLI arguments for the `init` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "init",
    long_about = "Create (or verify) the delta index and queue tables in \
                 the state database. With --create-target-tables the \
                 station and connector tables are bootstrapped as well; \
                 otherwise they are only checked and completed.",
    about = "Create the state database"
)]
#[ortho_config(prefix = "CHARGESYNC")]
pub(crate) struct InitArgs {
    /// Path to the state database.
    #[arg(long = ARG_DB, value_name = "path")]
    #[serde(default)]
    pub(crate) db: Option<Utf8PathBuf>,
    /// Create the station and connector tables when absent.
    #[arg(long = ARG_CREATE_TARGET_TABLES)]
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub(crate) create_target_tables: bool,
    /// Name of the station table.
    #[arg(long = ARG_STATIONS_TABLE, value_name = "table")]
    #[serde(default)]
    pub(crate) stations_table: Option<String>,
    /// Name of the connector table.
    #[arg(long = ARG_CONNECTORS_TABLE, value_name = "table")]
    #[serde(default)]
    pub(crate) connectors_table: Option<String>,
}

impl InitArgs {
    fn into_config(self) -> Result<InitConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        InitConfig::try_from(merged)
    }
}

/// Resolved `init` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InitConfig {
    pub(crate) db: Utf8PathBuf,
    pub(crate) create_target_tables: bool,
    pub(crate) tables: TargetTables,
}

impl TryFrom<InitArgs> for InitConfig {
    type Error = CliError;

    fn try_from(args: InitArgs) -> Result<Self, Self::Error> {
        let db = args.db.ok_or(CliError::MissingArgument {
            field: ARG_DB,
            env: ENV_INIT_DB,
        })?;
        let tables = target_tables(
            args.stations_table.as_deref(),
            args.connectors_table.as_deref(),
        )?;
        Ok(Self {
            db,
            create_target_tables: args.create_target_tables,
            tables,
        })
    }
}

/// Outcome of `chargesync init`.
#[derive(Debug, Serialize)]
pub(crate) struct InitReport {
    database: Utf8PathBuf,
    schema_version: i64,
    target_tables_ready: bool,
    added_columns: Vec<String>,
}

pub(crate) fn run_init(args: InitArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let config = args.into_config()?;
    execute_init(&config, writer)
}

pub(crate) fn execute_init(config: &InitConfig, writer: &mut dyn Write) -> Result<(), CliError> {
    let store = SqliteStore::open(&config.db)?.with_target_tables(config.tables.clone());
    if config.create_target_tables {
        store.create_target_tables()?;
    }
    // Target tables owned by another application may not exist yet.
    let (target_tables_ready, added_columns) = match store.ensure_target_schema() {
        Ok(added) => (true, added),
        Err(StoreError::Schema(
            err @ (SchemaError::MissingTable { .. } | SchemaError::MissingKeyColumn { .. }),
        )) => {
            log::warn!("target tables are not ready: {err}");
            (false, Vec::new())
        }
        Err(err) => return Err(err.into()),
    };
    write_report(
        writer,
        &InitReport {
            database: config.db.clone(),
            schema_version: SCHEMA_VERSION,
            target_tables_ready,
            added_columns,
        },
    )
}
